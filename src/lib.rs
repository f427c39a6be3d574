pub mod config;
pub mod error;
pub mod health;
pub mod mesh;
pub mod model;
pub mod observability;
pub mod outbox;
pub mod persist;
pub mod replica;
pub mod resolve;
pub mod state;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Settings;
use crate::mesh::{
	ExchangeReport, FramedPeerLink, PeerAdvert, PeerExchange, PeerId, PeerLink, StaticDiscovery,
	serve_peer_connection,
};
use crate::model::{ActorId, SystemClock};
use crate::observability::MetricsRegistry;
use crate::persist::{FileStateStore, StateStore};
use crate::state::AppState;
use crate::sync::{HttpTransport, MemoryAuthority, OfflineTransport, SyncEngine, SyncTransport};

/// Timeout for a single pull or push against the authority.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Open this device's engine over the state in `data_dir`.
pub async fn open_engine(
	settings: &Settings,
	metrics: Arc<MetricsRegistry>,
) -> anyhow::Result<SyncEngine> {
	let transport: Arc<dyn SyncTransport> = match &settings.remote_url {
		Some(url) => Arc::new(HttpTransport::new(url, HTTP_TIMEOUT)?),
		None => {
			warn!("no remote_url configured; changes stay local until one is set");
			Arc::new(OfflineTransport)
		}
	};
	let engine = SyncEngine::builder(ActorId::new(&settings.node_id), transport)
		.state_store(Arc::new(FileStateStore::in_dir(&settings.data_dir)))
		.metrics(metrics)
		.config(settings.engine_config())
		.open()
		.await
		.with_context(|| {
			format!("failed to open replica state in {}", settings.data_dir.display())
		})?;
	Ok(engine)
}

pub fn peer_exchange(settings: &Settings, engine: SyncEngine) -> PeerExchange {
	PeerExchange::new(
		engine,
		PeerId::new(&settings.node_id),
		settings.exchange_config(),
		Arc::new(SystemClock),
	)
}

fn paired_discovery(settings: &Settings) -> StaticDiscovery {
	StaticDiscovery::new(
		settings
			.trusted_peers
			.iter()
			.map(|peer| PeerAdvert::new(peer.clone(), 100))
			.collect(),
	)
}

async fn pair_trusted(exchange: &PeerExchange, settings: &Settings) -> anyhow::Result<()> {
	exchange.discover(&paired_discovery(settings)).await?;
	for peer in &settings.trusted_peers {
		exchange.mark_trusted(&PeerId::new(peer)).await?;
	}
	Ok(())
}

async fn spawn_peer_listener(
	settings: &Settings,
	engine: SyncEngine,
	addr: &str,
) -> anyhow::Result<JoinHandle<()>> {
	let exchange = peer_exchange(settings, engine);
	pair_trusted(&exchange, settings).await?;
	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind peer listener on {}", addr))?;
	info!(addr, "accepting peer sessions");

	let discovery = paired_discovery(settings);
	let refresh = (settings.exchange_config().peer_liveness / 2).max(Duration::from_secs(1));
	Ok(tokio::spawn(async move {
		let mut tick = tokio::time::interval(refresh);
		loop {
			tokio::select! {
				_ = tick.tick() => {
					if let Err(e) = exchange.discover(&discovery).await {
						warn!(error = %e, "peer discovery failed");
					}
				}
				accepted = listener.accept() => match accepted {
					Ok((stream, remote)) => {
						let exchange = exchange.clone();
						tokio::spawn(async move {
							if let Err(e) = serve_peer_connection(stream, exchange).await {
								warn!(%remote, error = %e, "peer session ended with error");
							}
						});
					}
					Err(e) => warn!(error = %e, "peer accept failed"),
				},
			}
		}
	}))
}

/// Run the background sync loop (and the peer responder, when configured)
/// until Ctrl-C.
pub async fn run(settings: &Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<()> {
	let engine = open_engine(settings, metrics).await?;
	let sync_loop = engine.start();
	let peers = match &settings.peer_listen {
		Some(addr) => Some(spawn_peer_listener(settings, engine.clone(), addr).await?),
		None => None,
	};
	info!(
		node_id = %settings.node_id,
		interval_secs = settings.sync_interval_secs,
		"asha-sync running"
	);

	tokio::signal::ctrl_c().await?;
	info!("shutting down");
	engine.cancel();
	sync_loop.abort();
	if let Some(peers) = peers {
		peers.abort();
	}
	Ok(())
}

/// One session with a paired peer at `addr`.
pub async fn exchange_with(
	settings: &Settings,
	engine: SyncEngine,
	peer: &str,
	addr: &str,
) -> anyhow::Result<ExchangeReport> {
	let exchange = peer_exchange(settings, engine);
	pair_trusted(&exchange, settings).await?;
	let stream = TcpStream::connect(addr)
		.await
		.with_context(|| format!("failed to reach peer {} at {}", peer, addr))?;
	let link: Arc<dyn PeerLink> = Arc::new(FramedPeerLink::new(stream));
	Ok(exchange.exchange(&PeerId::new(peer), link).await?)
}

/// Serve an in-memory authority over HTTP until Ctrl-C.
pub async fn serve(settings: &Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<()> {
	let state = AppState {
		authority: Arc::new(MemoryAuthority::new()),
		metrics,
		node_id: settings.node_id.clone(),
	};
	let listener = TcpListener::bind(&settings.listen)
		.await
		.with_context(|| format!("failed to bind {}", settings.listen))?;
	info!(addr = %listener.local_addr()?, "authority listening");
	axum::serve(listener, sync::router(state))
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await?;
	Ok(())
}

/// Forget local state so the next start resyncs from scratch.
pub async fn reset(settings: &Settings) -> anyhow::Result<()> {
	FileStateStore::in_dir(&settings.data_dir).reset().await?;
	Ok(())
}
