use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::mesh::link::PeerLink;
use crate::mesh::registry::{LivePeers, PeerRegistry};
use crate::mesh::{PROTOCOL_VERSION, PeerDiscovery, PeerHello, PeerId};
use crate::model::{Clock, Delta};
use crate::replica::MergeReport;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
	pub handshake_timeout: Duration,
	pub peer_liveness: Duration,
}

impl Default for ExchangeConfig {
	fn default() -> Self {
		Self {
			handshake_timeout: Duration::from_secs(5),
			peer_liveness: Duration::from_secs(120),
		}
	}
}

/// What one session with a peer did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeReport {
	pub peer_id: PeerId,
	pub sent: usize,
	pub received: usize,
	pub merge: MergeReport,
}

type Session = Shared<BoxFuture<'static, Result<ExchangeReport>>>;

struct ExchangeInner {
	engine: SyncEngine,
	local_id: PeerId,
	registry: Mutex<PeerRegistry>,
	sessions: Mutex<HashMap<PeerId, Session>>,
	handshake_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Swaps outbox deltas with trusted peers, merging through the same replica
/// the sync engine drives. Cheap to clone.
#[derive(Clone)]
pub struct PeerExchange {
	inner: Arc<ExchangeInner>,
}

impl PeerExchange {
	/// Pairings saved with the engine's replica are restored here.
	pub fn new(
		engine: SyncEngine,
		local_id: PeerId,
		config: ExchangeConfig,
		clock: Arc<dyn Clock>,
	) -> Self {
		let paired = engine.with_replica(|r| r.paired_peers().clone());
		let registry = PeerRegistry::new(config.peer_liveness, clock).with_paired(paired);
		Self {
			inner: Arc::new(ExchangeInner {
				engine,
				local_id,
				registry: Mutex::new(registry),
				sessions: Mutex::new(HashMap::new()),
				handshake_timeout: config.handshake_timeout,
			}),
		}
	}

	pub fn local_id(&self) -> &PeerId {
		&self.inner.local_id
	}

	pub fn engine(&self) -> &SyncEngine {
		&self.inner.engine
	}

	/// Scan for nearby devices and return the live ones.
	pub async fn discover(&self, discovery: &dyn PeerDiscovery) -> Result<LivePeers> {
		let adverts = discovery.scan().await?;
		let live = lock(&self.inner.registry).absorb(adverts);
		self.inner.engine.metrics().peers_live.set(live.len() as i64);
		Ok(live)
	}

	pub fn live_peers(&self) -> LivePeers {
		lock(&self.inner.registry).live()
	}

	/// Pair with a discovered peer and save the pairing with the replica.
	pub async fn mark_trusted(&self, peer_id: &PeerId) -> Result<()> {
		let added = lock(&self.inner.registry).mark_trusted(peer_id)?;
		let saved = self.inner.engine.with_replica(|r| r.pair_peer(peer_id.clone()));
		if added || saved {
			self.inner.engine.persist().await?;
		}
		Ok(())
	}

	/// Peers paired with so far, seen recently or not.
	pub fn paired_peers(&self) -> Vec<PeerId> {
		lock(&self.inner.registry).paired().iter().cloned().collect()
	}

	/// Run a session with `peer_id` over `link`.
	///
	/// Only one session per peer runs at a time; a second request for the same
	/// peer joins the running one and gets its result.
	pub async fn exchange(
		&self,
		peer_id: &PeerId,
		link: Arc<dyn PeerLink>,
	) -> Result<ExchangeReport> {
		lock(&self.inner.registry).require_trusted(peer_id)?;

		let session = {
			let mut sessions = lock(&self.inner.sessions);
			match sessions.get(peer_id) {
				Some(running) => {
					debug!(peer = %peer_id, "joining running peer session");
					running.clone()
				}
				None => {
					let inner = Arc::clone(&self.inner);
					let peer = peer_id.clone();
					let session: Session = async move {
						let result = inner.session(&peer, link).await;
						lock(&inner.sessions).remove(&peer);
						result
					}
					.boxed()
					.shared();
					sessions.insert(peer_id.clone(), session.clone());
					session
				}
			}
		};
		session.await
	}

	/// Responder side of the handshake.
	pub fn accept(&self, hello: &PeerHello) -> Result<PeerHello> {
		if hello.protocol != PROTOCOL_VERSION {
			return Err(SyncError::InvalidInput(format!(
				"peer {} speaks protocol {}, expected {}",
				hello.peer_id, hello.protocol, PROTOCOL_VERSION
			)));
		}
		lock(&self.inner.registry).require_trusted(&hello.peer_id)?;
		debug!(peer = %hello.peer_id, actor = %hello.actor, "peer handshake accepted");
		Ok(self.inner.hello())
	}

	/// Responder side of the swap: our deltas go back, theirs are merged.
	pub async fn accept_deltas(&self, from: &PeerId, incoming: Vec<Delta>) -> Result<Vec<Delta>> {
		lock(&self.inner.registry).require_trusted(from)?;
		let outgoing = self.inner.engine.with_replica(|r| r.outbound_deltas());
		let merge = self.inner.merge(&incoming);
		self.inner.finish(from, outgoing.len(), incoming.len(), merge).await?;
		Ok(outgoing)
	}
}

impl ExchangeInner {
	fn hello(&self) -> PeerHello {
		PeerHello {
			peer_id: self.local_id.clone(),
			actor: self.engine.actor(),
			protocol: PROTOCOL_VERSION,
		}
	}

	fn merge(&self, incoming: &[Delta]) -> MergeReport {
		let merge = self.engine.with_replica(|replica| {
			let mut report = MergeReport::default();
			for delta in incoming {
				match replica.apply_delta(delta) {
					Ok(merge) => report.absorb(merge),
					Err(e) => {
						report.rejected += 1;
						warn!(record_id = %delta.record_id, error = %e, "peer delta skipped");
					}
				}
			}
			report
		});
		self.engine.record_merge(&merge);
		merge
	}

	async fn finish(
		&self,
		peer: &PeerId,
		sent: usize,
		received: usize,
		merge: MergeReport,
	) -> Result<ExchangeReport> {
		self.engine.persist().await?;
		self.engine.publish();
		lock(&self.registry).touch(peer);
		let metrics = self.engine.metrics();
		metrics.peer_exchanges_total.inc();
		metrics.peer_deltas_received_total.inc_by(received as u64);
		info!(
			peer = %peer,
			sent,
			received,
			conflicts = merge.conflicts_detected,
			"peer exchange complete"
		);
		Ok(ExchangeReport {
			peer_id: peer.clone(),
			sent,
			received,
			merge,
		})
	}

	async fn session(&self, peer: &PeerId, link: Arc<dyn PeerLink>) -> Result<ExchangeReport> {
		let result = self.run(peer, link).await;
		if let Err(e) = &result {
			self.engine.metrics().peer_exchange_failures_total.inc();
			warn!(peer = %peer, error = %e, "peer exchange failed");
		}
		result
	}

	async fn run(&self, peer: &PeerId, link: Arc<dyn PeerLink>) -> Result<ExchangeReport> {
		let reply = tokio::time::timeout(self.handshake_timeout, link.handshake(self.hello()))
			.await
			.map_err(|_| SyncError::Transport(format!("handshake with {} timed out", peer)))??;
		if reply.peer_id != *peer {
			return Err(SyncError::UntrustedPeer(reply.peer_id.to_string()));
		}
		if reply.protocol != PROTOCOL_VERSION {
			return Err(SyncError::Transport(format!(
				"peer {} speaks protocol {}",
				peer, reply.protocol
			)));
		}

		let outgoing = self.engine.with_replica(|r| r.outbound_deltas());
		let sent = outgoing.len();
		let incoming = link.swap(outgoing).await?;
		let merge = self.merge(&incoming);
		self.finish(peer, sent, incoming.len(), merge).await
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use async_trait::async_trait;
	use serde_json::json;
	use std::collections::BTreeMap;

	use super::*;
	use crate::mesh::PeerAdvert;
	use crate::model::{ActorId, ManualClock, RecordId, RecordKind};
	use crate::sync::MemoryAuthority;

	struct SilentLink;

	#[async_trait]
	impl PeerLink for SilentLink {
		async fn handshake(&self, _hello: PeerHello) -> Result<PeerHello> {
			std::future::pending().await
		}

		async fn swap(&self, _deltas: Vec<Delta>) -> Result<Vec<Delta>> {
			Ok(Vec::new())
		}
	}

	async fn exchange_for(actor: &str, clock: &ManualClock) -> PeerExchange {
		let engine = SyncEngine::builder(ActorId::from(actor), Arc::new(MemoryAuthority::new()))
			.clock(Arc::new(clock.clone()))
			.open()
			.await
			.unwrap();
		PeerExchange::new(
			engine,
			PeerId::from(actor),
			ExchangeConfig {
				handshake_timeout: Duration::from_millis(50),
				..ExchangeConfig::default()
			},
			Arc::new(clock.clone()),
		)
	}

	#[tokio::test]
	async fn untrusted_and_unknown_peers_are_refused() {
		let clock = ManualClock::new(1_000);
		let ex = exchange_for("asha-1", &clock).await;
		let err = ex.exchange(&PeerId::from("tab-b"), Arc::new(SilentLink)).await.unwrap_err();
		assert!(matches!(err, SyncError::UnknownPeer(_)));

		lock(&ex.inner.registry).observe(PeerAdvert::new("tab-b", 70));
		let err = ex.exchange(&PeerId::from("tab-b"), Arc::new(SilentLink)).await.unwrap_err();
		assert!(matches!(err, SyncError::UntrustedPeer(_)));
	}

	#[tokio::test]
	async fn handshake_is_bounded() {
		let clock = ManualClock::new(1_000);
		let ex = exchange_for("asha-1", &clock).await;
		lock(&ex.inner.registry).observe(PeerAdvert::new("tab-b", 70));
		ex.mark_trusted(&PeerId::from("tab-b")).await.unwrap();

		let err = ex.exchange(&PeerId::from("tab-b"), Arc::new(SilentLink)).await.unwrap_err();
		assert!(matches!(err, SyncError::Transport(_)));
		assert_eq!(ex.engine().metrics().peer_exchange_failures_total.get(), 1);
	}

	#[tokio::test]
	async fn responder_returns_deltas_computed_before_merging() {
		let clock = ManualClock::new(1_000);
		let ex = exchange_for("asha-1", &clock).await;
		lock(&ex.inner.registry).observe(PeerAdvert::new("asha-2", 70));
		ex.mark_trusted(&PeerId::from("asha-2")).await.unwrap();

		let mut fields = BTreeMap::new();
		fields.insert("phone".to_string(), json!("111"));
		ex.engine()
			.edit(&RecordId::from("P1"), RecordKind::Patient, fields.clone(), None)
			.await
			.unwrap();

		let mut theirs = BTreeMap::new();
		theirs.insert("village".to_string(), json!("Rampur"));
		let incoming = vec![Delta {
			record_id: RecordId::from("P2"),
			kind: RecordKind::Patient,
			version: 1,
			fields: theirs,
			updated_at: 900,
			updated_by: ActorId::from("asha-2"),
		}];
		let out = ex.accept_deltas(&PeerId::from("asha-2"), incoming).await.unwrap();
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].record_id, RecordId::from("P1"));
		assert_eq!(
			ex.engine().get_record(&RecordId::from("P2")).unwrap().field("village"),
			Some(&json!("Rampur"))
		);
	}

	#[tokio::test]
	async fn peer_delta_of_the_wrong_kind_is_counted() {
		let clock = ManualClock::new(1_000);
		let ex = exchange_for("asha-1", &clock).await;
		lock(&ex.inner.registry).observe(PeerAdvert::new("asha-2", 70));
		ex.mark_trusted(&PeerId::from("asha-2")).await.unwrap();

		let mut fields = BTreeMap::new();
		fields.insert("phone".to_string(), json!("111"));
		ex.engine()
			.edit(&RecordId::from("P1"), RecordKind::Patient, fields.clone(), None)
			.await
			.unwrap();
		let incoming = vec![Delta {
			record_id: RecordId::from("P1"),
			kind: RecordKind::Visit,
			version: 1,
			fields,
			updated_at: 900,
			updated_by: ActorId::from("asha-2"),
		}];
		ex.accept_deltas(&PeerId::from("asha-2"), incoming).await.unwrap();
		assert_eq!(ex.engine().metrics().sync_deltas_rejected_total.get(), 1);
		assert_eq!(ex.engine().metrics().peer_exchanges_total.get(), 1);
	}
}
