mod common;

use async_trait::async_trait;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use asha_sync::Result;
use asha_sync::model::{ActorId, ManualClock, RecordId, RecordKind};
use asha_sync::observability::MetricsRegistry;
use asha_sync::state::AppState;
use asha_sync::sync::{
	ChangeBatch, HttpTransport, MemoryAuthority, OutgoingChange, PushOutcome, SyncTransport, router,
};
use common::{device, fields, test_config};

/// Serve an authority on an ephemeral port.
async fn spawn_authority(
	authority: Arc<MemoryAuthority>,
	metrics: Arc<MetricsRegistry>,
) -> SocketAddr {
	let state = AppState {
		authority,
		metrics,
		node_id: "hub-1".to_string(),
	};
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let _ = axum::serve(listener, router(state)).await;
	});
	addr
}

fn http_transport(addr: SocketAddr) -> Arc<HttpTransport> {
	let base = Url::parse(&format!("http://{}/", addr)).unwrap();
	Arc::new(HttpTransport::new(&base, Duration::from_secs(5)).unwrap())
}

/// Pushes over HTTP but never sees anything on pull, so stale pushes reach
/// the authority.
struct BlindPull(Arc<HttpTransport>);

#[async_trait]
impl SyncTransport for BlindPull {
	async fn pull(&self, _since: u64) -> Result<ChangeBatch> {
		Ok(ChangeBatch::default())
	}

	async fn push(&self, changes: &[OutgoingChange]) -> Result<Vec<PushOutcome>> {
		self.0.push(changes).await
	}
}

/// Two devices share a record through the HTTP authority.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_devices_sync_over_http() -> std::result::Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let metrics = Arc::new(MetricsRegistry::new());
	let addr = spawn_authority(authority.clone(), metrics.clone()).await;

	let a = device("asha-1", http_transport(addr), &clock, test_config(true)).await;
	let b = device("asha-2", http_transport(addr), &clock, test_config(true)).await;
	let id = RecordId::from("P1");

	a.edit(&id, RecordKind::Patient, fields(&[("phone", json!("111"))]), None)
		.await?;
	let report = a.run_cycle().await?;
	assert!(report.succeeded());
	assert_eq!(report.acknowledged, 1);
	assert_eq!(authority.record(&id).unwrap().field("phone"), Some(&json!("111")));

	let report = b.run_cycle().await?;
	assert_eq!(report.merge.deltas, 1);
	assert_eq!(b.get_record(&id)?.field("phone"), Some(&json!("111")));

	let health = reqwest::get(format!("http://{}/health", addr)).await?.text().await?;
	assert!(health.starts_with("OK hub-1"));
	let scrape = reqwest::get(format!("http://{}/metrics", addr)).await?.text().await?;
	assert!(scrape.contains("asha_authority_changes_accepted_total 1"));
	assert!(scrape.contains("asha_authority_deltas_served_total"));
	Ok(())
}

/// A stale push is refused with the current value and settled on the device.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_refused_stale_push_settles() -> std::result::Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let metrics = Arc::new(MetricsRegistry::new());
	let addr = spawn_authority(authority.clone(), metrics.clone()).await;
	let id = RecordId::from("P1");

	authority.write(
		&id,
		RecordKind::Patient,
		fields(&[("phone", json!("333"))]),
		&ActorId::from("asha-2"),
	)?;
	clock.advance(Duration::from_secs(5));

	let blind = Arc::new(BlindPull(http_transport(addr)));
	let a = device("asha-1", blind, &clock, test_config(true)).await;
	a.edit(&id, RecordKind::Patient, fields(&[("phone", json!("222"))]), None)
		.await?;

	let report = a.run_cycle().await?;
	assert_eq!(report.remote_conflicts, 1);
	assert_eq!(report.merge.auto_resolved, 1);
	assert_eq!(authority.record(&id).unwrap().field("phone"), Some(&json!("333")));
	assert!(metrics.encode().contains("asha_authority_changes_conflicted_total 1"));

	// The later local write won; its resolution goes through next cycle.
	let report = a.run_cycle().await?;
	assert_eq!(report.acknowledged, 1);
	assert_eq!(authority.record(&id).unwrap().field("phone"), Some(&json!("222")));
	assert_eq!(a.list_pending_counts().unsynced(), 0);
	Ok(())
}
