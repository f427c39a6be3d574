mod common;

use asha_sync::observability::{MetricsRegistry, init_metrics};

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_registry_creation() {
	let registry = MetricsRegistry::new();
	let output = registry.encode();

	assert!(output.contains("asha_sync_cycles_total"));
	assert!(output.contains("asha_sync_pending_entries"));
	assert!(output.contains("asha_conflicts_detected_total"));
	assert!(output.contains("asha_peer_exchanges_total"));
	assert!(output.contains("asha_authority_changes_accepted_total"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_gauge_operations() {
	let registry = MetricsRegistry::new();

	registry.sync_pending_entries.set(50);
	registry.open_conflicts.set(3);
	let output = registry.encode();
	assert!(output.contains("asha_sync_pending_entries 50"));
	assert!(output.contains("asha_open_conflicts 3"));

	registry.sync_pending_entries.inc();
	registry.sync_pending_entries.dec();
	assert!(registry.encode().contains("asha_sync_pending_entries 50"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_histogram_observations() {
	let registry = MetricsRegistry::new();

	registry.sync_cycle_duration_seconds.observe(0.1);
	registry.sync_cycle_duration_seconds.observe(1.2);

	let output = registry.encode();
	assert!(output.contains("asha_sync_cycle_duration_seconds_bucket"));
	assert!(output.contains("asha_sync_cycle_duration_seconds_sum"));
	assert!(output.contains("asha_sync_cycle_duration_seconds_count 2"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_init_metrics() {
	let metrics = init_metrics().unwrap();
	assert!(!metrics.encode().is_empty());
}

#[cfg(feature = "integration-tests")]
#[tokio::test]
async fn test_metrics_follow_a_sync_cycle() {
	use serde_json::json;
	use std::sync::Arc;

	use asha_sync::model::{ManualClock, RecordId, RecordKind};
	use asha_sync::sync::MemoryAuthority;

	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let engine = common::device("asha-1", authority, &clock, common::test_config(true)).await;
	engine
		.edit(
			&RecordId::from("P1"),
			RecordKind::Patient,
			common::fields(&[("phone", json!("111")), ("village", json!("Rampur"))]),
			None,
		)
		.await
		.unwrap();
	assert!(engine.metrics().encode().contains("asha_sync_pending_entries 2"));

	engine.run_cycle().await.unwrap();

	let output = engine.metrics().encode();
	assert!(output.contains("asha_sync_cycles_total 1"));
	assert!(output.contains("asha_sync_entries_pushed_total 2"));
	assert!(output.contains("asha_sync_entries_acknowledged_total 2"));
	assert!(output.contains("asha_sync_pending_entries 0"));
}

#[cfg(feature = "integration-tests")]
#[tokio::test]
async fn test_health_handler_reports_node() {
	use axum::extract::State;
	use axum::response::IntoResponse;
	use std::sync::Arc;

	use asha_sync::health::health;
	use asha_sync::state::AppState;
	use asha_sync::sync::MemoryAuthority;

	let state = AppState {
		authority: Arc::new(MemoryAuthority::new()),
		metrics: Arc::new(MetricsRegistry::new()),
		node_id: "hub-1".to_string(),
	};

	let response = health(State(state)).await.into_response();
	assert_eq!(response.status(), axum::http::StatusCode::OK);
	let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	assert_eq!(&body[..], b"OK hub-1 watermark=0");
}
