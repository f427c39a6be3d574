mod common;

use serde_json::json;
use std::sync::Arc;

use asha_sync::SyncError;
use asha_sync::model::{ManualClock, RecordId, RecordKind};
use asha_sync::persist::{FileStateStore, MemoryStateStore, StateStore};
use asha_sync::sync::{MemoryAuthority, OfflineTransport};
use common::{device_with_store, fields};

/// An unsynced edit is still queued after the device restarts.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_pending_changes_survive_restart() -> Result<(), Box<dyn std::error::Error>> {
	let dir = tempfile::tempdir()?;
	let clock = ManualClock::new(10_000);
	let id = RecordId::from("P1");

	{
		let store = Arc::new(FileStateStore::in_dir(dir.path()));
		let engine = device_with_store("asha-1", Arc::new(OfflineTransport), &clock, store).await?;
		engine
			.edit(&id, RecordKind::Patient, fields(&[("phone", json!("111"))]), None)
			.await?;
		let report = engine.run_cycle().await?;
		assert!(report.transport_error.is_some());
	}

	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(FileStateStore::in_dir(dir.path()));
	let engine = device_with_store("asha-1", authority.clone(), &clock, store).await?;
	assert_eq!(engine.get_record(&id)?.field("phone"), Some(&json!("111")));
	assert_eq!(engine.list_pending_counts().unsynced(), 1);

	let report = engine.run_cycle().await?;
	assert_eq!(report.acknowledged, 1);
	assert_eq!(authority.record(&id).unwrap().field("phone"), Some(&json!("111")));
	Ok(())
}

/// Tampered state refuses to load until it is reset.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_corrupt_state_is_refused_until_reset() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let store = Arc::new(MemoryStateStore::new());
	let id = RecordId::from("P1");

	let engine = device_with_store(
		"asha-1",
		Arc::new(OfflineTransport),
		&clock,
		store.clone(),
	).await?;
	engine
		.edit(&id, RecordKind::Patient, fields(&[("phone", json!("111"))]), None)
		.await?;
	drop(engine);

	let raw = store.raw().expect("state was saved");
	store.set_raw(raw.replace("111", "999"));
	let err = device_with_store("asha-1", Arc::new(OfflineTransport), &clock, store.clone())
		.await
		.err()
		.expect("tampered state must not open");
	assert!(matches!(err, SyncError::CorruptLocalState(_)));

	store.reset().await?;
	let engine = device_with_store("asha-1", Arc::new(OfflineTransport), &clock, store).await?;
	assert!(matches!(engine.get_record(&id), Err(SyncError::NotFound(_))));
	assert_eq!(engine.list_pending_counts().unsynced(), 0);
	Ok(())
}
