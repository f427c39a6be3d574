mod common;

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use asha_sync::SyncError;
use asha_sync::model::{ActorId, ManualClock, RecordId, RecordKind};
use asha_sync::outbox::SyncState;
use asha_sync::resolve::{ResolutionChoice, ResolutionState};
use asha_sync::sync::{EngineConfig, MemoryAuthority, SyncPhase};
use common::{ScriptedTransport, device, fields, test_config};

fn p1() -> RecordId {
	RecordId::from("P1")
}

/// A second cycle with nothing new creates no entries and bumps no versions.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_repeat_cycle_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	authority.write(
		&p1(),
		RecordKind::Patient,
		fields(&[("village", json!("Rampur"))]),
		&ActorId::from("hq"),
	)?;
	let engine = device("asha-1", authority.clone(), &clock, test_config(true)).await;

	engine
		.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("111"))]), None)
		.await?;
	let first = engine.run_cycle().await?;
	assert_eq!(first.merge.applied_fields, 1);
	assert_eq!(first.acknowledged, 1);

	// The authority echoes our own write back on the next pull.
	let second = engine.run_cycle().await?;
	assert_eq!(second.merge.deltas, 1);
	assert_eq!(second.merge.applied_fields, 0);
	let before = engine.get_record(&p1())?;
	let entries_before = engine.list_pending_counts();

	let third = engine.run_cycle().await?;
	assert_eq!(third.merge.deltas, 0);
	assert_eq!(third.pushed, 0);
	assert_eq!(engine.get_record(&p1())?, before);
	assert_eq!(engine.list_pending_counts(), entries_before);
	assert_eq!(entries_before.unsynced(), 0);
	assert_eq!(authority.watermark(), 2);
	Ok(())
}

/// Later entries of a record never overtake an earlier one that is waiting.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_per_record_order_is_preserved() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let transport = Arc::new(ScriptedTransport::new(authority.clone()));
	transport.reject_once.lock().unwrap().push(1);
	let engine = device("asha-1", transport.clone(), &clock, test_config(true)).await;

	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("1"))]), None).await?;
	engine.edit(&p1(), RecordKind::Patient, fields(&[("village", json!("Rampur"))]), None).await?;
	engine
		.edit(&RecordId::from("P2"), RecordKind::Patient, fields(&[("phone", json!("9"))]), None)
		.await?;

	let report = engine.run_cycle().await?;
	assert_eq!(report.pushed, 3);
	assert_eq!(report.rejected, 1);
	assert_eq!(report.acknowledged, 2);

	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("2"))]), None).await?;
	let report = engine.run_cycle().await?;
	// Entry 1 is backing off, so entry 4 (same record) is held back.
	assert_eq!(report.pushed, 0);
	assert_eq!(transport.pushes().len(), 1);

	clock.advance(Duration::from_secs(600));
	let report = engine.run_cycle().await?;
	assert_eq!(report.acknowledged, 2);
	assert_eq!(transport.pushes().last().cloned(), Some(vec![1, 4]));
	assert_eq!(authority.record(&p1()).unwrap().field("phone"), Some(&json!("2")));

	engine.run_cycle().await?;
	assert_eq!(engine.get_record(&p1())?.field("phone"), Some(&json!("2")));
	assert_eq!(engine.list_pending_counts().unsynced(), 0);
	Ok(())
}

/// Each failed delivery schedules the next attempt strictly later.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_retry_schedule_is_monotone() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let transport = Arc::new(ScriptedTransport::new(authority.clone()));
	transport.fail_pushes.store(3, Ordering::SeqCst);
	let engine = device("asha-1", transport.clone(), &clock, test_config(true)).await;
	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("111"))]), None).await?;

	let mut schedule = Vec::new();
	for attempt in 1..=3u32 {
		let report = engine.run_cycle().await?;
		assert!(!report.succeeded());
		assert!(matches!(engine.status().phase, SyncPhase::Backoff { .. }));
		assert_eq!(engine.status().consecutive_failures, attempt);
		assert!(engine.backoff_until().is_some());
		let pending = engine.list_pending_counts();
		assert_eq!(pending.failed, 1);
		schedule.push(engine.entry(1).and_then(|e| e.next_retry_at).expect("retry scheduled"));
		clock.advance(Duration::from_secs(600));
	}
	assert!(schedule.windows(2).all(|w| w[0] < w[1]), "{:?}", schedule);

	let report = engine.run_cycle().await?;
	assert!(report.succeeded());
	assert_eq!(report.acknowledged, 1);
	assert_eq!(engine.status().phase, SyncPhase::Idle);
	assert_eq!(engine.status().consecutive_failures, 0);
	assert!(engine.backoff_until().is_none());
	Ok(())
}

/// Exhausted or terminal failures stop being sent and are reported.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_permanent_failures_surface_and_retry() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let transport = Arc::new(ScriptedTransport::new(authority.clone()));
	transport.reject_permanently.lock().unwrap().push(1);
	let mut config = test_config(true);
	config.replica.retry.max_retries = 2;
	let engine = device("asha-1", transport.clone(), &clock, config).await;

	// Entry 1 is refused as terminal on first contact.
	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("111"))]), None).await?;
	engine
		.edit(&RecordId::from("P2"), RecordKind::Patient, fields(&[("phone", json!("222"))]), None)
		.await?;
	let report = engine.run_cycle().await?;
	assert_eq!(report.rejected, 1);
	assert_eq!(report.acknowledged, 1);
	assert_eq!(engine.permanent_failures().len(), 1);

	// Entry 3 runs out of retries on transport failures.
	engine
		.edit(&RecordId::from("P3"), RecordKind::Visit, fields(&[("notes", json!("fever"))]), None)
		.await?;
	transport.fail_pushes.store(2, Ordering::SeqCst);
	engine.run_cycle().await?;
	clock.advance(Duration::from_secs(600));
	engine.run_cycle().await?;
	clock.advance(Duration::from_secs(600));
	let report = engine.run_cycle().await?;
	assert_eq!(report.pushed, 0);

	let failures = engine.permanent_failures();
	let ids: Vec<u64> = failures.iter().map(|e| e.entry_id).collect();
	assert_eq!(ids, vec![1, 3]);
	assert!(failures.iter().all(|e| e.permanent && e.sync_state == SyncState::Failed));
	assert_eq!(engine.list_pending_counts().permanent_failures, 2);
	assert_eq!(engine.metrics().sync_permanent_failures_total.get(), 2);
	assert!(matches!(
		&engine.attention()[..],
		[
			SyncError::PermanentSyncFailure { entry_id: 1, attempts: 1, .. },
			SyncError::PermanentSyncFailure { entry_id: 3, attempts: 2, .. },
		]
	));
	let shown = engine.status().permanent_failure.unwrap_or_default();
	assert!(shown.starts_with("change 3 gave up after 2 attempts"), "{shown}");

	engine.retry_entry(3).await?;
	let report = engine.run_cycle().await?;
	assert_eq!(report.acknowledged, 1);

	let dropped = engine.discard_entry(1).await?;
	assert_eq!(dropped.record_id, p1());
	assert!(engine.permanent_failures().is_empty());
	assert!(engine.attention().is_empty());
	assert_eq!(engine.status().permanent_failure, None);
	assert!(matches!(engine.discard_entry(1).await, Err(SyncError::UnknownEntry(1))));
	Ok(())
}

/// The worked P1.phone example with a manual decision.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_p1_phone_conflict_resolved_locally() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let hq = ActorId::from("hq");
	for phone in ["1", "11", "111"] {
		authority.write(&p1(), RecordKind::Patient, fields(&[("phone", json!(phone))]), &hq)?;
	}
	let engine = device("asha-1", authority.clone(), &clock, test_config(false)).await;
	engine.run_cycle().await?;
	assert_eq!(engine.get_record(&p1())?.stamps["phone"].version, 3);

	clock.advance(Duration::from_secs(5));
	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("222"))]), None).await?;
	clock.advance(Duration::from_secs(5));
	authority.write(
		&p1(),
		RecordKind::Patient,
		fields(&[("phone", json!("333"))]),
		&ActorId::from("asha-2"),
	)?;

	let report = engine.run_cycle().await?;
	assert_eq!(report.merge.conflicts_detected, 1);
	assert_eq!(report.pushed, 0);
	let conflicts = engine.list_conflicts();
	assert_eq!(conflicts.len(), 1);
	let case = &conflicts[0];
	assert_eq!(case.field, "phone");
	assert_eq!(case.local_value, json!("222"));
	assert_eq!(case.remote_value, json!("333"));
	assert_eq!(case.remote_version, 4);
	assert_eq!(engine.list_pending_counts().conflicted, 1);
	assert_eq!(engine.status().open_conflicts, 1);
	assert!(matches!(
		&engine.attention()[..],
		[SyncError::RemoteConflict { case_id, field, .. }]
			if *case_id == case.id && field == "phone"
	));

	let closed = engine.resolve_conflict(case.id, ResolutionChoice::Local).await?;
	assert_eq!(closed.resolution_state, ResolutionState::ResolvedLocal);
	let record = engine.get_record(&p1())?;
	assert_eq!(record.field("phone"), Some(&json!("222")));
	assert_eq!(record.stamps["phone"].version, 5);
	assert!(engine.list_conflicts().is_empty());
	assert_eq!(engine.list_pending_counts().pending, 1);

	let report = engine.run_cycle().await?;
	assert_eq!(report.acknowledged, 1);
	let remote = authority.record(&p1()).unwrap();
	assert_eq!(remote.field("phone"), Some(&json!("222")));
	assert_eq!(remote.stamps["phone"].version, 5);
	assert!(matches!(
		engine.resolve_conflict(case.id, ResolutionChoice::Local).await,
		Err(SyncError::UnknownConflict(_))
	));
	Ok(())
}

/// The same example under the automatic policy: the newer remote write wins.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_p1_phone_conflict_resolved_automatically() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	authority.write(
		&p1(),
		RecordKind::Patient,
		fields(&[("phone", json!("111"))]),
		&ActorId::from("hq"),
	)?;
	let engine = device("asha-1", authority.clone(), &clock, test_config(true)).await;
	engine.run_cycle().await?;

	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("222"))]), None).await?;
	clock.advance(Duration::from_secs(30));
	authority.write(
		&p1(),
		RecordKind::Patient,
		fields(&[("phone", json!("333"))]),
		&ActorId::from("asha-2"),
	)?;

	let report = engine.run_cycle().await?;
	assert_eq!(report.merge.conflicts_detected, 1);
	assert_eq!(report.merge.auto_resolved, 1);
	assert!(report.merge.escalated.is_empty());
	assert!(engine.list_conflicts().is_empty());
	assert_eq!(engine.get_record(&p1())?.field("phone"), Some(&json!("333")));
	assert_eq!(engine.list_pending_counts().unsynced(), 0);
	assert_eq!(engine.metrics().conflicts_auto_resolved_total.get(), 1);
	Ok(())
}

/// A cycle that escalates waits for the user and pushes the decision in the same pass.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_cycle_waits_for_manual_resolution() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	authority.write(
		&p1(),
		RecordKind::Patient,
		fields(&[("phone", json!("111"))]),
		&ActorId::from("hq"),
	)?;
	let mut config = test_config(false);
	config.resolution_timeout = Duration::from_secs(10);
	let engine = device("asha-1", authority.clone(), &clock, config).await;
	engine.run_cycle().await?;

	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("222"))]), None).await?;
	authority.write(
		&p1(),
		RecordKind::Patient,
		fields(&[("phone", json!("333"))]),
		&ActorId::from("asha-2"),
	)?;

	let cycle = {
		let engine = engine.clone();
		tokio::spawn(async move { engine.run_cycle().await })
	};
	let mut state = engine.sync_state();
	state.wait_for(|s| s.phase == SyncPhase::AwaitingResolution).await?;
	let case = engine.list_conflicts().remove(0);
	engine
		.resolve_conflict(case.id, ResolutionChoice::Merged(json!("222-333")))
		.await?;

	let report = cycle.await??;
	assert!(report.awaited_resolution);
	assert_eq!(report.pushed, 1);
	assert_eq!(report.acknowledged, 1);
	assert_eq!(authority.record(&p1()).unwrap().field("phone"), Some(&json!("222-333")));
	Ok(())
}

/// Concurrent callers share one cycle.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_concurrent_triggers_share_one_cycle() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let transport =
		Arc::new(ScriptedTransport::new(authority).with_pull_delay(Duration::from_millis(50)));
	let engine = device("asha-1", transport.clone(), &clock, test_config(true)).await;
	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("111"))]), None).await?;

	let (a, b) = tokio::join!(engine.run_cycle(), engine.trigger_sync_now());
	assert_eq!(a?, b?);
	assert_eq!(transport.pulls.load(Ordering::SeqCst), 1);
	assert_eq!(transport.pushes().len(), 1);

	engine.run_cycle().await?;
	assert_eq!(transport.pulls.load(Ordering::SeqCst), 2);
	Ok(())
}

/// Cancelling mid-push puts the batch back to pending.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_cancel_reverts_in_flight_entries() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let transport = Arc::new(ScriptedTransport::new(authority));
	transport.stall_pushes.store(true, Ordering::SeqCst);
	let engine = device("asha-1", transport.clone(), &clock, test_config(true)).await;
	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("111"))]), None).await?;

	let cycle = {
		let engine = engine.clone();
		tokio::spawn(async move { engine.run_cycle().await })
	};
	let mut state = engine.sync_state();
	state.wait_for(|s| s.phase == SyncPhase::Pushing).await?;
	while engine.list_pending_counts().in_flight == 0 {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	engine.cancel();

	let result = tokio::time::timeout(Duration::from_secs(5), cycle).await??;
	assert!(matches!(result, Err(SyncError::Cancelled)));
	let counts = engine.list_pending_counts();
	assert_eq!(counts.in_flight, 0);
	assert_eq!(counts.pending, 1);
	assert_eq!(engine.status().phase, SyncPhase::Idle);

	transport.stall_pushes.store(false, Ordering::SeqCst);
	let report = engine.run_cycle().await?;
	assert_eq!(report.acknowledged, 1);
	Ok(())
}

/// The background loop keeps syncing on its own.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_background_loop_syncs() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	let config = EngineConfig {
		sync_interval: Duration::from_millis(20),
		..test_config(true)
	};
	let engine = device("asha-1", authority.clone(), &clock, config).await;
	engine.edit(&p1(), RecordKind::Patient, fields(&[("phone", json!("111"))]), None).await?;

	let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
	let subscriber = {
		let seen = seen.clone();
		engine.subscribe_to_sync_state(move |status| seen.lock().unwrap().push(status.phase))
	};
	let handle = engine.start();
	let mut state = engine.sync_state();
	tokio::time::timeout(
		Duration::from_secs(5),
		state.wait_for(|s| s.last_success_at.is_some() && s.pending.unsynced() == 0),
	)
	.await??;
	handle.abort();
	subscriber.abort();

	assert!(authority.record(&p1()).is_some());
	assert!(!seen.lock().unwrap().is_empty());
	Ok(())
}
