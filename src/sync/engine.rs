//! Sync engine: drives pull → merge → push cycles for one replica.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::model::{ActorId, Clock, Record, RecordId, RecordKind, SystemClock};
use crate::observability::MetricsRegistry;
use crate::outbox::{ChangeEntry, FailureOutcome, PendingCounts, SyncState};
use crate::persist::{MemoryStateStore, StateStore};
use crate::replica::{MergeReport, Replica, ReplicaConfig};
use crate::resolve::{CaseId, ConflictCase, ResolutionChoice};
use crate::sync::transport::{OutgoingChange, PushOutcome, SyncTransport};

/// Where the engine is in its cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
	Idle,
	Pulling,
	Merging,
	AwaitingResolution,
	Pushing,
	/// The last cycle hit a transport failure; the next attempt waits until `until` (ms).
	Backoff { until: u64 },
}

/// Snapshot published to the UI on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
	pub phase: SyncPhase,
	pub pending: PendingCounts,
	pub open_conflicts: usize,
	pub watermark: u64,
	pub last_success_at: Option<u64>,
	pub last_error: Option<String>,
	pub consecutive_failures: u32,
	/// Newest change the engine gave up on, until it is retried or discarded.
	pub permanent_failure: Option<String>,
}

impl SyncStatus {
	fn idle() -> Self {
		Self {
			phase: SyncPhase::Idle,
			pending: PendingCounts::default(),
			open_conflicts: 0,
			watermark: 0,
			last_success_at: None,
			last_error: None,
			consecutive_failures: 0,
			permanent_failure: None,
		}
	}
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
	pub merge: MergeReport,
	pub pushed: usize,
	pub acknowledged: usize,
	pub failed: usize,
	pub rejected: usize,
	pub remote_conflicts: usize,
	pub awaited_resolution: bool,
	/// Set when the cycle ended in backoff.
	pub transport_error: Option<String>,
}

impl CycleReport {
	pub fn succeeded(&self) -> bool {
		self.transport_error.is_none()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
	pub batch_size: usize,
	pub sync_interval: Duration,
	/// How long a cycle waits for freshly escalated conflicts; zero disables the wait.
	pub resolution_timeout: Duration,
	pub replica: ReplicaConfig,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			batch_size: 50,
			sync_interval: Duration::from_secs(60),
			resolution_timeout: Duration::from_secs(30),
			replica: ReplicaConfig::default(),
		}
	}
}

type CycleFuture = Shared<BoxFuture<'static, Result<CycleReport>>>;

struct EngineInner {
	replica: Mutex<Replica>,
	transport: Arc<dyn SyncTransport>,
	state_store: Arc<dyn StateStore>,
	config: EngineConfig,
	metrics: Arc<MetricsRegistry>,
	status: watch::Sender<SyncStatus>,
	current: Mutex<Option<CycleFuture>>,
	cancel: Notify,
	persist_lock: tokio::sync::Mutex<()>,
	failures: AtomicU32,
	backoff_until: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Puts in-flight entries back to `Pending` unless disarmed.
struct InFlightGuard<'a> {
	inner: &'a EngineInner,
	armed: bool,
}

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			let reverted = self.inner.replica().log_mut().revert_in_flight();
			if reverted > 0 {
				info!(reverted, "in-flight changes returned to pending");
			}
		}
	}
}

impl EngineInner {
	fn replica(&self) -> MutexGuard<'_, Replica> {
		lock(&self.replica)
	}

	fn set_phase(&self, phase: SyncPhase) {
		debug!(?phase, "sync phase");
		self.status.send_modify(|s| s.phase = phase);
	}

	/// Refresh counts in the published status and the gauges.
	fn publish(&self) {
		let (pending, open, watermark, gave_up) = {
			let replica = self.replica();
			(
				replica.log().pending_counts(),
				replica.resolver().open_count(),
				replica.watermark(),
				replica.log().permanent_failures().last().and_then(|e| e.failure()),
			)
		};
		self.metrics.sync_pending_entries.set(pending.unsynced() as i64);
		self.metrics.open_conflicts.set(open as i64);
		self.metrics.sync_watermark.set(watermark as i64);
		self.status.send_modify(|s| {
			s.pending = pending;
			s.open_conflicts = open;
			s.watermark = watermark;
			s.permanent_failure = gave_up.map(|e| e.to_string());
		});
	}

	/// Save the replica. The snapshot is taken under the persist lock so
	/// saves land in the order their state was reached.
	async fn persist(&self) -> Result<()> {
		let _serialized = self.persist_lock.lock().await;
		let snapshot = self.replica().snapshot();
		self.state_store.save(&snapshot).await.inspect_err(|e| {
			error!(error = %e, "failed to persist replica state");
		})
	}

	fn record_merge(&self, merge: &MergeReport) {
		self.metrics.conflicts_detected_total.inc_by(merge.conflicts_detected as u64);
		self.metrics.conflicts_auto_resolved_total.inc_by(merge.auto_resolved as u64);
		self.metrics.conflicts_escalated_total.inc_by(merge.escalated.len() as u64);
		self.metrics.sync_deltas_rejected_total.inc_by(merge.rejected as u64);
	}

	fn enter_backoff(&self, err: &SyncError, report: &mut CycleReport) {
		let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
		let delay = self.config.replica.retry.delay(failures, &mut rand::thread_rng());
		let until = self.replica().now().saturating_add(delay.as_millis() as u64);
		self.backoff_until.store(until, Ordering::SeqCst);
		self.metrics.sync_cycle_failures_total.inc();
		report.transport_error = Some(err.to_string());
		warn!(error = %err, failures, until, "sync cycle backing off");
		self.status.send_modify(|s| {
			s.phase = SyncPhase::Backoff { until };
			s.last_error = Some(err.to_string());
			s.consecutive_failures = failures;
		});
	}

	async fn cycle(&self) -> Result<CycleReport> {
		let started = Instant::now();
		self.metrics.sync_cycles_total.inc();
		let mut guard = InFlightGuard {
			inner: self,
			armed: true,
		};
		let mut report = CycleReport::default();

		let outcome = tokio::select! {
			_ = self.cancel.notified() => Err(SyncError::Cancelled),
			result = self.phases(&mut report) => result,
		};
		self.metrics
			.sync_cycle_duration_seconds
			.observe(started.elapsed().as_secs_f64());

		match outcome {
			Ok(()) => {
				guard.armed = false;
				Ok(report)
			}
			Err(SyncError::Cancelled) => {
				drop(guard);
				info!("sync cycle cancelled");
				self.set_phase(SyncPhase::Idle);
				self.persist().await?;
				self.publish();
				Err(SyncError::Cancelled)
			}
			Err(e) => {
				drop(guard);
				error!(error = %e, "sync cycle failed");
				self.status.send_modify(|s| {
					s.phase = SyncPhase::Idle;
					s.last_error = Some(e.to_string());
				});
				self.publish();
				Err(e)
			}
		}
	}

	async fn phases(&self, report: &mut CycleReport) -> Result<()> {
		self.set_phase(SyncPhase::Pulling);
		let since = self.replica().watermark();
		let batch = match self.transport.pull(since).await {
			Ok(batch) => batch,
			Err(e) => {
				self.enter_backoff(&e, report);
				return Ok(());
			}
		};
		self.metrics.sync_deltas_pulled_total.inc_by(batch.deltas.len() as u64);

		self.set_phase(SyncPhase::Merging);
		{
			let mut replica = self.replica();
			for delta in &batch.deltas {
				match replica.apply_delta(delta) {
					Ok(merge) => report.merge.absorb(merge),
					Err(e) => {
						report.merge.rejected += 1;
						warn!(record_id = %delta.record_id, error = %e, "delta skipped");
					}
				}
			}
			replica.set_watermark(batch.watermark);
		}
		self.record_merge(&report.merge);
		self.persist().await?;
		self.publish();
		if report.merge.deltas > 0 || report.merge.rejected > 0 {
			info!(
				deltas = report.merge.deltas,
				applied = report.merge.applied_fields,
				rejected = report.merge.rejected,
				conflicts = report.merge.conflicts_detected,
				watermark = batch.watermark,
				"merged remote changes"
			);
		}

		if !report.merge.escalated.is_empty() && !self.config.resolution_timeout.is_zero() {
			self.set_phase(SyncPhase::AwaitingResolution);
			report.awaited_resolution = true;
			let mut rx = self.status.subscribe();
			let cleared = matches!(
				tokio::time::timeout(
					self.config.resolution_timeout,
					rx.wait_for(|s| s.open_conflicts == 0)
				)
				.await,
				Ok(Ok(_))
			);
			if cleared {
				debug!("escalated conflicts resolved during cycle");
			} else {
				info!(
					open = report.merge.escalated.len(),
					"resolution wait timed out; conflicted changes held"
				);
			}
		}

		self.set_phase(SyncPhase::Pushing);
		let batch = {
			let mut replica = self.replica();
			let now = replica.now();
			replica.log_mut().next_batch(self.config.batch_size, now)
		};
		if !batch.is_empty() {
			let outgoing: Vec<OutgoingChange> = batch.iter().map(OutgoingChange::from).collect();
			report.pushed = batch.len();
			self.metrics.sync_entries_pushed_total.inc_by(batch.len() as u64);
			match self.transport.push(&outgoing).await {
				Ok(outcomes) => self.apply_outcomes(&batch, outcomes, report),
				Err(e) => {
					self.fail_batch(&batch, &e.to_string(), report);
					self.enter_backoff(&e, report);
				}
			}
		}

		{
			let mut replica = self.replica();
			let now = replica.now();
			let pruned = replica.log_mut().prune(now);
			if pruned > 0 {
				debug!(pruned, "acknowledged changes pruned");
			}
		}
		self.persist().await?;
		self.publish();

		if report.succeeded() {
			self.failures.store(0, Ordering::SeqCst);
			self.backoff_until.store(0, Ordering::SeqCst);
			let now = self.replica().now();
			self.status.send_modify(|s| {
				s.phase = SyncPhase::Idle;
				s.last_success_at = Some(now);
				s.last_error = None;
				s.consecutive_failures = 0;
			});
		}
		Ok(())
	}

	fn apply_outcomes(
		&self,
		batch: &[ChangeEntry],
		outcomes: Vec<PushOutcome>,
		report: &mut CycleReport,
	) {
		let mut replica = self.replica();
		let mut rng = rand::thread_rng();
		let now = replica.now();
		let mut outcomes = outcomes.into_iter();

		for entry in batch {
			let id = entry.entry_id;
			let result = match outcomes.next() {
				Some(PushOutcome::Accepted { version }) => {
					report.acknowledged += 1;
					self.metrics.sync_entries_acknowledged_total.inc();
					replica.acknowledge(id, version)
				}
				Some(PushOutcome::Conflict { snapshot }) => {
					report.remote_conflicts += 1;
					debug!(
						entry_id = id,
						remote_version = snapshot.stamp.version,
						"authority reported a stale base"
					);
					replica.remote_conflict(id, snapshot).map(|merge| {
						self.record_merge(&merge);
						report.merge.absorb(merge);
					})
				}
				Some(PushOutcome::Rejected { reason, retryable }) => {
					report.rejected += 1;
					if retryable {
						self.mark_failed(&mut replica, id, &reason, now, &mut rng, report)
					} else {
						self.metrics.sync_permanent_failures_total.inc();
						replica.log_mut().mark_permanent(id, &reason)
					}
				}
				None => self.mark_failed(
					&mut replica,
					id,
					"no outcome returned",
					now,
					&mut rng,
					report,
				),
			};
			if let Err(e) = result {
				warn!(entry_id = id, error = %e, "push outcome not applied");
			}
		}
	}

	fn mark_failed(
		&self,
		replica: &mut Replica,
		entry_id: u64,
		reason: &str,
		now: u64,
		rng: &mut rand::rngs::ThreadRng,
		report: &mut CycleReport,
	) -> Result<()> {
		report.failed += 1;
		self.metrics.sync_entries_failed_total.inc();
		if replica.log_mut().mark_failed(entry_id, reason, now, rng)? == FailureOutcome::Permanent {
			self.metrics.sync_permanent_failures_total.inc();
		}
		Ok(())
	}

	fn fail_batch(&self, batch: &[ChangeEntry], reason: &str, report: &mut CycleReport) {
		let mut replica = self.replica();
		let mut rng = rand::thread_rng();
		let now = replica.now();
		for entry in batch {
			if let Err(e) = self.mark_failed(
				&mut replica,
				entry.entry_id,
				reason,
				now,
				&mut rng,
				report,
			) {
				warn!(entry_id = entry.entry_id, error = %e, "failed change not recorded");
			}
		}
	}
}

/// Handle to a running sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
	inner: Arc<EngineInner>,
}

pub struct SyncEngineBuilder {
	actor: ActorId,
	transport: Arc<dyn SyncTransport>,
	state_store: Option<Arc<dyn StateStore>>,
	clock: Option<Arc<dyn Clock>>,
	metrics: Option<Arc<MetricsRegistry>>,
	config: EngineConfig,
}

impl SyncEngineBuilder {
	pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
		self.state_store = Some(store);
		self
	}

	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	/// Load saved state (if any) and build the engine.
	///
	/// Fails with `CorruptLocalState` when the saved state does not verify;
	/// the state store has to be reset before the engine can start.
	pub async fn open(self) -> Result<SyncEngine> {
		let state_store = self
			.state_store
			.unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let metrics = self.metrics.unwrap_or_default();

		let replica = match state_store.load().await? {
			Some(snapshot) => {
				if snapshot.actor != self.actor {
					warn!(
						saved = %snapshot.actor,
						configured = %self.actor,
						"saved state belongs to another actor; keeping saved identity"
					);
				}
				Replica::from_snapshot(snapshot, clock, self.config.replica.clone())?
			}
			None => Replica::new(self.actor, clock, self.config.replica.clone()),
		};
		info!(
			actor = %replica.actor(),
			records = replica.store().len(),
			unsynced = replica.unsynced_entries(),
			"sync engine opened"
		);

		let (status, _) = watch::channel(SyncStatus::idle());
		let engine = SyncEngine {
			inner: Arc::new(EngineInner {
				replica: Mutex::new(replica),
				transport: self.transport,
				state_store,
				config: self.config,
				metrics,
				status,
				current: Mutex::new(None),
				cancel: Notify::new(),
				persist_lock: tokio::sync::Mutex::new(()),
				failures: AtomicU32::new(0),
				backoff_until: AtomicU64::new(0),
			}),
		};
		engine.inner.publish();
		Ok(engine)
	}
}

impl SyncEngine {
	pub fn builder(actor: ActorId, transport: Arc<dyn SyncTransport>) -> SyncEngineBuilder {
		SyncEngineBuilder {
			actor,
			transport,
			state_store: None,
			clock: None,
			metrics: None,
			config: EngineConfig::default(),
		}
	}

	/// Run one pull → merge → push cycle.
	///
	/// Only one cycle runs at a time; callers arriving while one is in flight
	/// wait for it and share its result. Transport failures do not surface as
	/// errors: the report carries them and the phase moves to `Backoff`.
	pub async fn run_cycle(&self) -> Result<CycleReport> {
		let cycle = {
			let mut current = lock(&self.inner.current);
			match current.as_ref() {
				Some(running) => {
					debug!("joining in-flight sync cycle");
					running.clone()
				}
				None => {
					let inner = Arc::clone(&self.inner);
					let fut: CycleFuture = async move {
						let result = inner.cycle().await;
						*lock(&inner.current) = None;
						result
					}
					.boxed()
					.shared();
					*current = Some(fut.clone());
					fut
				}
			}
		};
		cycle.await
	}

	/// The UI's "sync now" button.
	pub async fn trigger_sync_now(&self) -> Result<CycleReport> {
		self.run_cycle().await
	}

	/// Abort the running cycle at its next suspension point.
	pub fn cancel(&self) {
		self.inner.cancel.notify_waiters();
	}

	pub fn sync_state(&self) -> watch::Receiver<SyncStatus> {
		self.inner.status.subscribe()
	}

	pub fn status(&self) -> SyncStatus {
		self.inner.status.borrow().clone()
	}

	/// Call `callback` with the current status and then on every change.
	pub fn subscribe_to_sync_state<F>(&self, callback: F) -> JoinHandle<()>
	where
		F: Fn(SyncStatus) + Send + 'static,
	{
		let mut rx = self.sync_state();
		tokio::spawn(async move {
			let first = rx.borrow_and_update().clone();
			callback(first);
			while rx.changed().await.is_ok() {
				let status = rx.borrow_and_update().clone();
				callback(status);
			}
		})
	}

	pub fn list_pending_counts(&self) -> PendingCounts {
		self.inner.replica().log().pending_counts()
	}

	pub fn list_conflicts(&self) -> Vec<ConflictCase> {
		self.inner.replica().open_conflicts()
	}

	/// Apply a user decision. The state is saved whether the case resolves or
	/// is re-raised.
	pub async fn resolve_conflict(
		&self,
		case_id: CaseId,
		choice: ResolutionChoice,
	) -> Result<ConflictCase> {
		let result = self.inner.replica().resolve(case_id, choice);
		match &result {
			Ok(case) => {
				self.inner.metrics.conflicts_manually_resolved_total.inc();
				info!(
					case_id = case.id,
					state = ?case.resolution_state,
					"conflict resolved by user"
				);
			}
			Err(SyncError::ConflictReraised { .. }) => {}
			Err(_) => return result,
		}
		self.inner.persist().await?;
		self.inner.publish();
		result
	}

	pub fn permanent_failures(&self) -> Vec<ChangeEntry> {
		self.inner
			.replica()
			.log()
			.permanent_failures()
			.into_iter()
			.cloned()
			.collect()
	}

	/// Everything waiting on the user: changes given up on, then open conflicts.
	pub fn attention(&self) -> Vec<SyncError> {
		let replica = self.inner.replica();
		let failures =
			replica.log().permanent_failures().into_iter().filter_map(ChangeEntry::failure);
		let conflicts = replica.resolver().open_cases().map(ConflictCase::to_error);
		failures.chain(conflicts).collect()
	}

	pub fn entry(&self, entry_id: u64) -> Option<ChangeEntry> {
		self.inner.replica().log().get(entry_id).cloned()
	}

	/// Drop a failed change for good.
	pub async fn discard_entry(&self, entry_id: u64) -> Result<ChangeEntry> {
		let entry = {
			let mut replica = self.inner.replica();
			let state = replica
				.log()
				.get(entry_id)
				.map(|e| e.sync_state)
				.ok_or(SyncError::UnknownEntry(entry_id))?;
			if state != SyncState::Failed {
				return Err(SyncError::InvalidInput(format!(
					"change {} is {:?}; only failed changes can be discarded",
					entry_id, state
				)));
			}
			replica.log_mut().discard(entry_id)?
		};
		warn!(
			entry_id,
			record_id = %entry.record_id,
			field = %entry.field,
			"failed change discarded"
		);
		self.inner.persist().await?;
		self.inner.publish();
		Ok(entry)
	}

	/// Give a failed change a fresh retry budget.
	pub async fn retry_entry(&self, entry_id: u64) -> Result<()> {
		self.inner.replica().log_mut().retry_now(entry_id)?;
		self.inner.persist().await?;
		self.inner.publish();
		Ok(())
	}

	/// Local write from the screens.
	pub async fn edit(
		&self,
		record_id: &RecordId,
		kind: RecordKind,
		fields: BTreeMap<String, Value>,
		expected_version: Option<u64>,
	) -> Result<u64> {
		let version = self
			.inner
			.replica()
			.edit(record_id, kind, fields, expected_version)?;
		self.inner.persist().await?;
		self.inner.publish();
		Ok(version)
	}

	pub fn get_record(&self, record_id: &RecordId) -> Result<Record> {
		self.inner.replica().get_record(record_id)
	}

	pub fn list_records<P>(&self, predicate: P) -> Vec<Record>
	where
		P: Fn(&Record) -> bool + Clone,
	{
		self.inner.replica().store().list(predicate).cloned().collect()
	}

	pub fn actor(&self) -> ActorId {
		self.inner.replica().actor().clone()
	}

	pub fn metrics(&self) -> &Arc<MetricsRegistry> {
		&self.inner.metrics
	}

	/// Wall-clock milliseconds as the replica sees them.
	pub fn now(&self) -> u64 {
		self.inner.replica().now()
	}

	/// When the background loop may try again after transport failures.
	pub fn backoff_until(&self) -> Option<u64> {
		match self.inner.backoff_until.load(Ordering::SeqCst) {
			0 => None,
			until => Some(until),
		}
	}

	/// Spawn the periodic sync loop. Honours backoff after failed cycles.
	pub fn start(&self) -> JoinHandle<()> {
		let engine = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(engine.inner.config.sync_interval);
			tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tick.tick().await;
				if let Some(until) = engine.backoff_until() {
					let now = engine.now();
					if until > now {
						tokio::time::sleep(Duration::from_millis(until - now)).await;
					}
				}
				match engine.run_cycle().await {
					Ok(report) if report.succeeded() => {
						debug!(
							pushed = report.pushed,
							acknowledged = report.acknowledged,
							"background sync cycle done"
						);
					}
					Ok(_) => {}
					Err(SyncError::Cancelled) => debug!("background sync cycle cancelled"),
					Err(e) => error!(error = %e, "background sync cycle failed"),
				}
			}
		})
	}

	pub(crate) fn with_replica<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> R {
		f(&mut self.inner.replica())
	}

	pub(crate) async fn persist(&self) -> Result<()> {
		self.inner.persist().await
	}

	pub(crate) fn publish(&self) {
		self.inner.publish();
	}

	pub(crate) fn record_merge(&self, merge: &MergeReport) {
		self.inner.record_merge(merge);
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::model::ManualClock;
	use crate::sync::MemoryAuthority;

	fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
	}

	#[tokio::test]
	async fn cycle_pushes_local_edits_and_goes_idle() {
		let clock = ManualClock::new(10_000);
		let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
		let engine = SyncEngine::builder(ActorId::from("asha-1"), authority.clone())
			.clock(Arc::new(clock.clone()))
			.open()
			.await
			.unwrap();

		engine
			.edit(
				&RecordId::from("P1"),
				RecordKind::Patient,
				fields(&[("phone", json!("111"))]),
				None,
			)
			.await
			.unwrap();
		assert_eq!(engine.list_pending_counts().pending, 1);

		let report = engine.run_cycle().await.unwrap();
		assert!(report.succeeded());
		assert_eq!(report.pushed, 1);
		assert_eq!(report.acknowledged, 1);
		assert_eq!(engine.status().phase, SyncPhase::Idle);
		assert_eq!(
			authority.record(&RecordId::from("P1")).unwrap().field("phone"),
			Some(&json!("111"))
		);
	}

	#[tokio::test]
	async fn unmergeable_delta_is_counted_and_passed_over() {
		let clock = ManualClock::new(10_000);
		let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
		authority
			.write(
				&RecordId::from("P1"),
				RecordKind::Patient,
				fields(&[("phone", json!("111"))]),
				&ActorId::from("hq"),
			)
			.unwrap();
		let engine = SyncEngine::builder(ActorId::from("asha-1"), authority.clone())
			.clock(Arc::new(clock.clone()))
			.open()
			.await
			.unwrap();
		engine
			.edit(
				&RecordId::from("P1"),
				RecordKind::Visit,
				fields(&[("notes", json!("fever"))]),
				None,
			)
			.await
			.unwrap();

		let report = engine.run_cycle().await.unwrap();
		assert_eq!(report.merge.deltas, 0);
		assert_eq!(report.merge.rejected, 1);
		assert_eq!(engine.metrics().sync_deltas_rejected_total.get(), 1);
		assert_eq!(engine.status().watermark, 1);
		assert_eq!(engine.get_record(&RecordId::from("P1")).unwrap().kind, RecordKind::Visit);
	}

	#[tokio::test]
	async fn status_subscribers_see_counts_change() {
		let authority = Arc::new(MemoryAuthority::new());
		let engine = SyncEngine::builder(ActorId::from("asha-1"), authority)
			.open()
			.await
			.unwrap();
		let mut rx = engine.sync_state();
		engine
			.edit(
				&RecordId::from("P1"),
				RecordKind::Patient,
				fields(&[("phone", json!("1"))]),
				None,
			)
			.await
			.unwrap();
		rx.changed().await.unwrap();
		assert_eq!(rx.borrow().pending.pending, 1);
	}
}
