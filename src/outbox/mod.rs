//! Change log / outbox.
//!
//! An ordered, durable log of local field edits awaiting delivery. The log is
//! the only writer of an entry's `sync_state`.

mod retry;

pub use retry::RetryPolicy;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::model::{ActorId, Delta, FieldStamp, RecordId, RecordKind};
use crate::resolve::{CaseId, ConflictCase, ConflictMeta, FieldPolicy, ResolutionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
	Pending,
	InFlight,
	Acknowledged,
	Failed,
	Conflicted,
}

/// One outbound field edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
	pub entry_id: u64,
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub field: String,
	/// Shared field version the edit was made against.
	pub base_version: u64,
	/// Field value before the edit; `None` when the field did not exist.
	pub base_value: Option<Value>,
	pub new_value: Value,
	pub created_at: u64,
	pub author: ActorId,
	pub sync_state: SyncState,
	#[serde(default)]
	pub retry_count: u32,
	#[serde(default)]
	pub next_retry_at: Option<u64>,
	#[serde(default)]
	pub last_error: Option<String>,
	#[serde(default)]
	pub permanent: bool,
	#[serde(default)]
	pub acknowledged_at: Option<u64>,
}

impl ChangeEntry {
	pub fn is_unacknowledged(&self) -> bool {
		self.sync_state != SyncState::Acknowledged
	}

	/// The entry in the delta shape peers exchange.
	pub fn to_delta(&self) -> Delta {
		let mut fields = BTreeMap::new();
		fields.insert(self.field.clone(), self.new_value.clone());
		Delta {
			record_id: self.record_id.clone(),
			kind: self.kind,
			version: self.base_version + 1,
			fields,
			updated_at: self.created_at,
			updated_by: self.author.clone(),
		}
	}

	pub fn stamp(&self) -> FieldStamp {
		FieldStamp {
			version: self.base_version + 1,
			updated_at: self.created_at,
			updated_by: self.author.clone(),
		}
	}

	/// `PermanentSyncFailure` for an entry the engine has given up on.
	pub fn failure(&self) -> Option<SyncError> {
		self.permanent.then(|| SyncError::PermanentSyncFailure {
			entry_id: self.entry_id,
			attempts: self.retry_count,
			reason: self
				.last_error
				.clone()
				.unwrap_or_else(|| "no reason recorded".to_string()),
		})
	}
}

/// Input to [`ChangeLog::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub field: String,
	pub base_version: u64,
	pub base_value: Option<Value>,
	pub new_value: Value,
	pub created_at: u64,
	pub author: ActorId,
}

/// The other side's view of a field when a conflict is detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
	pub value: Value,
	pub stamp: FieldStamp,
}

/// What happened to an entry after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
	RetryAt(u64),
	Permanent,
}

/// Per-state entry counts for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
	pub pending: usize,
	pub in_flight: usize,
	pub failed: usize,
	pub conflicted: usize,
	pub permanent_failures: usize,
	pub acknowledged: usize,
}

impl PendingCounts {
	/// Entries not yet accepted by anyone.
	pub fn unsynced(&self) -> usize {
		self.pending + self.in_flight + self.failed + self.conflicted
	}
}

pub struct ChangeLog {
	entries: BTreeMap<u64, ChangeEntry>,
	next_id: u64,
	retry: RetryPolicy,
	retention: Duration,
}

impl ChangeLog {
	pub fn new(retry: RetryPolicy, retention: Duration) -> Self {
		Self {
			entries: BTreeMap::new(),
			next_id: 1,
			retry,
			retention,
		}
	}

	/// Rebuild from persisted entries. `next_id` is lifted above every stored id.
	pub fn restore(
		entries: impl IntoIterator<Item = ChangeEntry>,
		next_id: u64,
		retry: RetryPolicy,
		retention: Duration,
	) -> Self {
		let mut log = Self::new(retry, retention);
		for entry in entries {
			log.next_id = log.next_id.max(entry.entry_id + 1);
			log.entries.insert(entry.entry_id, entry);
		}
		log.next_id = log.next_id.max(next_id);
		log
	}

	pub fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	pub fn next_id(&self) -> u64 {
		self.next_id
	}

	pub fn append(&mut self, change: NewChange) -> u64 {
		let entry_id = self.next_id;
		self.next_id += 1;
		debug!(
			entry_id,
			record_id = %change.record_id,
			field = %change.field,
			base_version = change.base_version,
			"change appended"
		);
		self.entries.insert(
			entry_id,
			ChangeEntry {
				entry_id,
				record_id: change.record_id,
				kind: change.kind,
				field: change.field,
				base_version: change.base_version,
				base_value: change.base_value,
				new_value: change.new_value,
				created_at: change.created_at,
				author: change.author,
				sync_state: SyncState::Pending,
				retry_count: 0,
				next_retry_at: None,
				last_error: None,
				permanent: false,
				acknowledged_at: None,
			},
		);
		entry_id
	}

	pub fn get(&self, entry_id: u64) -> Option<&ChangeEntry> {
		self.entries.get(&entry_id)
	}

	/// All entries in creation order.
	pub fn entries(&self) -> impl Iterator<Item = &ChangeEntry> + Clone {
		self.entries.values()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Take up to `max` deliverable entries, oldest first, and mark them in flight.
	///
	/// Once an entry of a record is not deliverable (in flight, conflicted,
	/// backing off or permanently failed), no later entry of that record is
	/// handed out.
	pub fn next_batch(&mut self, max: usize, now: u64) -> Vec<ChangeEntry> {
		let mut blocked: HashSet<RecordId> = HashSet::new();
		let mut batch = Vec::new();
		for entry in self.entries.values_mut() {
			if batch.len() >= max {
				break;
			}
			if entry.sync_state == SyncState::Acknowledged || blocked.contains(&entry.record_id) {
				continue;
			}
			let eligible = match entry.sync_state {
				SyncState::Pending => true,
				SyncState::Failed => {
					!entry.permanent && entry.next_retry_at.is_none_or(|at| at <= now)
				}
				_ => false,
			};
			if !eligible {
				blocked.insert(entry.record_id.clone());
				continue;
			}
			entry.sync_state = SyncState::InFlight;
			batch.push(entry.clone());
		}
		batch
	}

	/// Deliverable entries without changing their state, for peer exchange.
	pub fn outbound(&self) -> Vec<ChangeEntry> {
		self.entries
			.values()
			.filter(|e| {
				matches!(
					e.sync_state,
					SyncState::Pending | SyncState::InFlight | SyncState::Failed
				) && !e.permanent
			})
			.cloned()
			.collect()
	}

	pub fn acknowledge(&mut self, entry_id: u64, now: u64) -> Result<&ChangeEntry> {
		let entry = self
			.entries
			.get_mut(&entry_id)
			.ok_or(SyncError::UnknownEntry(entry_id))?;
		entry.sync_state = SyncState::Acknowledged;
		entry.acknowledged_at = Some(now);
		entry.next_retry_at = None;
		entry.last_error = None;
		Ok(entry)
	}

	/// Drop acknowledged entries older than the retention window.
	pub fn prune(&mut self, now: u64) -> usize {
		let retention = self.retention.as_millis() as u64;
		let before = self.entries.len();
		self.entries.retain(|_, e| match (e.sync_state, e.acknowledged_at) {
			(SyncState::Acknowledged, Some(at)) => at.saturating_add(retention) > now,
			_ => true,
		});
		before - self.entries.len()
	}

	/// Record a failed delivery and schedule the next attempt.
	///
	/// `next_retry_at` strictly increases across failures of the same entry.
	pub fn mark_failed<R: Rng + ?Sized>(
		&mut self,
		entry_id: u64,
		reason: &str,
		now: u64,
		rng: &mut R,
	) -> Result<FailureOutcome> {
		let entry = self
			.entries
			.get_mut(&entry_id)
			.ok_or(SyncError::UnknownEntry(entry_id))?;
		entry.retry_count += 1;
		entry.last_error = Some(reason.to_string());
		entry.sync_state = SyncState::Failed;

		if self.retry.exhausted(entry.retry_count) {
			entry.permanent = true;
			entry.next_retry_at = None;
			warn!(
				entry_id,
				attempts = entry.retry_count,
				reason,
				"change gave up after retry budget"
			);
			return Ok(FailureOutcome::Permanent);
		}

		let delay = self.retry.delay(entry.retry_count, rng).as_millis() as u64;
		let mut at = now.saturating_add(delay);
		if let Some(previous) = entry.next_retry_at {
			at = at.max(previous + 1);
		}
		entry.next_retry_at = Some(at);
		debug!(entry_id, attempts = entry.retry_count, retry_at = at, "change scheduled for retry");
		Ok(FailureOutcome::RetryAt(at))
	}

	/// Mark an entry failed with no further retries.
	pub fn mark_permanent(&mut self, entry_id: u64, reason: &str) -> Result<()> {
		let entry = self
			.entries
			.get_mut(&entry_id)
			.ok_or(SyncError::UnknownEntry(entry_id))?;
		entry.retry_count += 1;
		entry.sync_state = SyncState::Failed;
		entry.permanent = true;
		entry.next_retry_at = None;
		entry.last_error = Some(reason.to_string());
		warn!(entry_id, reason, "change rejected permanently");
		Ok(())
	}

	/// Mark `entry_ids` conflicted and describe the conflict as a case.
	///
	/// The entries must all concern the same field of the same record. The local
	/// side of the case is the latest entry, the base is the earliest.
	pub fn mark_conflicted(
		&mut self,
		entry_ids: &[u64],
		remote: RemoteSnapshot,
		case_id: CaseId,
		policy: FieldPolicy,
		opened_at: u64,
	) -> Result<ConflictCase> {
		let ids: Vec<u64> =
			entry_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
		if ids.is_empty() {
			return Err(SyncError::InvalidInput("conflict without entries".to_string()));
		}
		for id in &ids {
			if !self.entries.contains_key(id) {
				return Err(SyncError::UnknownEntry(*id));
			}
		}
		let first = &self.entries[&ids[0]];
		let (record_id, kind, field, base_value) = (
			first.record_id.clone(),
			first.kind,
			first.field.clone(),
			first.base_value.clone(),
		);
		if ids.iter().any(|id| {
			let e = &self.entries[id];
			e.record_id != record_id || e.field != field
		}) {
			return Err(SyncError::InvalidInput(format!(
				"conflicted entries span more than {}.{}",
				record_id, field
			)));
		}

		for id in &ids {
			if let Some(entry) = self.entries.get_mut(id) {
				entry.sync_state = SyncState::Conflicted;
				entry.next_retry_at = None;
			}
		}
		let latest = &self.entries[&ids[ids.len() - 1]];

		Ok(ConflictCase {
			id: case_id,
			record_id,
			kind,
			field,
			local_value: latest.new_value.clone(),
			local_meta: ConflictMeta {
				author: latest.author.clone(),
				timestamp: latest.created_at,
			},
			remote_value: remote.value,
			remote_meta: ConflictMeta {
				author: remote.stamp.updated_by,
				timestamp: remote.stamp.updated_at,
			},
			remote_version: remote.stamp.version,
			base_value,
			entry_ids: ids,
			local_record_version: 0,
			policy,
			resolution_state: ResolutionState::Unresolved,
			opened_at,
			resolved_at: None,
		})
	}

	/// Park entries behind a case that is already open for their field.
	pub fn hold(&mut self, entry_ids: &[u64]) {
		for id in entry_ids {
			if let Some(entry) = self.entries.get_mut(id) {
				if entry.is_unacknowledged() {
					entry.sync_state = SyncState::Conflicted;
					entry.next_retry_at = None;
				}
			}
		}
	}

	/// Put every in-flight entry back to `Pending`. Used when a cycle is cancelled.
	pub fn revert_in_flight(&mut self) -> usize {
		let mut reverted = 0;
		for entry in self.entries.values_mut() {
			if entry.sync_state == SyncState::InFlight {
				entry.sync_state = SyncState::Pending;
				reverted += 1;
			}
		}
		reverted
	}

	/// Remove an entry from the log entirely.
	pub fn discard(&mut self, entry_id: u64) -> Result<ChangeEntry> {
		self.entries
			.remove(&entry_id)
			.ok_or(SyncError::UnknownEntry(entry_id))
	}

	/// Clear backoff and the permanent flag so the entry is sent next cycle.
	pub fn retry_now(&mut self, entry_id: u64) -> Result<()> {
		let entry = self
			.entries
			.get_mut(&entry_id)
			.ok_or(SyncError::UnknownEntry(entry_id))?;
		if entry.sync_state != SyncState::Failed {
			return Err(SyncError::InvalidInput(format!(
				"change {} is {:?}, not failed",
				entry_id, entry.sync_state
			)));
		}
		entry.sync_state = SyncState::Pending;
		entry.retry_count = 0;
		entry.permanent = false;
		entry.next_retry_at = None;
		Ok(())
	}

	/// Unacknowledged entries for one field, oldest first.
	pub fn unacked_for<'a>(
		&'a self,
		record_id: &'a RecordId,
		field: &'a str,
	) -> impl Iterator<Item = &'a ChangeEntry> + 'a {
		self.entries
			.values()
			.filter(move |e| e.is_unacknowledged() && &e.record_id == record_id && e.field == field)
	}

	pub fn permanent_failures(&self) -> Vec<&ChangeEntry> {
		self.entries.values().filter(|e| e.permanent).collect()
	}

	/// Earliest scheduled retry among failed entries.
	pub fn next_retry_at(&self) -> Option<u64> {
		self.entries
			.values()
			.filter(|e| e.sync_state == SyncState::Failed && !e.permanent)
			.filter_map(|e| e.next_retry_at)
			.min()
	}

	pub fn pending_counts(&self) -> PendingCounts {
		let mut counts = PendingCounts::default();
		for entry in self.entries.values() {
			match entry.sync_state {
				SyncState::Pending => counts.pending += 1,
				SyncState::InFlight => counts.in_flight += 1,
				SyncState::Acknowledged => counts.acknowledged += 1,
				SyncState::Conflicted => counts.conflicted += 1,
				SyncState::Failed if entry.permanent => counts.permanent_failures += 1,
				SyncState::Failed => counts.failed += 1,
			}
		}
		counts
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use rand::SeedableRng;
	use rand::rngs::StdRng;
	use serde_json::json;

	use super::*;

	fn change(record: &str, field: &str, value: Value) -> NewChange {
		NewChange {
			record_id: RecordId::from(record),
			kind: RecordKind::Patient,
			field: field.to_string(),
			base_version: 3,
			base_value: Some(json!("old")),
			new_value: value,
			created_at: 100,
			author: ActorId::from("asha-1"),
		}
	}

	fn log() -> ChangeLog {
		ChangeLog::new(RetryPolicy::default(), Duration::from_secs(60))
	}

	#[test]
	fn append_assigns_increasing_ids() {
		let mut l = log();
		let a = l.append(change("P1", "phone", json!("1")));
		let b = l.append(change("P1", "phone", json!("2")));
		assert!(b > a);
		assert_eq!(l.get(a).unwrap().sync_state, SyncState::Pending);
	}

	#[test]
	fn next_batch_holds_back_later_entries_of_a_blocked_record() {
		let mut l = log();
		let p1a = l.append(change("P1", "phone", json!("1")));
		let p2 = l.append(change("P2", "phone", json!("x")));
		let p1b = l.append(change("P1", "name", json!("Asha")));

		let mut rng = StdRng::seed_from_u64(1);
		let first = l.next_batch(1, 0);
		assert_eq!(first[0].entry_id, p1a);
		l.mark_failed(p1a, "offline", 0, &mut rng).unwrap();

		let second: Vec<u64> = l.next_batch(10, 0).iter().map(|e| e.entry_id).collect();
		assert_eq!(second, vec![p2]);
		assert_eq!(l.get(p1b).unwrap().sync_state, SyncState::Pending);
	}

	#[test]
	fn failed_entries_come_back_after_their_retry_time() {
		let mut l = log();
		let id = l.append(change("P1", "phone", json!("1")));
		let mut rng = StdRng::seed_from_u64(2);
		l.next_batch(10, 0);
		let FailureOutcome::RetryAt(at) = l.mark_failed(id, "timeout", 0, &mut rng).unwrap() else {
			panic!("expected a retry");
		};
		assert!(l.next_batch(10, at - 1).is_empty());
		assert_eq!(l.next_batch(10, at)[0].entry_id, id);
	}

	#[test]
	fn retry_times_strictly_increase_and_budget_ends_in_permanent_failure() {
		let mut l = ChangeLog::new(
			RetryPolicy {
				max_retries: 4,
				..RetryPolicy::default()
			},
			Duration::from_secs(60),
		);
		let id = l.append(change("P1", "phone", json!("1")));
		let mut rng = StdRng::seed_from_u64(3);
		let mut last = 0;
		for _ in 0..3 {
			match l.mark_failed(id, "offline", 0, &mut rng).unwrap() {
				FailureOutcome::RetryAt(at) => {
					assert!(at > last);
					last = at;
				}
				FailureOutcome::Permanent => panic!("gave up too early"),
			}
		}
		assert_eq!(l.mark_failed(id, "offline", 0, &mut rng).unwrap(), FailureOutcome::Permanent);
		assert_eq!(l.permanent_failures().len(), 1);
		assert!(l.next_batch(10, u64::MAX).is_empty());

		l.retry_now(id).unwrap();
		assert_eq!(l.next_batch(10, 0).len(), 1);
	}

	#[test]
	fn prune_keeps_recent_acknowledgements() {
		let mut l = log();
		let a = l.append(change("P1", "phone", json!("1")));
		let b = l.append(change("P2", "phone", json!("2")));
		l.next_batch(10, 0);
		l.acknowledge(a, 1_000).unwrap();
		l.acknowledge(b, 50_000).unwrap();
		assert_eq!(l.prune(61_000), 1);
		assert!(l.get(a).is_none());
		assert!(l.get(b).is_some());
	}

	#[test]
	fn mark_conflicted_builds_a_case_from_the_entries() {
		let mut l = log();
		let a = l.append(change("P1", "phone", json!("222")));
		let b = l.append(change("P1", "phone", json!("223")));
		let remote = RemoteSnapshot {
			value: json!("333"),
			stamp: FieldStamp {
				version: 4,
				updated_at: 90,
				updated_by: ActorId::from("asha-2"),
			},
		};
		let case = l
			.mark_conflicted(&[b, a], remote, 7, FieldPolicy::Scalar, 500)
			.unwrap();
		assert_eq!(case.entry_ids, vec![a, b]);
		assert_eq!(case.local_value, json!("223"));
		assert_eq!(case.remote_value, json!("333"));
		assert_eq!(case.remote_version, 4);
		assert_eq!(case.base_value, Some(json!("old")));
		assert_eq!(l.pending_counts().conflicted, 2);
	}

	#[test]
	fn revert_in_flight_returns_entries_to_pending() {
		let mut l = log();
		l.append(change("P1", "phone", json!("1")));
		l.append(change("P2", "phone", json!("2")));
		assert_eq!(l.next_batch(10, 0).len(), 2);
		assert_eq!(l.revert_in_flight(), 2);
		assert_eq!(l.pending_counts().pending, 2);
	}
}
