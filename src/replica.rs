//! One device's replica: record store, outbox, resolver and pull watermark.
//!
//! Every method here is synchronous. Callers hold the replica lock for the
//! duration of a call and never across an await, so a merge either lands
//! completely or not at all.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::mesh::PeerId;
use crate::model::{ActorId, Clock, Delta, FieldStamp, Record, RecordId, RecordKind};
use crate::outbox::{ChangeEntry, ChangeLog, NewChange, RemoteSnapshot, RetryPolicy, SyncState};
use crate::resolve::{
	CaseId, ConflictCase, ConflictResolver, Decision, FieldPolicy, ResolutionChoice,
	ResolutionState, ResolverConfig,
};
use crate::store::{LocalRecordStore, WriteEvent, WriteOrigin};

/// Knobs shared by the outbox and resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaConfig {
	pub retry: RetryPolicy,
	pub ack_retention: Duration,
	pub resolver: ResolverConfig,
}

impl Default for ReplicaConfig {
	fn default() -> Self {
		Self {
			retry: RetryPolicy::default(),
			ack_retention: Duration::from_secs(24 * 60 * 60),
			resolver: ResolverConfig::default(),
		}
	}
}

/// What merging one or more deltas did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
	pub deltas: usize,
	pub applied_fields: usize,
	pub skipped_fields: usize,
	pub conflicts_detected: usize,
	pub auto_resolved: usize,
	pub escalated: Vec<CaseId>,
	/// Deltas that only refreshed the remote side of an open case.
	pub refreshed: usize,
	/// Deltas that could not be merged at all and were dropped.
	pub rejected: usize,
}

impl MergeReport {
	pub fn absorb(&mut self, other: MergeReport) {
		self.deltas += other.deltas;
		self.applied_fields += other.applied_fields;
		self.skipped_fields += other.skipped_fields;
		self.conflicts_detected += other.conflicts_detected;
		self.auto_resolved += other.auto_resolved;
		self.escalated.extend(other.escalated);
		self.refreshed += other.refreshed;
		self.rejected += other.rejected;
	}
}

/// Everything a replica persists between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
	pub actor: ActorId,
	pub records: Vec<Record>,
	pub entries: Vec<ChangeEntry>,
	pub next_entry_id: u64,
	#[serde(default)]
	pub open_conflicts: Vec<ConflictCase>,
	#[serde(default)]
	pub archived_conflicts: Vec<ConflictCase>,
	pub next_case_id: CaseId,
	pub watermark: u64,
	/// Peers this device has paired with for mesh exchange.
	#[serde(default)]
	pub paired_peers: BTreeSet<PeerId>,
}

impl ReplicaSnapshot {
	/// Structural checks run on every load.
	pub fn validate(&self) -> Result<()> {
		let corrupt = |msg: String| Err(SyncError::CorruptLocalState(msg));

		let mut kinds: BTreeMap<&RecordId, RecordKind> = BTreeMap::new();
		for record in &self.records {
			if record.version == 0 {
				return corrupt(format!("record {} has version 0", record.id));
			}
			if kinds.insert(&record.id, record.kind).is_some() {
				return corrupt(format!("record {} stored twice", record.id));
			}
		}

		let mut last_id = 0;
		for entry in &self.entries {
			if entry.entry_id <= last_id {
				return corrupt(format!("change {} out of order", entry.entry_id));
			}
			if entry.entry_id >= self.next_entry_id {
				return corrupt(format!(
					"change {} beyond id counter {}",
					entry.entry_id,
					self.next_entry_id
				));
			}
			match kinds.get(&entry.record_id) {
				Some(kind) if *kind == entry.kind => {}
				Some(_) => {
					return corrupt(format!("change {} has the wrong record kind", entry.entry_id));
				}
				None => {
					return corrupt(format!(
						"change {} refers to missing record {}",
						entry.entry_id, entry.record_id
					));
				}
			}
			last_id = entry.entry_id;
		}

		let mut case_ids = BTreeSet::new();
		for case in self.open_conflicts.iter().chain(self.archived_conflicts.iter()) {
			if case.id >= self.next_case_id || !case_ids.insert(case.id) {
				return corrupt(format!("conflict case {} has an invalid id", case.id));
			}
		}
		if self
			.open_conflicts
			.iter()
			.any(|c| c.resolution_state != ResolutionState::Unresolved)
		{
			return corrupt("resolved case stored as open".to_string());
		}
		Ok(())
	}
}

pub struct Replica {
	actor: ActorId,
	store: LocalRecordStore,
	writes: UnboundedReceiver<WriteEvent>,
	log: ChangeLog,
	resolver: ConflictResolver,
	watermark: u64,
	paired_peers: BTreeSet<PeerId>,
}

impl Replica {
	pub fn new(actor: ActorId, clock: Arc<dyn Clock>, config: ReplicaConfig) -> Self {
		let mut store = LocalRecordStore::new(clock);
		let writes = store.subscribe();
		Self {
			actor,
			store,
			writes,
			log: ChangeLog::new(config.retry, config.ack_retention),
			resolver: ConflictResolver::new(config.resolver),
			watermark: 0,
			paired_peers: BTreeSet::new(),
		}
	}

	/// Rebuild from a persisted snapshot.
	///
	/// Entries that were in flight when the snapshot was taken go back to
	/// `Pending`; the authority either never saw them or will report them as
	/// duplicates of what it already has.
	pub fn from_snapshot(
		snapshot: ReplicaSnapshot,
		clock: Arc<dyn Clock>,
		config: ReplicaConfig,
	) -> Result<Self> {
		snapshot.validate()?;
		let mut store = LocalRecordStore::from_records(snapshot.records, clock);
		let writes = store.subscribe();
		let mut log = ChangeLog::restore(
			snapshot.entries,
			snapshot.next_entry_id,
			config.retry,
			config.ack_retention,
		);
		let reverted = log.revert_in_flight();
		if reverted > 0 {
			info!(reverted, "in-flight changes returned to pending after restart");
		}
		Ok(Self {
			actor: snapshot.actor,
			store,
			writes,
			log,
			resolver: ConflictResolver::restore(
				config.resolver,
				snapshot.open_conflicts,
				snapshot.archived_conflicts,
				snapshot.next_case_id,
			),
			watermark: snapshot.watermark,
			paired_peers: snapshot.paired_peers,
		})
	}

	pub fn snapshot(&self) -> ReplicaSnapshot {
		ReplicaSnapshot {
			actor: self.actor.clone(),
			records: self.store.list(|_| true).cloned().collect(),
			entries: self.log.entries().cloned().collect(),
			next_entry_id: self.log.next_id(),
			open_conflicts: self.resolver.open_cases().cloned().collect(),
			archived_conflicts: self.resolver.archived().cloned().collect(),
			next_case_id: self.resolver.next_case_id(),
			watermark: self.watermark,
			paired_peers: self.paired_peers.clone(),
		}
	}

	pub fn paired_peers(&self) -> &BTreeSet<PeerId> {
		&self.paired_peers
	}

	/// Remember a pairing. Returns false if the peer was already paired.
	pub fn pair_peer(&mut self, peer: PeerId) -> bool {
		self.paired_peers.insert(peer)
	}

	pub fn actor(&self) -> &ActorId {
		&self.actor
	}

	pub fn store(&self) -> &LocalRecordStore {
		&self.store
	}

	pub fn log(&self) -> &ChangeLog {
		&self.log
	}

	pub fn log_mut(&mut self) -> &mut ChangeLog {
		&mut self.log
	}

	pub fn resolver(&self) -> &ConflictResolver {
		&self.resolver
	}

	pub fn watermark(&self) -> u64 {
		self.watermark
	}

	pub fn set_watermark(&mut self, watermark: u64) {
		self.watermark = self.watermark.max(watermark);
	}

	/// Wall-clock milliseconds, for retry scheduling.
	pub fn now(&self) -> u64 {
		self.store.wall_clock()
	}

	/// Turn outbound write events into change entries.
	///
	/// `base_override` replaces the recorded base value of the named field; a
	/// resolution write is based on the side it supersedes, not on the local
	/// value it overwrites.
	fn drain_writes(&mut self, base_override: Option<(&str, Value)>) {
		while let Ok(event) = self.writes.try_recv() {
			if !event.origin.is_outbound() {
				continue;
			}
			for change in event.changes {
				let base_value = match &base_override {
					Some((field, value)) if *field == change.field => Some(value.clone()),
					_ => change.old_value,
				};
				self.log.append(NewChange {
					record_id: event.record_id.clone(),
					kind: event.kind,
					base_version: change.new_stamp.version.saturating_sub(1),
					base_value,
					new_value: change.new_value.unwrap_or(Value::Null),
					created_at: change.new_stamp.updated_at,
					author: change.new_stamp.updated_by,
					field: change.field,
				});
			}
		}
	}

	/// Local write from the screens. Each changed field becomes one outbox entry.
	///
	/// Writing values identical to what is stored is a no-op and creates nothing.
	pub fn edit(
		&mut self,
		record_id: &RecordId,
		kind: RecordKind,
		changes: BTreeMap<String, Value>,
		expected_version: Option<u64>,
	) -> Result<u64> {
		let mut record = match self.store.get(record_id) {
			Ok(existing) => existing.clone(),
			Err(SyncError::NotFound(_)) => Record::new(record_id.clone(), kind),
			Err(e) => return Err(e),
		};
		if record.kind != kind {
			return Err(SyncError::InvalidInput(format!(
				"record {} is a {}, not a {}",
				record_id, record.kind, kind
			)));
		}
		let mut changed = false;
		for (field, value) in changes {
			if record.fields.get(&field) != Some(&value) {
				record.fields.insert(field, value);
				changed = true;
			}
		}
		if !changed {
			if let Some(expected) = expected_version {
				if expected != record.version {
					return Err(SyncError::VersionConflict {
						record_id: record_id.clone(),
						expected,
						actual: record.version,
					});
				}
			}
			return Ok(record.version);
		}

		let actor = self.actor.clone();
		let version = self.store.put(record, expected_version, &actor, WriteOrigin::Local)?;
		self.drain_writes(None);
		Ok(version)
	}

	/// Merge one delta from the authority or a peer.
	///
	/// Fields without unacknowledged local edits take the remote value when its
	/// stamp is greater. Fields with local edits either ignore the delta (stale,
	/// our own echo, or the same value) or raise a conflict.
	pub fn apply_delta(&mut self, delta: &Delta) -> Result<MergeReport> {
		let mut report = MergeReport {
			deltas: 1,
			..MergeReport::default()
		};
		let current = match self.store.get(&delta.record_id) {
			Ok(existing) => Some(existing.clone()),
			Err(SyncError::NotFound(_)) => None,
			Err(e) => return Err(e),
		};
		if let Some(existing) = &current {
			if existing.kind != delta.kind {
				return Err(SyncError::InvalidInput(format!(
					"delta for {} claims kind {}, stored kind is {}",
					delta.record_id, delta.kind, existing.kind
				)));
			}
		}
		let expected = current.as_ref().map_or(0, |r| r.version);
		let mut record =
			current.unwrap_or_else(|| Record::new(delta.record_id.clone(), delta.kind));
		let remote_stamp = delta.stamp();

		let mut fast_path = false;
		let mut decided = Vec::new();
		for (field, value) in &delta.fields {
			let unacked: Vec<(u64, u64, Value)> = self
				.log
				.unacked_for(&delta.record_id, field)
				.map(|e| (e.entry_id, e.base_version, e.new_value.clone()))
				.collect();

			let Some((_, first_base, _)) = unacked.first() else {
				if remote_stamp > record.stamp(field) {
					record.fields.insert(field.clone(), value.clone());
					record.stamps.insert(field.clone(), remote_stamp.clone());
					fast_path = true;
					report.applied_fields += 1;
				} else {
					report.skipped_fields += 1;
				}
				continue;
			};
			// A delta behind our base is stale, except that a scalar write with a
			// newer key still wins wherever it lands.
			let local_stamp = record.stamp(field);
			let newer_scalar = self.resolver.policy_for(delta.kind, field) == FieldPolicy::Scalar
				&& remote_stamp.lww_key() > local_stamp.lww_key();
			let stale = delta.version <= *first_base && !newer_scalar;
			let latest_value = unacked.last().map(|(_, _, v)| v);
			if delta.updated_by == self.actor || stale || latest_value == Some(value) {
				report.skipped_fields += 1;
				continue;
			}

			let ids: Vec<u64> = unacked.iter().map(|(id, _, _)| *id).collect();
			let snapshot = RemoteSnapshot {
				value: value.clone(),
				stamp: remote_stamp.clone(),
			};
			if let Some(pending) =
				self.raise_conflict(
					&delta.record_id,
					delta.kind,
					field,
					&ids,
					snapshot,
					expected,
					&mut report,
				)?
			{
				decided.push(pending);
			}
		}

		if fast_path {
			self.store.put(record, Some(expected), &delta.updated_by, WriteOrigin::Remote)?;
			self.drain_writes(None);
		}
		for (case, choice) in decided {
			self.commit_resolution(case, choice, false)?;
			report.auto_resolved += 1;
		}
		Ok(report)
	}

	/// Open or refresh the conflict for one field.
	///
	/// Returns the case and choice when the automatic policy settles it; the
	/// caller commits it once any pending remote write has landed.
	#[allow(clippy::too_many_arguments)]
	fn raise_conflict(
		&mut self,
		record_id: &RecordId,
		kind: RecordKind,
		field: &str,
		entry_ids: &[u64],
		remote: RemoteSnapshot,
		local_record_version: u64,
		report: &mut MergeReport,
	) -> Result<Option<(ConflictCase, ResolutionChoice)>> {
		if let Some(case) = self.resolver.open_case_for_mut(record_id, field) {
			let known = FieldStamp {
				version: case.remote_version,
				updated_at: case.remote_meta.timestamp,
				updated_by: case.remote_meta.author.clone(),
			};
			if remote.stamp > known {
				case.remote_value = remote.value;
				case.remote_version = remote.stamp.version;
				case.remote_meta.timestamp = remote.stamp.updated_at;
				case.remote_meta.author = remote.stamp.updated_by;
			}
			debug!(case_id = case.id, record_id = %record_id, field, "open conflict refreshed");
			self.log.hold(entry_ids);
			report.refreshed += 1;
			return Ok(None);
		}

		let policy = self.resolver.policy_for(kind, field);
		let case_id = self.resolver.allocate_id();
		let now = self.store.wall_clock();
		let mut case = self.log.mark_conflicted(entry_ids, remote, case_id, policy, now)?;
		case.local_record_version = local_record_version;
		report.conflicts_detected += 1;
		info!(case_id, record_id = %record_id, field, ?policy, "conflict detected");

		match self.resolver.decide(&case) {
			Decision::Resolve(choice) => Ok(Some((case, choice))),
			Decision::Escalate(reason) => {
				debug!(case_id, reason = %reason, "automatic resolution declined");
				self.resolver.open(case);
				report.escalated.push(case_id);
				Ok(None)
			}
		}
	}

	/// Write the chosen value and archive the case.
	///
	/// An automatic remote win adopts the remote stamp as-is and produces no
	/// outbox entry. An automatic local win keeps the local write's
	/// `(updated_at, updated_by)` and re-sends it at `max(local, remote) + 1`,
	/// so the winning key is the same on every replica. Manual and merged
	/// values are new writes, stamped after both sides.
	fn commit_resolution(
		&mut self,
		case: ConflictCase,
		choice: ResolutionChoice,
		manual: bool,
	) -> Result<ConflictCase> {
		let value = case.chosen_value(&choice);
		let mut record = self.store.get(&case.record_id)?.clone();
		let expected = record.version;
		for id in &case.entry_ids {
			if self.log.discard(*id).is_err() {
				debug!(entry_id = id, case_id = case.id, "superseded change already gone");
			}
		}

		let remote_stamp = FieldStamp {
			version: case.remote_version,
			updated_at: case.remote_meta.timestamp,
			updated_by: case.remote_meta.author.clone(),
		};
		if !manual && choice == ResolutionChoice::Remote {
			record.fields.insert(case.field.clone(), value);
			record.stamps.insert(case.field.clone(), remote_stamp);
			self.store.put(record, Some(expected), &case.remote_meta.author, WriteOrigin::Remote)?;
			self.drain_writes(None);
		} else {
			let local_stamp = record.stamp(&case.field);
			let version = local_stamp.version.max(case.remote_version) + 1;
			let stamp = if !manual && choice == ResolutionChoice::Local {
				FieldStamp {
					version,
					..local_stamp.clone()
				}
			} else {
				self.store.observe(case.remote_meta.timestamp);
				FieldStamp {
					version,
					updated_at: self.store.tick(),
					updated_by: self.actor.clone(),
				}
			};
			let base = if case.remote_version >= local_stamp.version {
				case.remote_value.clone()
			} else {
				record.field(&case.field).cloned().unwrap_or(Value::Null)
			};
			record.fields.insert(case.field.clone(), value);
			record.stamps.insert(case.field.clone(), stamp);
			let actor = self.actor.clone();
			self.store.put(record, Some(expected), &actor, WriteOrigin::Resolution)?;
			self.drain_writes(Some((case.field.as_str(), base)));
		}

		let now = self.store.wall_clock();
		let closed = self.resolver.archive(case, &choice, now);
		info!(case_id = closed.id, state = ?closed.resolution_state, manual, "conflict resolved");
		Ok(closed)
	}

	/// Apply a user decision to an open case.
	///
	/// If the field was edited locally after the case was opened, the case is
	/// replaced by a fresh one carrying the current local value and the caller
	/// gets `ConflictReraised`.
	pub fn resolve(&mut self, case_id: CaseId, choice: ResolutionChoice) -> Result<ConflictCase> {
		let case = self.resolver.get(case_id)?.clone();
		let unacked: Vec<u64> = self
			.log
			.unacked_for(&case.record_id, &case.field)
			.map(|e| e.entry_id)
			.collect();

		if unacked.iter().any(|id| !case.entry_ids.contains(id)) {
			let new_case = self.resolver.allocate_id();
			let snapshot = RemoteSnapshot {
				value: case.remote_value.clone(),
				stamp: FieldStamp {
					version: case.remote_version,
					updated_at: case.remote_meta.timestamp,
					updated_by: case.remote_meta.author.clone(),
				},
			};
			let now = self.store.wall_clock();
			let mut fresh = self.log.mark_conflicted(
				&unacked,
				snapshot,
				new_case,
				case.policy,
				now,
			)?;
			fresh.local_record_version = self.store.get(&case.record_id).map_or(0, |r| r.version);
			self.resolver.replace(case_id, fresh);
			warn!(
				old_case = case_id,
				new_case,
				"local value changed since detection; conflict re-raised"
			);
			return Err(SyncError::ConflictReraised {
				old_case: case_id,
				new_case,
			});
		}

		self.commit_resolution(case, choice, true)
	}

	/// The authority accepted an entry at `assigned_version`.
	///
	/// When the field still carries that entry's stamp, the stamp takes the
	/// assigned version so the authority's echo of the write is a no-op.
	pub fn acknowledge(&mut self, entry_id: u64, assigned_version: u64) -> Result<()> {
		let now = self.store.wall_clock();
		let entry = self.log.acknowledge(entry_id, now)?.clone();
		let Ok(record) = self.store.get(&entry.record_id) else {
			return Ok(());
		};
		let stamp = record.stamp(&entry.field);
		if stamp.updated_at != entry.created_at
			|| stamp.updated_by != entry.author
			|| stamp.version == assigned_version
		{
			return Ok(());
		}
		let mut record = record.clone();
		let expected = record.version;
		record.stamps.insert(
			entry.field.clone(),
			FieldStamp {
				version: assigned_version,
				..stamp
			},
		);
		self.store.put(record, Some(expected), &entry.author, WriteOrigin::Remote)?;
		self.drain_writes(None);
		Ok(())
	}

	/// The authority refused an entry because the field moved on.
	pub fn remote_conflict(
		&mut self,
		entry_id: u64,
		remote: RemoteSnapshot,
	) -> Result<MergeReport> {
		let entry = self
			.log
			.get(entry_id)
			.cloned()
			.ok_or(SyncError::UnknownEntry(entry_id))?;
		let ids: Vec<u64> = self
			.log
			.unacked_for(&entry.record_id, &entry.field)
			.map(|e| e.entry_id)
			.collect();
		let record_version = self.store.get(&entry.record_id).map_or(0, |r| r.version);

		let mut report = MergeReport::default();
		if let Some((case, choice)) = self.raise_conflict(
			&entry.record_id,
			entry.kind,
			&entry.field,
			&ids,
			remote,
			record_version,
			&mut report,
		)? {
			self.commit_resolution(case, choice, false)?;
			report.auto_resolved += 1;
		}
		Ok(report)
	}

	/// Deliverable outbox entries as deltas, for a peer.
	pub fn outbound_deltas(&self) -> Vec<Delta> {
		self.log.outbound().iter().map(ChangeEntry::to_delta).collect()
	}

	pub fn get_record(&self, id: &RecordId) -> Result<Record> {
		self.store.get(id).cloned()
	}

	pub fn open_conflicts(&self) -> Vec<ConflictCase> {
		self.resolver.open_cases().cloned().collect()
	}

	pub fn unsynced_entries(&self) -> usize {
		self.log
			.entries()
			.filter(|e| e.sync_state != SyncState::Acknowledged)
			.count()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use rand::SeedableRng;
	use rand::rngs::StdRng;
	use rand::seq::SliceRandom;
	use serde_json::json;

	use super::*;
	use crate::model::ManualClock;

	fn replica(actor: &str, clock: &ManualClock, resolver: ResolverConfig) -> Replica {
		Replica::new(
			ActorId::from(actor),
			Arc::new(clock.clone()),
			ReplicaConfig {
				resolver,
				..ReplicaConfig::default()
			},
		)
	}

	fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
	}

	fn delta(id: &str, version: u64, field: &str, value: Value, at: u64, by: &str) -> Delta {
		Delta {
			record_id: RecordId::from(id),
			kind: RecordKind::Patient,
			version,
			fields: fields(&[(field, value)]),
			updated_at: at,
			updated_by: ActorId::from(by),
		}
	}

	#[test]
	fn local_edit_creates_one_entry_per_changed_field() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		let p1 = RecordId::from("P1");
		r.edit(
			&p1,
			RecordKind::Patient,
			fields(&[("phone", json!("111")), ("name", json!("Sita"))]),
			None,
		)
			.unwrap();
		assert_eq!(r.log().len(), 2);

		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("111"))]), None).unwrap();
		assert_eq!(r.log().len(), 2, "unchanged value must not create an entry");
	}

	#[test]
	fn remote_delta_is_applied_without_echoing_into_the_outbox() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		let report = r.apply_delta(&delta("P1", 1, "phone", json!("111"), 10, "asha-2")).unwrap();
		assert_eq!(report.applied_fields, 1);
		assert!(r.log().is_empty());

		let again = r.apply_delta(&delta("P1", 1, "phone", json!("111"), 10, "asha-2")).unwrap();
		assert_eq!(again.skipped_fields, 1);
		assert_eq!(r.get_record(&RecordId::from("P1")).unwrap().version, 1);
	}

	#[test]
	fn stale_remote_write_is_ignored() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		r.apply_delta(&delta("P1", 5, "phone", json!("new"), 50, "asha-2")).unwrap();
		r.apply_delta(&delta("P1", 4, "phone", json!("old"), 40, "asha-3")).unwrap();
		assert_eq!(
			r.get_record(&RecordId::from("P1")).unwrap().field("phone"),
			Some(&json!("new"))
		);
	}

	#[test]
	fn newer_scalar_write_behind_our_base_still_wins() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		let p1 = RecordId::from("P1");
		r.apply_delta(&delta("P1", 1, "phone", json!("111"), 10, "asha-2")).unwrap();
		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("222"))]), None).unwrap();

		let report =
			r.apply_delta(&delta("P1", 1, "phone", json!("333"), 5_000, "asha-3")).unwrap();
		assert_eq!(report.conflicts_detected, 1);
		assert_eq!(report.auto_resolved, 1);
		let stored = r.get_record(&p1).unwrap();
		assert_eq!(stored.field("phone"), Some(&json!("333")));
		assert_eq!(stored.stamp("phone").lww_key(), (5_000, &ActorId::from("asha-3")));
		assert_eq!(r.unsynced_entries(), 0);
	}

	#[test]
	fn automatic_local_win_resends_the_original_write() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		let p1 = RecordId::from("P1");
		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("222"))]), None).unwrap();
		clock.advance(Duration::from_secs(60));

		let report = r.apply_delta(&delta("P1", 3, "phone", json!("333"), 500, "asha-2")).unwrap();
		assert_eq!(report.auto_resolved, 1);
		let stamp = r.get_record(&p1).unwrap().stamp("phone");
		assert_eq!(stamp.version, 4);
		assert_eq!(stamp.lww_key(), (1_000, &ActorId::from("asha-1")));

		let outbound = r.outbound_deltas();
		assert_eq!(outbound.len(), 1);
		assert_eq!(outbound[0].version, 4);
		assert_eq!(outbound[0].updated_at, 1_000);
		assert_eq!(outbound[0].fields.get("phone"), Some(&json!("222")));
	}

	#[test]
	fn applying_the_same_deltas_in_any_order_gives_the_same_record() {
		let writes = [
			delta("P1", 1, "phone", json!("111"), 100, "asha-1"),
			delta("P1", 2, "phone", json!("222"), 90, "asha-2"),
			delta("P1", 1, "phone", json!("333"), 100, "asha-3"),
			delta("P1", 4, "village", json!("Rampur"), 40, "asha-2"),
			delta("P1", 3, "village", json!("Sitapur"), 70, "asha-1"),
			delta("P1", 1, "name", json!("Sita"), 10, "asha-3"),
		];
		let mut rng = StdRng::seed_from_u64(11);
		let mut seen = Vec::new();
		for _ in 0..24 {
			let mut order: Vec<&Delta> = writes.iter().chain(writes.iter()).collect();
			order.shuffle(&mut rng);
			let clock = ManualClock::new(1_000);
			let mut r = replica("asha-9", &clock, ResolverConfig::default());
			for d in order {
				r.apply_delta(d).unwrap();
			}
			let stored = r.get_record(&RecordId::from("P1")).unwrap();
			seen.push((stored.fields, stored.stamps));
		}
		assert!(seen.windows(2).all(|w| w[0] == w[1]));
		let (fields, _) = &seen[0];
		assert_eq!(fields.get("phone"), Some(&json!("333")));
		assert_eq!(fields.get("village"), Some(&json!("Sitapur")));
	}

	#[test]
	fn replicas_with_offline_edits_converge_in_every_exchange_order() {
		let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
		let p1 = RecordId::from("P1");
		let mut outcomes = Vec::new();
		for order in orders {
			let clock = ManualClock::new(1_000);
			let mut replicas: Vec<Replica> = ["asha-1", "asha-2", "asha-3"]
				.iter()
				.map(|a| replica(a, &clock, ResolverConfig::default()))
				.collect();
			for (i, r) in replicas.iter_mut().enumerate() {
				clock.advance(Duration::from_millis(100));
				let mut changes = fields(&[("phone", json!(format!("98450-{i}")))]);
				if i != 1 {
					changes.insert("village".to_string(), json!(format!("village-{i}")));
				}
				r.edit(&p1, RecordKind::Patient, changes, None).unwrap();
			}

			for _ in 0..3 {
				for &from in &order {
					let deltas = replicas[from].outbound_deltas();
					for &to in order.iter().filter(|&&to| to != from) {
						for d in deltas.iter().chain(deltas.iter()) {
							replicas[to].apply_delta(d).unwrap();
						}
					}
				}
			}

			let states: Vec<BTreeMap<String, Value>> =
				replicas.iter().map(|r| r.get_record(&p1).unwrap().fields).collect();
			assert!(
				states.windows(2).all(|w| w[0] == w[1]),
				"order {order:?} diverged: {states:?}"
			);
			outcomes.push(states[0].clone());
		}
		assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
		assert_eq!(outcomes[0].get("phone"), Some(&json!("98450-2")));
		assert_eq!(outcomes[0].get("village"), Some(&json!("village-2")));
	}

	#[test]
	fn concurrent_scalar_edit_is_escalated_when_auto_resolve_is_off() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default().with_auto_resolve(false));
		let p1 = RecordId::from("P1");
		r.apply_delta(&delta("P1", 3, "phone", json!("111"), 10, "asha-2")).unwrap();
		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("222"))]), None).unwrap();

		let report = r.apply_delta(&delta("P1", 4, "phone", json!("333"), 20, "asha-2")).unwrap();
		assert_eq!(report.conflicts_detected, 1);
		assert_eq!(report.escalated.len(), 1);
		let case = &r.open_conflicts()[0];
		assert_eq!(case.local_value, json!("222"));
		assert_eq!(case.remote_value, json!("333"));
		assert_eq!(r.log().pending_counts().conflicted, 1);
	}

	#[test]
	fn editing_after_detection_re_raises_the_case() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default().with_auto_resolve(false));
		let p1 = RecordId::from("P1");
		r.apply_delta(&delta("P1", 3, "phone", json!("111"), 10, "asha-2")).unwrap();
		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("222"))]), None).unwrap();
		r.apply_delta(&delta("P1", 4, "phone", json!("333"), 20, "asha-2")).unwrap();
		let case_id = r.open_conflicts()[0].id;

		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("444"))]), None).unwrap();
		let err = r.resolve(case_id, ResolutionChoice::Local).unwrap_err();
		let SyncError::ConflictReraised { old_case, new_case } = err else {
			panic!("expected a re-raise, got {:?}", err);
		};
		assert_eq!(old_case, case_id);
		let fresh = r.resolver().get(new_case).unwrap();
		assert_eq!(fresh.local_value, json!("444"));
		assert!(r.resolver().get(case_id).is_err());
	}

	#[test]
	fn snapshot_round_trip_preserves_state() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		let p1 = RecordId::from("P1");
		r.edit(&p1, RecordKind::Patient, fields(&[("phone", json!("111"))]), None).unwrap();
		r.set_watermark(9);

		let snapshot = r.snapshot();
		snapshot.validate().unwrap();
		let restored = Replica::from_snapshot(
			snapshot.clone(),
			Arc::new(clock.clone()),
			ReplicaConfig::default(),
		).unwrap();
		assert_eq!(restored.snapshot(), snapshot);
	}

	#[test]
	fn validation_rejects_entries_for_missing_records() {
		let clock = ManualClock::new(1_000);
		let mut r = replica("asha-1", &clock, ResolverConfig::default());
		r.edit(&RecordId::from("P1"), RecordKind::Patient, fields(&[("phone", json!("1"))]), None)
			.unwrap();
		let mut snapshot = r.snapshot();
		snapshot.records.clear();
		assert!(matches!(snapshot.validate(), Err(SyncError::CorruptLocalState(_))));
	}
}
