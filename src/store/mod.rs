//! Local record store: keyed, versioned records with compare-and-swap writes.
//!
//! The store knows nothing about the outbox. Every accepted write is announced
//! as a [`WriteEvent`] on the subscriber channels, and the replica turns local
//! ones into change entries.

use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{ActorId, Clock, FieldStamp, LogicalClock, Record, RecordId, RecordKind};

/// Where a write came from. Only `Local` and `Resolution` writes are outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
	/// An edit made on this device.
	Local,
	/// A delta from the authority or a peer.
	Remote,
	/// A reconciled value chosen by the conflict resolver.
	Resolution,
}

impl WriteOrigin {
	pub fn is_outbound(self) -> bool {
		matches!(self, WriteOrigin::Local | WriteOrigin::Resolution)
	}
}

/// One field touched by a write (value or stamp differ from before).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
	pub field: String,
	pub old_value: Option<Value>,
	pub new_value: Option<Value>,
	pub old_stamp: FieldStamp,
	pub new_stamp: FieldStamp,
}

/// Emitted after every successful `put`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub origin: WriteOrigin,
	pub version: u64,
	pub updated_at: u64,
	pub updated_by: ActorId,
	pub changes: Vec<FieldChange>,
}

pub struct LocalRecordStore {
	records: BTreeMap<RecordId, Record>,
	clock: LogicalClock,
	subscribers: Vec<UnboundedSender<WriteEvent>>,
}

impl LocalRecordStore {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self {
			records: BTreeMap::new(),
			clock: LogicalClock::new(clock),
			subscribers: Vec::new(),
		}
	}

	/// Rebuild from persisted records, keeping timestamps monotone across restarts.
	pub fn from_records(records: impl IntoIterator<Item = Record>, clock: Arc<dyn Clock>) -> Self {
		let mut store = Self::new(clock);
		for record in records {
			store.clock.observe(record.updated_at);
			for stamp in record.stamps.values() {
				store.clock.observe(stamp.updated_at);
			}
			store.records.insert(record.id.clone(), record);
		}
		store
	}

	/// Register a listener for write events.
	pub fn subscribe(&mut self) -> UnboundedReceiver<WriteEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.subscribers.push(tx);
		rx
	}

	/// Next logical timestamp from the store's clock.
	pub fn tick(&mut self) -> u64 {
		self.clock.tick()
	}

	/// Move the clock past a timestamp seen on another replica.
	pub fn observe(&mut self, seen: u64) {
		self.clock.observe(seen);
	}

	/// Wall-clock milliseconds, for scheduling rather than stamping.
	pub fn wall_clock(&self) -> u64 {
		self.clock.wall()
	}

	/// Insert or replace `record`.
	///
	/// With `expected_version` set, the write only lands if the stored version
	/// matches (absent records count as version 0). Fields whose value changed
	/// without a caller-provided stamp get a local stamp one past the previous
	/// shared version. Returns the new local version.
	pub fn put(
		&mut self,
		mut record: Record,
		expected_version: Option<u64>,
		actor: &ActorId,
		origin: WriteOrigin,
	) -> Result<u64> {
		let current = self.records.get(&record.id);
		let actual = current.map_or(0, |r| r.version);
		if let Some(expected) = expected_version {
			if expected != actual {
				return Err(SyncError::VersionConflict {
					record_id: record.id.clone(),
					expected,
					actual,
				});
			}
		}
		if let Some(existing) = current {
			if existing.kind != record.kind {
				return Err(SyncError::InvalidInput(format!(
					"record {} is a {}, not a {}",
					record.id, existing.kind, record.kind
				)));
			}
		}

		// Anything written after this put must outrank the stamps it carries.
		for stamp in record.stamps.values() {
			self.clock.observe(stamp.updated_at);
		}
		let now = self.clock.tick();
		let no_fields: BTreeMap<String, Value> = BTreeMap::new();
		let no_stamps: BTreeMap<String, FieldStamp> = BTreeMap::new();
		let (old_fields, old_stamps) =
			current.map_or((&no_fields, &no_stamps), |r| (&r.fields, &r.stamps));

		let mut names: Vec<&String> = old_fields.keys().chain(record.fields.keys()).collect();
		names.sort();
		names.dedup();

		let mut changes = Vec::new();
		let mut filled: Vec<(String, FieldStamp)> = Vec::new();
		for name in names {
			let old_value = old_fields.get(name);
			let new_value = record.fields.get(name);
			let old_stamp = old_stamps.get(name).cloned().unwrap_or_default();
			let mut new_stamp = record.stamps.get(name).cloned().unwrap_or_default();

			if old_value != new_value && new_stamp == old_stamp {
				new_stamp = FieldStamp {
					version: old_stamp.version + 1,
					updated_at: now,
					updated_by: actor.clone(),
				};
				filled.push((name.clone(), new_stamp.clone()));
			}
			if old_value != new_value || old_stamp != new_stamp {
				changes.push(FieldChange {
					field: name.clone(),
					old_value: old_value.cloned(),
					new_value: new_value.cloned(),
					old_stamp,
					new_stamp,
				});
			}
		}

		for (name, stamp) in filled {
			record.stamps.insert(name, stamp);
		}
		record.stamps.retain(|name, _| record.fields.contains_key(name));
		record.version = actual + 1;
		record.updated_at = now;
		record.updated_by = actor.clone();

		let event = WriteEvent {
			record_id: record.id.clone(),
			kind: record.kind,
			origin,
			version: record.version,
			updated_at: now,
			updated_by: actor.clone(),
			changes,
		};
		let version = record.version;
		debug!(
			record_id = %record.id,
			version,
			?origin,
			changed = event.changes.len(),
			"record written"
		);
		self.records.insert(record.id.clone(), record);
		self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());

		Ok(version)
	}

	pub fn get(&self, id: &RecordId) -> Result<&Record> {
		self.records
			.get(id)
			.ok_or_else(|| SyncError::NotFound(id.clone()))
	}

	pub fn contains(&self, id: &RecordId) -> bool {
		self.records.contains_key(id)
	}

	/// Lazily iterate the records matching `predicate`, in id order.
	///
	/// The returned iterator is `Clone`; cloning it before consumption restarts
	/// the walk from the beginning.
	pub fn list<P>(&self, predicate: P) -> Records<'_, P>
	where
		P: Fn(&Record) -> bool + Clone,
	{
		Records {
			inner: self.records.values(),
			predicate,
		}
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}
}

/// Lazy, restartable record sequence returned by [`LocalRecordStore::list`].
#[derive(Clone)]
pub struct Records<'a, P> {
	inner: btree_map::Values<'a, RecordId, Record>,
	predicate: P,
}

impl<'a, P> Iterator for Records<'a, P>
where
	P: Fn(&Record) -> bool,
{
	type Item = &'a Record;

	fn next(&mut self) -> Option<Self::Item> {
		let predicate = &self.predicate;
		self.inner.by_ref().find(|r| predicate(r))
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::model::ManualClock;

	fn store() -> LocalRecordStore {
		LocalRecordStore::new(Arc::new(ManualClock::new(1_000)))
	}

	fn patient(id: &str, phone: &str) -> Record {
		let mut r = Record::new(RecordId::from(id), RecordKind::Patient);
		r.fields.insert("phone".to_string(), json!(phone));
		r
	}

	#[test]
	fn put_assigns_versions_and_local_stamps() {
		let mut s = store();
		let me = ActorId::from("asha-1");
		assert_eq!(s.put(patient("P1", "111"), Some(0), &me, WriteOrigin::Local).unwrap(), 1);

		let mut r = s.get(&RecordId::from("P1")).unwrap().clone();
		assert_eq!(r.stamp("phone").version, 1);
		r.fields.insert("phone".to_string(), json!("222"));
		assert_eq!(s.put(r, Some(1), &me, WriteOrigin::Local).unwrap(), 2);

		let stored = s.get(&RecordId::from("P1")).unwrap();
		assert_eq!(stored.version, 2);
		assert_eq!(stored.stamp("phone").version, 2);
		assert_eq!(stored.updated_by, me);
	}

	#[test]
	fn stale_expected_version_is_rejected() {
		let mut s = store();
		let me = ActorId::from("asha-1");
		s.put(patient("P1", "111"), None, &me, WriteOrigin::Local).unwrap();
		let err = s
			.put(patient("P1", "999"), Some(0), &me, WriteOrigin::Local)
			.unwrap_err();
		assert_eq!(
			err,
			SyncError::VersionConflict {
				record_id: RecordId::from("P1"),
				expected: 0,
				actual: 1,
			}
		);
		assert_eq!(s.get(&RecordId::from("P1")).unwrap().field("phone"), Some(&json!("111")));
	}

	#[test]
	fn merged_stamps_lift_the_clock_for_later_local_writes() {
		let mut s = store();
		let me = ActorId::from("asha-1");
		let peer = ActorId::from("asha-2");
		let mut r = patient("P1", "111");
		r.stamps.insert(
			"phone".to_string(),
			FieldStamp { version: 1, updated_at: 90_000, updated_by: peer },
		);
		s.put(r, None, &me, WriteOrigin::Remote).unwrap();

		let mut r = s.get(&RecordId::from("P1")).unwrap().clone();
		r.fields.insert("phone".to_string(), json!("222"));
		s.put(r, None, &me, WriteOrigin::Local).unwrap();
		let stamp = s.get(&RecordId::from("P1")).unwrap().stamp("phone");
		assert_eq!(stamp.version, 2);
		assert!(stamp.updated_at > 90_000);
		assert_eq!(stamp.updated_by, me);
	}

	#[test]
	fn get_missing_is_not_found() {
		let s = store();
		assert!(matches!(s.get(&RecordId::from("nope")), Err(SyncError::NotFound(_))));
	}

	#[test]
	fn writes_are_announced_to_subscribers() {
		let mut s = store();
		let mut rx = s.subscribe();
		let me = ActorId::from("asha-1");
		s.put(patient("P1", "111"), None, &me, WriteOrigin::Local).unwrap();

		let event = rx.try_recv().expect("event");
		assert_eq!(event.origin, WriteOrigin::Local);
		assert_eq!(event.changes.len(), 1);
		assert_eq!(event.changes[0].field, "phone");
		assert_eq!(event.changes[0].old_value, None);
		assert_eq!(event.changes[0].new_value, Some(json!("111")));
		assert_eq!(event.changes[0].old_stamp.version, 0);
	}

	#[test]
	fn list_is_lazy_and_restartable() {
		let mut s = store();
		let me = ActorId::from("asha-1");
		for (id, phone) in [("P1", "1"), ("P2", "2"), ("P3", "3")] {
			s.put(patient(id, phone), None, &me, WriteOrigin::Local).unwrap();
		}
		let odd = s.list(|r| r.id.as_str() != "P2");
		let first: Vec<_> = odd.clone().map(|r| r.id.to_string()).collect();
		let again: Vec<_> = odd.map(|r| r.id.to_string()).collect();
		assert_eq!(first, vec!["P1", "P3"]);
		assert_eq!(first, again);
	}
}
