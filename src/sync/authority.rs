//! A remote authority: the hub replicas pull from and push to.
//!
//! Keeps per-field stamps so a push based on a stale field version is refused
//! with the current value. Usable in-process as a [`SyncTransport`] or served
//! over HTTP with [`router`].

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::model::{ActorId, Clock, Delta, FieldStamp, Record, RecordId, RecordKind, SystemClock};
use crate::outbox::RemoteSnapshot;
use crate::state::AppState;
use crate::sync::transport::{
	ChangeBatch, OutgoingChange, PullQuery, PushOutcome, PushRequest, PushResponse, SyncTransport,
};

#[derive(Default)]
struct Ledger {
	records: BTreeMap<RecordId, Record>,
	/// Accepted writes in order; a watermark is a position in this feed.
	feed: Vec<Delta>,
}

pub struct MemoryAuthority {
	ledger: Mutex<Ledger>,
	clock: Arc<dyn Clock>,
}

impl Default for MemoryAuthority {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryAuthority {
	pub fn new() -> Self {
		Self::with_clock(Arc::new(SystemClock))
	}

	pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
		Self {
			ledger: Mutex::new(Ledger::default()),
			clock,
		}
	}

	fn ledger(&self) -> Result<MutexGuard<'_, Ledger>> {
		self.ledger
			.lock()
			.map_err(|_| SyncError::Transport("authority ledger poisoned".to_string()))
	}

	/// Write fields directly at the authority, as another device or the back
	/// office would. Returns the new record version.
	pub fn write(
		&self,
		record_id: &RecordId,
		kind: RecordKind,
		fields: BTreeMap<String, Value>,
		author: &ActorId,
	) -> Result<u64> {
		let now = self.clock.now_millis();
		let mut ledger = self.ledger()?;
		let mut record = ledger
			.records
			.get(record_id)
			.cloned()
			.unwrap_or_else(|| Record::new(record_id.clone(), kind));
		if record.kind != kind {
			return Err(SyncError::InvalidInput(format!(
				"record {} is a {}, not a {}",
				record_id, record.kind, kind
			)));
		}
		let version = record.version + 1;
		let stamp = FieldStamp {
			version,
			updated_at: now,
			updated_by: author.clone(),
		};
		for (name, value) in &fields {
			record.fields.insert(name.clone(), value.clone());
			record.stamps.insert(name.clone(), stamp.clone());
		}
		record.version = version;
		record.updated_at = now;
		record.updated_by = author.clone();
		ledger.records.insert(record_id.clone(), record);
		ledger.feed.push(Delta {
			record_id: record_id.clone(),
			kind,
			version,
			fields,
			updated_at: now,
			updated_by: author.clone(),
		});
		Ok(version)
	}

	pub fn record(&self, record_id: &RecordId) -> Option<Record> {
		self.ledger().ok()?.records.get(record_id).cloned()
	}

	pub fn watermark(&self) -> u64 {
		self.ledger().map_or(0, |l| l.feed.len() as u64)
	}

	pub fn changes_since(&self, since: u64) -> Result<ChangeBatch> {
		let ledger = self.ledger()?;
		let start = (since as usize).min(ledger.feed.len());
		Ok(ChangeBatch {
			deltas: ledger.feed[start..].to_vec(),
			watermark: ledger.feed.len() as u64,
		})
	}

	/// Accept or refuse one change.
	///
	/// A change conflicts when the field has moved past its base version, the
	/// newer write came from someone else, and the values differ. Replaying an
	/// already accepted change returns its original version.
	pub fn apply(&self, change: &OutgoingChange) -> Result<PushOutcome> {
		if change.field.is_empty() {
			return Ok(PushOutcome::Rejected {
				reason: "empty field name".to_string(),
				retryable: false,
			});
		}
		let mut ledger = self.ledger()?;
		let mut record = ledger
			.records
			.get(&change.record_id)
			.cloned()
			.unwrap_or_else(|| Record::new(change.record_id.clone(), change.kind));
		if record.kind != change.kind {
			return Ok(PushOutcome::Rejected {
				reason: format!("record {} is a {}", change.record_id, record.kind),
				retryable: false,
			});
		}

		let current = record.stamp(&change.field);
		let current_value = record.field(&change.field).cloned().unwrap_or(Value::Null);
		if current.updated_by == change.author
			&& current.updated_at == change.created_at
			&& current_value == change.new_value
		{
			return Ok(PushOutcome::Accepted {
				version: current.version,
			});
		}
		if current.version > change.base_version
			&& current.updated_by != change.author
			&& current_value != change.new_value
		{
			debug!(
				record_id = %change.record_id,
				field = %change.field,
				base = change.base_version,
				current = current.version,
				"stale change refused"
			);
			return Ok(PushOutcome::Conflict {
				snapshot: RemoteSnapshot {
					value: current_value,
					stamp: current,
				},
			});
		}

		let version = record.version + 1;
		record.fields.insert(change.field.clone(), change.new_value.clone());
		record.stamps.insert(
			change.field.clone(),
			FieldStamp {
				version,
				updated_at: change.created_at,
				updated_by: change.author.clone(),
			},
		);
		record.version = version;
		record.updated_at = change.created_at;
		record.updated_by = change.author.clone();
		ledger.records.insert(change.record_id.clone(), record);

		let mut fields = BTreeMap::new();
		fields.insert(change.field.clone(), change.new_value.clone());
		ledger.feed.push(Delta {
			record_id: change.record_id.clone(),
			kind: change.kind,
			version,
			fields,
			updated_at: change.created_at,
			updated_by: change.author.clone(),
		});
		Ok(PushOutcome::Accepted { version })
	}
}

#[async_trait]
impl SyncTransport for MemoryAuthority {
	async fn pull(&self, since: u64) -> Result<ChangeBatch> {
		self.changes_since(since)
	}

	async fn push(&self, changes: &[OutgoingChange]) -> Result<Vec<PushOutcome>> {
		changes.iter().map(|c| self.apply(c)).collect()
	}
}

/// HTTP surface of the authority, plus health and metrics.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/changes", get(pull_changes).post(push_changes))
		.route("/health", get(crate::health::health))
		.route("/metrics", get(crate::health::metrics_handler))
		.with_state(state)
}

async fn pull_changes(
	State(state): State<AppState>,
	Query(query): Query<PullQuery>,
) -> std::result::Result<Json<ChangeBatch>, crate::health::ApiError> {
	let batch = state.authority.changes_since(query.since)?;
	state.metrics.authority_deltas_served_total.inc_by(batch.deltas.len() as u64);
	Ok(Json(batch))
}

async fn push_changes(
	State(state): State<AppState>,
	Json(request): Json<PushRequest>,
) -> std::result::Result<Json<PushResponse>, crate::health::ApiError> {
	let mut outcomes = Vec::with_capacity(request.changes.len());
	for change in &request.changes {
		let outcome = state.authority.apply(change)?;
		match &outcome {
			PushOutcome::Accepted { .. } => state.metrics.authority_changes_accepted_total.inc(),
			PushOutcome::Conflict { .. } => state.metrics.authority_changes_conflicted_total.inc(),
			PushOutcome::Rejected { .. } => state.metrics.authority_changes_rejected_total.inc(),
		}
		outcomes.push(outcome);
	}
	info!(changes = request.changes.len(), "push handled");
	Ok(Json(PushResponse { outcomes }))
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::model::ManualClock;

	fn change(base: u64, value: &str, by: &str, at: u64) -> OutgoingChange {
		OutgoingChange {
			entry_id: 1,
			record_id: RecordId::from("P1"),
			kind: RecordKind::Patient,
			field: "phone".to_string(),
			base_version: base,
			new_value: json!(value),
			created_at: at,
			author: ActorId::from(by),
		}
	}

	fn authority() -> MemoryAuthority {
		MemoryAuthority::with_clock(Arc::new(ManualClock::new(100)))
	}

	#[test]
	fn accepted_changes_are_fed_back_in_order() {
		let a = authority();
		assert_eq!(
			a.apply(&change(0, "111", "asha-1", 10)).unwrap(),
			PushOutcome::Accepted { version: 1 }
		);
		assert_eq!(
			a.apply(&change(1, "222", "asha-1", 11)).unwrap(),
			PushOutcome::Accepted { version: 2 }
		);
		let batch = a.changes_since(1).unwrap();
		assert_eq!(batch.watermark, 2);
		assert_eq!(batch.deltas.len(), 1);
		assert_eq!(batch.deltas[0].fields["phone"], json!("222"));
	}

	#[test]
	fn stale_change_from_another_author_conflicts() {
		let a = authority();
		a.apply(&change(0, "111", "asha-2", 10)).unwrap();
		let outcome = a.apply(&change(0, "999", "asha-1", 11)).unwrap();
		let PushOutcome::Conflict { snapshot } = outcome else {
			panic!("expected conflict");
		};
		assert_eq!(snapshot.value, json!("111"));
		assert_eq!(snapshot.stamp.version, 1);
	}

	#[test]
	fn replayed_change_is_not_written_twice() {
		let a = authority();
		let c = change(0, "111", "asha-1", 10);
		a.apply(&c).unwrap();
		assert_eq!(a.apply(&c).unwrap(), PushOutcome::Accepted { version: 1 });
		assert_eq!(a.watermark(), 1);
	}

	#[test]
	fn kind_mismatch_is_rejected() {
		let a = authority();
		a.apply(&change(0, "111", "asha-1", 10)).unwrap();
		let mut c = change(1, "x", "asha-1", 11);
		c.kind = RecordKind::Visit;
		assert!(matches!(a.apply(&c).unwrap(), PushOutcome::Rejected { retryable: false, .. }));
	}
}
