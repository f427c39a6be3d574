//! Conflict resolver: per-field policies, automatic decisions and the case book.

mod list_merge;

pub use list_merge::union_merge;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::model::{ActorId, RecordId, RecordKind};

pub type CaseId = u64;

/// Resolved cases kept around for the history screen.
const ARCHIVE_LIMIT: usize = 256;

/// How conflicting writes to a field are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
	/// Last writer wins.
	#[default]
	Scalar,
	/// Three-way union of list elements.
	List,
	/// Always needs a human decision.
	ManualOnly,
}

/// Policy override for one field of one record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
	pub kind: RecordKind,
	pub field: String,
	pub policy: FieldPolicy,
}

impl FieldRule {
	pub fn new(kind: RecordKind, field: impl Into<String>, policy: FieldPolicy) -> Self {
		Self {
			kind,
			field: field.into(),
			policy,
		}
	}
}

/// Field policy schema plus the automatic-resolution switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
	#[serde(default)]
	pub rules: Vec<FieldRule>,
	#[serde(default)]
	pub kind_defaults: BTreeMap<RecordKind, FieldPolicy>,
	#[serde(default)]
	pub default_policy: FieldPolicy,
	/// When off, every conflict waits for a manual decision.
	#[serde(default = "default_auto_resolve")]
	pub auto_resolve: bool,
}

fn default_auto_resolve() -> bool {
	true
}

impl Default for ResolverConfig {
	fn default() -> Self {
		Self::empty()
			.add_rule(FieldRule::new(RecordKind::Patient, "medications", FieldPolicy::List))
			.add_rule(FieldRule::new(RecordKind::Patient, "conditions", FieldPolicy::List))
			.add_rule(FieldRule::new(
				RecordKind::Patient,
				"clinical_notes",
				FieldPolicy::ManualOnly,
			))
			.add_rule(FieldRule::new(RecordKind::Visit, "notes", FieldPolicy::ManualOnly))
			.add_rule(FieldRule::new(RecordKind::Message, "attachments", FieldPolicy::List))
	}
}

impl ResolverConfig {
	/// No rules, scalar everywhere, automatic resolution on.
	pub fn empty() -> Self {
		Self {
			rules: Vec::new(),
			kind_defaults: BTreeMap::new(),
			default_policy: FieldPolicy::Scalar,
			auto_resolve: true,
		}
	}

	/// Add or replace the rule for a (kind, field) pair.
	pub fn add_rule(mut self, rule: FieldRule) -> Self {
		self.rules.retain(|r| !(r.kind == rule.kind && r.field == rule.field));
		self.rules.push(rule);
		self
	}

	pub fn with_kind_default(mut self, kind: RecordKind, policy: FieldPolicy) -> Self {
		self.kind_defaults.insert(kind, policy);
		self
	}

	pub fn with_default_policy(mut self, policy: FieldPolicy) -> Self {
		self.default_policy = policy;
		self
	}

	pub fn with_auto_resolve(mut self, enabled: bool) -> Self {
		self.auto_resolve = enabled;
		self
	}

	/// Field rule, then kind default, then the global default.
	pub fn policy_for(&self, kind: RecordKind, field: &str) -> FieldPolicy {
		self.rules
			.iter()
			.find(|r| r.kind == kind && r.field == field)
			.map(|r| r.policy)
			.or_else(|| self.kind_defaults.get(&kind).copied())
			.unwrap_or(self.default_policy)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
	Unresolved,
	ResolvedLocal,
	ResolvedRemote,
	ResolvedMerged,
}

/// Who wrote one side of a conflict, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMeta {
	pub author: ActorId,
	pub timestamp: u64,
}

impl ConflictMeta {
	/// Same ordering key as [`FieldStamp::lww_key`](crate::model::FieldStamp::lww_key).
	pub fn lww_key(&self) -> (u64, &ActorId) {
		(self.timestamp, &self.author)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
	pub id: CaseId,
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub field: String,
	pub local_value: Value,
	pub local_meta: ConflictMeta,
	pub remote_value: Value,
	pub remote_meta: ConflictMeta,
	pub remote_version: u64,
	pub base_value: Option<Value>,
	/// Outbox entries held back by this case.
	pub entry_ids: Vec<u64>,
	/// Local record version when the conflict was detected.
	pub local_record_version: u64,
	pub policy: FieldPolicy,
	pub resolution_state: ResolutionState,
	pub opened_at: u64,
	#[serde(default)]
	pub resolved_at: Option<u64>,
}

impl ConflictCase {
	/// The value a choice commits.
	pub fn chosen_value(&self, choice: &ResolutionChoice) -> Value {
		match choice {
			ResolutionChoice::Local => self.local_value.clone(),
			ResolutionChoice::Remote => self.remote_value.clone(),
			ResolutionChoice::Merged(value) => value.clone(),
		}
	}

	/// How an open case is reported alongside other problems.
	pub fn to_error(&self) -> SyncError {
		SyncError::RemoteConflict {
			case_id: self.id,
			record_id: self.record_id.clone(),
			field: self.field.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum ResolutionChoice {
	Local,
	Remote,
	Merged(Value),
}

impl ResolutionChoice {
	fn state(&self) -> ResolutionState {
		match self {
			ResolutionChoice::Local => ResolutionState::ResolvedLocal,
			ResolutionChoice::Remote => ResolutionState::ResolvedRemote,
			ResolutionChoice::Merged(_) => ResolutionState::ResolvedMerged,
		}
	}
}

/// Outcome of the automatic policy for a freshly detected case.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
	Resolve(ResolutionChoice),
	Escalate(String),
}

pub struct ConflictResolver {
	config: ResolverConfig,
	open: BTreeMap<CaseId, ConflictCase>,
	archive: VecDeque<ConflictCase>,
	next_case_id: CaseId,
}

impl ConflictResolver {
	pub fn new(config: ResolverConfig) -> Self {
		Self {
			config,
			open: BTreeMap::new(),
			archive: VecDeque::new(),
			next_case_id: 1,
		}
	}

	pub fn restore(
		config: ResolverConfig,
		open: impl IntoIterator<Item = ConflictCase>,
		archived: impl IntoIterator<Item = ConflictCase>,
		next_case_id: CaseId,
	) -> Self {
		let mut resolver = Self::new(config);
		for case in open {
			resolver.next_case_id = resolver.next_case_id.max(case.id + 1);
			resolver.open.insert(case.id, case);
		}
		for case in archived {
			resolver.next_case_id = resolver.next_case_id.max(case.id + 1);
			resolver.archive.push_back(case);
		}
		resolver.next_case_id = resolver.next_case_id.max(next_case_id);
		resolver
	}

	pub fn config(&self) -> &ResolverConfig {
		&self.config
	}

	pub fn policy_for(&self, kind: RecordKind, field: &str) -> FieldPolicy {
		self.config.policy_for(kind, field)
	}

	pub fn allocate_id(&mut self) -> CaseId {
		let id = self.next_case_id;
		self.next_case_id += 1;
		id
	}

	pub fn next_case_id(&self) -> CaseId {
		self.next_case_id
	}

	/// Apply the field policy to a case without touching any state.
	pub fn decide(&self, case: &ConflictCase) -> Decision {
		if !self.config.auto_resolve {
			return Decision::Escalate("automatic resolution disabled".to_string());
		}
		match case.policy {
			FieldPolicy::ManualOnly => {
				Decision::Escalate(format!("{} needs a manual decision", case.field))
			}
			FieldPolicy::Scalar => {
				if case.remote_meta.lww_key() > case.local_meta.lww_key() {
					Decision::Resolve(ResolutionChoice::Remote)
				} else {
					Decision::Resolve(ResolutionChoice::Local)
				}
			}
			FieldPolicy::List => {
				match union_merge(case.base_value.as_ref(), &case.local_value, &case.remote_value) {
					Ok(merged) if merged == case.local_value => {
						Decision::Resolve(ResolutionChoice::Local)
					}
					Ok(merged) if merged == case.remote_value => {
						Decision::Resolve(ResolutionChoice::Remote)
					}
					Ok(merged) => Decision::Resolve(ResolutionChoice::Merged(merged)),
					Err(reason) => Decision::Escalate(reason),
				}
			}
		}
	}

	/// Park a case until someone decides it.
	pub fn open(&mut self, case: ConflictCase) {
		info!(
			case_id = case.id,
			record_id = %case.record_id,
			field = %case.field,
			policy = ?case.policy,
			"conflict escalated"
		);
		self.open.insert(case.id, case);
	}

	pub fn get(&self, id: CaseId) -> Result<&ConflictCase> {
		self.open.get(&id).ok_or(SyncError::UnknownConflict(id))
	}

	pub fn open_case_for_mut(
		&mut self,
		record_id: &RecordId,
		field: &str,
	) -> Option<&mut ConflictCase> {
		self.open
			.values_mut()
			.find(|c| &c.record_id == record_id && c.field == field)
	}

	pub fn open_cases(&self) -> impl Iterator<Item = &ConflictCase> + Clone {
		self.open.values()
	}

	pub fn open_count(&self) -> usize {
		self.open.len()
	}

	pub fn archived(&self) -> impl Iterator<Item = &ConflictCase> + Clone {
		self.archive.iter()
	}

	/// Swap an open case for a fresh one (local value moved on since detection).
	pub fn replace(&mut self, old: CaseId, case: ConflictCase) {
		self.open.remove(&old);
		debug!(old_case = old, new_case = case.id, "conflict re-raised");
		self.open.insert(case.id, case);
	}

	/// Record the decision and move the case to the archive.
	pub fn archive(
		&mut self,
		mut case: ConflictCase,
		choice: &ResolutionChoice,
		now: u64,
	) -> ConflictCase {
		self.open.remove(&case.id);
		case.resolution_state = choice.state();
		case.resolved_at = Some(now);
		debug!(case_id = case.id, state = ?case.resolution_state, "conflict archived");
		self.archive.push_back(case.clone());
		while self.archive.len() > ARCHIVE_LIMIT {
			self.archive.pop_front();
		}
		case
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;

	fn case(policy: FieldPolicy, local: Value, remote: Value, base: Option<Value>) -> ConflictCase {
		ConflictCase {
			id: 1,
			record_id: RecordId::from("P1"),
			kind: RecordKind::Patient,
			field: "phone".to_string(),
			local_value: local,
			local_meta: ConflictMeta {
				author: ActorId::from("asha-1"),
				timestamp: 200,
			},
			remote_value: remote,
			remote_meta: ConflictMeta {
				author: ActorId::from("asha-2"),
				timestamp: 100,
			},
			remote_version: 4,
			base_value: base,
			entry_ids: vec![1],
			local_record_version: 4,
			policy,
			resolution_state: ResolutionState::Unresolved,
			opened_at: 300,
			resolved_at: None,
		}
	}

	#[test]
	fn default_schema_has_asha_policies() {
		let cfg = ResolverConfig::default();
		assert_eq!(cfg.policy_for(RecordKind::Patient, "medications"), FieldPolicy::List);
		assert_eq!(cfg.policy_for(RecordKind::Patient, "clinical_notes"), FieldPolicy::ManualOnly);
		assert_eq!(cfg.policy_for(RecordKind::Visit, "notes"), FieldPolicy::ManualOnly);
		assert_eq!(cfg.policy_for(RecordKind::Patient, "phone"), FieldPolicy::Scalar);
	}

	#[test]
	fn kind_default_sits_between_rule_and_global_default() {
		let cfg = ResolverConfig::empty()
			.with_kind_default(RecordKind::Reminder, FieldPolicy::ManualOnly)
			.add_rule(FieldRule::new(RecordKind::Reminder, "due_at", FieldPolicy::Scalar));
		assert_eq!(cfg.policy_for(RecordKind::Reminder, "text"), FieldPolicy::ManualOnly);
		assert_eq!(cfg.policy_for(RecordKind::Reminder, "due_at"), FieldPolicy::Scalar);
		assert_eq!(cfg.policy_for(RecordKind::Visit, "text"), FieldPolicy::Scalar);
	}

	#[test]
	fn scalar_conflicts_go_to_the_later_writer() {
		let r = ConflictResolver::new(ResolverConfig::default());
		let mut c = case(FieldPolicy::Scalar, json!("222"), json!("333"), None);
		assert_eq!(r.decide(&c), Decision::Resolve(ResolutionChoice::Local));
		c.remote_meta.timestamp = 500;
		assert_eq!(r.decide(&c), Decision::Resolve(ResolutionChoice::Remote));
	}

	#[test]
	fn equal_timestamps_break_ties_on_author() {
		let r = ConflictResolver::new(ResolverConfig::default());
		let mut c = case(FieldPolicy::Scalar, json!("a"), json!("b"), None);
		c.remote_meta.timestamp = c.local_meta.timestamp;
		assert_eq!(r.decide(&c), Decision::Resolve(ResolutionChoice::Remote));
	}

	#[test]
	fn list_conflicts_merge_or_escalate() {
		let r = ConflictResolver::new(ResolverConfig::default());
		let c = case(FieldPolicy::List, json!(["Metformin"]), json!(["Insulin"]), Some(json!([])));
		assert_eq!(
			r.decide(&c),
			Decision::Resolve(ResolutionChoice::Merged(json!(["Insulin", "Metformin"])))
		);

		let bad = case(FieldPolicy::List, json!("x"), json!(["Insulin"]), None);
		assert!(matches!(r.decide(&bad), Decision::Escalate(_)));
	}

	#[test]
	fn manual_only_and_disabled_auto_resolve_escalate() {
		let r = ConflictResolver::new(ResolverConfig::default());
		let c = case(FieldPolicy::ManualOnly, json!("a"), json!("b"), None);
		assert!(matches!(r.decide(&c), Decision::Escalate(_)));

		let r = ConflictResolver::new(ResolverConfig::default().with_auto_resolve(false));
		let c = case(FieldPolicy::Scalar, json!("a"), json!("b"), None);
		assert!(matches!(r.decide(&c), Decision::Escalate(_)));
	}

	#[test]
	fn archive_closes_the_case() {
		let mut r = ConflictResolver::new(ResolverConfig::default());
		let mut c = case(FieldPolicy::Scalar, json!("a"), json!("b"), None);
		c.id = r.allocate_id();
		r.open(c.clone());
		assert_eq!(r.open_count(), 1);
		let closed = r.archive(c, &ResolutionChoice::Remote, 900);
		assert_eq!(closed.resolution_state, ResolutionState::ResolvedRemote);
		assert_eq!(r.open_count(), 0);
		assert_eq!(r.archived().count(), 1);
		assert!(matches!(r.get(closed.id), Err(SyncError::UnknownConflict(_))));
	}
}
