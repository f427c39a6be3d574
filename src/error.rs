use thiserror::Error;

use crate::model::RecordId;
use crate::resolve::CaseId;

/// Result alias used across the sync core.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure taxonomy of the sync core.
///
/// `VersionConflict` and `Transport` are absorbed by the engine and only show up
/// as entry state; `PermanentSyncFailure` and `CorruptLocalState` are the ones the
/// user has to act on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
	#[error("version conflict on {record_id}: expected {expected}, found {actual}")]
	VersionConflict {
		record_id: RecordId,
		expected: u64,
		actual: u64,
	},

	#[error("record not found: {0}")]
	NotFound(RecordId),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("conflict {case_id} on {record_id}.{field} is waiting for a decision")]
	RemoteConflict {
		case_id: CaseId,
		record_id: RecordId,
		field: String,
	},

	#[error("change {entry_id} gave up after {attempts} attempts: {reason}")]
	PermanentSyncFailure {
		entry_id: u64,
		attempts: u32,
		reason: String,
	},

	#[error("local state failed integrity checks: {0}")]
	CorruptLocalState(String),

	#[error("conflict {old_case} re-raised as {new_case}: local value changed since detection")]
	ConflictReraised { old_case: CaseId, new_case: CaseId },

	#[error("conflict case not found: {0}")]
	UnknownConflict(CaseId),

	#[error("change entry not found: {0}")]
	UnknownEntry(u64),

	#[error("peer {0} is not trusted; pair before exchanging")]
	UntrustedPeer(String),

	#[error("peer {0} is not known or no longer live")]
	UnknownPeer(String),

	#[error("sync cancelled")]
	Cancelled,

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("persistence error: {0}")]
	Persistence(String),

	#[error("configuration error: {0}")]
	Config(String),
}

impl From<std::io::Error> for SyncError {
	fn from(e: std::io::Error) -> Self {
		SyncError::Persistence(e.to_string())
	}
}

impl From<serde_json::Error> for SyncError {
	fn from(e: serde_json::Error) -> Self {
		SyncError::Persistence(format!("serialization: {}", e))
	}
}

impl From<reqwest::Error> for SyncError {
	fn from(e: reqwest::Error) -> Self {
		SyncError::Transport(e.to_string())
	}
}
