//! Durable replica state.
//!
//! Snapshots are stored as a JSON envelope carrying the payload text and its
//! SHA-256 digest. Anything that fails the digest, the JSON decode or the
//! structural checks loads as `CorruptLocalState`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::replica::ReplicaSnapshot;

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
	format: u32,
	sha256: String,
	payload: String,
}

fn digest(payload: &str) -> String {
	let hash = Sha256::digest(payload.as_bytes());
	hash.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Serialize a snapshot into its on-disk envelope.
pub fn encode_snapshot(snapshot: &ReplicaSnapshot) -> Result<String> {
	let payload = serde_json::to_string(snapshot)?;
	let envelope = Envelope {
		format: SNAPSHOT_FORMAT,
		sha256: digest(&payload),
		payload,
	};
	Ok(serde_json::to_string_pretty(&envelope)?)
}

/// Parse and verify an envelope produced by [`encode_snapshot`].
pub fn decode_snapshot(text: &str) -> Result<ReplicaSnapshot> {
	let envelope: Envelope = serde_json::from_str(text)
		.map_err(|e| SyncError::CorruptLocalState(format!("unreadable envelope: {}", e)))?;
	if envelope.format != SNAPSHOT_FORMAT {
		return Err(SyncError::CorruptLocalState(format!(
			"unsupported snapshot format {}",
			envelope.format
		)));
	}
	if digest(&envelope.payload) != envelope.sha256 {
		return Err(SyncError::CorruptLocalState("digest mismatch".to_string()));
	}
	let snapshot: ReplicaSnapshot = serde_json::from_str(&envelope.payload)
		.map_err(|e| SyncError::CorruptLocalState(format!("unreadable snapshot: {}", e)))?;
	snapshot.validate()?;
	Ok(snapshot)
}

/// Where replica snapshots live.
#[async_trait]
pub trait StateStore: Send + Sync {
	/// `Ok(None)` when nothing has been saved yet.
	async fn load(&self) -> Result<Option<ReplicaSnapshot>>;
	async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()>;
	/// Forget everything so the next start resyncs from scratch.
	async fn reset(&self) -> Result<()>;
}

/// Snapshot file with atomic replace (write temp, then rename).
pub struct FileStateStore {
	path: PathBuf,
}

impl FileStateStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// `<dir>/replica.json`.
	pub fn in_dir(dir: impl AsRef<Path>) -> Self {
		Self::new(dir.as_ref().join("replica.json"))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn temp_path(&self) -> PathBuf {
		let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
		name.push(".tmp");
		self.path.with_file_name(name)
	}
}

#[async_trait]
impl StateStore for FileStateStore {
	#[tracing::instrument(skip(self), fields(path = %self.path.display()))]
	async fn load(&self) -> Result<Option<ReplicaSnapshot>> {
		let text = match tokio::fs::read_to_string(&self.path).await {
			Ok(text) => text,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!("no saved state");
				return Ok(None);
			}
			Err(e) => return Err(e.into()),
		};
		match decode_snapshot(&text) {
			Ok(snapshot) => {
				debug!(
					records = snapshot.records.len(),
					entries = snapshot.entries.len(),
					"state loaded"
				);
				Ok(Some(snapshot))
			}
			Err(e) => {
				warn!(error = %e, "saved state failed integrity checks");
				Err(e)
			}
		}
	}

	async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
		let text = encode_snapshot(snapshot)?;
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				tokio::fs::create_dir_all(parent).await?;
			}
		}
		let temp = self.temp_path();
		tokio::fs::write(&temp, text.as_bytes()).await?;
		tokio::fs::rename(&temp, &self.path).await?;
		Ok(())
	}

	async fn reset(&self) -> Result<()> {
		match tokio::fs::remove_file(&self.path).await {
			Ok(()) => {
				info!(path = %self.path.display(), "saved state removed");
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// In-memory state store. Keeps the encoded envelope so tests can tamper with it.
#[derive(Default)]
pub struct MemoryStateStore {
	saved: Mutex<Option<String>>,
}

impl MemoryStateStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Raw envelope text as it would sit on disk.
	pub fn raw(&self) -> Option<String> {
		self.saved.lock().ok().and_then(|g| g.clone())
	}

	pub fn set_raw(&self, text: impl Into<String>) {
		if let Ok(mut guard) = self.saved.lock() {
			*guard = Some(text.into());
		}
	}
}

#[async_trait]
impl StateStore for MemoryStateStore {
	async fn load(&self) -> Result<Option<ReplicaSnapshot>> {
		match self.raw() {
			Some(text) => decode_snapshot(&text).map(Some),
			None => Ok(None),
		}
	}

	async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
		let text = encode_snapshot(snapshot)?;
		self.set_raw(text);
		Ok(())
	}

	async fn reset(&self) -> Result<()> {
		let mut guard = self
			.saved
			.lock()
			.map_err(|_| SyncError::Persistence("state lock poisoned".to_string()))?;
		*guard = None;
		Ok(())
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;
	use std::collections::BTreeMap;
	use std::sync::Arc;

	use super::*;
	use crate::model::{ActorId, ManualClock, RecordId, RecordKind};
	use crate::replica::{Replica, ReplicaConfig};

	fn sample() -> ReplicaSnapshot {
		let mut replica = Replica::new(
			ActorId::from("asha-1"),
			Arc::new(ManualClock::new(1_000)),
			ReplicaConfig::default(),
		);
		let mut fields = BTreeMap::new();
		fields.insert("phone".to_string(), json!("111"));
		replica
			.edit(&RecordId::from("P1"), RecordKind::Patient, fields, None)
			.unwrap();
		replica.snapshot()
	}

	#[test]
	fn envelope_round_trips() {
		let snapshot = sample();
		let text = encode_snapshot(&snapshot).unwrap();
		assert_eq!(decode_snapshot(&text).unwrap(), snapshot);
	}

	#[test]
	fn tampered_payload_is_corrupt() {
		let text = encode_snapshot(&sample()).unwrap();
		let tampered = text.replace("111", "999");
		assert!(matches!(
			decode_snapshot(&tampered),
			Err(SyncError::CorruptLocalState(_))
		));
		assert!(matches!(
			decode_snapshot("{ not json"),
			Err(SyncError::CorruptLocalState(_))
		));
	}

	#[tokio::test]
	async fn file_store_saves_loads_and_resets() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::in_dir(dir.path().join("nested"));
		assert!(store.load().await.unwrap().is_none());

		let snapshot = sample();
		store.save(&snapshot).await.unwrap();
		assert_eq!(store.load().await.unwrap(), Some(snapshot));
		assert!(!store.temp_path().exists());

		store.reset().await.unwrap();
		assert!(store.load().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn file_store_reports_truncated_files_as_corrupt() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStateStore::in_dir(dir.path());
		store.save(&sample()).await.unwrap();
		let text = std::fs::read_to_string(store.path()).unwrap();
		std::fs::write(store.path(), &text[..text.len() / 2]).unwrap();
		assert!(matches!(store.load().await, Err(SyncError::CorruptLocalState(_))));
	}
}
