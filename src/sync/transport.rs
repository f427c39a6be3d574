use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{Result, SyncError};
use crate::model::{ActorId, Delta, RecordId, RecordKind};
use crate::outbox::{ChangeEntry, RemoteSnapshot};

/// Deltas since a watermark, plus the watermark to resume from next time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
	pub deltas: Vec<Delta>,
	pub watermark: u64,
}

/// Wire form of an outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingChange {
	pub entry_id: u64,
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub field: String,
	pub base_version: u64,
	pub new_value: Value,
	pub created_at: u64,
	pub author: ActorId,
}

impl From<&ChangeEntry> for OutgoingChange {
	fn from(entry: &ChangeEntry) -> Self {
		Self {
			entry_id: entry.entry_id,
			record_id: entry.record_id.clone(),
			kind: entry.kind,
			field: entry.field.clone(),
			base_version: entry.base_version,
			new_value: entry.new_value.clone(),
			created_at: entry.created_at,
			author: entry.author.clone(),
		}
	}
}

/// Authority verdict on one pushed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushOutcome {
	Accepted { version: u64 },
	Conflict { snapshot: RemoteSnapshot },
	Rejected {
		reason: String,
		#[serde(default)]
		retryable: bool,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
	pub changes: Vec<OutgoingChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
	pub outcomes: Vec<PushOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullQuery {
	pub since: u64,
}

/// Connection to the remote authority.
///
/// `push` answers with one outcome per change, in request order.
#[async_trait]
pub trait SyncTransport: Send + Sync {
	async fn pull(&self, since: u64) -> Result<ChangeBatch>;
	async fn push(&self, changes: &[OutgoingChange]) -> Result<Vec<PushOutcome>>;
}

/// Transport for devices with no authority configured. Every call fails, so
/// cycles back off and changes wait in the outbox.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineTransport;

#[async_trait]
impl SyncTransport for OfflineTransport {
	async fn pull(&self, _since: u64) -> Result<ChangeBatch> {
		Err(SyncError::Transport("no remote configured".to_string()))
	}

	async fn push(&self, _changes: &[OutgoingChange]) -> Result<Vec<PushOutcome>> {
		Err(SyncError::Transport("no remote configured".to_string()))
	}
}

/// JSON-over-HTTP transport: `GET {base}/changes?since=N`, `POST {base}/changes`.
pub struct HttpTransport {
	client: reqwest::Client,
	changes_url: Url,
}

impl HttpTransport {
	pub fn new(base: &Url, timeout: Duration) -> Result<Self> {
		let mut base = base.clone();
		if !base.path().ends_with('/') {
			let path = format!("{}/", base.path());
			base.set_path(&path);
		}
		let changes_url = base
			.join("changes")
			.map_err(|e| SyncError::Config(format!("invalid remote url: {}", e)))?;
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| SyncError::Config(format!("failed to build http client: {}", e)))?;
		Ok(Self { client, changes_url })
	}

	pub fn changes_url(&self) -> &Url {
		&self.changes_url
	}
}

#[async_trait]
impl SyncTransport for HttpTransport {
	async fn pull(&self, since: u64) -> Result<ChangeBatch> {
		let response = self
			.client
			.get(self.changes_url.clone())
			.query(&PullQuery { since })
			.send()
			.await?;
		let status = response.status();
		if !status.is_success() {
			return Err(SyncError::Transport(format!("pull returned {}", status)));
		}
		let batch: ChangeBatch = response.json().await?;
		debug!(since, deltas = batch.deltas.len(), watermark = batch.watermark, "pulled changes");
		Ok(batch)
	}

	async fn push(&self, changes: &[OutgoingChange]) -> Result<Vec<PushOutcome>> {
		let response = self
			.client
			.post(self.changes_url.clone())
			.json(&PushRequest {
				changes: changes.to_vec(),
			})
			.send()
			.await?;
		let status = response.status();
		if !status.is_success() {
			return Err(SyncError::Transport(format!("push returned {}", status)));
		}
		let body: PushResponse = response.json().await?;
		if body.outcomes.len() != changes.len() {
			return Err(SyncError::Transport(format!(
				"push answered {} outcomes for {} changes",
				body.outcomes.len(),
				changes.len()
			)));
		}
		Ok(body.outcomes)
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::model::FieldStamp;

	#[test]
	fn base_url_gets_a_trailing_slash() {
		let base = Url::parse("http://hub.local:8787/api").unwrap();
		let t = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
		assert_eq!(t.changes_url().as_str(), "http://hub.local:8787/api/changes");
		let base = Url::parse("http://hub.local:8787").unwrap();
		let t = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
		assert_eq!(t.changes_url().as_str(), "http://hub.local:8787/changes");
	}

	#[test]
	fn push_outcomes_are_tagged_by_status() {
		let conflict = PushOutcome::Conflict {
			snapshot: RemoteSnapshot {
				value: json!("333"),
				stamp: FieldStamp {
					version: 4,
					updated_at: 10,
					updated_by: ActorId::from("asha-2"),
				},
			},
		};
		let v = serde_json::to_value(&conflict).unwrap();
		assert_eq!(v["status"], "conflict");
		assert_eq!(v["snapshot"]["stamp"]["version"], 4);

		let rejected: PushOutcome =
			serde_json::from_value(json!({"status": "rejected", "reason": "bad field"})).unwrap();
		assert_eq!(
			rejected,
			PushOutcome::Rejected {
				reason: "bad field".to_string(),
				retryable: false
			}
		);
	}
}
