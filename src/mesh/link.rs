//! Carrying a peer session over a byte stream.
//!
//! Frames are a 4-byte big-endian length followed by a JSON [`PeerMessage`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::mesh::exchange::PeerExchange;
use crate::mesh::{PeerHello, PeerId};
use crate::model::Delta;

/// Largest frame either side will send or accept.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// The two steps of a session as seen by the initiator.
#[async_trait]
pub trait PeerLink: Send + Sync {
	async fn handshake(&self, hello: PeerHello) -> Result<PeerHello>;
	/// Send our deltas, receive theirs.
	async fn swap(&self, deltas: Vec<Delta>) -> Result<Vec<Delta>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
	Hello(PeerHello),
	HelloOk(PeerHello),
	HelloRejected { reason: String },
	Deltas { deltas: Vec<Delta> },
	Error { message: String },
}

fn wire_error(what: &str, e: impl std::fmt::Display) -> SyncError {
	SyncError::Transport(format!("{}: {}", what, e))
}

/// Write one frame.
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &PeerMessage) -> Result<()> {
	let json = serde_json::to_vec(msg).map_err(|e| wire_error("failed to serialize message", e))?;
	let len = json.len();
	if len > MAX_FRAME_SIZE {
		return Err(SyncError::Transport(format!(
			"message size {} exceeds maximum {}",
			len, MAX_FRAME_SIZE
		)));
	}

	writer
		.write_all(&(len as u32).to_be_bytes())
		.await
		.map_err(|e| wire_error("failed to write message length", e))?;
	writer
		.write_all(&json)
		.await
		.map_err(|e| wire_error("failed to write message body", e))?;
	writer
		.flush()
		.await
		.map_err(|e| wire_error("failed to flush writer", e))?;
	Ok(())
}

/// Read one frame. `Ok(None)` when the stream closed between frames.
pub async fn receive_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<PeerMessage>> {
	let mut len_bytes = [0u8; 4];
	match reader.read_exact(&mut len_bytes).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(wire_error("failed to read message length", e)),
	}

	let len = u32::from_be_bytes(len_bytes) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(SyncError::Transport(format!(
			"message size {} exceeds maximum {}",
			len, MAX_FRAME_SIZE
		)));
	}

	let mut buf = vec![0u8; len];
	reader
		.read_exact(&mut buf)
		.await
		.map_err(|e| wire_error("failed to read message body", e))?;
	let msg = serde_json::from_slice(&buf)
		.map_err(|e| wire_error("failed to deserialize message", e))?;
	Ok(Some(msg))
}

/// Initiator end of a session over any async byte stream.
pub struct FramedPeerLink<S> {
	stream: tokio::sync::Mutex<S>,
}

impl<S> FramedPeerLink<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	pub fn new(stream: S) -> Self {
		Self {
			stream: tokio::sync::Mutex::new(stream),
		}
	}

	async fn round_trip(&self, msg: &PeerMessage) -> Result<PeerMessage> {
		let mut stream = self.stream.lock().await;
		send_message(&mut *stream, msg).await?;
		receive_message(&mut *stream)
			.await?
			.ok_or_else(|| SyncError::Transport("peer closed the connection".to_string()))
	}
}

#[async_trait]
impl<S> PeerLink for FramedPeerLink<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	async fn handshake(&self, hello: PeerHello) -> Result<PeerHello> {
		match self.round_trip(&PeerMessage::Hello(hello)).await? {
			PeerMessage::HelloOk(reply) => Ok(reply),
			PeerMessage::HelloRejected { reason } => Err(SyncError::UntrustedPeer(reason)),
			PeerMessage::Error { message } => Err(SyncError::Transport(message)),
			other => Err(SyncError::Transport(format!("unexpected reply to hello: {:?}", other))),
		}
	}

	async fn swap(&self, deltas: Vec<Delta>) -> Result<Vec<Delta>> {
		match self.round_trip(&PeerMessage::Deltas { deltas }).await? {
			PeerMessage::Deltas { deltas } => Ok(deltas),
			PeerMessage::Error { message } => Err(SyncError::Transport(message)),
			other => Err(SyncError::Transport(format!("unexpected reply to deltas: {:?}", other))),
		}
	}
}

/// Responder loop for one inbound connection. Returns when the peer hangs up.
pub async fn serve_peer_connection<S>(mut stream: S, exchange: PeerExchange) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let mut from: Option<PeerId> = None;
	while let Some(msg) = receive_message(&mut stream).await? {
		let reply = match msg {
			PeerMessage::Hello(hello) => match exchange.accept(&hello) {
				Ok(ours) => {
					from = Some(hello.peer_id);
					PeerMessage::HelloOk(ours)
				}
				Err(e) => {
					warn!(peer = %hello.peer_id, error = %e, "peer handshake refused");
					let reply = PeerMessage::HelloRejected { reason: e.to_string() };
					send_message(&mut stream, &reply).await?;
					return Err(e);
				}
			},
			PeerMessage::Deltas { deltas } => match &from {
				Some(peer) => match exchange.accept_deltas(peer, deltas).await {
					Ok(deltas) => PeerMessage::Deltas { deltas },
					Err(e) => PeerMessage::Error { message: e.to_string() },
				},
				None => PeerMessage::Error {
					message: "handshake required before deltas".to_string(),
				},
			},
			other => PeerMessage::Error {
				message: format!("unexpected message: {:?}", other),
			},
		};
		send_message(&mut stream, &reply).await?;
	}
	debug!(peer = ?from, "peer connection closed");
	Ok(())
}

/// In-process link straight into another device's [`PeerExchange`].
pub struct MemoryPeerLink {
	remote: PeerExchange,
	from: Mutex<Option<PeerId>>,
}

impl MemoryPeerLink {
	pub fn new(remote: PeerExchange) -> Self {
		Self {
			remote,
			from: Mutex::new(None),
		}
	}
}

#[async_trait]
impl PeerLink for MemoryPeerLink {
	async fn handshake(&self, hello: PeerHello) -> Result<PeerHello> {
		let reply = self.remote.accept(&hello)?;
		if let Ok(mut from) = self.from.lock() {
			*from = Some(hello.peer_id);
		}
		Ok(reply)
	}

	async fn swap(&self, deltas: Vec<Delta>) -> Result<Vec<Delta>> {
		let from = self
			.from
			.lock()
			.ok()
			.and_then(|g| g.clone())
			.ok_or_else(|| SyncError::Transport("swap before handshake".to_string()))?;
		self.remote.accept_deltas(&from, deltas).await
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;
	use std::collections::BTreeMap;

	use super::*;
	use crate::model::{ActorId, RecordId, RecordKind};

	#[tokio::test]
	async fn frames_cross_a_duplex_stream() {
		let (mut a, mut b) = tokio::io::duplex(1024);
		let mut fields = BTreeMap::new();
		fields.insert("phone".to_string(), json!("111"));
		let msg = PeerMessage::Deltas {
			deltas: vec![Delta {
				record_id: RecordId::from("P1"),
				kind: RecordKind::Patient,
				version: 3,
				fields,
				updated_at: 10,
				updated_by: ActorId::from("asha-1"),
			}],
		};
		send_message(&mut a, &msg).await.unwrap();
		assert_eq!(receive_message(&mut b).await.unwrap(), Some(msg));

		drop(a);
		assert_eq!(receive_message(&mut b).await.unwrap(), None);
	}

	#[tokio::test]
	async fn oversized_frames_are_refused() {
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes()).await.unwrap();
		assert!(matches!(receive_message(&mut b).await, Err(SyncError::Transport(_))));
	}

	#[test]
	fn messages_are_tagged_by_type() {
		let v = serde_json::to_value(PeerMessage::HelloRejected {
			reason: "untrusted".to_string(),
		})
		.unwrap();
		assert_eq!(v["type"], "hello_rejected");
	}
}
