//! Peer-to-peer delta exchange between nearby devices.
//!
//! Discovery only tells us who is around; a peer has to be paired with
//! [`PeerExchange::mark_trusted`] before any data is swapped with it. Pairings
//! are saved with the replica and survive the peer dropping out of range.

pub mod exchange;
pub mod link;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

use crate::error::Result;
use crate::model::ActorId;

pub use exchange::{ExchangeConfig, ExchangeReport, PeerExchange};
pub use link::{FramedPeerLink, MemoryPeerLink, PeerLink, PeerMessage, serve_peer_connection};
pub use registry::{LivePeers, PeerRegistry};

/// Version of the peer handshake. Peers speaking another version are refused.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for PeerId {
	fn from(s: &str) -> Self {
		Self::new(s)
	}
}

/// A device seen on the local link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
	pub peer_id: PeerId,
	pub last_seen_at: u64,
	/// 0 (barely reachable) to 100.
	pub link_quality: u8,
	pub trusted: bool,
}

/// What discovery reports about a nearby device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvert {
	pub peer_id: PeerId,
	pub link_quality: u8,
}

impl PeerAdvert {
	pub fn new(peer_id: impl Into<String>, link_quality: u8) -> Self {
		Self {
			peer_id: PeerId::new(peer_id),
			link_quality: link_quality.min(100),
		}
	}
}

/// First message of a session, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHello {
	pub peer_id: PeerId,
	pub actor: ActorId,
	pub protocol: u32,
}

/// Source of nearby-device adverts (Wi-Fi Direct, BLE, a static list...).
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
	async fn scan(&self) -> Result<Vec<PeerAdvert>>;
}

/// Discovery that reports a fixed, replaceable set of adverts.
#[derive(Default)]
pub struct StaticDiscovery {
	adverts: Mutex<Vec<PeerAdvert>>,
}

impl StaticDiscovery {
	pub fn new(adverts: Vec<PeerAdvert>) -> Self {
		Self {
			adverts: Mutex::new(adverts),
		}
	}

	pub fn set(&self, adverts: Vec<PeerAdvert>) {
		if let Ok(mut guard) = self.adverts.lock() {
			*guard = adverts;
		}
	}
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
	async fn scan(&self) -> Result<Vec<PeerAdvert>> {
		Ok(self.adverts.lock().map(|g| g.clone()).unwrap_or_default())
	}
}
