use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::mesh::{PeerAdvert, PeerDevice, PeerDiscovery, PeerId};
use crate::model::Clock;

/// Live peers at the time of the call, in id order. Clone it to walk again.
pub type LivePeers = std::vec::IntoIter<PeerDevice>;

/// Nearby devices and their pairing state.
///
/// Sightings come and go with the liveness window; pairings stay until the
/// device is reset.
pub struct PeerRegistry {
	peers: BTreeMap<PeerId, PeerDevice>,
	paired: BTreeSet<PeerId>,
	liveness: Duration,
	clock: Arc<dyn Clock>,
}

impl PeerRegistry {
	pub fn new(liveness: Duration, clock: Arc<dyn Clock>) -> Self {
		Self {
			peers: BTreeMap::new(),
			paired: BTreeSet::new(),
			liveness,
			clock,
		}
	}

	/// Start out paired with `peers`, e.g. as restored from disk.
	pub fn with_paired(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
		self.paired.extend(peers);
		self
	}

	pub fn paired(&self) -> &BTreeSet<PeerId> {
		&self.paired
	}

	fn is_live(&self, device: &PeerDevice, now: u64) -> bool {
		now.saturating_sub(device.last_seen_at) <= self.liveness.as_millis() as u64
	}

	/// Upsert one advert. Pairing state is kept across sightings.
	pub fn observe(&mut self, advert: PeerAdvert) {
		let now = self.clock.now_millis();
		let quality = advert.link_quality.min(100);
		let trusted = self.paired.contains(&advert.peer_id);
		self.peers
			.entry(advert.peer_id.clone())
			.and_modify(|d| {
				d.last_seen_at = now;
				d.link_quality = quality;
			})
			.or_insert_with(|| {
				debug!(peer = %advert.peer_id, quality, "new peer seen");
				PeerDevice {
					peer_id: advert.peer_id,
					last_seen_at: now,
					link_quality: quality,
					trusted,
				}
			});
	}

	/// Drop peers not seen within the liveness window.
	pub fn evict_stale(&mut self) -> usize {
		let now = self.clock.now_millis();
		let liveness = self.liveness.as_millis() as u64;
		let before = self.peers.len();
		self.peers
			.retain(|_, d| now.saturating_sub(d.last_seen_at) <= liveness);
		let evicted = before - self.peers.len();
		if evicted > 0 {
			debug!(evicted, "stale peers evicted");
		}
		evicted
	}

	/// Fold in a batch of adverts, evict stale peers and list who is live.
	pub fn absorb(&mut self, adverts: Vec<PeerAdvert>) -> LivePeers {
		for advert in adverts {
			self.observe(advert);
		}
		self.evict_stale();
		self.live()
	}

	/// Scan with `discovery` and [`absorb`](Self::absorb) the result.
	pub async fn discover(&mut self, discovery: &dyn PeerDiscovery) -> Result<LivePeers> {
		let adverts = discovery.scan().await?;
		Ok(self.absorb(adverts))
	}

	pub fn live(&self) -> LivePeers {
		let now = self.clock.now_millis();
		self.peers
			.values()
			.filter(|d| self.is_live(d, now))
			.cloned()
			.collect::<Vec<_>>()
			.into_iter()
	}

	pub fn get(&self, peer_id: &PeerId) -> Option<&PeerDevice> {
		self.peers.get(peer_id)
	}

	/// Pair with a discovered peer. Returns false if it was already paired.
	pub fn mark_trusted(&mut self, peer_id: &PeerId) -> Result<bool> {
		let device = self
			.peers
			.get_mut(peer_id)
			.ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;
		device.trusted = true;
		let added = self.paired.insert(peer_id.clone());
		if added {
			info!(peer = %peer_id, "peer trusted");
		}
		Ok(added)
	}

	/// The peer must be known, live and trusted.
	pub fn require_trusted(&self, peer_id: &PeerId) -> Result<&PeerDevice> {
		let device = self
			.peers
			.get(peer_id)
			.filter(|d| self.is_live(d, self.clock.now_millis()))
			.ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;
		if !self.paired.contains(peer_id) {
			return Err(SyncError::UntrustedPeer(peer_id.to_string()));
		}
		Ok(device)
	}

	/// Record a completed session.
	pub fn touch(&mut self, peer_id: &PeerId) {
		let now = self.clock.now_millis();
		if let Some(device) = self.peers.get_mut(peer_id) {
			device.last_seen_at = now;
		}
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::mesh::StaticDiscovery;
	use crate::model::ManualClock;

	fn registry(clock: &ManualClock) -> PeerRegistry {
		PeerRegistry::new(Duration::from_secs(120), Arc::new(clock.clone()))
	}

	#[tokio::test]
	async fn discovery_upserts_and_evicts() {
		let clock = ManualClock::new(0);
		let mut reg = registry(&clock);
		let discovery =
			StaticDiscovery::new(vec![PeerAdvert::new("tab-a", 80), PeerAdvert::new("tab-b", 150)]);

		let live: Vec<_> = reg.discover(&discovery).await.unwrap().collect();
		assert_eq!(live.len(), 2);
		assert_eq!(live[1].link_quality, 100);

		clock.advance(Duration::from_secs(60));
		discovery.set(vec![PeerAdvert::new("tab-a", 40)]);
		reg.discover(&discovery).await.unwrap();

		clock.advance(Duration::from_secs(90));
		let live = reg.discover(&StaticDiscovery::default()).await.unwrap();
		let ids: Vec<_> = live.clone().map(|d| d.peer_id).collect();
		assert_eq!(ids, vec![PeerId::from("tab-a")]);
		// restartable
		assert_eq!(live.count(), 1);
		assert!(reg.get(&PeerId::from("tab-b")).is_none());
	}

	#[test]
	fn trust_is_explicit_and_survives_sightings() {
		let clock = ManualClock::new(0);
		let mut reg = registry(&clock);
		reg.observe(PeerAdvert::new("tab-a", 50));
		assert!(matches!(
			reg.require_trusted(&PeerId::from("tab-a")),
			Err(SyncError::UntrustedPeer(_))
		));
		assert!(matches!(
			reg.mark_trusted(&PeerId::from("tab-z")),
			Err(SyncError::UnknownPeer(_))
		));

		reg.mark_trusted(&PeerId::from("tab-a")).unwrap();
		reg.observe(PeerAdvert::new("tab-a", 10));
		assert!(reg.require_trusted(&PeerId::from("tab-a")).unwrap().trusted);

		clock.advance(Duration::from_secs(121));
		assert!(matches!(
			reg.require_trusted(&PeerId::from("tab-a")),
			Err(SyncError::UnknownPeer(_))
		));
	}

	#[test]
	fn pairing_outlives_eviction() {
		let clock = ManualClock::new(0);
		let mut reg = registry(&clock);
		reg.observe(PeerAdvert::new("tab-a", 50));
		assert!(reg.mark_trusted(&PeerId::from("tab-a")).unwrap());

		clock.advance(Duration::from_secs(180));
		assert_eq!(reg.absorb(Vec::new()).count(), 0);
		assert!(reg.get(&PeerId::from("tab-a")).is_none());

		reg.absorb(vec![PeerAdvert::new("tab-a", 60)]);
		let device = reg.require_trusted(&PeerId::from("tab-a")).unwrap();
		assert!(device.trusted);
		assert!(!reg.mark_trusted(&PeerId::from("tab-a")).unwrap());
	}

	#[test]
	fn restored_pairings_apply_on_first_sighting() {
		let clock = ManualClock::new(0);
		let mut reg = registry(&clock).with_paired([PeerId::from("tab-a")]);
		assert!(matches!(
			reg.require_trusted(&PeerId::from("tab-a")),
			Err(SyncError::UnknownPeer(_))
		));
		reg.observe(PeerAdvert::new("tab-a", 50));
		reg.observe(PeerAdvert::new("tab-b", 50));
		assert!(reg.require_trusted(&PeerId::from("tab-a")).is_ok());
		assert!(matches!(
			reg.require_trusted(&PeerId::from("tab-b")),
			Err(SyncError::UntrustedPeer(_))
		));
	}
}
