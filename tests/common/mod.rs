/// Common test utilities and helpers for integration tests.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asha_sync::model::{ActorId, ManualClock};
use asha_sync::persist::StateStore;
use asha_sync::resolve::ResolverConfig;
use asha_sync::sync::{
	ChangeBatch, EngineConfig, MemoryAuthority, OutgoingChange, PushOutcome, SyncEngine,
	SyncTransport,
};
use asha_sync::{Result, SyncError};

/// Build a field map from `(name, value)` pairs.
#[allow(dead_code)]
pub fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
	pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Engine config for tests: no resolution wait unless asked for.
#[allow(dead_code)]
pub fn test_config(auto_resolve: bool) -> EngineConfig {
	let mut config = EngineConfig {
		resolution_timeout: Duration::ZERO,
		..EngineConfig::default()
	};
	config.replica.resolver = ResolverConfig::default().with_auto_resolve(auto_resolve);
	config
}

/// Open a device engine against `transport` on a shared manual clock.
#[allow(dead_code)]
pub async fn device(
	actor: &str,
	transport: Arc<dyn SyncTransport>,
	clock: &ManualClock,
	config: EngineConfig,
) -> SyncEngine {
	SyncEngine::builder(ActorId::from(actor), transport)
		.clock(Arc::new(clock.clone()))
		.config(config)
		.open()
		.await
		.expect("engine opens")
}

/// Open a device engine that persists into `store`.
#[allow(dead_code)]
pub async fn device_with_store(
	actor: &str,
	transport: Arc<dyn SyncTransport>,
	clock: &ManualClock,
	store: Arc<dyn StateStore>,
) -> Result<SyncEngine> {
	SyncEngine::builder(ActorId::from(actor), transport)
		.clock(Arc::new(clock.clone()))
		.config(test_config(true))
		.state_store(store)
		.open()
		.await
}

/// Authority wrapper that can fail pushes, refuse chosen entries, stall pushes,
/// and records every push it sees.
#[allow(dead_code)]
pub struct ScriptedTransport {
	pub authority: Arc<MemoryAuthority>,
	/// Number of upcoming pushes that fail with a transport error.
	pub fail_pushes: AtomicUsize,
	/// Entry ids refused once with a retryable rejection.
	pub reject_once: Mutex<Vec<u64>>,
	/// Entry ids refused for good.
	pub reject_permanently: Mutex<Vec<u64>>,
	/// When set, pushes never complete.
	pub stall_pushes: AtomicBool,
	/// Entry ids of every push, one vector per call.
	pub pushes: Mutex<Vec<Vec<u64>>>,
	pub pulls: AtomicUsize,
	pub pull_delay: Duration,
}

#[allow(dead_code)]
impl ScriptedTransport {
	pub fn new(authority: Arc<MemoryAuthority>) -> Self {
		Self {
			authority,
			fail_pushes: AtomicUsize::new(0),
			reject_once: Mutex::new(Vec::new()),
			reject_permanently: Mutex::new(Vec::new()),
			stall_pushes: AtomicBool::new(false),
			pushes: Mutex::new(Vec::new()),
			pulls: AtomicUsize::new(0),
			pull_delay: Duration::ZERO,
		}
	}

	pub fn with_pull_delay(mut self, delay: Duration) -> Self {
		self.pull_delay = delay;
		self
	}

	pub fn pushes(&self) -> Vec<Vec<u64>> {
		self.pushes.lock().unwrap().clone()
	}
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
	async fn pull(&self, since: u64) -> Result<ChangeBatch> {
		self.pulls.fetch_add(1, Ordering::SeqCst);
		if !self.pull_delay.is_zero() {
			tokio::time::sleep(self.pull_delay).await;
		}
		self.authority.changes_since(since)
	}

	async fn push(&self, changes: &[OutgoingChange]) -> Result<Vec<PushOutcome>> {
		self.pushes
			.lock()
			.unwrap()
			.push(changes.iter().map(|c| c.entry_id).collect());
		if self.stall_pushes.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}
		let failing = self
			.fail_pushes
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failing {
			return Err(SyncError::Transport("link dropped".to_string()));
		}

		let mut outcomes = Vec::with_capacity(changes.len());
		for change in changes {
			let once = {
				let mut once = self.reject_once.lock().unwrap();
				let hit = once.contains(&change.entry_id);
				once.retain(|id| *id != change.entry_id);
				hit
			};
			if once {
				outcomes.push(PushOutcome::Rejected {
					reason: "authority busy".to_string(),
					retryable: true,
				});
			} else if self.reject_permanently.lock().unwrap().contains(&change.entry_id) {
				outcomes.push(PushOutcome::Rejected {
					reason: "field not writable".to_string(),
					retryable: false,
				});
			} else {
				outcomes.push(self.authority.apply(change)?);
			}
		}
		Ok(outcomes)
	}
}
