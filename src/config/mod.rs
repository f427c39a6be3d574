use hostname;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::mesh::ExchangeConfig;
use crate::outbox::RetryPolicy;
use crate::replica::ReplicaConfig;
use crate::resolve::ResolverConfig;
use crate::sync::EngineConfig;

/// Runtime configuration for asha-sync.
///
/// Values are loaded from (in order): `/etc/asha/sync.json`, the user config
/// folder (optional), and environment variables prefixed with `ASHA_`
/// (e.g. `ASHA_NODE_ID`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	/// Identity of this device; becomes the actor id on every write.
	pub node_id: String,
	pub data_dir: PathBuf,
	/// Authority base URL; unset means offline-only.
	pub remote_url: Option<Url>,
	/// Address `serve` binds the authority to.
	pub listen: String,
	pub sync_interval_secs: u64,
	pub batch_size: usize,
	// Retry policy for failed pushes
	pub retry_base_ms: u64,
	pub retry_cap_ms: u64,
	pub retry_jitter: f64,
	pub max_retries: u32,
	pub ack_retention_secs: u64,
	pub resolution_timeout_secs: u64,
	// Peer exchange
	pub peer_liveness_secs: u64,
	pub handshake_timeout_ms: u64,
	/// Address `run` accepts peer sessions on; unset disables the responder.
	pub peer_listen: Option<String>,
	/// Peer ids paired with this device.
	pub trusted_peers: Vec<String>,
	pub log_level: String,
	pub auto_resolve: bool,
}

impl Default for Settings {
	fn default() -> Self {
		let node_id = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "asha-device".to_string());
		let data_dir = dirs::data_local_dir()
			.map(|d| d.join("asha"))
			.unwrap_or_else(|| PathBuf::from("./asha-data"));
		let retry = RetryPolicy::default();

		Self {
			node_id,
			data_dir,
			remote_url: None,
			listen: "127.0.0.1:8787".to_string(),
			sync_interval_secs: 60,
			batch_size: 50,
			retry_base_ms: retry.base_ms,
			retry_cap_ms: retry.cap_ms,
			retry_jitter: retry.jitter,
			max_retries: retry.max_retries,
			ack_retention_secs: 24 * 60 * 60,
			resolution_timeout_secs: 30,
			peer_liveness_secs: 120,
			handshake_timeout_ms: 5_000,
			peer_listen: None,
			trusted_peers: Vec::new(),
			log_level: "info".to_string(),
			auto_resolve: true,
		}
	}
}

impl Settings {
	pub fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			base_ms: self.retry_base_ms,
			cap_ms: self.retry_cap_ms,
			jitter: self.retry_jitter.clamp(0.0, 1.0),
			max_retries: self.max_retries.max(1),
		}
	}

	pub fn engine_config(&self) -> EngineConfig {
		EngineConfig {
			batch_size: self.batch_size.max(1),
			sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
			resolution_timeout: Duration::from_secs(self.resolution_timeout_secs),
			replica: ReplicaConfig {
				retry: self.retry_policy(),
				ack_retention: Duration::from_secs(self.ack_retention_secs),
				resolver: ResolverConfig::default().with_auto_resolve(self.auto_resolve),
			},
		}
	}

	pub fn exchange_config(&self) -> ExchangeConfig {
		ExchangeConfig {
			handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
			peer_liveness: Duration::from_secs(self.peer_liveness_secs),
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

fn env_override<T: std::str::FromStr>(key: &str) -> Option<T> {
	std::env::var(key)
		.ok()
		.filter(|v| !v.is_empty())
		.and_then(|v| v.parse().ok())
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/asha/sync.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("asha").join("sync.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("asha").join("sync.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix("ASHA").separator("__"));

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Direct variables win over whatever the layered sources produced.
	if let Some(id) = env_override::<String>("ASHA_NODE_ID") {
		s.node_id = id;
	}
	if let Some(dir) = env_override::<PathBuf>("ASHA_DATA_DIR") {
		s.data_dir = dir;
	}
	if let Some(url) = env_override::<Url>("ASHA_REMOTE_URL") {
		s.remote_url = Some(url);
	}
	if let Some(listen) = env_override::<String>("ASHA_LISTEN") {
		s.listen = listen;
	}
	if let Some(secs) = env_override("ASHA_SYNC_INTERVAL_SECS") {
		s.sync_interval_secs = secs;
	}
	if let Some(n) = env_override("ASHA_BATCH_SIZE") {
		s.batch_size = n;
	}
	if let Some(n) = env_override("ASHA_MAX_RETRIES") {
		s.max_retries = n;
	}
	if let Some(addr) = env_override::<String>("ASHA_PEER_LISTEN") {
		s.peer_listen = Some(addr);
	}
	if let Some(level) = env_override::<String>("ASHA_LOG_LEVEL") {
		s.log_level = level;
	}
	if let Some(auto) = env_override("ASHA_AUTO_RESOLVE") {
		s.auto_resolve = auto;
	}

	Ok(s)
}

#[cfg(feature = "unit-tests")]
mod tests {
	use std::env;

	use super::*;

	const KEYS: [&str; 5] = [
		"ASHA_NODE_ID",
		"ASHA_REMOTE_URL",
		"ASHA_BATCH_SIZE",
		"ASHA_LOG_LEVEL",
		"ASHA_AUTO_RESOLVE",
	];

	#[test]
	fn test_load_defaults_and_env_overlay() {
		let originals: Vec<_> = KEYS.iter().map(|k| env::var_os(k)).collect();
		for key in KEYS {
			unsafe { env::remove_var(key) };
		}

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.node_id, d.node_id);
		assert_eq!(s.batch_size, d.batch_size);
		assert!(s.auto_resolve);

		unsafe { env::set_var("ASHA_NODE_ID", "asha-kit-07") };
		unsafe { env::set_var("ASHA_REMOTE_URL", "http://hub.local:8787/") };
		unsafe { env::set_var("ASHA_BATCH_SIZE", "10") };
		unsafe { env::set_var("ASHA_LOG_LEVEL", "debug") };
		unsafe { env::set_var("ASHA_AUTO_RESOLVE", "false") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.node_id, "asha-kit-07");
		assert_eq!(s2.remote_url.as_ref().map(Url::as_str), Some("http://hub.local:8787/"));
		assert_eq!(s2.batch_size, 10);
		assert_eq!(s2.log_level, "debug");
		assert!(!s2.engine_config().replica.resolver.auto_resolve);

		for (key, original) in KEYS.iter().zip(originals) {
			match original {
				Some(v) => unsafe { env::set_var(key, v) },
				None => unsafe { env::remove_var(key) },
			}
		}
	}

	#[test]
	fn derived_configs_clamp_nonsense() {
		let s = Settings {
			batch_size: 0,
			retry_jitter: 3.0,
			max_retries: 0,
			handshake_timeout_ms: 250,
			..Settings::default()
		};
		let engine = s.engine_config();
		assert_eq!(engine.batch_size, 1);
		assert_eq!(engine.replica.retry.jitter, 1.0);
		assert_eq!(engine.replica.retry.max_retries, 1);
		assert_eq!(s.exchange_config().handshake_timeout, Duration::from_millis(250));
	}
}
