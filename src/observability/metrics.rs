use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

const NAMESPACE: &str = "asha";

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
	let metric = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(metric.clone()))?;
	Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
	let metric = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(metric.clone()))?;
	Ok(metric)
}

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Sync engine
	pub sync_cycles_total: IntCounter,
	pub sync_cycle_failures_total: IntCounter,
	pub sync_cycle_duration_seconds: Histogram,
	pub sync_deltas_pulled_total: IntCounter,
	pub sync_deltas_rejected_total: IntCounter,
	pub sync_entries_pushed_total: IntCounter,
	pub sync_entries_acknowledged_total: IntCounter,
	pub sync_entries_failed_total: IntCounter,
	pub sync_permanent_failures_total: IntCounter,
	pub sync_pending_entries: IntGauge,
	pub sync_watermark: IntGauge,

	// Conflicts
	pub conflicts_detected_total: IntCounter,
	pub conflicts_auto_resolved_total: IntCounter,
	pub conflicts_escalated_total: IntCounter,
	pub conflicts_manually_resolved_total: IntCounter,
	pub open_conflicts: IntGauge,

	// Peer exchange
	pub peer_exchanges_total: IntCounter,
	pub peer_exchange_failures_total: IntCounter,
	pub peer_deltas_received_total: IntCounter,
	pub peers_live: IntGauge,

	// Authority (serve)
	pub authority_changes_accepted_total: IntCounter,
	pub authority_changes_conflicted_total: IntCounter,
	pub authority_changes_rejected_total: IntCounter,
	pub authority_deltas_served_total: IntCounter,
}

impl MetricsRegistry {
	/// Panics only if the static metric definitions are invalid.
	pub fn new() -> Self {
		Self::try_new().expect("metric definitions are valid")
	}

	pub fn try_new() -> prometheus::Result<Self> {
		let registry = Registry::new();
		let r = &registry;

		let sync_cycle_duration_seconds = Histogram::with_opts(
			HistogramOpts::new("sync_cycle_duration_seconds", "Duration of sync cycles in seconds")
				.namespace(NAMESPACE)
				.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 120.0]),
		)?;
		registry.register(Box::new(sync_cycle_duration_seconds.clone()))?;

		Ok(Self {
			sync_cycles_total: counter(r, "sync_cycles_total", "Sync cycles started")?,
			sync_cycle_failures_total: counter(
				r,
				"sync_cycle_failures_total",
				"Sync cycles that ended in backoff",
			)?,
			sync_cycle_duration_seconds,
			sync_deltas_pulled_total: counter(
				r,
				"sync_deltas_pulled_total",
				"Deltas pulled from the authority",
			)?,
			sync_deltas_rejected_total: counter(
				r,
				"sync_deltas_rejected_total",
				"Pulled or peer deltas that could not be merged",
			)?,
			sync_entries_pushed_total: counter(
				r,
				"sync_entries_pushed_total",
				"Outbox entries pushed",
			)?,
			sync_entries_acknowledged_total: counter(
				r,
				"sync_entries_acknowledged_total",
				"Outbox entries accepted by the authority",
			)?,
			sync_entries_failed_total: counter(
				r,
				"sync_entries_failed_total",
				"Failed delivery attempts",
			)?,
			sync_permanent_failures_total: counter(
				r,
				"sync_permanent_failures_total",
				"Entries that exhausted their retry budget",
			)?,
			sync_pending_entries: gauge(
				r,
				"sync_pending_entries",
				"Outbox entries not yet accepted",
			)?,
			sync_watermark: gauge(r, "sync_watermark", "Last pulled authority watermark")?,
			conflicts_detected_total: counter(r, "conflicts_detected_total", "Conflicts detected")?,
			conflicts_auto_resolved_total: counter(
				r,
				"conflicts_auto_resolved_total",
				"Conflicts settled by field policy",
			)?,
			conflicts_escalated_total: counter(
				r,
				"conflicts_escalated_total",
				"Conflicts escalated for a manual decision",
			)?,
			conflicts_manually_resolved_total: counter(
				r,
				"conflicts_manually_resolved_total",
				"Conflicts resolved by a user",
			)?,
			open_conflicts: gauge(r, "open_conflicts", "Conflicts awaiting a decision")?,
			peer_exchanges_total: counter(
				r,
				"peer_exchanges_total",
				"Completed peer exchange sessions",
			)?,
			peer_exchange_failures_total: counter(
				r,
				"peer_exchange_failures_total",
				"Failed peer exchange sessions",
			)?,
			peer_deltas_received_total: counter(
				r,
				"peer_deltas_received_total",
				"Deltas received from peers",
			)?,
			peers_live: gauge(r, "peers_live", "Peers seen within the liveness window")?,
			authority_changes_accepted_total: counter(
				r,
				"authority_changes_accepted_total",
				"Pushed changes accepted",
			)?,
			authority_changes_conflicted_total: counter(
				r,
				"authority_changes_conflicted_total",
				"Pushed changes refused as stale",
			)?,
			authority_changes_rejected_total: counter(
				r,
				"authority_changes_rejected_total",
				"Pushed changes rejected as invalid",
			)?,
			authority_deltas_served_total: counter(
				r,
				"authority_deltas_served_total",
				"Deltas served to pulling replicas",
			)?,
			registry,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				tracing::error!(error = %e, "failed to encode metrics");
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the global metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::try_new()?))
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn metrics_registry_creation() {
		let registry = super::MetricsRegistry::new();
		assert!(registry.encode().contains("asha_sync_cycles_total"));
	}

	#[test]
	fn metrics_increment() {
		let registry = super::MetricsRegistry::new();
		registry.sync_cycles_total.inc();
		registry.sync_deltas_pulled_total.inc_by(10);
		registry.open_conflicts.set(2);
		let text = registry.encode();
		assert!(text.contains("asha_sync_deltas_pulled_total 10"));
		assert!(text.contains("asha_open_conflicts 2"));
	}
}
