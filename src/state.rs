use std::sync::Arc;

use crate::observability::MetricsRegistry;
use crate::sync::MemoryAuthority;

/// Application state passed to handlers via Axum's `State` extractor.
///
/// Holds the shared authority ledger and the metrics registry so the
/// `serve` command can answer pulls, pushes and scrapes from one place.
#[derive(Clone)]
pub struct AppState {
	pub authority: Arc<MemoryAuthority>,
	pub metrics: Arc<MetricsRegistry>,
	pub node_id: String,
}
