use axum::{
	extract::State,
	http::StatusCode,
	response::{IntoResponse, Response},
};

use crate::error::SyncError;

/// Liveness endpoint: returns 200 with the node id while the ledger is usable,
/// otherwise 503 Service Unavailable.
pub async fn health(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	match state.authority.changes_since(u64::MAX) {
		Ok(batch) => (
			StatusCode::OK,
			format!("OK {} watermark={}", state.node_id, batch.watermark),
		)
			.into_response(),
		Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("ledger error: {}", e)).into_response(),
	}
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	let metrics_text = state.metrics.encode();
	(StatusCode::OK, metrics_text).into_response()
}

/// Maps sync errors onto HTTP statuses for the authority handlers.
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
	fn from(e: SyncError) -> Self {
		Self(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
			SyncError::NotFound(_) => StatusCode::NOT_FOUND,
			_ => StatusCode::SERVICE_UNAVAILABLE,
		};
		(status, self.0.to_string()).into_response()
	}
}
