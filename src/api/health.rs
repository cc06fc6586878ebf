use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    /// Ledger backend in use ("memory" or "redis").
    pub ledger: String,
    /// Free slots in the usage queue.
    pub pending_usage_capacity: usize,
    /// Usage events dropped since startup.
    pub dropped_usage_events: u64,
}

/// GET /health
///
/// Liveness plus the state of the usage pipeline. Does not touch the ledger.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        ledger: state.gate.backend().to_string(),
        pending_usage_capacity: state.dispatcher.available(),
        dropped_usage_events: state.dispatcher.dropped(),
    })
}
