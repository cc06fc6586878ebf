pub mod chat;
pub mod health;
pub mod metrics;
pub mod usage;

use axum::Router;
use axum::routing::{get, post};

use crate::AppState;

/// Build the API router.
///
/// Route layout:
/// ```text
/// /health                        GET
/// /metrics                       GET
/// /v1/chat/completions           POST   (metered when a Bearer token is sent)
/// /v1/usage                      GET    (Bearer token required)
/// ```
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/usage", get(usage::get_usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_api_router_creates_router() {
        // Smoke test: ensure the router builds without panicking.
        let _router: Router<AppState> = build_api_router();
    }
}
