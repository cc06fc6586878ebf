use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Serialize;

use crate::AppState;
use crate::auth::require_bearer_token;
use crate::budget::{Balance, micros_to_dollars};
use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub api_key: String,
    pub usage_dollars: f64,
    pub limit_dollars: f64,
    pub remaining_dollars: f64,
}

impl UsageResponse {
    fn new(api_key: String, balance: Balance) -> Self {
        Self {
            api_key,
            usage_dollars: micros_to_dollars(balance.spent),
            limit_dollars: micros_to_dollars(balance.limit),
            remaining_dollars: micros_to_dollars(balance.remaining),
        }
    }
}

/// GET /v1/usage
///
/// Spend of the calling key against its limit. Requires a Bearer token.
pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UsageResponse>, AppError> {
    let api_key = require_bearer_token(&headers)?;
    let balance = state.gate.balance(&api_key).await?;
    Ok(Json(UsageResponse::new(api_key, balance)))
}
