use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CONNECTION, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, Method};
use axum::response::{IntoResponse, Response};

use crate::AppState;
use crate::auth::bearer_token;
use crate::budget::micros_to_dollars;
use crate::error::AppError;
use crate::observability::{GatewayEvent, redact};
use crate::proxy::{RelayContext, RelayStream, forward_headers, rewrite_body};

/// Response headers that describe the upstream connection rather than the
/// payload. The body is re-framed on the way out.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == CONNECTION || name == TRANSFER_ENCODING || name.as_str() == "keep-alive"
}

/// POST /v1/chat/completions
///
/// Admission check, then the rewritten request is sent upstream and its
/// event stream relayed back to the caller as it arrives. Usage found in the
/// stream is charged to the caller after the response ends.
pub async fn chat_completions(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    match proxy_completion(&state, method, &headers, &body, started).await {
        Ok(response) => response,
        Err(err) => {
            // Relayed responses report on their own when the stream ends.
            state.events.emit(GatewayEvent::RequestCompleted {
                status: err.status_code().as_u16(),
                latency: started.elapsed(),
            });
            err.into_response()
        }
    }
}

async fn proxy_completion(
    state: &AppState,
    method: Method,
    headers: &HeaderMap,
    body: &[u8],
    started: Instant,
) -> Result<Response, AppError> {
    let caller = bearer_token(headers);

    match caller.as_deref() {
        Some(token) => {
            if !state.gate.allow(token).await? {
                let limit = state.gate.policy().spend_limit;
                tracing::info!(caller = %redact(token), "Request rejected, spend limit reached");
                return Err(AppError::LimitExceeded(format!(
                    "usage >= ${:.2}",
                    micros_to_dollars(limit)
                )));
            }
            tracing::info!(caller = %redact(token), "Chat completion request");
        }
        None => tracing::debug!("Chat completion request without caller token, not metered"),
    }

    let outbound = rewrite_body(body)?;
    let upstream = state
        .upstream
        .send(method, forward_headers(headers), outbound)
        .await?;

    let status = upstream.status();
    tracing::debug!(status = status.as_u16(), "Upstream responded");

    let mut response = Response::builder().status(status);
    if let Some(response_headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                response_headers.append(name.clone(), value.clone());
            }
        }
    }

    let relay = RelayStream::new(
        upstream.bytes_stream(),
        state.config.upstream.max_record_bytes,
    )
    .with_context(RelayContext {
        caller,
        status: status.as_u16(),
        started,
        dispatcher: state.dispatcher.clone(),
        events: state.events.clone(),
    });

    response
        .body(Body::from_stream(relay))
        .map_err(|e| AppError::Internal(format!("failed to build response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop(&CONNECTION));
        assert!(is_hop_by_hop(&TRANSFER_ENCODING));
        assert!(is_hop_by_hop(&HeaderName::from_static("keep-alive")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-request-id")));
    }
}
