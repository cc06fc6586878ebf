pub mod api;
pub mod auth;
pub mod budget;
pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::budget::{AdmissionGate, UsageDispatcher};
use crate::config::Config;
use crate::observability::EventSink;
use crate::proxy::Upstream;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: Arc<AdmissionGate>,
    pub upstream: Upstream,
    pub dispatcher: UsageDispatcher,
    pub events: Arc<dyn EventSink>,
    /// Present when the Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Build the application router with all middleware layers.
pub fn build_app(state: AppState) -> Router {
    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // -- Tracing layer --------------------------------------------------------
    let trace = TraceLayer::new_for_http();

    let body_limit = DefaultBodyLimit::max(state.config.server.max_body_bytes);

    api::build_api_router()
        .layer(body_limit)
        .layer(propagate_id)
        .layer(request_id)
        .layer(trace)
        .with_state(state)
}

/// Serve `app` until `signal` fires, then give open responses `grace` to finish.
///
/// Returns `false` when the grace period ran out and the server was dropped
/// with responses still open.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    signal: F,
    grace: Duration,
) -> std::io::Result<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (fired_tx, fired_rx) = oneshot::channel::<()>();
    let shutdown = async move {
        signal.await;
        let _ = fired_tx.send(());
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result.map(|()| true),
        Ok(()) = fired_rx => {}
    }

    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => result.map(|()| true),
        Err(_) => {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Open responses did not finish before the shutdown deadline, abandoning them"
            );
            Ok(false)
        }
    }
}
