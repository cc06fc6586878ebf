//! Gateway events and their metric export.
//!
//! The request path reports plain facts through [`EventSink`]; what happens to
//! them (Prometheus counters, a test recorder) is up to the sink.

use std::sync::Mutex;
use std::time::Duration;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// A discrete fact emitted by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A completions request finished, either rejected early or after the
    /// relay ended.
    RequestCompleted { status: u16, latency: Duration },
    /// Usage was applied to the ledger.
    UsageRecorded { caller: String, tokens: u64 },
    /// The ledger rejected a usage write; the event is discarded.
    UsageWriteFailed {
        caller: String,
        tokens: u64,
        error: String,
    },
    /// The usage queue was full or closed; the event never reached the ledger.
    UsageDropped { caller: String, tokens: u64 },
}

/// Receiver of gateway events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

// ---------------------------------------------------------------------------
// Prometheus
// ---------------------------------------------------------------------------

pub const REQUEST_LATENCY: &str = "aura_gateway_request_latency_seconds";
pub const TOTAL_TOKENS: &str = "aura_gateway_total_tokens";
pub const ERRORS_TOTAL: &str = "aura_gateway_errors_total";

/// Install the global Prometheus recorder and describe the gateway metrics.
///
/// Only one recorder can be installed per process.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    describe_histogram!(REQUEST_LATENCY, "Latency of /v1/chat/completions requests.");
    describe_counter!(TOTAL_TOKENS, "Total tokens consumed through the proxy.");
    describe_counter!(ERRORS_TOTAL, "Total errors encountered by the proxy.");

    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Sink that records events through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::RequestCompleted { status, latency } => {
                metrics::histogram!(REQUEST_LATENCY, "status" => status.to_string())
                    .record(latency.as_secs_f64());
            }
            GatewayEvent::UsageRecorded { tokens, .. } => {
                metrics::counter!(TOTAL_TOKENS).increment(tokens);
            }
            GatewayEvent::UsageWriteFailed { .. } => {
                metrics::counter!(ERRORS_TOTAL, "type" => "ledger_write").increment(1);
            }
            GatewayEvent::UsageDropped { .. } => {
                metrics::counter!(ERRORS_TOTAL, "type" => "usage_dropped").increment(1);
            }
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GatewayEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Shorten a caller token for logs: first and last four characters only.
pub fn redact(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
