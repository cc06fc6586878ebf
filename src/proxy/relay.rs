//! Byte-transparent relay of an upstream event stream.
//!
//! Handles the framing of the upstream body into newline-terminated records,
//! yielding each record as soon as it is complete. Records are forwarded
//! verbatim; `data:` records are additionally probed for a `usage` object.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use pin_project_lite::pin_project;
use serde::Deserialize;

use crate::budget::{UsageDispatcher, UsageEvent};
use crate::observability::{EventSink, GatewayEvent};

/// Default ceiling for a single record.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

const DATA_PREFIX: &[u8] = b"data:";
const DONE_SENTINEL: &[u8] = b"[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Upstream record exceeds {limit} bytes")]
    RecordTooLarge { limit: usize },

    #[error("Upstream stream failed: {0}")]
    Upstream(String),
}

#[derive(Deserialize)]
struct UsageProbe {
    usage: Option<UsageCounts>,
}

#[derive(Deserialize)]
struct UsageCounts {
    total_tokens: Option<u64>,
}

/// Extract `usage.total_tokens` from one event-stream record.
///
/// Returns `None` for non-data records, the `[DONE]` sentinel, unparsable
/// payloads and payloads without a usage figure.
pub fn scan_usage(record: &[u8]) -> Option<u64> {
    let line = record.strip_suffix(b"\n").unwrap_or(record);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);
    if payload.starts_with(DONE_SENTINEL) {
        return None;
    }
    serde_json::from_slice::<UsageProbe>(payload)
        .ok()?
        .usage?
        .total_tokens
}

/// Where the relay reports when it ends.
pub struct RelayContext {
    /// Caller token, `None` for unmetered requests.
    pub caller: Option<String>,
    /// Upstream status, reported with the request latency.
    pub status: u16,
    pub started: Instant,
    pub dispatcher: UsageDispatcher,
    pub events: Arc<dyn EventSink>,
}

/// Usage seen so far and the one-shot report made when the relay ends.
struct Settlement {
    tokens: Option<u64>,
    context: Option<RelayContext>,
}

impl Settlement {
    fn observe(&mut self, record: &[u8]) {
        if let Some(tokens) = scan_usage(record) {
            self.tokens = Some(tokens);
        }
    }

    /// Report the outcome. Only the first call does anything.
    fn settle(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };

        context.events.emit(GatewayEvent::RequestCompleted {
            status: context.status,
            latency: context.started.elapsed(),
        });

        match (context.caller, self.tokens) {
            (Some(caller), Some(tokens)) if tokens > 0 && !caller.is_empty() => {
                context.dispatcher.submit(UsageEvent { caller, tokens });
            }
            _ => {}
        }
    }
}

pin_project! {
    /// Forwards an upstream body record by record while watching for usage.
    ///
    /// Concatenating the yielded frames reproduces the upstream bytes exactly.
    /// Usage is reported once, when the stream ends, errors, or is dropped
    /// (the caller went away).
    pub struct RelayStream<S> {
        #[pin]
        upstream: S,
        buffer: BytesMut,
        // Bytes of `buffer` already searched for a newline.
        scanned: usize,
        max_record: usize,
        upstream_done: bool,
        terminated: bool,
        settlement: Settlement,
    }

    impl<S> PinnedDrop for RelayStream<S> {
        fn drop(this: Pin<&mut Self>) {
            this.project().settlement.settle();
        }
    }
}

impl<S, E> RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    pub fn new(upstream: S, max_record: usize) -> Self {
        Self {
            upstream,
            buffer: BytesMut::new(),
            scanned: 0,
            max_record: max_record.max(1),
            upstream_done: false,
            terminated: false,
            settlement: Settlement {
                tokens: None,
                context: None,
            },
        }
    }

    /// Attach the usage and latency reporting target.
    pub fn with_context(mut self, context: RelayContext) -> Self {
        self.settlement.context = Some(context);
        self
    }

    /// Last usage figure seen.
    pub fn tokens(&self) -> Option<u64> {
        self.settlement.tokens
    }
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.terminated {
            return Poll::Ready(None);
        }

        loop {
            // 1. Yield the next complete record.
            let unscanned = &this.buffer[*this.scanned..];
            if let Some(pos) = unscanned.iter().position(|&b| b == b'\n') {
                let end = *this.scanned + pos + 1;
                *this.scanned = 0;
                if end > *this.max_record {
                    return Poll::Ready(Some(Err(fail(
                        this.terminated,
                        this.settlement,
                        RelayError::RecordTooLarge {
                            limit: *this.max_record,
                        },
                    ))));
                }
                let record = this.buffer.split_to(end).freeze();
                this.settlement.observe(&record);
                return Poll::Ready(Some(Ok(record)));
            }
            *this.scanned = this.buffer.len();

            // 2. Upstream closed: flush the unterminated tail, then finish.
            if *this.upstream_done {
                *this.scanned = 0;
                if !this.buffer.is_empty() {
                    let record = this.buffer.split().freeze();
                    this.settlement.observe(&record);
                    return Poll::Ready(Some(Ok(record)));
                }
                *this.terminated = true;
                this.settlement.settle();
                return Poll::Ready(None);
            }

            if this.buffer.len() > *this.max_record {
                return Poll::Ready(Some(Err(fail(
                    this.terminated,
                    this.settlement,
                    RelayError::RecordTooLarge {
                        limit: *this.max_record,
                    },
                ))));
            }

            // 3. Pull more bytes.
            match this.upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(fail(
                        this.terminated,
                        this.settlement,
                        RelayError::Upstream(e.to_string()),
                    ))));
                }
                Poll::Ready(None) => *this.upstream_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// End the relay with an error. Usage observed before the failure is still
/// reported.
fn fail(terminated: &mut bool, settlement: &mut Settlement, error: RelayError) -> RelayError {
    tracing::warn!(error = %error, "Relay aborted");
    *terminated = true;
    settlement.settle();
    error
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
