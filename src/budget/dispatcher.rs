use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::budget::{AdmissionGate, UsageEvent};
use crate::observability::{EventSink, GatewayEvent, redact};

/// Default queue capacity between relays and the usage worker.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Receiving end of the usage queue, consumed by [`spawn_usage_worker`].
pub type UsageReceiver = mpsc::Receiver<UsageEvent>;

/// Result of [`UsageDispatcher::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    Dropped,
}

/// Non-blocking hand-off of usage events to the background worker.
///
/// The queue is bounded. When it is full the event is dropped and counted.
#[derive(Clone)]
pub struct UsageDispatcher {
    tx: mpsc::Sender<UsageEvent>,
    dropped: Arc<AtomicU64>,
    events: Arc<dyn EventSink>,
}

impl UsageDispatcher {
    /// Create a dispatcher and the receiver to hand to [`spawn_usage_worker`].
    pub fn channel(
        capacity: usize,
        events: Arc<dyn EventSink>,
    ) -> (Self, UsageReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            events,
        };
        (dispatcher, rx)
    }

    /// Queue an event without waiting. O(1) regardless of queue occupancy.
    pub fn submit(&self, event: UsageEvent) -> SubmitOutcome {
        let (event, reason) = match self.tx.try_send(event) {
            Ok(()) => return SubmitOutcome::Queued,
            Err(TrySendError::Full(event)) => (event, "queue full"),
            Err(TrySendError::Closed(event)) => (event, "queue closed"),
        };

        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            caller = %redact(&event.caller),
            tokens = event.tokens,
            reason,
            dropped_total = total,
            "Usage event dropped"
        );
        self.events.emit(GatewayEvent::UsageDropped {
            caller: event.caller,
            tokens: event.tokens,
        });
        SubmitOutcome::Dropped
    }

    /// Events dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured queue capacity.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Handle on the background usage worker.
pub struct UsageWorker {
    handle: JoinHandle<()>,
}

impl UsageWorker {
    /// Wait for the worker to drain its backlog and exit.
    ///
    /// The worker only exits once every [`UsageDispatcher`] clone is dropped.
    /// Returns `false` if the deadline passed first; the worker is then aborted
    /// and whatever is still queued is lost.
    pub async fn shutdown(mut self, deadline: Duration) -> bool {
        match tokio::time::timeout(deadline, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Usage worker terminated abnormally");
                false
            }
            Err(_) => {
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "Usage worker did not drain before the shutdown deadline"
                );
                self.handle.abort();
                false
            }
        }
    }
}

/// Spawn the single consumer that applies usage events to the ledger in
/// arrival order. Failed writes are logged and discarded, never retried.
pub fn spawn_usage_worker(
    gate: Arc<AdmissionGate>,
    mut rx: UsageReceiver,
    events: Arc<dyn EventSink>,
) -> UsageWorker {
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            apply(&gate, events.as_ref(), event).await;
        }
        tracing::info!("Usage worker drained, shutting down");
    });
    UsageWorker { handle }
}

async fn apply(gate: &AdmissionGate, events: &dyn EventSink, event: UsageEvent) {
    match gate.record(&event.caller, event.tokens).await {
        Ok(()) => {
            tracing::info!(
                caller = %redact(&event.caller),
                tokens = event.tokens,
                "Usage recorded"
            );
            events.emit(GatewayEvent::UsageRecorded {
                caller: event.caller,
                tokens: event.tokens,
            });
        }
        Err(e) => {
            tracing::error!(
                caller = %redact(&event.caller),
                tokens = event.tokens,
                error = %e,
                "Failed to add usage to ledger"
            );
            events.emit(GatewayEvent::UsageWriteFailed {
                caller: event.caller,
                tokens: event.tokens,
                error: e.to_string(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
