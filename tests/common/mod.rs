//! Shared harness: the full router wired to a caller-supplied ledger and
//! upstream URL, with events captured in memory.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, Response};
use axum::routing::post;
use bytes::Bytes;
use futures::stream;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;

use aura_gateway::budget::{
    AdmissionGate, LedgerError, LedgerFuture, MemoryLedger, SpendPolicy, UsageDispatcher,
    UsageLedger, UsageWorker, spawn_usage_worker,
};
use aura_gateway::config::Config;
use aura_gateway::observability::{EventSink, GatewayEvent, RecordingSink};
use aura_gateway::proxy::Upstream;
use aura_gateway::{AppState, build_app};

pub const TRANSCRIPT: &str = concat!(
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}],\"usage\":null}\n",
    "\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}],\"usage\":null}\n",
    "\n",
    "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":8,\"total_tokens\":18}}\n",
    "\n",
    "data: [DONE]\n",
    "\n",
);

pub struct Gateway {
    pub app: Router,
    pub gate: Arc<AdmissionGate>,
    pub sink: Arc<RecordingSink>,
    worker: UsageWorker,
}

impl Gateway {
    /// Gateway with an in-memory ledger and the default policy.
    pub fn new(upstream_url: &str) -> Self {
        Self::with_ledger(
            upstream_url,
            Arc::new(MemoryLedger::new(SpendPolicy::default())),
        )
    }

    pub fn with_ledger(upstream_url: &str, ledger: Arc<dyn UsageLedger>) -> Self {
        let mut config = Config::default();
        config.upstream.url = upstream_url.to_string();

        let sink = Arc::new(RecordingSink::new());
        let events: Arc<dyn EventSink> = sink.clone();
        let gate = Arc::new(AdmissionGate::new(ledger));
        let (dispatcher, rx) = UsageDispatcher::channel(16, events.clone());
        let worker = spawn_usage_worker(Arc::clone(&gate), rx, events.clone());
        let upstream = Upstream::from_config(&config.upstream).unwrap();

        let state = AppState {
            config: Arc::new(config),
            gate: Arc::clone(&gate),
            upstream,
            dispatcher,
            events,
            metrics: None,
        };

        Self {
            app: build_app(state),
            gate,
            sink,
            worker,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Serve the router on a loopback port until the test ends.
    pub async fn listen(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.app.clone();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    /// Drop the router and wait for the usage worker to drain.
    pub async fn finish(self) -> (Arc<AdmissionGate>, Vec<GatewayEvent>) {
        drop(self.app);
        assert!(self.worker.shutdown(Duration::from_secs(5)).await);
        (self.gate, self.sink.events())
    }
}

/// Upstream that answers every completion with `first`, then keeps the
/// response open, writing a `: ping` comment every `ping` interval.
///
/// The returned receiver gets a message once a ping can no longer be written
/// because the reader went away.
pub async fn trickling_upstream(
    first: &'static str,
    ping: Duration,
) -> (String, mpsc::UnboundedReceiver<()>) {
    let (gone_tx, gone_rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let gone_tx = gone_tx.clone();
            async move {
                let (tx, rx) = mpsc::channel::<Bytes>(1);
                tokio::spawn(async move {
                    let _ = tx.send(Bytes::from_static(first.as_bytes())).await;
                    loop {
                        tokio::time::sleep(ping).await;
                        if tx.send(Bytes::from_static(b": ping\n")).await.is_err() {
                            let _ = gone_tx.send(());
                            break;
                        }
                    }
                });
                let body = stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
                });
                ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(body))
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}/v1/chat/completions"), gone_rx)
}

/// Read a live response until one full record has arrived.
pub async fn read_record(response: &mut reqwest::Response) -> Vec<u8> {
    let mut record = Vec::new();
    while !record.contains(&b'\n') {
        let chunk = response.chunk().await.unwrap().expect("response ended early");
        record.extend_from_slice(&chunk);
    }
    record
}

pub fn completion_request(token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Ledger whose store is always down.
pub struct DownLedger;

impl UsageLedger for DownLedger {
    fn backend(&self) -> &'static str {
        "down"
    }

    fn policy(&self) -> SpendPolicy {
        SpendPolicy::default()
    }

    fn check_allowed<'a>(&'a self, _caller: &'a str) -> LedgerFuture<'a, bool> {
        Box::pin(async { Err(LedgerError::Backend("connection refused".into())) })
    }

    fn add_usage<'a>(&'a self, _caller: &'a str, _tokens: u64) -> LedgerFuture<'a, ()> {
        Box::pin(async { Err(LedgerError::Backend("connection refused".into())) })
    }

    fn get_usage<'a>(&'a self, _caller: &'a str) -> LedgerFuture<'a, i64> {
        Box::pin(async { Err(LedgerError::Backend("connection refused".into())) })
    }
}
