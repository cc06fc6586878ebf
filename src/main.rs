//! aura-gateway -- budget-gated streaming proxy for chat completions.
//!
//! This is the application entry point. It wires together all modules:
//!   - Configuration loading
//!   - Usage ledger (in-memory or Redis) and admission gate
//!   - Usage dispatcher + background worker
//!   - Prometheus metrics
//!   - HTTP server
//!   - Graceful shutdown on SIGTERM / SIGINT, draining pending usage

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use aura_gateway::budget::{AdmissionGate, UsageDispatcher, build_ledger, spawn_usage_worker};
use aura_gateway::config::Config;
use aura_gateway::observability::{self, EventSink, MetricsSink};
use aura_gateway::proxy::Upstream;
use aura_gateway::{AppState, build_app, serve};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG_PATH: &str = "aura-gateway.toml";

struct CliArgs {
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("aura-gateway {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
aura-gateway {version} -- Budget-gated streaming proxy for chat completions

USAGE:
    aura-gateway [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: {default_path}]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    AURA_CONFIG            Alternative to --config flag
    AURA_*                 Per-setting overrides (e.g. AURA_LEDGER_BACKEND=redis)
",
        version = env!("CARGO_PKG_VERSION"),
        default_path = DEFAULT_CONFIG_PATH,
    );
}

/// `--config` wins over `AURA_CONFIG`, which wins over the default path.
fn resolve_config_path(flag: Option<PathBuf>, env: Option<String>) -> PathBuf {
    flag.or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();
    let config_path = resolve_config_path(cli.config_path, std::env::var("AURA_CONFIG").ok());

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting aura-gateway"
    );
    for (key, env_var) in config.env_overrides.all() {
        tracing::debug!(setting = %key, env = %env_var, "Setting overridden by environment");
    }

    // 4. Metrics
    let metrics = observability::install_prometheus()?;
    let events: Arc<dyn EventSink> = Arc::new(MetricsSink);

    // 5. Usage ledger (fails fast when the remote store is unreachable)
    let policy = config.budget.policy();
    let ledger = build_ledger(&config.ledger, policy).await?;
    tracing::info!(
        backend = ledger.backend(),
        spend_limit_micros = policy.spend_limit,
        cost_per_token_micros = policy.cost_per_token,
        "Usage ledger ready"
    );
    let gate = Arc::new(AdmissionGate::new(ledger));

    // 6. Usage dispatcher + background worker
    let (dispatcher, usage_rx) = UsageDispatcher::channel(config.dispatcher.capacity, events.clone());
    let worker = spawn_usage_worker(Arc::clone(&gate), usage_rx, events.clone());

    // 7. Upstream client
    let upstream = Upstream::from_config(&config.upstream)?;
    tracing::info!(url = %upstream.url(), "Upstream configured");

    // 8. Build shared application state and router
    let config = Arc::new(config);
    let state = AppState {
        config: Arc::clone(&config),
        gate,
        upstream,
        dispatcher,
        events,
        metrics: Some(metrics),
    };
    let app = build_app(state);

    // 9. Bind and serve
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    let grace = config.server.shutdown_timeout();
    let drained = serve(listener, app, shutdown_signal(), grace).await?;

    // 10. Cleanup
    // The worker exits once every dispatcher handle held by a response is gone.
    tracing::info!(drained, "Shutting down gracefully");
    let deadline = config.dispatcher.shutdown_timeout();
    if worker.shutdown(deadline).await {
        tracing::info!("Pending usage flushed");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Build the default log filter for a configured level.
fn default_filter(level: &str) -> String {
    format!("aura_gateway={level},tower_http={level},warn")
}

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.logging.level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
