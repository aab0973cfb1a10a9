use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, StoreBackend, TollgateConfig};
use tollgate::grpc::{GrpcServer, LeaseTable};
use tollgate::ratelimit::{AdmissionGate, Clock, CounterStore, MemoryCounterStore, SystemClock};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Admission control and rate limiting sidecar")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gRPC admission service (default)
    Serve,
    /// Delete every counter held by an identity, e.g. `user:42` or `203.0.113.7`
    Reset { identity: String },
    /// Print the counters held by an identity as JSON
    Inspect { identity: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    init_tracing(&config.logging);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (store, memory) = open_store(&config, clock.clone()).await?;
    let gate = Arc::new(AdmissionGate::from_config(&config, store, clock)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, cli.config, gate, memory).await,
        Command::Reset { identity } => {
            warn_if_local(&config);
            if !gate.reset_key(&identity).await {
                anyhow::bail!("failed to reset counters for {}", identity);
            }
            println!("reset {}", identity);
            Ok(())
        }
        Command::Inspect { identity } => {
            warn_if_local(&config);
            let counters = gate.inspect_key(&identity).await?;
            let report: serde_json::Map<String, serde_json::Value> = counters
                .into_iter()
                .map(|(namespace, value)| {
                    (
                        namespace,
                        serde_json::json!({
                            "count": value.count,
                            "ttl_ms": value.ttl.as_millis() as u64,
                        }),
                    )
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn open_store(
    config: &TollgateConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(Arc<dyn CounterStore>, Option<Arc<MemoryCounterStore>>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::with_clock(clock));
            Ok((store.clone(), Some(store)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config.store.url.as_deref().unwrap_or_default();
            let store =
                tollgate::ratelimit::RedisCounterStore::connect(url, config.store.key_prefix.clone())
                    .await
                    .context("failed to connect to Redis")?;
            Ok((Arc::new(store), None))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => anyhow::bail!("redis support was not compiled in"),
    }
}

fn warn_if_local(config: &TollgateConfig) {
    if config.store.backend == StoreBackend::Memory {
        warn!("Memory store is local to this process; admin commands only see its own counters");
    }
}

async fn serve(
    config: TollgateConfig,
    config_path: Option<PathBuf>,
    gate: Arc<AdmissionGate>,
    memory: Option<Arc<MemoryCounterStore>>,
) -> anyhow::Result<()> {
    info!("Starting Tollgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        failure_mode = ?config.store.failure_mode,
        rules = config.rules.len(),
        "Configuration loaded"
    );

    let leases = Arc::new(LeaseTable::new(config.lease_ttl()));
    let mut tasks = vec![leases.spawn_reaper(config.lease_reap_interval())];
    if let Some(memory) = memory {
        tasks.push(spawn_purger(
            memory,
            Duration::from_millis(config.store.purge_interval_ms),
        ));
    }
    #[cfg(unix)]
    tasks.push(spawn_reloader(gate.clone(), config_path));
    #[cfg(not(unix))]
    let _ = config_path;

    let grpc_server = GrpcServer::new(config.server.grpc_addr, gate, leases);
    let result = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    for task in tasks {
        task.abort();
    }
    result?;

    info!("Tollgate admission service stopped");
    Ok(())
}

fn spawn_purger(store: Arc<MemoryCounterStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged = purged, live = store.len(), "Purged expired counters");
            }
        }
    })
}

/// Re-read configuration on SIGHUP. A reload that fails validation keeps the
/// running configuration.
#[cfg(unix)]
fn spawn_reloader(gate: Arc<AdmissionGate>, config_path: Option<PathBuf>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler; reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading configuration");
            let reloaded = TollgateConfig::load(config_path.as_deref())
                .and_then(|config| gate.reload_from(&config));
            match reloaded {
                Ok(()) => info!("Configuration reloaded"),
                Err(e) => error!(error = %e, "Reload rejected, keeping previous configuration"),
            }
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
