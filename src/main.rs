// liquidity-monitor entry point
// Exit codes: 0 normal shutdown, 1 configuration error, 2 persistent
// external failure, 130 interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use liquidity_monitor::core::config::MonitorConfig;
use liquidity_monitor::core::logger::setup_logging;
use liquidity_monitor::pipeline::{
    spawn_symbol_pipeline, supervise, HealthState, RunOutcome,
};
use liquidity_monitor::sink::{
    connect_pool, health_check, EventSink, LogEventSink, LogSnapshotSink, PgEventSink,
    PgSnapshotSink, SnapshotSink,
};
use liquidity_monitor::transport::{RestSnapshotFetcher, WsFrameSource};

#[derive(Debug, Parser)]
#[command(
    name = "liquidity-monitor",
    about = "Real-time liquidity risk detection for cryptocurrency futures"
)]
struct Cli {
    /// Trading pair to monitor (repeatable)
    #[arg(short, long = "symbol")]
    symbol: Vec<String>,

    /// Path to a JSON configuration file
    #[arg(short, long = "config")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    json_logs: bool,

    /// Disable PostgreSQL persistence (log output only)
    #[arg(long)]
    no_database: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => match MonitorConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to load configuration");
                return 1;
            }
        },
        None => MonitorConfig::default(),
    };

    if !cli.symbol.is_empty() {
        config.symbols = cli.symbol.iter().map(|s| s.to_uppercase()).collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".to_string()];
    }
    if cli.no_database {
        config.database.enabled = false;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return 1;
    }

    // Secrets come from the environment only; fail fast before connecting
    let pool = if config.database.enabled {
        let password = match config.db_password() {
            Ok(password) => password,
            Err(e) => {
                error!(error = %e, "Database is enabled but no credentials are available");
                return 1;
            }
        };
        match connect_pool(&config.database, &password).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "Database unreachable, continuing without persistence");
                None
            }
        }
    } else {
        None
    };

    info!(
        symbols = ?config.symbols,
        exchange = %config.exchange.name,
        database = pool.is_some(),
        "Starting liquidity monitor"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = Arc::new(HealthState::default());

    let mut pipelines = Vec::with_capacity(config.symbols.len());
    for symbol in config.symbols.clone() {
        let source = WsFrameSource::new(&symbol, &config.exchange);
        let fetcher = RestSnapshotFetcher::new(&config.exchange);

        let (snapshot_sink, event_sink): (Box<dyn SnapshotSink>, Box<dyn EventSink>) =
            match &pool {
                Some(pool) => (
                    Box::new(PgSnapshotSink::new(
                        pool.clone(),
                        config.database.batch_size,
                    )),
                    Box::new(PgEventSink::new(pool.clone())),
                ),
                None => (
                    Box::new(LogSnapshotSink),
                    Box::new(LogEventSink),
                ),
            };

        pipelines.push(spawn_symbol_pipeline(
            &config,
            &symbol,
            source,
            fetcher,
            snapshot_sink,
            event_sink,
            shutdown_rx.clone(),
            health.clone(),
        ));
    }

    // Periodic sink probe: a dead database degrades health until the
    // supervisor's terminal deadline expires
    if let Some(pool) = pool.clone() {
        let health = health.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !health_check(&pool).await {
                            health.set_degraded("database unreachable");
                        }
                    }
                }
            }
        });
    }

    let supervisor = tokio::spawn(supervise(health, shutdown_rx));

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            RunOutcome::Interrupted
        }
        _ = wait_sigterm() => {
            info!("Termination requested, shutting down");
            RunOutcome::Finished
        }
        result = supervisor => result.unwrap_or(RunOutcome::Failed),
    };

    let _ = shutdown_tx.send(true);
    for pipeline in pipelines {
        pipeline.join().await;
    }

    info!(outcome = ?outcome, "Liquidity monitor stopped");

    match outcome {
        RunOutcome::Finished => 0,
        RunOutcome::Failed => 2,
        RunOutcome::Interrupted => 130,
    }
}

#[cfg(unix)]
async fn wait_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => futures::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_sigterm() {
    futures::future::pending::<()>().await;
}
