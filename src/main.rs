use clap::Parser;
use sockpool::config::Config;
use sockpool::{ConnectionPool, PooledSocket, Reactor, Result, SockPoolError, SocketConnector};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sockpool")]
#[command(about = "Check connections out of a socket pool and report reuse", long_about = None)]
#[command(version)]
struct Args {
    /// Destination, e.g. tcp://example.com:80 or unix:///run/app.sock
    destination: Option<String>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of checkout/checkin rounds
    #[arg(long, default_value_t = 3)]
    rounds: usize,

    /// Pause between rounds in milliseconds
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Idle timeout in milliseconds (overrides config)
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(idle_timeout_ms) = args.idle_timeout_ms {
        config.pool.idle_timeout_ms = idle_timeout_ms;
    }

    init_logging(&config.logging.level, &config.logging.format)?;

    let destination = args.destination.ok_or_else(|| {
        SockPoolError::Config("a destination is required, e.g. tcp://127.0.0.1:8080".to_string())
    })?;

    info!("sockpool v{} starting", env!("CARGO_PKG_VERSION"));

    let reactor = Reactor::new();
    let pool = ConnectionPool::new(SocketConnector, reactor.clone(), config.pool.clone());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling...");
            ctrl_c.cancel();
        }
    });

    for round in 1..=args.rounds {
        let socket = match pool.checkout(&destination, Some(&cancel)).await {
            Ok(socket) => socket,
            Err(SockPoolError::Cancelled) => {
                warn!("Checkout cancelled in round {}", round);
                break;
            }
            Err(e) => {
                error!("Checkout failed in round {}: {}", round, e);
                return Err(e);
            }
        };

        let stats = pool.stats();
        info!(
            "Round {}: connection {} ({} opened so far)",
            round,
            socket.id(),
            stats.opened
        );

        pool.checkin(socket)?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(args.interval_ms)) => {}
            _ = cancel.cancelled() => break,
        }
    }

    let stats = pool.stats();
    info!(
        "Done: {} rounds served by {} connection(s), {} idle",
        args.rounds, stats.opened, stats.idle
    );

    // Idle timers are unreferenced, so nothing here keeps us waiting.
    reactor.wait_unreferenced().await;

    Ok(())
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| SockPoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
