// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE NODE - Matrix placement, layer rewards and balance ledger service
//
// Receives activation/upgrade events from the payment collaborator, serves
// member commands and views over REST, and runs the timer sweep on an
// interval.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::{Parser, Subcommand};
use hive_core::{HiveError, Wallet};
use hive_engine::{unix_now, HiveEngine};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod api;
mod config;
mod metrics;

use api::ApiState;
use config::NodeConfig;
use metrics::HiveMetrics;

#[derive(Parser)]
#[command(name = "hive-node")]
#[command(about = "Beehive matrix node - placement, rewards and balances", long_about = None)]
#[command(version)]
struct Cli {
    /// Node configuration file (TOML)
    #[arg(short, long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Override storage.path
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override api.listen
    #[arg(long)]
    listen: Option<String>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the REST API and run the periodic sweep (default)
    Run,
    /// Run one sweep pass at the current time and print the report
    Sweep,
    /// Print the effective configuration after file and env overrides
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<NodeConfig, HiveError> {
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(dir) = &cli.data_dir {
        config.storage.path = dir.clone();
    }
    if let Some(listen) = &cli.listen {
        config.api.listen = listen.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Open the store and make sure the network root exists.
fn open_engine(config: &NodeConfig) -> Result<HiveEngine, HiveError> {
    let engine = HiveEngine::open(&config.storage.path, config.engine.clone())?;
    match (&config.network.root_wallet, engine.store().network_root()?) {
        (Some(raw), _) => {
            let wallet = Wallet::parse(raw)?;
            engine.register_root(&wallet, config.network.root_level, unix_now())?;
        }
        (None, Some(root)) => info!("network root {}", root),
        (None, None) => warn!(
            "no network root registered; set network.root_wallet or HIVE_ROOT_WALLET before activations arrive"
        ),
    }
    info!(
        "store opened at {} members={}",
        config.storage.path.display(),
        engine.store().member_count()
    );
    Ok(engine)
}

/// Periodic sweep. A failed pass is logged and retried on the next tick.
async fn sweep_loop(engine: Arc<HiveEngine>, metrics: Arc<HiveMetrics>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let engine = engine.clone();
        let started = Instant::now();
        match tokio::task::spawn_blocking(move || engine.sweep(unix_now())).await {
            Ok(Ok(report)) => metrics.observe_sweep(&report, started.elapsed().as_secs_f64()),
            Ok(Err(e)) => error!("sweep pass failed: {}", e),
            Err(e) => error!("sweep worker panicked: {}", e),
        }
    }
}

async fn run(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.listen_addr()?;
    let engine = Arc::new(open_engine(&config)?);
    let metrics = HiveMetrics::new()?;

    tokio::spawn(sweep_loop(
        engine.clone(),
        metrics.clone(),
        config.sweep.interval_secs,
    ));

    let routes = api::routes(ApiState {
        engine: engine.clone(),
        metrics,
    });
    let (bound, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
        }
    });
    info!(
        "hive-node listening on http://{} (sweep every {}s)",
        bound, config.sweep.interval_secs
    );
    server.await;

    info!("shutting down, flushing store");
    engine.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Sweep => {
            let engine = open_engine(&config)?;
            let report = tokio::task::spawn_blocking(move || {
                let report = engine.sweep(unix_now());
                engine.flush().and(report)
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
