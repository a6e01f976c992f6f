//! Laneway CLI
//!
//! Inspect lane-set configurations and watch lanes run a short workload.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{eyre, WrapErr};
use laneway_core::LaneSetConfig;
use laneway_runtime::{DelayableExecutorExt, ExecutorExt, LaneRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "laneway")]
#[command(about = "Laneway - named single-threaded execution lanes", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a lane-set config and show how names resolve
    Check {
        /// Path to config file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the built-in interactive profile as JSON
    Defaults {
        /// Give notification inflation its own worker
        #[arg(long)]
        dedicated_inflation: bool,
    },
    /// Start lanes and run a demonstration workload
    Demo {
        /// Path to config file; the built-in profile is used if omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to let the workload run
        #[arg(long, default_value_t = 1500)]
        duration_ms: u64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(config: Option<PathBuf>) -> Result<LaneSetConfig> {
    match config {
        Some(path) => LaneSetConfig::from_path(&path)
            .wrap_err_with(|| format!("loading {}", path.display())),
        None => Ok(LaneSetConfig::interactive_defaults(false)),
    }
}

fn check(config: PathBuf) -> Result<()> {
    let config = load(Some(config))?;
    for lane in &config.lanes {
        let resolved = config.resolve(&lane.name)?;
        if resolved == lane.name {
            println!(
                "{:<20} dispatch={}ms delivery={}ms",
                lane.name, lane.thresholds.dispatch_ms, lane.thresholds.delivery_ms
            );
        } else {
            println!("{:<20} -> {}", lane.name, resolved);
        }
    }
    Ok(())
}

fn demo(config: Option<PathBuf>, duration_ms: u64) -> Result<()> {
    let config = load(config)?;
    let registry = LaneRegistry::start_default(config)?;
    let first = registry
        .names()
        .next()
        .ok_or_else(|| eyre!("config has no lanes"))?
        .to_string();
    let last = registry.names().last().unwrap_or(&first).to_string();

    let ticks = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&ticks);
    let series = registry.repeatable(&last)?.execute_repeatedly_labeled(
        "tick",
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
        },
        Duration::from_millis(100),
        true,
    )?;

    let router = registry.router(&first)?;
    router.subscribe(|level: &u8| tracing::info!(level, "brightness changed"));
    for level in [10_u8, 40, 90] {
        router.send(level);
    }

    let worker = registry.lane(&first)?;
    worker.execute_labeled("hog", || std::thread::sleep(Duration::from_millis(1200)));
    worker.execute_labeled("starved", || {});
    worker.execute_fallible("parse-settings", || Err::<(), _>("settings file is corrupt"));
    worker.execute_delayed_labeled("late-hello", || tracing::info!("hello later"), Duration::from_millis(300))?;

    std::thread::sleep(Duration::from_millis(duration_ms));
    series.cancel();

    tracing::info!(ticks = ticks.load(Ordering::Relaxed), "demo finished");
    println!("{}", serde_json::to_string_pretty(&registry.metrics())?);
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Check { config } => check(config),
        Commands::Defaults { dedicated_inflation } => {
            let config = LaneSetConfig::interactive_defaults(dedicated_inflation);
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
        Commands::Demo {
            config,
            duration_ms,
        } => demo(config, duration_ms),
    }
}
