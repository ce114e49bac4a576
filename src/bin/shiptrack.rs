//! Shipment tracking CLI.
//!
//! Usage examples:
//!   Serve the HTTP API against a Chrome started with remote debugging:
//!     $ TRACKER_CDP_URL=http://localhost:9222 MODEL_API_KEY=... \
//!       cargo run --bin shiptrack -- serve --bind 0.0.0.0:5000 --cors
//!   Track one booking and print the JSON response:
//!     $ MODEL_API_KEY=... cargo run --bin shiptrack -- track SINI25432400 --carrier hmm

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use shiptrack_rs::config::{LoggerCallback, TrackerConfig, Verbosity};
use shiptrack_rs::server;
use shiptrack_rs::service::{TrackRequest, TrackingService};

#[derive(Parser)]
#[command(
    name = "shiptrack",
    author,
    version,
    about = "Milestone-driven shipment tracking"
)]
struct Cli {
    /// Increase log verbosity (pass multiple times for DEBUG).
    #[arg(long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve(ServeArgs),
    /// Track a single booking and print the result as JSON.
    Track(TrackArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to bind; defaults to TRACKER_BIND_ADDR or 0.0.0.0:5000.
    #[arg(long)]
    bind: Option<String>,

    /// Allow cross-origin requests from any origin.
    #[arg(long)]
    cors: bool,
}

#[derive(Args)]
struct TrackArgs {
    booking_id: String,

    /// Carrier code; defaults to TRACKER_DEFAULT_CARRIER or hmm.
    #[arg(long)]
    carrier: Option<String>,

    /// Ignore cached scripts and results.
    #[arg(long)]
    force_fresh: bool,

    /// Override the step budget.
    #[arg(long)]
    max_steps: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_env_logger(count_to_filter(cli.verbose));

    let mut config = TrackerConfig::from_env().context("invalid tracker configuration")?;
    if cli.verbose > 0 {
        config.verbose = verbosity_from_count(cli.verbose);
    }
    config.logger = Some(make_logger_callback());

    match cli.command {
        Command::Serve(args) => run_serve(config, args).await,
        Command::Track(args) => run_track(config, args).await,
    }
}

async fn run_serve(config: TrackerConfig, args: ServeArgs) -> Result<()> {
    let bind = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    let service =
        TrackingService::from_config(config).context("failed to construct tracking service")?;
    server::serve(Arc::new(service), &bind, args.cors).await
}

async fn run_track(mut config: TrackerConfig, args: TrackArgs) -> Result<()> {
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    let service =
        TrackingService::from_config(config).context("failed to construct tracking service")?;

    let mut request = TrackRequest::new(&args.booking_id).force_fresh(args.force_fresh);
    if let Some(carrier) = args.carrier {
        request = request.carrier(carrier);
    }
    info!("Tracking booking {}", args.booking_id);
    let response = service
        .track(request)
        .await
        .with_context(|| format!("tracking {} failed", args.booking_id))?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    info!(
        "Oracle usage: {}",
        serde_json::to_string(&service.metrics()).unwrap_or_default()
    );
    Ok(())
}

fn make_logger_callback() -> LoggerCallback {
    Arc::new(|line: &str| {
        log::debug!("{line}");
    })
}

fn verbosity_from_count(count: u8) -> Verbosity {
    match count {
        0 => Verbosity::Medium,
        _ => Verbosity::Detailed,
    }
}

fn count_to_filter(count: u8) -> log::LevelFilter {
    match count {
        0 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

fn init_env_logger(default: log::LevelFilter) {
    if env::var("RUST_LOG").is_err() {
        unsafe {
            env::set_var("RUST_LOG", default.as_str().to_ascii_lowercase());
        }
    }

    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp_secs()
        .try_init();
}
