//! Entry point for `coap-telemetry`.
//!
//! Parses CLI arguments, connects the reporter and runs the periodic report
//! loop.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, signal handling, argument parsing) and the
//! schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use coap_telemetry::config::DEFAULT_PORT;
use coap_telemetry::sensor::SimulatedSensor;
use coap_telemetry::{Config, ExchangeOutcome, Reporter};

/// Periodically report simulated temperature and humidity over CoAP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// CoAP server host name or IP address.
    #[arg(short, long)]
    server: String,

    /// CoAP server UDP port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Device access token used in the telemetry path.
    #[arg(short, long)]
    device: String,

    /// How long to wait for each reply, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Seconds between the end of one report and the next.
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,

    /// Seconds to wait before the first report.
    #[arg(long, default_value_t = 5)]
    initial_delay_secs: u64,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            host: cli.server,
            port: cli.port,
            timeout: Duration::from_millis(cli.timeout_ms),
            device_id: cli.device,
            interval: Duration::from_secs(cli.interval_secs),
            initial_delay: Duration::from_secs(cli.initial_delay_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default `info` level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from(Cli::parse());
    log::info!("Starting up, reporting to {}:{}", config.host, config.port);

    // Name resolution blocks, so keep it off the async workers.
    let reporter = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Reporter::init(&config))
            .await?
            .context("failed to initialize the CoAP client")?
    };

    tokio::select! {
        _ = run(Arc::new(reporter), &config) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            log::info!("Shutting down");
        }
    }
    Ok(())
}

/// Report forever: one reading per cycle, `interval` after the previous
/// exchange finished.
async fn run(reporter: Arc<Reporter>, config: &Config) {
    let mut sensor = SimulatedSensor::new();
    tokio::time::sleep(config.initial_delay).await;

    loop {
        let reading = sensor.next_reading();
        let worker = Arc::clone(&reporter);
        match tokio::task::spawn_blocking(move || worker.report(&reading)).await {
            Ok(outcome) => log_outcome(&outcome),
            Err(e) => log::error!("report task failed: {e}"),
        }
        tokio::time::sleep(config.interval).await;
    }
}

fn log_outcome(outcome: &ExchangeOutcome) {
    if let Some(e) = outcome.error() {
        log::error!("Report failed: {e}");
    } else if outcome.is_success() {
        log::info!("Report {outcome}");
    } else {
        log::info!("Report timed out; next cycle will try again");
    }
}
