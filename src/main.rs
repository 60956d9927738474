mod config;
mod error;
mod exchange;
mod indicator;
mod model;
mod monitor;
mod notifier;
mod retry;
mod rule;
mod signal;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, Secrets};
use exchange::Exchange;
use exchange::binance::BinanceExchange;
use model::TimeFrame;
use notifier::Notifier;
use notifier::telegram::TelegramNotifier;
use notifier::terminal::TerminalNotifier;
use rule::ThresholdRule;
use signal::BandSignal;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("exchange error")]
    Exchange,
    #[display("notifier error")]
    Notifier,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "price-alert-bot", about = "Crypto price alerts delivered to Telegram")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log alerts to the terminal instead of sending them to Telegram
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();

    // A missing .env file is fine; the variables may come from the shell.
    dotenvy::dotenv().ok();

    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let secrets = Secrets::from_env(!cli.dry_run).change_context(AppError::Config)?;

    // ── Exchange ──────────────────────────────────────────────────────────────
    let exchange: Arc<dyn Exchange> = Arc::new(
        BinanceExchange::new(&config.exchange, secrets.exchange.clone())
            .change_context(AppError::Exchange)?,
    );

    if config.exchange.verify_credentials {
        match exchange.verify_credentials().await {
            Ok(()) => info!(exchange = exchange.name(), "API credentials accepted"),
            Err(e) => {
                tracing::warn!(error = ?e, "credential check failed (continuing with public endpoints)");
            }
        }
    }

    // ── Notifier ──────────────────────────────────────────────────────────────
    let notifier = build_notifier(&config, &secrets, cli.dry_run)?;
    info!(notifier = notifier.name(), "notifier ready");

    // ── Monitors ──────────────────────────────────────────────────────────────
    let rules = ThresholdRule::from_config(&config);
    if rules.is_empty() && config.bands.is_empty() {
        tracing::warn!("no rules or bands configured; nothing to do");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();
    let interval = Duration::from_secs(config.monitor.poll_interval_secs);

    for (symbol, rules) in group_by_symbol(rules) {
        task_handles.push(tokio::spawn(monitor::run_threshold_monitor(
            Arc::clone(&exchange),
            symbol,
            rules,
            Arc::clone(&notifier),
            interval,
            cancel.clone(),
        )));
    }

    for band in &config.bands {
        let signal = BandSignal::from_config(band)
            .change_context(AppError::Config)
            .attach_with(|| format!("band: {}", band.name))?;
        let Some(timeframe) = TimeFrame::from_str(&band.timeframe) else {
            return Err(Report::new(AppError::Config)
                .attach(format!("band {}: unknown timeframe {}", band.name, band.timeframe)));
        };

        task_handles.push(tokio::spawn(monitor::run_band_monitor(
            Arc::clone(&exchange),
            signal,
            timeframe,
            band.historical_candles,
            Arc::clone(&notifier),
            cancel.clone(),
        )));
    }

    info!(
        tasks = task_handles.len(),
        dry_run = cli.dry_run,
        "monitoring started"
    );

    // ── Shutdown ──────────────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    cancel.cancel();

    for handle in task_handles {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            tracing::warn!("monitor task did not stop within 5s");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn build_notifier(
    config: &AppConfig,
    secrets: &Secrets,
    dry_run: bool,
) -> Result<Arc<dyn Notifier>, Report<AppError>> {
    if dry_run {
        return Ok(Arc::new(TerminalNotifier));
    }

    let Some(credentials) = secrets.telegram.clone() else {
        return Err(Report::new(AppError::Config).attach("telegram credentials are not set"));
    };
    let telegram =
        TelegramNotifier::new(&config.telegram, credentials).change_context(AppError::Notifier)?;
    Ok(Arc::new(telegram))
}

/// One polling task per instrument; each owns the state of its rules.
fn group_by_symbol(rules: Vec<ThresholdRule>) -> BTreeMap<String, Vec<ThresholdRule>> {
    let mut grouped: BTreeMap<String, Vec<ThresholdRule>> = BTreeMap::new();
    for rule in rules {
        grouped.entry(rule.symbol.clone()).or_default().push(rule);
    }
    grouped
}
