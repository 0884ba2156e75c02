//! Trendstack
//!
//! EMA crossover trend engine with staged (pyramided) entries, risk-based
//! position sizing and multi-rule exits, driven by a JSON-lines market feed
//! against a paper broker.

mod api;
mod engine;
mod feed;
mod indicators;
mod metrics;
mod models;
mod retry;
mod trading;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::BufReader;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{PaperBroker, PositionLedger};
use crate::engine::Engine;
use crate::feed::{run_feed, session_report};
use crate::indicators::FeedIndicators;
use crate::models::Timeframe;
use crate::trading::{EngineConfig, RiskSizer};

/// Trend engine CLI.
#[derive(Parser)]
#[command(name = "trendstack")]
#[command(about = "EMA/MACD trend engine with staged entries and risk-based exits", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON configuration file (defaults apply to missing fields)
    #[arg(short, long, env = "TRENDSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Symbol override
    #[arg(long, env = "TRENDSTACK_SYMBOL")]
    symbol: Option<String>,

    /// Timeframe override (M1, M5, M15, M30, H1, H4, D1)
    #[arg(long, env = "TRENDSTACK_TIMEFRAME")]
    timeframe: Option<String>,

    /// Position tag override
    #[arg(long, env = "TRENDSTACK_TAG")]
    tag: Option<String>,

    /// Base risk per tranche in percent of balance
    #[arg(long, env = "TRENDSTACK_RISK_PCT")]
    risk_pct: Option<Decimal>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the engine from a JSON-lines feed with the paper broker
    Run {
        /// Feed file (reads stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Starting paper balance in account currency
        #[arg(short, long, default_value = "10000")]
        balance: Decimal,
    },

    /// Show the effective configuration
    Config,

    /// One-off tranche size calculation
    Size {
        /// Account balance
        #[arg(short, long)]
        balance: Decimal,

        /// Stop distance in price units
        #[arg(short, long)]
        stop_distance: f64,

        /// Calendar month 1-12 (defaults to the current month)
        #[arg(short, long)]
        month: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { input, balance } => {
            info!(
                symbol = %config.symbol,
                timeframe = %config.timeframe,
                tag = %config.tag,
                balance = %balance,
                "Starting engine"
            );
            let p = &config.periods;
            info!(
                ema = %format!("{}/{}/{}", p.ema_fast, p.ema_mid, p.ema_slow),
                macd = %format!("{}/{}/{}", p.macd_fast, p.macd_slow, p.macd_signal),
                atr = p.atr,
                "Expected indicator periods"
            );

            println!("\n=== Trendstack ===");
            println!("Symbol:     {} {}", config.symbol, config.timeframe);
            println!("Tag:        {}", config.tag);
            println!("Balance:    {}", balance);
            println!("Risk:       {}% per tranche", config.risk.base_risk_pct);
            println!(
                "Feed:       {}",
                input.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "stdin".to_string())
            );
            println!("\nPaper broker only. Press Ctrl+C to stop.\n");

            let tag = config.tag.clone();
            let broker = PaperBroker::new(config.instrument.clone(), balance);
            let mut engine = Engine::new(config, FeedIndicators::new(), broker);

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Ctrl-C handler unavailable");
                    std::future::pending::<()>().await;
                }
            };

            let summary = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open feed {}", path.display()))?;
                    run_feed(&mut engine, BufReader::new(file), shutdown).await?
                }
                None => run_feed(&mut engine, BufReader::new(tokio::io::stdin()), shutdown).await?,
            };

            if summary.malformed > 0 {
                println!("Skipped {} malformed feed lines", summary.malformed);
            }
            println!("{}", session_report(&engine));

            let open = engine.broker().open_positions(&tag)?;
            if !open.is_empty() {
                println!("--- Open Positions ({}) ---", open.len());
                for pos in &open {
                    println!(
                        "  {} {} {} @ {:.5} SL {}",
                        pos.ticket,
                        pos.direction,
                        pos.volume,
                        pos.open_price,
                        pos.stop_loss.map(|s| format!("{:.5}", s)).unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Size {
            balance,
            stop_distance,
            month,
        } => {
            let month = month.unwrap_or_else(|| Utc::now().month());
            if !(1..=12).contains(&month) {
                return Err(anyhow!("Month must be 1-12, got {}", month));
            }

            let sizer = RiskSizer::new(config.risk.clone(), config.instrument.clone());
            let b = sizer.breakdown(balance, stop_distance, month);

            println!("\n=== Tranche Size ===");
            println!("Balance:        {}", balance);
            println!("Stop Distance:  {}", stop_distance);
            println!("Month:          {}", month);
            println!("Risk:           {}%", b.effective_risk_pct);
            println!("Risk Amount:    {:.2}", b.risk_amount);
            println!("Unit Value:     {}", b.unit_value);
            println!("Raw Size:       {:.4}", b.raw_size);
            println!("Volume:         {} lots", b.size);
            if b.size.is_zero() {
                println!("\nSize is zero: no order would be placed.");
            }
        }
    }

    Ok(())
}

/// Defaults, then the optional JSON file, then CLI/environment overrides.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(symbol) = &cli.symbol {
        config.symbol = symbol.clone();
    }
    if let Some(tf) = &cli.timeframe {
        config.timeframe =
            Timeframe::from_str(tf).ok_or_else(|| anyhow!("Unknown timeframe: {}", tf))?;
    }
    if let Some(tag) = &cli.tag {
        config.tag = tag.clone();
    }
    if let Some(risk) = cli.risk_pct {
        config.risk.base_risk_pct = risk;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
