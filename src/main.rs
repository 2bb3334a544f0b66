//! Long-Short Equity - Main Entry Point
//!
//! Runs the 130/30 momentum rebalancer against Alpaca (paper by default).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use long_short_equity::config::Config;
use long_short_equity::gateway::{AlpacaClient, BrokerGateway};
use long_short_equity::strategy::{
    LoopMetrics, LoopSettings, MarketClock, MeanReversionLoop, MeanReversionSettings,
    RebalanceLoop,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Long-Short Equity CLI
#[derive(Parser)]
#[command(name = "long-short-equity")]
#[command(version, about = "Momentum-ranked 130/30 long-short equity rebalancer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rebalance loop until Ctrl-C (default)
    Run {
        /// Trade against the live endpoint regardless of config
        #[arg(long)]
        live: bool,
    },

    /// Run the mean-reversion loop until Ctrl-C
    MeanReversion {
        /// Trade against the live endpoint regardless of config
        #[arg(long)]
        live: bool,
    },

    /// Rank and bucketize once without sending orders
    Rank,

    /// Show clock, account, positions and open orders
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run { live: false }) {
        Commands::Run { live } => {
            if live {
                config.alpaca.paper = false;
            }
            run_loop(&config).await
        }
        Commands::MeanReversion { live } => {
            if live {
                config.alpaca.paper = false;
            }
            run_mean_reversion(&config).await
        }
        Commands::Rank => run_rank(&config).await,
        Commands::Status => show_status(&config).await,
    }
}

/// Run sessions until a shutdown signal arrives.
async fn run_loop(config: &Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║         Long-Short Equity v{} - 130/30 Rebalancer          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let universe = config.universe().context("Failed to resolve symbol universe")?;
    log_config(config, &universe);
    let gateway = live_gateway(config)?;

    let mut rebalance_loop = RebalanceLoop::new(gateway, LoopSettings::from_config(config, universe));
    rebalance_loop.run(shutdown_on_ctrl_c()).await;

    log_metrics(rebalance_loop.metrics());
    Ok(())
}

/// Run the mean-reversion loop until a shutdown signal arrives.
async fn run_mean_reversion(config: &Config) -> Result<()> {
    info!(
        "🔁 Long-Short Equity v{} - Mean Reversion",
        env!("CARGO_PKG_VERSION")
    );

    let universe = config.universe().context("Failed to resolve symbol universe")?;
    info!("📋 Configuration:");
    info!("   Universe: {} symbols", universe.len());
    info!(
        "   Average: {} one-minute closes | Scale: {}",
        config.mean_reversion.average_bars, config.mean_reversion.portfolio_scale
    );
    let gateway = live_gateway(config)?;

    let mut reversion_loop =
        MeanReversionLoop::new(gateway, MeanReversionSettings::from_config(config, universe));
    reversion_loop.run(shutdown_on_ctrl_c()).await;

    log_metrics(reversion_loop.metrics());
    Ok(())
}

/// Build the Alpaca gateway, announcing which endpoint is in use.
fn live_gateway(config: &Config) -> Result<Arc<dyn BrokerGateway>> {
    if config.alpaca.paper {
        info!("📝 PAPER TRADING MODE");
    } else {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    }

    let client = AlpacaClient::new(&config.alpaca)?;
    if config.alpaca.api_key.is_empty() {
        warn!("⚠️  No API keys provided. Requests will be rejected.");
    }
    Ok(Arc::new(client))
}

/// Shutdown channel that flips to true on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_tx.send(true).ok();
    });
    shutdown_rx
}

fn log_metrics(metrics: &LoopMetrics) {
    info!("📊 Final metrics:");
    info!("   Sessions: {}", metrics.sessions);
    info!(
        "   Ticks: {} run, {} skipped, {} without clock",
        metrics.ticks_run, metrics.ticks_skipped, metrics.ticks_without_clock
    );
    info!("   Orders sent: {}", metrics.orders_sent);
    info!("   Compensations: {}", metrics.compensations);
    info!("   Liquidations: {}", metrics.liquidations);
}

/// One-off dry run: log buckets and target quantities.
async fn run_rank(config: &Config) -> Result<()> {
    let universe = config.universe().context("Failed to resolve symbol universe")?;
    let gateway: Arc<dyn BrokerGateway> = Arc::new(AlpacaClient::new(&config.alpaca)?);

    let mut rebalance_loop = RebalanceLoop::new(gateway, LoopSettings::from_config(config, universe));
    let buckets = rebalance_loop.preview().await;

    info!("📊 [RANK] Dry run, no orders sent");
    info!(
        "   Short ({} shares each, ${:.2}): {:?}",
        buckets.short.target_quantity_per_symbol,
        buckets.short.target_dollar_amount,
        buckets.short.symbols
    );
    info!(
        "   Long ({} shares each, ${:.2}): {:?}",
        buckets.long.target_quantity_per_symbol,
        buckets.long.target_dollar_amount,
        buckets.long.symbols
    );

    Ok(())
}

/// Log the broker's view of the account.
async fn show_status(config: &Config) -> Result<()> {
    let client = AlpacaClient::new(&config.alpaca)?;

    let clock = client.get_clock().await.context("Failed to fetch clock")?;
    info!(
        "🕐 Market {} | next open {} | next close {}",
        if clock.is_open { "OPEN" } else { "CLOSED" },
        clock.next_open,
        clock.next_close
    );
    if !clock.is_open {
        info!("⏳ Market opens in {} minutes", MarketClock::minutes_to_open(&clock));
    }

    let account = client.get_account().await.context("Failed to fetch account")?;
    info!(
        "💰 Equity: ${:.2} | Buying power: ${:.2}",
        account.equity, account.buying_power
    );

    match client.get_positions().await {
        Ok(positions) if positions.is_empty() => info!("📂 No open positions"),
        Ok(positions) => {
            info!("📂 {} open positions:", positions.len());
            for p in positions {
                info!(
                    "   {:<6} {:?} {} shares (${:.2})",
                    p.symbol, p.side, p.quantity, p.market_value
                );
            }
        }
        Err(e) => error!("❌ Failed to fetch positions: {}", e),
    }

    match client.get_open_orders().await {
        Ok(orders) => {
            info!("📋 {} open orders", orders.len());
            for o in orders {
                info!("   {} {} {} ({})", o.id, o.side, o.symbol, o.status);
            }
        }
        Err(e) => error!("❌ Failed to fetch open orders: {}", e),
    }

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "long-short-equity.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Keep the guard alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("long_short_equity=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, universe: &[String]) {
    info!("📋 Configuration:");
    info!("   Universe: {} symbols", universe.len());
    info!(
        "   Bucket fraction: {:.0}%",
        config.strategy.bucket_fraction * dec!(100)
    );
    info!(
        "   Short ratio: {:.0}% (long {:.0}%)",
        config.strategy.short_ratio * dec!(100),
        (dec!(1) + config.strategy.short_ratio) * dec!(100)
    );
    info!("   Lookback: {} one-minute bars", config.strategy.lookback_bars);
    info!(
        "   Tick: {}s | Pre-close window: {} min",
        config.schedule.tick_interval_secs, config.schedule.pre_close_minutes
    );
}
