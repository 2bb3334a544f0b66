//! Configuration management for the long-short equity rebalancer.
//!
//! Loads settings from environment variables and config files, and resolves
//! the symbol universe from a JSON stock list.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Startup configuration problems that prevent the loop from running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("symbol universe is empty; add symbols to {0} or set strategy.symbols")]
    EmptyUniverse(String),
    #[error("failed to read universe file {path}: {reason}")]
    UniverseFile { path: String, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Alpaca API credentials and endpoints
    #[serde(default)]
    pub alpaca: AlpacaConfig,
    /// Ranking and sizing parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Loop cadence
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Parameters for the mean-reversion loop
    #[serde(default)]
    pub mean_reversion: MeanReversionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlpacaConfig {
    /// API key id
    #[serde(default)]
    pub api_key: String,
    /// API secret
    #[serde(default)]
    pub secret_key: String,
    /// Use the paper trading endpoint
    #[serde(default = "default_paper")]
    pub paper: bool,
    /// Override for the trading API base URL
    #[serde(default)]
    pub trading_url: Option<String>,
    /// Override for the market data API base URL
    #[serde(default)]
    pub data_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// JSON file of the form `{"stocks": ["AAPL", ...]}`
    #[serde(default = "default_universe_file")]
    pub universe_file: String,
    /// Inline universe; takes precedence over the file when non-empty
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Fraction of the ranked universe placed in each bucket (0.0-0.5]
    #[serde(default = "default_bucket_fraction")]
    pub bucket_fraction: Decimal,
    /// Number of one-minute bars used for the momentum score
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: u32,
    /// Short allocation as a fraction of equity (0.30 = 130/30)
    #[serde(default = "default_short_ratio")]
    pub short_ratio: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between rebalance ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Minutes before the close at which positions are liquidated
    #[serde(default = "default_pre_close_minutes")]
    pub pre_close_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanReversionConfig {
    /// Number of one-minute closes in the running average
    #[serde(default = "default_average_bars")]
    pub average_bars: u32,
    /// Portfolio share per unit of relative discount below the average
    #[serde(default = "default_portfolio_scale")]
    pub portfolio_scale: Decimal,
}

/// Shape of the universe file.
#[derive(Debug, Deserialize)]
struct UniverseFile {
    #[serde(default)]
    stocks: Vec<String>,
}

// Default value functions
fn default_paper() -> bool {
    true
}

fn default_universe_file() -> String {
    "stock_config.json".to_string()
}

fn default_bucket_fraction() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_lookback_bars() -> u32 {
    10
}

fn default_short_ratio() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_tick_interval() -> u64 {
    60
}

fn default_pre_close_minutes() -> u64 {
    15
}

fn default_average_bars() -> u32 {
    20
}

fn default_portfolio_scale() -> Decimal {
    Decimal::from(200)
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("LSE"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Fall back to the conventional Alpaca variables
        if config.alpaca.api_key.is_empty() {
            config.alpaca.api_key = std::env::var("APCA_API_KEY_ID").unwrap_or_default();
        }
        if config.alpaca.secret_key.is_empty() {
            config.alpaca.secret_key = std::env::var("APCA_API_SECRET_KEY").unwrap_or_default();
        }

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.strategy.bucket_fraction > Decimal::ZERO
                && self.strategy.bucket_fraction <= Decimal::new(5, 1),
            "bucket_fraction must be in (0, 0.5] so long and short buckets cannot overlap"
        );

        anyhow::ensure!(
            self.strategy.lookback_bars >= 1,
            "lookback_bars must be at least 1"
        );

        anyhow::ensure!(
            self.strategy.short_ratio >= Decimal::ZERO && self.strategy.short_ratio <= Decimal::ONE,
            "short_ratio must be between 0 and 1"
        );

        anyhow::ensure!(
            self.schedule.tick_interval_secs >= 1,
            "tick_interval_secs must be at least 1"
        );

        anyhow::ensure!(
            self.mean_reversion.average_bars >= 2,
            "mean_reversion.average_bars must be at least 2"
        );

        anyhow::ensure!(
            self.mean_reversion.portfolio_scale > Decimal::ZERO,
            "mean_reversion.portfolio_scale must be positive"
        );

        Ok(())
    }

    /// Resolve the trading universe: inline symbols first, then the file.
    ///
    /// Symbols are uppercased and de-duplicated, keeping first occurrence.
    pub fn universe(&self) -> Result<Vec<String>, ConfigError> {
        let raw = if self.strategy.symbols.is_empty() {
            load_universe_file(&self.strategy.universe_file)?
        } else {
            self.strategy.symbols.clone()
        };

        let mut seen = HashSet::new();
        let symbols: Vec<String> = raw
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();

        if symbols.is_empty() {
            return Err(ConfigError::EmptyUniverse(self.strategy.universe_file.clone()));
        }
        Ok(symbols)
    }
}

fn load_universe_file(path: &str) -> Result<Vec<String>, ConfigError> {
    let to_err = |reason: String| ConfigError::UniverseFile {
        path: path.to_string(),
        reason,
    };

    let contents = std::fs::read_to_string(Path::new(path)).map_err(|e| to_err(e.to_string()))?;
    let file: UniverseFile = serde_json::from_str(&contents).map_err(|e| to_err(e.to_string()))?;
    Ok(file.stocks)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpaca: AlpacaConfig::default(),
            strategy: StrategyConfig::default(),
            schedule: ScheduleConfig::default(),
            mean_reversion: MeanReversionConfig::default(),
        }
    }
}

impl Default for AlpacaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            paper: default_paper(),
            trading_url: None,
            data_url: None,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            universe_file: default_universe_file(),
            symbols: Vec::new(),
            bucket_fraction: default_bucket_fraction(),
            lookback_bars: default_lookback_bars(),
            short_ratio: default_short_ratio(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            pre_close_minutes: default_pre_close_minutes(),
        }
    }
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            average_bars: default_average_bars(),
            portfolio_scale: default_portfolio_scale(),
        }
    }
}
