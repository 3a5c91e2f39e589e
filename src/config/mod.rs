//! Configuration for the arbitrage engine.
//!
//! Everything is loaded from environment variables with validated defaults,
//! so the binary boots from a plain `.env` file.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Leverage settings for one venue: a default plus per-symbol overrides.
#[derive(Debug, Clone)]
pub struct LeverageConfig {
    pub default: u32,
    pub overrides: HashMap<String, u32>,
}

impl LeverageConfig {
    pub fn leverage_for(&self, symbol: &str) -> u32 {
        self.overrides.get(symbol).copied().unwrap_or(self.default)
    }
}

impl Default for LeverageConfig {
    fn default() -> Self {
        Self {
            default: 5,
            overrides: HashMap::new(),
        }
    }
}

/// Trading strategy parameters.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Base daily-spread threshold at zero size.
    pub min_daily_spread_base: Decimal,
    /// Threshold increment per $10k of position size.
    pub min_daily_spread_per_10k: Decimal,
    /// Opportunities closer to funding than this are discarded.
    pub min_seconds_to_funding: i64,
    /// Entries require at least this many minutes before the next funding.
    pub entry_buffer_minutes: i64,
    /// How long a limit leg may sit unfilled before it is cancelled.
    pub order_fill_timeout_seconds: u64,
    pub max_position_per_pair_usd: Decimal,
    /// Signed daily-spread bound below which an open position is flagged.
    pub negative_spread_tolerance: Decimal,
    /// Fallback taker fee when a venue has no entry in the fee table.
    pub default_taker_fee: Decimal,
    pub poll_interval_secs: u64,
    /// Leverage per venue, keyed by venue name.
    pub leverage: HashMap<String, LeverageConfig>,
}

impl TradingConfig {
    /// `base + per_10k × size / 10_000` — non-decreasing in size.
    pub fn spread_threshold(&self, position_size_usd: Decimal) -> Decimal {
        self.min_daily_spread_base
            + self.min_daily_spread_per_10k * (position_size_usd / Decimal::from(10_000))
    }

    pub fn leverage_for(&self, exchange: &str, symbol: &str) -> u32 {
        self.leverage
            .get(exchange)
            .map(|cfg| cfg.leverage_for(symbol))
            .unwrap_or(5)
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_daily_spread_base: dec!(0.0001),
            min_daily_spread_per_10k: dec!(0.00001),
            min_seconds_to_funding: 60,
            entry_buffer_minutes: 20,
            order_fill_timeout_seconds: 30,
            max_position_per_pair_usd: Decimal::from(50_000),
            negative_spread_tolerance: dec!(-0.0001),
            default_taker_fee: dec!(0.0004),
            poll_interval_secs: 30,
            leverage: HashMap::new(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Venue names to wire up (mock venues in simulation mode).
    pub exchanges: Vec<String>,
    /// Symbols to monitor, `BASE/QUOTE:SETTLE` format.
    pub symbols: Vec<String>,
    pub database_url: String,
    pub simulation_mode: bool,
    pub trading: TradingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let symbols = parse_list(
            &env_or("SYMBOLS", "BTC/USDT:USDT,ETH/USDT:USDT"),
        );
        for symbol in &symbols {
            if !symbol.contains('/') {
                anyhow::bail!(
                    "Invalid symbol format: {}. Expected format: BTC/USDT:USDT",
                    symbol
                );
            }
        }

        let exchanges = parse_list(&env_or("EXCHANGES", "alpha,beta"));
        if exchanges.len() < 2 {
            anyhow::bail!("At least two exchanges are required, got {:?}", exchanges);
        }

        let defaults = TradingConfig::default();
        let trading = TradingConfig {
            min_daily_spread_base: env_decimal(
                "MIN_DAILY_SPREAD_BASE",
                defaults.min_daily_spread_base,
            )?,
            min_daily_spread_per_10k: env_decimal(
                "MIN_DAILY_SPREAD_PER_10K",
                defaults.min_daily_spread_per_10k,
            )?,
            min_seconds_to_funding: env_parse(
                "MIN_SECONDS_TO_FUNDING",
                defaults.min_seconds_to_funding,
            )?,
            entry_buffer_minutes: env_parse("ENTRY_BUFFER_MINUTES", defaults.entry_buffer_minutes)?,
            order_fill_timeout_seconds: env_parse(
                "ORDER_FILL_TIMEOUT_SECONDS",
                defaults.order_fill_timeout_seconds,
            )?,
            max_position_per_pair_usd: env_decimal(
                "MAX_POSITION_PER_PAIR_USD",
                defaults.max_position_per_pair_usd,
            )?,
            negative_spread_tolerance: env_decimal(
                "NEGATIVE_SPREAD_TOLERANCE",
                defaults.negative_spread_tolerance,
            )?,
            default_taker_fee: env_decimal("DEFAULT_TAKER_FEE", defaults.default_taker_fee)?,
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            leverage: parse_leverage(&exchanges)?,
        };

        Ok(Self {
            exchanges,
            symbols,
            database_url: env_or("DATABASE_URL", "sqlite://data/perparb.db"),
            simulation_mode: env_parse("SIMULATION_MODE", true)?,
            trading,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match env::var(key) {
        Ok(raw) => Decimal::from_str(&raw).with_context(|| format!("Invalid {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Per-venue leverage comes from `LEVERAGE_<VENUE>` variables, e.g.
/// `LEVERAGE_ALPHA=5`.
fn parse_leverage(exchanges: &[String]) -> Result<HashMap<String, LeverageConfig>> {
    let mut leverage = HashMap::new();
    for exchange in exchanges {
        let key = format!("LEVERAGE_{}", exchange.to_uppercase());
        let default = env_parse(&key, 5u32)?;
        leverage.insert(
            exchange.clone(),
            LeverageConfig {
                default,
                overrides: HashMap::new(),
            },
        );
    }
    Ok(leverage)
}
