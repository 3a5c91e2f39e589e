//! Opportunity detection over funding-rate snapshots.
//!
//! Venues are compared on daily-normalized rates so that a 1 h-interval
//! venue and an 8 h-interval venue are judged on equal footing. The long
//! leg goes on the venue with the lowest daily rate, the short leg on the
//! highest.

use crate::application::scanner::RateSnapshot;
use crate::config::TradingConfig;
use crate::domain::types::{FeeTier, FundingRate};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock;

/// Nominal holding period that entry+exit fees are amortized over.
const FEE_AMORTIZATION_DAYS: i64 = 7;

/// A detected cross-venue funding spread worth funding a hedge.
///
/// Carries both the raw per-interval rates and their daily normalizations;
/// broadcasts and storage rely on both forms.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub long_exchange: String,
    pub short_exchange: String,
    pub long_interval_hours: u32,
    pub short_interval_hours: u32,
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    pub long_daily_rate: Decimal,
    pub short_daily_rate: Decimal,
    /// `short_rate − long_rate`, per funding interval.
    pub spread: Decimal,
    /// `short_daily_rate − long_daily_rate`; positive for any surfaced
    /// opportunity.
    pub daily_spread: Decimal,
    /// Net of amortized round-trip fees.
    pub expected_daily_profit: Decimal,
    pub annualized_apr: Decimal,
    /// Earlier of the two legs' next funding instants.
    pub next_funding_time: DateTime<Utc>,
    pub seconds_to_funding: i64,
    pub detected_at: DateTime<Utc>,
}

/// Verdict on whether an open position's spread still carries it.
#[derive(Debug, Clone)]
pub struct PositionEvaluation {
    pub keep: bool,
    pub current_daily_spread: Decimal,
    pub reason: String,
}

pub struct SpreadDetector {
    config: Arc<TradingConfig>,
    fee_tiers: HashMap<String, FeeTier>,
    last_opportunities: RwLock<Vec<Opportunity>>,
}

impl SpreadDetector {
    pub fn new(config: Arc<TradingConfig>) -> Self {
        Self::with_fee_tiers(config, HashMap::new())
    }

    pub fn with_fee_tiers(config: Arc<TradingConfig>, fee_tiers: HashMap<String, FeeTier>) -> Self {
        Self {
            config,
            fee_tiers,
            last_opportunities: RwLock::new(Vec::new()),
        }
    }

    /// Minimum daily spread for a position of the given size.
    pub fn spread_threshold(&self, position_size_usd: Decimal) -> Decimal {
        self.config.spread_threshold(position_size_usd)
    }

    /// Taker fees for opening and closing both legs.
    pub fn round_trip_fees(
        &self,
        position_size_usd: Decimal,
        long_exchange: &str,
        short_exchange: &str,
    ) -> Decimal {
        let mut total = Decimal::ZERO;
        for exchange in [long_exchange, short_exchange] {
            let fee_rate = self
                .fee_tiers
                .get(exchange)
                .map(|t| t.taker_fee)
                .unwrap_or(self.config.default_taker_fee);
            // Entry and exit on each leg.
            total += position_size_usd * fee_rate * Decimal::from(2);
        }
        total
    }

    /// Build the full opportunity record for a long/short rate pairing.
    /// Applies no admission gates; callers gate as needed.
    pub fn synthesize(
        &self,
        symbol: &str,
        long: &FundingRate,
        short: &FundingRate,
        position_size_usd: Decimal,
        now: DateTime<Utc>,
    ) -> Opportunity {
        let long_daily = long.daily_rate();
        let short_daily = short.daily_rate();
        let daily_spread = short_daily - long_daily;

        let fees =
            self.round_trip_fees(position_size_usd, &long.exchange, &short.exchange);
        let net_daily = position_size_usd * daily_spread
            - fees / Decimal::from(FEE_AMORTIZATION_DAYS);
        let annualized_apr = if position_size_usd.is_zero() {
            Decimal::ZERO
        } else {
            (net_daily / position_size_usd) * Decimal::from(365) * Decimal::from(100)
        };

        let next_funding_time = long.next_funding_time.min(short.next_funding_time);

        Opportunity {
            symbol: symbol.to_string(),
            long_exchange: long.exchange.clone(),
            short_exchange: short.exchange.clone(),
            long_interval_hours: long.interval_hours,
            short_interval_hours: short.interval_hours,
            long_rate: long.rate,
            short_rate: short.rate,
            long_daily_rate: long_daily,
            short_daily_rate: short_daily,
            spread: short.rate - long.rate,
            daily_spread,
            expected_daily_profit: net_daily,
            annualized_apr,
            next_funding_time,
            seconds_to_funding: (next_funding_time - now).num_seconds(),
            detected_at: now,
        }
    }

    /// All opportunities above threshold, sorted by daily spread descending.
    pub fn find_opportunities(
        &self,
        rates: &RateSnapshot,
        position_size_usd: Decimal,
    ) -> Vec<Opportunity> {
        let threshold = self.spread_threshold(position_size_usd);
        let now = Utc::now();
        let mut opportunities = Vec::new();

        let mut symbols: HashSet<&String> = HashSet::new();
        for venue_rates in rates.values() {
            symbols.extend(venue_rates.keys());
        }

        for symbol in symbols {
            let mut venue_rates: Vec<(&String, &FundingRate)> = rates
                .iter()
                .filter_map(|(exchange, by_symbol)| {
                    by_symbol.get(symbol).map(|r| (exchange, r))
                })
                .collect();

            if venue_rates.len() < 2 {
                continue;
            }

            // Lowest daily rate first; venue name breaks ties so the choice
            // is deterministic across runs.
            venue_rates.sort_by(|a, b| {
                a.1.daily_rate()
                    .cmp(&b.1.daily_rate())
                    .then_with(|| a.0.cmp(b.0))
            });

            let (_, long) = venue_rates[0];
            let (_, short) = venue_rates[venue_rates.len() - 1];

            let opportunity = self.synthesize(symbol, long, short, position_size_usd, now);

            if opportunity.daily_spread < threshold {
                continue;
            }
            if opportunity.seconds_to_funding < self.config.min_seconds_to_funding {
                continue;
            }
            if opportunity.expected_daily_profit <= Decimal::ZERO {
                continue;
            }

            opportunities.push(opportunity);
        }

        opportunities.sort_by(|a, b| b.daily_spread.cmp(&a.daily_spread));

        *self.last_opportunities.write().unwrap() = opportunities.clone();
        opportunities
    }

    /// Best opportunity whose symbol is not excluded.
    pub fn find_best_opportunity(
        &self,
        rates: &RateSnapshot,
        position_size_usd: Decimal,
        excluded_pairs: &HashSet<String>,
    ) -> Option<Opportunity> {
        self.find_opportunities(rates, position_size_usd)
            .into_iter()
            .find(|o| !excluded_pairs.contains(&o.symbol))
    }

    /// Should an open position be kept at the current rates?
    pub fn evaluate_existing_position(
        &self,
        rates: &RateSnapshot,
        symbol: &str,
        long_exchange: &str,
        short_exchange: &str,
    ) -> PositionEvaluation {
        let long = rates.get(long_exchange).and_then(|r| r.get(symbol));
        let short = rates.get(short_exchange).and_then(|r| r.get(symbol));

        let (Some(long), Some(short)) = (long, short) else {
            return PositionEvaluation {
                keep: false,
                current_daily_spread: Decimal::ZERO,
                reason: "Missing rate data".to_string(),
            };
        };

        let current_daily_spread = short.daily_rate() - long.daily_rate();

        if current_daily_spread < self.config.negative_spread_tolerance {
            return PositionEvaluation {
                keep: false,
                current_daily_spread,
                reason: format!("daily spread inverted: {}", current_daily_spread),
            };
        }

        if current_daily_spread > Decimal::ZERO {
            return PositionEvaluation {
                keep: true,
                current_daily_spread,
                reason: "daily spread still positive".to_string(),
            };
        }

        PositionEvaluation {
            keep: true,
            current_daily_spread,
            reason: "within negative tolerance".to_string(),
        }
    }

    pub fn last_opportunities(&self) -> Vec<Opportunity> {
        self.last_opportunities.read().unwrap().clone()
    }
}
