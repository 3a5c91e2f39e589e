//! Admission control and incident response.
//!
//! The risk manager is the single authority on whether a new position may
//! open. It also owns the kill switch and the liquidation response: both
//! are best-effort sweeps where one venue's failure must never stop the
//! others from being handled.

use crate::config::TradingConfig;
use crate::domain::events::AlertSeverity;
use crate::domain::ports::{Alerter, ExchangeAdapter};
use crate::domain::types::{Order, OrderSide, PositionSide, VenuePosition};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Cooldown applied to a pair after a liquidation.
const LIQUIDATION_COOLDOWN_HOURS: f64 = 1.0;

/// A position that vanished from a venue while carrying a liquidation
/// price — treated as a suspected liquidation.
#[derive(Debug, Clone)]
pub struct LiquidationAlert {
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub liquidation_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub kill_switch_active: bool,
    pub kill_switch_activated_at: Option<DateTime<Utc>>,
    pub trading_enabled: bool,
    pub paused_pairs: HashMap<String, DateTime<Utc>>,
    pub max_position_per_pair_usd: Decimal,
}

#[derive(Default)]
struct KillSwitch {
    active: bool,
    activated_at: Option<DateTime<Utc>>,
}

pub struct RiskManager {
    config: Arc<TradingConfig>,
    exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
    alerter: Arc<dyn Alerter>,
    kill_switch: RwLock<KillSwitch>,
    paused_pairs: RwLock<HashMap<String, DateTime<Utc>>>,
    last_positions: RwLock<HashMap<String, HashMap<String, VenuePosition>>>,
}

impl RiskManager {
    pub fn new(
        config: Arc<TradingConfig>,
        exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            config,
            exchanges,
            alerter,
            kill_switch: RwLock::new(KillSwitch::default()),
            paused_pairs: RwLock::new(HashMap::new()),
            last_positions: RwLock::new(HashMap::new()),
        }
    }

    // ---- admission ------------------------------------------------------

    /// Gate for new entries. Check order: kill switch, pair cooldown, size
    /// cap. Denials are values, never errors.
    pub async fn can_open_position(&self, symbol: &str, size_usd: Decimal) -> (bool, String) {
        if self.kill_switch.read().await.active {
            return (false, "Kill switch is active".to_string());
        }

        if self.is_pair_paused(symbol).await {
            let expiry = self.paused_pairs.read().await.get(symbol).copied();
            return (
                false,
                match expiry {
                    Some(expiry) => format!("Pair is paused until {}", expiry.to_rfc3339()),
                    None => "Pair is paused".to_string(),
                },
            );
        }

        if size_usd > self.config.max_position_per_pair_usd {
            return (
                false,
                format!(
                    "Position size {} exceeds limit {}",
                    size_usd, self.config.max_position_per_pair_usd
                ),
            );
        }

        (true, "OK".to_string())
    }

    /// Expired cooldowns are evicted on read.
    pub async fn is_pair_paused(&self, symbol: &str) -> bool {
        let mut paused = self.paused_pairs.write().await;
        match paused.get(symbol) {
            Some(expiry) if Utc::now() >= *expiry => {
                paused.remove(symbol);
                info!("Pair cooldown expired: {}", symbol);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn pause_pair(&self, symbol: &str, cooldown_hours: f64) {
        let expiry =
            Utc::now() + Duration::milliseconds((cooldown_hours * 3_600_000.0) as i64);
        self.paused_pairs
            .write()
            .await
            .insert(symbol.to_string(), expiry);
        warn!(
            "Pair paused: {} for {}h (until {})",
            symbol,
            cooldown_hours,
            expiry.to_rfc3339()
        );
    }

    pub async fn paused_pairs(&self) -> HashMap<String, DateTime<Utc>> {
        self.paused_pairs.read().await.clone()
    }

    // ---- kill switch ----------------------------------------------------

    pub async fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.read().await.active
    }

    pub async fn is_trading_enabled(&self) -> bool {
        !self.kill_switch.read().await.active
    }

    /// Halt everything: flag first, then best-effort cancel all orders and
    /// flatten every live venue position. Idempotent, and never auto-resets.
    pub async fn activate_kill_switch(&self, reason: &str) {
        {
            let mut kill_switch = self.kill_switch.write().await;
            if kill_switch.active {
                warn!("Kill switch already active");
                return;
            }
            kill_switch.active = true;
            kill_switch.activated_at = Some(Utc::now());
        }
        error!("KILL SWITCH ACTIVATED: {}", reason);

        let cancelled = self.cancel_all_orders().await;
        info!("Kill switch: {} orders cancelled", cancelled);

        let closed = self.close_all_positions().await;
        info!("Kill switch: {} positions closed", closed.len());

        self.alerter
            .send(
                AlertSeverity::Critical,
                "KILL SWITCH ACTIVATED",
                &format!(
                    "Reason: {}\nOrders cancelled: {}\nPositions closed: {}\nManual restart required to resume trading.",
                    reason,
                    cancelled,
                    closed.len()
                ),
            )
            .await;
    }

    /// Operator-only reset.
    pub async fn deactivate_kill_switch(&self) {
        let mut kill_switch = self.kill_switch.write().await;
        if !kill_switch.active {
            return;
        }
        info!("Kill switch deactivated");
        kill_switch.active = false;
        kill_switch.activated_at = None;
    }

    async fn cancel_all_orders(&self) -> usize {
        let mut total = 0;
        for (name, venue) in &self.exchanges {
            match venue.cancel_all_orders(None).await {
                Ok(count) => {
                    total += count;
                    info!("Cancelled {} orders on {}", count, name);
                }
                Err(e) => error!("Failed to cancel orders on {}: {}", name, e),
            }
        }
        total
    }

    async fn close_all_positions(&self) -> Vec<String> {
        let mut closed = Vec::new();
        for (name, venue) in &self.exchanges {
            let positions = match venue.get_positions().await {
                Ok(positions) => positions,
                Err(e) => {
                    error!("Failed to fetch positions on {}: {}", name, e);
                    continue;
                }
            };

            for position in positions {
                if position.size.is_zero() {
                    continue;
                }
                let close_side = match position.side {
                    PositionSide::Long => OrderSide::Sell,
                    PositionSide::Short => OrderSide::Buy,
                };
                let order =
                    Order::market_reduce_only(&position.symbol, close_side, position.size);
                match venue.place_order(&order).await {
                    Ok(_) => {
                        info!("Force-closed {} {} on {}", position.side, position.symbol, name);
                        closed.push(format!("{}:{}", name, position.symbol));
                    }
                    Err(e) => {
                        error!("Force close of {} on {} failed: {}", position.symbol, name, e)
                    }
                }
            }
        }
        closed
    }

    // ---- liquidation handling -------------------------------------------

    /// Diff current venue positions against the previous sweep. A position
    /// that disappeared (or went to zero) while it carried a liquidation
    /// price is reported; the snapshot is updated either way.
    pub async fn check_for_liquidations(&self) -> Vec<LiquidationAlert> {
        let mut detections = Vec::new();

        for (name, venue) in &self.exchanges {
            let current = match venue.get_positions().await {
                Ok(positions) => positions,
                Err(e) => {
                    error!("Liquidation check failed on {}: {}", name, e);
                    continue;
                }
            };

            let current_map: HashMap<String, VenuePosition> = current
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect();

            let mut last = self.last_positions.write().await;
            if let Some(previous) = last.get(name) {
                for (symbol, last_position) in previous {
                    let gone = current_map
                        .get(symbol)
                        .map(|p| p.size.is_zero())
                        .unwrap_or(true);
                    if gone
                        && !last_position.size.is_zero()
                        && let Some(liquidation_price) = last_position.liquidation_price
                    {
                        detections.push(LiquidationAlert {
                            exchange: name.clone(),
                            symbol: symbol.clone(),
                            side: last_position.side,
                            size: last_position.size,
                            entry_price: last_position.entry_price,
                            liquidation_price,
                        });
                    }
                }
            }
            last.insert(name.clone(), current_map);
        }

        if !detections.is_empty() {
            warn!("Suspected liquidations detected: {}", detections.len());
        }
        detections
    }

    /// Close the surviving leg of a liquidated hedge and cool the pair
    /// down. The pause happens even when the close call fails.
    pub async fn handle_liquidation(
        &self,
        position_id: &str,
        liquidated_exchange: &str,
        surviving_exchange: &str,
        symbol: &str,
        surviving_side: PositionSide,
        surviving_size: Decimal,
    ) {
        error!(
            "Handling liquidation: position={} liquidated_on={} surviving_on={}",
            position_id, liquidated_exchange, surviving_exchange
        );

        let close_side = match surviving_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };

        match self.exchanges.get(surviving_exchange) {
            Some(venue) => {
                let order = Order::market_reduce_only(symbol, close_side, surviving_size);
                match venue.place_order(&order).await {
                    Ok(result) => info!(
                        "Surviving leg closed on {}: order {}",
                        surviving_exchange, result.order_id
                    ),
                    Err(e) => error!(
                        "Surviving leg close failed on {}: {}",
                        surviving_exchange, e
                    ),
                }
            }
            None => error!("Unknown surviving exchange: {}", surviving_exchange),
        }

        self.pause_pair(symbol, LIQUIDATION_COOLDOWN_HOURS).await;

        self.alerter
            .send(
                AlertSeverity::Critical,
                "LIQUIDATION DETECTED",
                &format!(
                    "Position: {}\nLiquidated on: {}\nSurviving leg closed on: {}\nPair {} paused for 1 hour.",
                    position_id, liquidated_exchange, surviving_exchange, symbol
                ),
            )
            .await;
    }

    pub async fn risk_status(&self) -> RiskStatus {
        let kill_switch = self.kill_switch.read().await;
        RiskStatus {
            kill_switch_active: kill_switch.active,
            kill_switch_activated_at: kill_switch.activated_at,
            trading_enabled: !kill_switch.active,
            paused_pairs: self.paused_pairs.read().await.clone(),
            max_position_per_pair_usd: self.config.max_position_per_pair_usd,
        }
    }
}
