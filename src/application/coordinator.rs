//! Engine coordinator: the state machine over scanner, detector, executor,
//! position manager and risk manager, and the single producer on the
//! broadcast bus.
//!
//! The coordinator is used behind `Arc`; background tasks hold clones and
//! exit when the engine state leaves RUNNING. `stop()` aborts and awaits
//! them, so a stop always completes before a subsequent start.

use crate::application::detector::{Opportunity, SpreadDetector};
use crate::application::executor::{ExecutionEngine, ExecutionResult};
use crate::application::position_manager::PositionManager;
use crate::application::risk_manager::RiskManager;
use crate::application::scanner::{FundingRateScanner, RateSnapshot};
use crate::config::Config;
use crate::domain::events::{AlertSeverity, EngineEvent};
use crate::domain::ports::{Alerter, ExchangeAdapter, PositionListener};
use crate::domain::position::Position;
use crate::domain::types::PositionSide;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::system_state;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Funding settlements are recorded when a funding instant passed within
/// this window. Polling can miss or double-count near interval boundaries;
/// an idempotent ledger fed by venue funding history would be stricter.
const FUNDING_PROXIMITY_SECS: i64 = 300;
const FUNDING_LOOP_INTERVAL: Duration = Duration::from_secs(300);
const MAIN_LOOP_INTERVAL: Duration = Duration::from_secs(1);
const BUS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const ENGINE_STATE_KEY: &str = "engine_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "STOPPED"),
            EngineState::Starting => write!(f, "STARTING"),
            EngineState::Running => write!(f, "RUNNING"),
            EngineState::Stopping => write!(f, "STOPPING"),
            EngineState::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: EngineState,
    pub simulation_mode: bool,
    pub connected_exchanges: Vec<String>,
    pub monitored_symbols: Vec<String>,
    pub open_positions: usize,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub last_opportunity_time: Option<DateTime<Utc>>,
    pub pending_orders: usize,
    pub kill_switch_active: bool,
    pub error_message: Option<String>,
}

pub struct TradingCoordinator {
    config: Config,
    exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
    db: Database,
    pub scanner: Arc<FundingRateScanner>,
    pub detector: Arc<SpreadDetector>,
    pub executor: Arc<ExecutionEngine>,
    pub risk: Arc<RiskManager>,
    bus: Arc<EventBus>,
    alerter: Arc<dyn Alerter>,
    state: RwLock<EngineState>,
    error_message: RwLock<Option<String>>,
    last_scan_time: RwLock<Option<DateTime<Utc>>>,
    last_opportunity_time: RwLock<Option<DateTime<Utc>>>,
    listeners: RwLock<Vec<Arc<dyn PositionListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TradingCoordinator {
    pub fn new(
        config: Config,
        exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
        db: Database,
        bus: Arc<EventBus>,
        alerter: Arc<dyn Alerter>,
    ) -> Arc<Self> {
        let trading = Arc::new(config.trading.clone());

        let scanner = Arc::new(FundingRateScanner::new(
            exchanges.clone(),
            Duration::from_secs(config.trading.poll_interval_secs),
        ));
        let detector = Arc::new(SpreadDetector::new(trading.clone()));
        let executor = Arc::new(ExecutionEngine::new(exchanges.clone(), trading.clone()));
        let risk = Arc::new(RiskManager::new(
            trading,
            exchanges.clone(),
            alerter.clone(),
        ));

        Arc::new(Self {
            config,
            exchanges,
            db,
            scanner,
            detector,
            executor,
            risk,
            bus,
            alerter,
            state: RwLock::new(EngineState::Stopped),
            error_message: RwLock::new(None),
            last_scan_time: RwLock::new(None),
            last_opportunity_time: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == EngineState::Running
    }

    pub async fn add_position_listener(&self, listener: Arc<dyn PositionListener>) {
        self.listeners.write().await.push(listener);
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn position_manager(&self) -> PositionManager {
        PositionManager::new(self.db.clone(), self.exchanges.clone())
    }

    // ---- lifecycle ------------------------------------------------------

    /// STOPPED → STARTING → RUNNING. Any exception on the way sets ERROR
    /// and is returned. Calling from any other state warns and no-ops.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Stopped {
                warn!("Engine start ignored in state {}", state);
                return Ok(());
            }
            *state = EngineState::Starting;
        }
        info!("Engine starting");

        match Arc::clone(&self).start_inner().await {
            Ok(()) => {
                *self.state.write().await = EngineState::Running;
                *self.error_message.write().await = None;
                self.checkpoint("RUNNING").await;
                info!("Engine started");

                self.broadcast_engine_status().await;
                self.alert(
                    AlertSeverity::Info,
                    "Engine Started",
                    &format!(
                        "Mode: {}\nSymbols: {}\nExchanges: {}",
                        if self.config.simulation_mode {
                            "SIMULATION"
                        } else {
                            "LIVE"
                        },
                        self.config.symbols.join(", "),
                        self.exchanges.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                error!("Engine start failed: {:#}", e);
                *self.state.write().await = EngineState::Error;
                *self.error_message.write().await = Some(format!("{:#}", e));
                self.broadcast_engine_status().await;
                Err(e)
            }
        }
    }

    async fn start_inner(self: Arc<Self>) -> Result<()> {
        // Refuse to trade while local truth and venue truth disagree.
        let issues = self.reconcile_state().await?;
        if !issues.is_empty() {
            anyhow::bail!(
                "startup reconciliation found {} issue(s): {}",
                issues.len(),
                issues.join("; ")
            );
        }

        let (snapshot_tx, snapshot_rx) = mpsc::channel::<RateSnapshot>(1);
        self.scanner
            .clone()
            .start(self.config.symbols.clone(), snapshot_tx)
            .await;

        let mut tasks = self.tasks.lock().await;

        let this = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            this.rates_loop(snapshot_rx).await;
        }));

        let this = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            this.main_loop().await;
        }));

        let this = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            this.funding_loop().await;
        }));

        let this = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            this.heartbeat_loop().await;
        }));

        Ok(())
    }

    /// RUNNING | STARTING → STOPPING → STOPPED. Always succeeds; other
    /// states warn and no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, EngineState::Running | EngineState::Starting) {
                warn!("Engine stop ignored in state {}", state);
                return;
            }
            *state = EngineState::Stopping;
        }
        info!("Engine stopping");

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        drop(tasks);

        self.scanner.stop().await;

        *self.state.write().await = EngineState::Stopped;
        self.checkpoint("STOPPED").await;
        info!("Engine stopped");
        self.broadcast_engine_status().await;
    }

    // ---- background loops -----------------------------------------------

    async fn rates_loop(self: Arc<Self>, mut rx: mpsc::Receiver<RateSnapshot>) {
        while let Some(snapshot) = rx.recv().await {
            self.on_rates_update(&snapshot).await;
            // A slow entry must not hold up the feed.
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.process_opportunities(snapshot).await;
            });
        }
        debug!("Rates loop ended");
    }

    /// Heartbeat tick reserved for cancellation and future tick-driven
    /// work; opportunity processing happens in the scanner callback.
    async fn main_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(MAIN_LOOP_INTERVAL).await;
            let state = *self.state.read().await;
            if !matches!(state, EngineState::Running | EngineState::Starting) {
                break;
            }
        }
        debug!("Main loop ended");
    }

    async fn funding_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(FUNDING_LOOP_INTERVAL).await;
            let state = *self.state.read().await;
            if !matches!(state, EngineState::Running | EngineState::Starting) {
                break;
            }
            self.run_funding_check().await;
        }
        debug!("Funding loop ended");
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(BUS_HEARTBEAT_INTERVAL).await;
            let state = *self.state.read().await;
            if !matches!(state, EngineState::Running | EngineState::Starting) {
                break;
            }
            if self.bus.subscriber_count() > 0 {
                self.bus.publish(EngineEvent::Heartbeat);
            }
        }
    }

    /// Scanner callback half one: stamp the scan time and publish every
    /// rate in the snapshot.
    async fn on_rates_update(&self, snapshot: &RateSnapshot) {
        *self.last_scan_time.write().await = Some(Utc::now());

        for venue_rates in snapshot.values() {
            for rate in venue_rates.values() {
                self.bus.publish(EngineEvent::FundingRateUpdate {
                    exchange: rate.exchange.clone(),
                    pair: rate.symbol.clone(),
                    rate: rate.rate,
                    predicted: rate.predicted_rate,
                    next_funding_time: rate.next_funding_time,
                    interval_hours: rate.interval_hours,
                    mark_price: rate.mark_price,
                    index_price: rate.index_price,
                });
                if let Some(mark_price) = rate.mark_price {
                    self.bus.publish(EngineEvent::PriceUpdate {
                        exchange: rate.exchange.clone(),
                        pair: rate.symbol.clone(),
                        mark_price,
                        index_price: rate.index_price,
                    });
                }
            }
        }
    }

    async fn process_opportunities(self: Arc<Self>, snapshot: RateSnapshot) {
        if !self.risk.is_trading_enabled().await {
            return;
        }

        let manager = self.position_manager();
        let open_positions = match manager.get_open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Opportunity processing failed to list positions: {}", e);
                return;
            }
        };
        let excluded: HashSet<String> = open_positions.iter().map(|p| p.pair.clone()).collect();

        let size_usd = self.config.trading.max_position_per_pair_usd;
        let Some(opportunity) =
            self.detector
                .find_best_opportunity(&snapshot, size_usd, &excluded)
        else {
            return;
        };

        *self.last_opportunity_time.write().await = Some(Utc::now());

        if let Err(e) = self.try_enter(&opportunity, size_usd).await {
            error!("Opportunity execution error: {:#}", e);
        }
    }

    /// Shared entry path for automatic and manual opens: risk admission,
    /// funding-time buffer, execution, persistence, fan-out.
    async fn try_enter(&self, opportunity: &Opportunity, size_usd: Decimal) -> Result<bool> {
        let (can_open, reason) = self
            .risk
            .can_open_position(&opportunity.symbol, size_usd)
            .await;
        if !can_open {
            info!("Entry declined for {}: {}", opportunity.symbol, reason);
            return Ok(false);
        }

        let buffer_secs = self.config.trading.entry_buffer_minutes * 60;
        if opportunity.seconds_to_funding < buffer_secs {
            debug!(
                "Too close to funding for {}: {}s remaining, {}s required",
                opportunity.symbol, opportunity.seconds_to_funding, buffer_secs
            );
            return Ok(false);
        }

        info!(
            "Executing opportunity: {} long={} short={} daily_spread={}",
            opportunity.symbol,
            opportunity.long_exchange,
            opportunity.short_exchange,
            opportunity.daily_spread
        );

        let result = self.executor.execute_entry(opportunity, size_usd).await;

        if !result.success {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            warn!("Execution failed for {}: {}", opportunity.symbol, message);
            self.alert(
                AlertSeverity::Warning,
                "Execution Failed",
                &format!("Pair: {}\nError: {}", opportunity.symbol, message),
            )
            .await;
            return Ok(false);
        }

        let manager = self.position_manager();
        let position = manager
            .create_position(opportunity, &result, size_usd)
            .await?;

        for listener in self.listeners.read().await.iter() {
            listener.on_position_opened(&position).await;
        }

        self.bus.publish(EngineEvent::PositionUpdate {
            position_id: position.id.clone(),
            status: position.status.to_string(),
            unrealized_pnl: Some(Decimal::ZERO),
            funding_collected: Decimal::ZERO,
        });
        self.bus.publish(EngineEvent::Opportunity {
            symbol: opportunity.symbol.clone(),
            long_exchange: opportunity.long_exchange.clone(),
            short_exchange: opportunity.short_exchange.clone(),
            spread: opportunity.daily_spread,
            expected_profit: opportunity.expected_daily_profit,
        });
        self.publish_leg_trades(&position.id, &result, false);

        self.alert(
            AlertSeverity::Info,
            "Position Opened",
            &format!(
                "Pair: {}\nLong: {} @ {}\nShort: {} @ {}\nSize: ${}\nDaily spread: {}%",
                position.pair,
                position.long_exchange,
                position
                    .long_entry_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
                position.short_exchange,
                position
                    .short_entry_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
                size_usd,
                opportunity.daily_spread * Decimal::from(100),
            ),
        )
        .await;

        Ok(true)
    }

    fn publish_leg_trades(&self, position_id: &str, result: &ExecutionResult, closing: bool) {
        if let Some(long_order) = &result.long_order {
            self.bus.publish(EngineEvent::TradeExecuted {
                position_id: position_id.to_string(),
                exchange: long_order.exchange.clone(),
                side: if closing { "SELL" } else { "BUY" }.to_string(),
                price: long_order.effective_price().unwrap_or_default(),
                size: long_order.filled_size,
                fee: long_order.fee,
            });
        }
        if let Some(short_order) = &result.short_order {
            self.bus.publish(EngineEvent::TradeExecuted {
                position_id: position_id.to_string(),
                exchange: short_order.exchange.clone(),
                side: if closing { "BUY" } else { "SELL" }.to_string(),
                price: short_order.effective_price().unwrap_or_default(),
                size: short_order.filled_size,
                fee: short_order.fee,
            });
        }
    }

    // ---- funding + liquidation sweep ------------------------------------

    /// One pass of the funding loop: accrue settlements that just occurred
    /// for every open position, then sweep for liquidations.
    pub async fn run_funding_check(&self) {
        let manager = self.position_manager();
        let positions = match manager.get_open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Funding check failed to list positions: {}", e);
                return;
            }
        };

        for position in &positions {
            self.record_due_funding(&manager, position).await;
        }

        let detections = self.risk.check_for_liquidations().await;
        for detection in detections {
            self.respond_to_liquidation(&manager, &positions, &detection)
                .await;
        }
    }

    async fn record_due_funding(&self, manager: &PositionManager, position: &Position) {
        let now = Utc::now();
        let legs = [
            (
                &position.long_exchange,
                PositionSide::Long,
                position.long_size,
            ),
            (
                &position.short_exchange,
                PositionSide::Short,
                position.short_size,
            ),
        ];

        for (exchange, side, size) in legs {
            let Some(size) = size.filter(|s| !s.is_zero()) else {
                continue;
            };
            let Some(venue) = self.exchanges.get(exchange) else {
                continue;
            };
            let rate = match venue.get_funding_rate(&position.pair).await {
                Ok(rate) => rate,
                Err(e) => {
                    debug!("Funding check skipped {} on {}: {}", position.pair, exchange, e);
                    continue;
                }
            };

            let interval =
                ChronoDuration::seconds(rate.interval_hours as i64 * 3600);
            let last_funding = rate.next_funding_time - interval;
            if (now - last_funding).num_seconds() >= FUNDING_PROXIMITY_SECS {
                continue;
            }

            // Longs pay a positive rate, shorts receive it.
            let mut payment = rate.rate * size;
            if side == PositionSide::Short {
                payment = -payment;
            }
            if payment.is_zero() {
                continue;
            }

            match manager
                .record_funding_payment(&position.id, exchange, side, rate.rate, payment, size)
                .await
            {
                Ok(_) => {
                    let funding_collected = manager
                        .get_position(&position.id)
                        .await
                        .ok()
                        .flatten()
                        .map(|p| p.funding_collected)
                        .unwrap_or_default();
                    self.bus.publish(EngineEvent::PositionUpdate {
                        position_id: position.id.clone(),
                        status: position.status.to_string(),
                        unrealized_pnl: None,
                        funding_collected,
                    });
                }
                Err(e) => error!(
                    "Failed to record funding for {} on {}: {}",
                    position.id, exchange, e
                ),
            }
        }
    }

    async fn respond_to_liquidation(
        &self,
        manager: &PositionManager,
        open_positions: &[Position],
        detection: &crate::application::risk_manager::LiquidationAlert,
    ) {
        let hit = open_positions.iter().find(|p| {
            p.pair == detection.symbol
                && (p.long_exchange == detection.exchange
                    || p.short_exchange == detection.exchange)
        });

        let Some(position) = hit else {
            self.alert(
                AlertSeverity::Critical,
                "Liquidation Detected",
                &format!(
                    "Venue position {} on {} disappeared with a liquidation price but matches no local position.",
                    detection.symbol, detection.exchange
                ),
            )
            .await;
            return;
        };

        let (surviving_exchange, surviving_side, surviving_size) =
            if position.long_exchange == detection.exchange {
                (
                    position.short_exchange.clone(),
                    PositionSide::Short,
                    position.short_size.unwrap_or_default(),
                )
            } else {
                (
                    position.long_exchange.clone(),
                    PositionSide::Long,
                    position.long_size.unwrap_or_default(),
                )
            };

        self.risk
            .handle_liquidation(
                &position.id,
                &detection.exchange,
                &surviving_exchange,
                &position.pair,
                surviving_side,
                surviving_size,
            )
            .await;

        match manager
            .mark_liquidated(&position.id, &detection.exchange, None)
            .await
        {
            Ok(liquidated) => {
                self.bus.publish(EngineEvent::PositionUpdate {
                    position_id: liquidated.id.clone(),
                    status: liquidated.status.to_string(),
                    unrealized_pnl: None,
                    funding_collected: liquidated.funding_collected,
                });
            }
            Err(e) => error!("Failed to mark {} liquidated: {}", position.id, e),
        }

        self.bus.publish(EngineEvent::Alert {
            severity: AlertSeverity::Critical,
            title: "Liquidation Detected".to_string(),
            message: format!(
                "Position {} ({}) liquidated on {}",
                position.id, position.pair, detection.exchange
            ),
        });
    }

    // ---- external operations --------------------------------------------

    /// Close an open position. Returns false (with a log) when the position
    /// is missing, already terminal, or the exit did not fill.
    pub async fn close_position(&self, position_id: &str, reason: &str) -> Result<bool> {
        let manager = self.position_manager();

        let Some(position) = manager.get_position(position_id).await? else {
            warn!("Close requested for unknown position {}", position_id);
            return Ok(false);
        };
        if !position.is_open() {
            warn!("Close requested for non-open position {}", position_id);
            return Ok(false);
        }

        let result = self
            .executor
            .execute_exit(
                &position.pair,
                &position.long_exchange,
                &position.short_exchange,
                position.long_size.unwrap_or_default(),
                position.short_size.unwrap_or_default(),
            )
            .await;

        if !result.success {
            error!(
                "Close failed for {}: {:?}",
                position_id, result.error_message
            );
            return Ok(false);
        }

        let closed = manager.close_position(position_id, &result).await?;

        for listener in self.listeners.read().await.iter() {
            listener.on_position_closed(&closed, reason).await;
        }

        self.publish_leg_trades(position_id, &result, true);
        self.bus.publish(EngineEvent::PositionUpdate {
            position_id: closed.id.clone(),
            status: closed.status.to_string(),
            unrealized_pnl: None,
            funding_collected: closed.funding_collected,
        });

        self.alert(
            AlertSeverity::Info,
            "Position Closed",
            &format!(
                "Pair: {}\nReason: {}\nRealized PnL: ${}",
                closed.pair,
                reason,
                closed.realized_pnl.unwrap_or_default()
            ),
        )
        .await;

        info!("Position {} closed ({})", position_id, reason);
        Ok(true)
    }

    /// Manual entry: synthesize an opportunity from the cached rates of the
    /// requested venues and run it through the normal gates.
    pub async fn open_position(
        &self,
        pair: &str,
        long_exchange: &str,
        short_exchange: &str,
        size_usd: Decimal,
    ) -> Result<bool> {
        let long_rate = self
            .scanner
            .get_rate(long_exchange, pair)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!("no cached funding rate for {} on {}", pair, long_exchange)
            })?;
        let short_rate = self
            .scanner
            .get_rate(short_exchange, pair)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!("no cached funding rate for {} on {}", pair, short_exchange)
            })?;

        let opportunity =
            self.detector
                .synthesize(pair, &long_rate, &short_rate, size_usd, Utc::now());
        if opportunity.daily_spread <= Decimal::ZERO {
            warn!(
                "Manual entry for {} has non-positive daily spread {}",
                pair, opportunity.daily_spread
            );
        }

        self.try_enter(&opportunity, size_usd).await
    }

    pub async fn activate_kill_switch(&self, reason: &str) {
        self.risk.activate_kill_switch(reason).await;
        self.broadcast_engine_status().await;
    }

    pub async fn deactivate_kill_switch(&self) {
        self.risk.deactivate_kill_switch().await;
        self.broadcast_engine_status().await;
    }

    /// One synchronous fetch+publish cycle. Requires RUNNING.
    pub async fn force_scan(&self) -> Result<()> {
        if !self.is_running().await {
            anyhow::bail!("engine is not running");
        }
        self.scanner.scan_once().await;
        Ok(())
    }

    pub async fn reconcile_state(&self) -> Result<Vec<String>> {
        self.position_manager().reconcile_with_exchanges().await
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        self.position_manager().get_open_positions().await
    }

    pub async fn get_position(&self, position_id: &str) -> Result<Option<Position>> {
        self.position_manager().get_position(position_id).await
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.detector.last_opportunities()
    }

    pub async fn rates(&self) -> RateSnapshot {
        self.scanner.get_rates().await
    }

    pub async fn risk_status(&self) -> crate::application::risk_manager::RiskStatus {
        self.risk.risk_status().await
    }

    pub async fn get_status(&self) -> EngineStatus {
        let open_positions = self
            .position_manager()
            .get_open_positions()
            .await
            .map(|p| p.len())
            .unwrap_or(0);

        EngineStatus {
            state: *self.state.read().await,
            simulation_mode: self.config.simulation_mode,
            connected_exchanges: self
                .exchanges
                .iter()
                .filter(|(_, venue)| venue.is_connected())
                .map(|(name, _)| name.clone())
                .collect(),
            monitored_symbols: self.scanner.monitored_symbols().await,
            open_positions,
            last_scan_time: *self.last_scan_time.read().await,
            last_opportunity_time: *self.last_opportunity_time.read().await,
            pending_orders: self.executor.pending_orders(),
            kill_switch_active: self.risk.is_kill_switch_active().await,
            error_message: self.error_message.read().await.clone(),
        }
    }

    // ---- plumbing -------------------------------------------------------

    /// Send through the alert transport and mirror onto the bus.
    async fn alert(&self, severity: AlertSeverity, title: &str, message: &str) {
        self.alerter.send(severity, title, message).await;
        self.bus.publish(EngineEvent::Alert {
            severity,
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    async fn broadcast_engine_status(&self) {
        let state = *self.state.read().await;
        self.bus.publish(EngineEvent::EngineStatus {
            status: state.to_string(),
            connected_exchanges: self
                .exchanges
                .iter()
                .filter(|(_, venue)| venue.is_connected())
                .map(|(name, _)| name.clone())
                .collect(),
            last_scan: *self.last_scan_time.read().await,
            error: self.error_message.read().await.clone(),
        });
    }

    async fn checkpoint(&self, state: &str) {
        let result: Result<()> = async {
            let mut tx = self.db.begin().await?;
            system_state::set(&mut tx, ENGINE_STATE_KEY, state).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!("Failed to checkpoint engine state: {}", e);
        }
    }
}
