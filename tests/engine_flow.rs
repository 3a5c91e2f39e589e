//! End-to-end coordinator behavior: state machine, automatic entries from
//! the scanner feed, manual operations, funding accrual, kill switch and
//! liquidation response.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use perparb::application::coordinator::EngineState;
use perparb::domain::events::EngineEvent;
use perparb::domain::position::{Position, PositionStatus};
use perparb::domain::types::{OrderType, PositionSide, VenuePosition};
use perparb::infrastructure::persistence::repositories::{positions, system_state};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

#[tokio::test]
async fn engine_opens_one_position_from_the_rate_feed() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let mut harness = build_harness(fast_config(), alpha, beta).await;

    harness.coordinator.clone().start().await.unwrap();
    assert_eq!(harness.coordinator.state().await, EngineState::Running);

    let coordinator = harness.coordinator.clone();
    let opened = wait_until(Duration::from_secs(3), || {
        let coordinator = coordinator.clone();
        async move { coordinator.get_status().await.open_positions == 1 }
    })
    .await;
    assert!(opened, "no position opened from the seed scan");

    let open = harness.coordinator.open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    let position = &open[0];
    assert_eq!(position.pair, BTC);
    assert_eq!(position.long_exchange, "alpha");
    assert_eq!(position.short_exchange, "beta");
    assert_eq!(position.status, PositionStatus::Open);

    // Later scans keep excluding the occupied pair.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(harness.coordinator.get_status().await.open_positions, 1);

    let events = drain_events(&mut harness.events);
    let has = |pred: &dyn Fn(&EngineEvent) -> bool| events.iter().any(|e| pred(&e.event));
    assert!(has(&|e| matches!(e, EngineEvent::EngineStatus { status, .. } if status == "RUNNING")));
    assert!(has(&|e| matches!(e, EngineEvent::FundingRateUpdate { .. })));
    assert!(has(&|e| matches!(e, EngineEvent::PriceUpdate { .. })));
    assert!(has(&|e| matches!(e, EngineEvent::Opportunity { .. })));
    assert!(has(
        &|e| matches!(e, EngineEvent::PositionUpdate { status, .. } if status == "OPEN")
    ));
    let trade_events = events
        .iter()
        .filter(|e| matches!(e.event, EngineEvent::TradeExecuted { .. }))
        .count();
    assert_eq!(trade_events, 2);

    let status = harness.coordinator.get_status().await;
    assert!(status.simulation_mode);
    assert!(status.last_scan_time.is_some());
    assert!(status.last_opportunity_time.is_some());
    assert!(!status.kill_switch_active);
    assert_eq!(status.monitored_symbols, vec![BTC.to_string()]);
    assert_eq!(status.connected_exchanges.len(), 2);

    // The cached snapshot is queryable from outside.
    let rates = harness.coordinator.rates().await;
    assert_eq!(rates["alpha"][BTC].rate, dec!(-0.0005));
    assert_eq!(rates["beta"][BTC].rate, dec!(0.0020));

    harness.coordinator.stop().await;
    assert_eq!(harness.coordinator.state().await, EngineState::Stopped);
}

#[tokio::test]
async fn start_and_stop_are_noops_in_wrong_states() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(5)).await;
    let harness = build_harness(fast_config(), alpha, beta).await;

    // Stop before start: nothing happens.
    harness.coordinator.stop().await;
    assert_eq!(harness.coordinator.state().await, EngineState::Stopped);

    harness.coordinator.clone().start().await.unwrap();
    assert_eq!(harness.coordinator.state().await, EngineState::Running);

    // The state transition was checkpointed.
    let mut conn = harness.db.pool.acquire().await.unwrap();
    assert_eq!(
        system_state::get(&mut conn, "engine_state").await.unwrap(),
        Some("RUNNING".to_string())
    );
    drop(conn);

    // A second start warns and leaves the engine running.
    harness.coordinator.clone().start().await.unwrap();
    assert_eq!(harness.coordinator.state().await, EngineState::Running);

    harness.coordinator.stop().await;
    harness.coordinator.stop().await;
    assert_eq!(harness.coordinator.state().await, EngineState::Stopped);

    let mut conn = harness.db.pool.acquire().await.unwrap();
    assert_eq!(
        system_state::get(&mut conn, "engine_state").await.unwrap(),
        Some("STOPPED".to_string())
    );
}

struct CountingListener {
    opened: std::sync::atomic::AtomicUsize,
    closed: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl perparb::domain::ports::PositionListener for CountingListener {
    async fn on_position_opened(&self, _position: &Position) {
        self.opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    async fn on_position_closed(&self, _position: &Position, _reason: &str) {
        self.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test]
async fn close_position_settles_and_broadcasts() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let mut harness = build_harness(fast_config(), alpha, beta).await;

    let listener = std::sync::Arc::new(CountingListener {
        opened: std::sync::atomic::AtomicUsize::new(0),
        closed: std::sync::atomic::AtomicUsize::new(0),
    });
    harness
        .coordinator
        .add_position_listener(listener.clone())
        .await;

    harness.coordinator.clone().start().await.unwrap();
    let coordinator = harness.coordinator.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let coordinator = coordinator.clone();
            async move { coordinator.get_status().await.open_positions == 1 }
        })
        .await
    );

    let position = harness.coordinator.open_positions().await.unwrap().remove(0);

    // Stop the feed first so the freed pair is not immediately re-entered.
    harness.coordinator.stop().await;
    let _ = drain_events(&mut harness.events);

    let closed = harness
        .coordinator
        .close_position(&position.id, "manual")
        .await
        .unwrap();
    assert!(closed);

    let stored = harness
        .coordinator
        .get_position(&position.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert!(stored.realized_pnl.is_some());
    assert_eq!(harness.coordinator.get_status().await.open_positions, 0);

    // Both closing legs were reduce-only markets.
    let reduce_only = |orders: Vec<perparb::domain::types::Order>| {
        orders
            .into_iter()
            .filter(|o| o.reduce_only && o.order_type == OrderType::Market)
            .count()
    };
    assert_eq!(reduce_only(harness.alpha.placed_orders().await), 1);
    assert_eq!(reduce_only(harness.beta.placed_orders().await), 1);

    let events = drain_events(&mut harness.events);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        EngineEvent::PositionUpdate { status, .. } if status == "CLOSED"
    )));
    let trade_events = events
        .iter()
        .filter(|e| matches!(e.event, EngineEvent::TradeExecuted { .. }))
        .count();
    assert_eq!(trade_events, 2);

    // Closing an already closed position reports failure.
    assert!(
        !harness
            .coordinator
            .close_position(&position.id, "manual")
            .await
            .unwrap()
    );

    // Lifecycle listeners saw exactly one open and one close.
    assert_eq!(listener.opened.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(listener.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn startup_aborts_when_reconciliation_finds_drift() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let harness = build_harness(fast_config(), alpha, beta).await;

    // A locally OPEN position that no venue knows about.
    let orphan = Position {
        id: "orphan".to_string(),
        pair: BTC.to_string(),
        long_exchange: "alpha".to_string(),
        short_exchange: "beta".to_string(),
        size_usd: dec!(10000),
        long_size: Some(dec!(0.2)),
        short_size: Some(dec!(0.2)),
        long_entry_price: Some(dec!(50000)),
        short_entry_price: Some(dec!(50010)),
        leverage_long: 5,
        leverage_short: 5,
        entry_timestamp: Utc::now(),
        entry_funding_spread: None,
        status: PositionStatus::Open,
        close_timestamp: None,
        realized_pnl: None,
        funding_collected: Decimal::ZERO,
        total_fees: Decimal::ZERO,
        long_close_price: None,
        short_close_price: None,
        notes: None,
    };
    let mut conn = harness.db.pool.acquire().await.unwrap();
    positions::insert(&mut conn, &orphan).await.unwrap();
    drop(conn);

    let err = harness.coordinator.clone().start().await.unwrap_err();
    assert!(err.to_string().contains("reconciliation"));
    assert_eq!(harness.coordinator.state().await, EngineState::Error);
    let status = harness.coordinator.get_status().await;
    assert!(status.error_message.unwrap().contains("reconciliation"));
}

#[tokio::test]
async fn kill_switch_gates_automatic_entries() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let harness = build_harness(fast_config(), alpha, beta).await;

    harness.coordinator.activate_kill_switch("test halt").await;
    harness.coordinator.clone().start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(harness.coordinator.get_status().await.open_positions, 0);
    assert!(harness.coordinator.get_status().await.kill_switch_active);
    assert!(!harness.coordinator.risk_status().await.trading_enabled);

    // Operator reset re-enables the normal path.
    harness.coordinator.deactivate_kill_switch().await;
    harness.coordinator.force_scan().await.unwrap();

    let coordinator = harness.coordinator.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let coordinator = coordinator.clone();
            async move { coordinator.get_status().await.open_positions == 1 }
        })
        .await
    );

    harness.coordinator.stop().await;
}

#[tokio::test]
async fn entries_too_close_to_funding_are_skipped() {
    // Strong spread, but funding in five minutes: the detector admits it,
    // the entry buffer refuses it.
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(5)).await;
    let harness = build_harness(fast_config(), alpha, beta).await;

    harness.coordinator.clone().start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(harness.coordinator.get_status().await.open_positions, 0);
    // The opportunity itself was surfaced.
    assert!(!harness.coordinator.opportunities().is_empty());
    assert!(harness.coordinator.get_status().await.last_opportunity_time.is_some());

    harness.coordinator.stop().await;
}

#[tokio::test]
async fn force_scan_requires_a_running_engine() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let harness = build_harness(fast_config(), alpha, beta).await;

    assert!(harness.coordinator.force_scan().await.is_err());
}

#[tokio::test]
async fn manual_open_uses_cached_rates_and_gates() {
    // Tiny positive spread: below the auto threshold, still a legal manual
    // entry.
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    alpha
        .set_funding_rate(funding_rate(
            "alpha",
            BTC,
            dec!(0.0),
            8,
            ChronoDuration::minutes(30),
        ))
        .await;
    beta.set_funding_rate(funding_rate(
        "beta",
        BTC,
        dec!(0.00002),
        8,
        ChronoDuration::minutes(30),
    ))
    .await;

    let harness = build_harness(fast_config(), alpha, beta).await;
    harness.coordinator.clone().start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        harness.coordinator.get_status().await.open_positions,
        0,
        "sub-threshold spread must not auto-enter"
    );

    // Unknown venue: no cached rate, structured error.
    assert!(
        harness
            .coordinator
            .open_position(BTC, "gamma", "beta", dec!(10000))
            .await
            .is_err()
    );

    let opened = harness
        .coordinator
        .open_position(BTC, "alpha", "beta", dec!(10000))
        .await
        .unwrap();
    assert!(opened);

    let open = harness.coordinator.open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].long_exchange, "alpha");
    assert_eq!(open[0].short_exchange, "beta");

    // Manual entries still honor the risk cap.
    let denied = harness
        .coordinator
        .open_position(BTC, "alpha", "beta", dec!(90000))
        .await
        .unwrap();
    assert!(!denied);

    harness.coordinator.stop().await;
}

#[tokio::test]
async fn funding_sweep_applies_the_sign_convention() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let mut harness = build_harness(fast_config(), alpha, beta).await;

    harness.coordinator.clone().start().await.unwrap();
    let coordinator = harness.coordinator.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let coordinator = coordinator.clone();
            async move { coordinator.get_status().await.open_positions == 1 }
        })
        .await
    );
    let position = harness.coordinator.open_positions().await.unwrap().remove(0);
    harness.coordinator.stop().await;

    // Rates now show a funding instant 60 s in the past.
    let just_funded = ChronoDuration::hours(8) - ChronoDuration::seconds(60);
    harness
        .alpha
        .set_funding_rate(funding_rate("alpha", BTC, dec!(-0.0005), 8, just_funded))
        .await;
    harness
        .beta
        .set_funding_rate(funding_rate("beta", BTC, dec!(0.0020), 8, just_funded))
        .await;

    let _ = drain_events(&mut harness.events);
    harness.coordinator.run_funding_check().await;

    let manager = perparb::application::position_manager::PositionManager::new(
        harness.db.clone(),
        std::collections::HashMap::new(),
    );
    let events = manager.get_funding_events(&position.id).await.unwrap();
    assert_eq!(events.len(), 2);

    let long_size = position.long_size.unwrap();
    let short_size = position.short_size.unwrap();

    let long_event = events
        .iter()
        .find(|e| e.side == PositionSide::Long)
        .unwrap();
    assert_eq!(long_event.exchange, "alpha");
    assert_eq!(long_event.payment_usd, dec!(-0.0005) * long_size);

    let short_event = events
        .iter()
        .find(|e| e.side == PositionSide::Short)
        .unwrap();
    assert_eq!(short_event.exchange, "beta");
    assert_eq!(short_event.payment_usd, -(dec!(0.0020) * short_size));

    let refreshed = manager.get_position(&position.id).await.unwrap().unwrap();
    let total: Decimal = events.iter().map(|e| e.payment_usd).sum();
    assert_eq!(refreshed.funding_collected, total);

    // The accrual was broadcast.
    let bus_events = drain_events(&mut harness.events);
    assert!(bus_events.iter().any(|e| matches!(
        &e.event,
        EngineEvent::PositionUpdate { position_id, .. } if *position_id == position.id
    )));

    // Re-running outside the proximity window records nothing new.
    harness
        .alpha
        .set_funding_rate(funding_rate(
            "alpha",
            BTC,
            dec!(-0.0005),
            8,
            ChronoDuration::hours(4),
        ))
        .await;
    harness
        .beta
        .set_funding_rate(funding_rate(
            "beta",
            BTC,
            dec!(0.0020),
            8,
            ChronoDuration::hours(4),
        ))
        .await;
    harness.coordinator.run_funding_check().await;
    assert_eq!(
        manager.get_funding_events(&position.id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn liquidation_is_detected_and_answered() {
    let (alpha, beta) = scripted_pair(ChronoDuration::minutes(30)).await;
    let mut harness = build_harness(fast_config(), alpha, beta).await;

    harness.coordinator.clone().start().await.unwrap();
    let coordinator = harness.coordinator.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let coordinator = coordinator.clone();
            async move { coordinator.get_status().await.open_positions == 1 }
        })
        .await
    );
    let position = harness.coordinator.open_positions().await.unwrap().remove(0);
    harness.coordinator.stop().await;

    // Venue truth: both legs live, the long on alpha carries a liquidation
    // price.
    let venue_position = |exchange: &str, side: PositionSide, liq: Option<Decimal>| VenuePosition {
        exchange: exchange.to_string(),
        symbol: BTC.to_string(),
        side,
        size: dec!(0.2),
        entry_price: dec!(50000),
        mark_price: dec!(50000),
        liquidation_price: liq,
        unrealized_pnl: Decimal::ZERO,
        leverage: 5,
        margin_type: "isolated".to_string(),
        timestamp: Utc::now(),
    };
    harness
        .alpha
        .set_position(venue_position("alpha", PositionSide::Long, Some(dec!(45000))))
        .await;
    harness
        .beta
        .set_position(venue_position("beta", PositionSide::Short, None))
        .await;

    // First sweep primes the snapshot.
    harness.coordinator.run_funding_check().await;

    // The alpha leg vanishes: suspected liquidation.
    harness.alpha.remove_position(BTC).await;
    let _ = drain_events(&mut harness.events);
    harness.coordinator.run_funding_check().await;

    let stored = harness
        .coordinator
        .get_position(&position.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PositionStatus::Liquidated);
    assert!(stored.notes.unwrap().contains("alpha"));

    // The surviving short on beta was bought back reduce-only.
    let beta_closes: Vec<_> = harness
        .beta
        .placed_orders()
        .await
        .into_iter()
        .filter(|o| o.reduce_only)
        .collect();
    assert_eq!(beta_closes.len(), 1);
    assert_eq!(beta_closes[0].order_type, OrderType::Market);

    // Pair cooled down for an hour.
    assert!(harness.coordinator.risk.is_pair_paused(BTC).await);

    let events = drain_events(&mut harness.events);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        EngineEvent::PositionUpdate { status, .. } if status == "LIQUIDATED"
    )));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        EngineEvent::Alert { title, .. } if title.contains("Liquidation")
    )));
}
