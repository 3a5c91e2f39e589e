//! Durable lifecycle behavior: one open position per pair, realized P&L
//! accounting, atomic funding accrual, liquidation bookkeeping and
//! reconciliation against venue truth.

mod common;

use chrono::Utc;
use common::*;
use perparb::application::executor::ExecutionResult;
use perparb::application::position_manager::PositionManager;
use perparb::domain::errors::PositionError;
use perparb::domain::ports::ExchangeAdapter;
use perparb::domain::position::{Position, PositionStatus, TradeAction};
use perparb::domain::types::{OrderSide, PositionSide, VenuePosition};
use perparb::infrastructure::mock::MockVenue;
use perparb::infrastructure::persistence::repositories::positions;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;

async fn manager() -> (PositionManager, Arc<MockVenue>, Arc<MockVenue>) {
    let db = memory_db().await;
    let alpha = Arc::new(MockVenue::new("alpha"));
    let beta = Arc::new(MockVenue::new("beta"));
    let mut exchanges: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    exchanges.insert("alpha".to_string(), alpha.clone());
    exchanges.insert("beta".to_string(), beta.clone());
    (PositionManager::new(db, exchanges), alpha, beta)
}

#[tokio::test]
async fn create_position_records_both_legs() {
    let (manager, _alpha, _beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));
    let execution = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));

    let position = manager
        .create_position(&opportunity, &execution, dec!(10000))
        .await
        .unwrap();

    assert_eq!(position.pair, BTC);
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.long_exchange, "alpha");
    assert_eq!(position.short_exchange, "beta");
    assert_eq!(position.long_entry_price, Some(dec!(50000)));
    assert_eq!(position.short_entry_price, Some(dec!(50010)));
    assert_eq!(position.long_size, Some(dec!(0.2)));
    assert_eq!(position.short_size, Some(dec!(0.2)));
    assert_eq!(position.total_fees, dec!(8));
    assert_eq!(position.funding_collected, Decimal::ZERO);
    assert_eq!(position.entry_funding_spread, Some(opportunity.spread));

    let trades = manager.get_trades(&position.id).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert!(trades.iter().all(|t| t.action == TradeAction::Open));
    assert!(trades.iter().any(|t| t.side == PositionSide::Long && t.exchange == "alpha"));
    assert!(trades.iter().any(|t| t.side == PositionSide::Short && t.exchange == "beta"));

    let by_pair = manager.get_position_for_pair(BTC).await.unwrap().unwrap();
    assert_eq!(by_pair.id, position.id);
    assert!(manager.get_position_for_pair("ETH/USDT:USDT").await.unwrap().is_none());

    // A second open for the same pair violates the invariant.
    let err = manager
        .create_position(&opportunity, &execution, dec!(10000))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PositionError>(),
        Some(PositionError::PairOccupied(_))
    ));
}

#[tokio::test]
async fn failed_execution_cannot_create_a_position() {
    let (manager, _alpha, _beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));

    let mut execution = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    execution.success = false;
    let err = manager
        .create_position(&opportunity, &execution, dec!(10000))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PositionError>(),
        Some(PositionError::InvalidExecutionResult)
    ));

    // Success flag without both legs is equally invalid.
    let mut missing_leg = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    missing_leg.short_order = None;
    assert!(
        manager
            .create_position(&opportunity, &missing_leg, dec!(10000))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn storage_layer_rejects_second_open_position_for_pair() {
    let db = memory_db().await;

    let template = Position {
        id: "one".to_string(),
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

    let mut conn = db.pool.acquire().await.unwrap();
    positions::insert(&mut conn, &template).await.unwrap();

    let mut second = template.clone();
    second.id = "two".to_string();
    // Same pair, still OPEN: the partial unique index refuses it.
    assert!(positions::insert(&mut conn, &second).await.is_err());

    // A closed row for the pair is fine.
    second.status = PositionStatus::Closed;
    positions::insert(&mut conn, &second).await.unwrap();
}

#[tokio::test]
async fn close_position_realizes_pnl() {
    let (manager, _alpha, _beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));
    let entry = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    let position = manager
        .create_position(&opportunity, &entry, dec!(10000))
        .await
        .unwrap();

    let exit = ExecutionResult {
        success: true,
        long_order: Some(filled_order(
            "alpha",
            BTC,
            OrderSide::Sell,
            dec!(0.2),
            dec!(50500),
            dec!(4),
        )),
        short_order: Some(filled_order(
            "beta",
            BTC,
            OrderSide::Buy,
            dec!(0.2),
            dec!(50500),
            dec!(4),
        )),
        error_message: None,
        execution_time_ms: 3,
    };

    let closed = manager.close_position(&position.id, &exit).await.unwrap();

    // long: (50500 − 50000) × 0.2 = 100
    // short: (50010 − 50500) × 0.2 = −98
    // fees: 8 entry + 8 exit, no funding collected
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.realized_pnl, Some(dec!(100) - dec!(98) - dec!(16)));
    assert_eq!(closed.long_close_price, Some(dec!(50500)));
    assert_eq!(closed.short_close_price, Some(dec!(50500)));
    assert_eq!(closed.total_fees, dec!(16));
    assert!(closed.close_timestamp.is_some());

    let trades = manager.get_trades(&position.id).await.unwrap();
    assert_eq!(trades.len(), 4);
    assert_eq!(
        trades.iter().filter(|t| t.action == TradeAction::Close).count(),
        2
    );

    // Terminal means terminal.
    let err = manager.close_position(&position.id, &exit).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PositionError>(),
        Some(PositionError::NotOpen(_))
    ));

    // The pair is free again for a new position.
    assert!(
        manager
            .create_position(&opportunity, &entry, dec!(10000))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn funding_events_and_accrual_commit_together() {
    let (manager, _alpha, _beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));
    let entry = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    let position = manager
        .create_position(&opportunity, &entry, dec!(10000))
        .await
        .unwrap();

    manager
        .record_funding_payment(
            &position.id,
            "alpha",
            PositionSide::Long,
            dec!(-0.0005),
            dec!(-0.0001),
            dec!(0.2),
        )
        .await
        .unwrap();
    manager
        .record_funding_payment(
            &position.id,
            "beta",
            PositionSide::Short,
            dec!(0.0020),
            dec!(-0.0004),
            dec!(0.2),
        )
        .await
        .unwrap();

    let events = manager.get_funding_events(&position.id).await.unwrap();
    assert_eq!(events.len(), 2);

    let total: Decimal = events.iter().map(|e| e.payment_usd).sum();
    let refreshed = manager.get_position(&position.id).await.unwrap().unwrap();
    assert_eq!(refreshed.funding_collected, total);
    assert_eq!(refreshed.funding_collected, dec!(-0.0005));

    // Funding for an unknown position is an invariant error, not a silent
    // insert.
    assert!(
        manager
            .record_funding_payment(
                "missing",
                "alpha",
                PositionSide::Long,
                dec!(0.0001),
                dec!(0.1),
                dec!(0.2),
            )
            .await
            .is_err()
    );
}

#[tokio::test]
async fn funding_feeds_into_realized_pnl() {
    let (manager, _alpha, _beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));
    let entry = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    let position = manager
        .create_position(&opportunity, &entry, dec!(10000))
        .await
        .unwrap();

    manager
        .record_funding_payment(
            &position.id,
            "beta",
            PositionSide::Short,
            dec!(-0.0020),
            dec!(12.5),
            dec!(0.2),
        )
        .await
        .unwrap();

    // Close flat: both legs back at entry, zero exit fees.
    let exit = ExecutionResult {
        success: true,
        long_order: Some(filled_order(
            "alpha",
            BTC,
            OrderSide::Sell,
            dec!(0.2),
            dec!(50000),
            Decimal::ZERO,
        )),
        short_order: Some(filled_order(
            "beta",
            BTC,
            OrderSide::Buy,
            dec!(0.2),
            dec!(50010),
            Decimal::ZERO,
        )),
        error_message: None,
        execution_time_ms: 3,
    };
    let closed = manager.close_position(&position.id, &exit).await.unwrap();

    // Price legs net to zero; realized = funding − entry fees.
    assert_eq!(closed.realized_pnl, Some(dec!(12.5) - dec!(8)));
}

#[tokio::test]
async fn mark_liquidated_settles_with_surviving_leg() {
    let (manager, _alpha, _beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));
    let entry = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    let position = manager
        .create_position(&opportunity, &entry, dec!(10000))
        .await
        .unwrap();

    // Long leg on alpha was liquidated; the surviving short closed at
    // 49800: (50010 − 49800) × 0.2 = 42.
    let surviving_close = ExecutionResult {
        success: true,
        long_order: None,
        short_order: Some(filled_order(
            "beta",
            BTC,
            OrderSide::Buy,
            dec!(0.2),
            dec!(49800),
            Decimal::ZERO,
        )),
        error_message: None,
        execution_time_ms: 3,
    };

    let liquidated = manager
        .mark_liquidated(&position.id, "alpha", Some(&surviving_close))
        .await
        .unwrap();

    assert_eq!(liquidated.status, PositionStatus::Liquidated);
    assert_eq!(liquidated.realized_pnl, Some(dec!(42) - dec!(8)));
    assert!(liquidated.notes.unwrap().contains("alpha"));
    assert!(liquidated.close_timestamp.is_some());
}

#[tokio::test]
async fn reconcile_flags_missing_legs() {
    let (manager, alpha, beta) = manager().await;
    let opportunity = btc_opportunity(dec!(10000));
    let entry = entry_execution(dec!(50000), dec!(50010), dec!(0.2), dec!(4));
    let position = manager
        .create_position(&opportunity, &entry, dec!(10000))
        .await
        .unwrap();

    // Neither venue reports a position: both legs flagged.
    let issues = manager.reconcile_with_exchanges().await.unwrap();
    assert_eq!(issues.len(), 2);
    assert!(issues.iter().any(|i| i.contains("Long leg missing on alpha")));
    assert!(issues.iter().any(|i| i.contains("Short leg missing on beta")));

    let venue_position = |exchange: &str, side: PositionSide| VenuePosition {
        exchange: exchange.to_string(),
        symbol: BTC.to_string(),
        side,
        size: dec!(0.2),
        entry_price: dec!(50000),
        mark_price: dec!(50000),
        liquidation_price: None,
        unrealized_pnl: Decimal::ZERO,
        leverage: 5,
        margin_type: "isolated".to_string(),
        timestamp: Utc::now(),
    };

    alpha.set_position(venue_position("alpha", PositionSide::Long)).await;
    beta.set_position(venue_position("beta", PositionSide::Short)).await;

    assert!(manager.reconcile_with_exchanges().await.unwrap().is_empty());

    // Position closed locally: nothing left to reconcile.
    let mut exit = entry_execution(dec!(50000), dec!(50010), dec!(0.2), Decimal::ZERO);
    exit.long_order.as_mut().unwrap().side = OrderSide::Sell;
    exit.short_order.as_mut().unwrap().side = OrderSide::Buy;
    manager.close_position(&position.id, &exit).await.unwrap();
    assert!(manager.reconcile_with_exchanges().await.unwrap().is_empty());
}
