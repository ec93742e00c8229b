//! Concurrent orders for one user are serialized by the ledger's locked reads.

mod common;

use std::time::Duration;

use common::{fixture, fixture_with, order, sized};
use order_ledger::ErrorKind;
use order_ledger::ledger::{Ledger, LedgerTx, MemoryLedger};
use order_ledger::types::order::{OrderKind, OrderSide, OrderStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buys_cannot_overspend() {
    let fx = fixture().await;
    fx.deposit(1_000).await;

    // Each costs 900 (> 1000 / 2, <= 1000); together they need 1800.
    let input = sized(
        order(fx.user.id, fx.stock.id, OrderSide::Buy, OrderKind::Market),
        6,
    );
    let a = {
        let engine = fx.orders.clone();
        let input = input.clone();
        tokio::spawn(async move { engine.execute_order(&input).await })
    };
    let b = {
        let engine = fx.orders.clone();
        let input = input.clone();
        tokio::spawn(async move { engine.execute_order(&input).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    let mut statuses = vec![a.order.status, b.order.status];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![OrderStatus::Filled, OrderStatus::Rejected]);
    assert_eq!(
        fx.ledger.available_cash(fx.user.id, fx.cash.id).await.unwrap(),
        dec!(100)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_withdrawals_never_go_negative() {
    let fx = fixture().await;
    fx.deposit(500).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = fx.orders.clone();
        let input = sized(
            order(fx.user.id, fx.cash.id, OrderSide::CashOut, OrderKind::Market),
            100,
        );
        handles.push(tokio::spawn(async move { engine.execute_order(&input).await }));
    }

    let mut filled = 0;
    for handle in handles {
        let view = handle.await.unwrap().unwrap();
        if view.order.status == OrderStatus::Filled {
            filled += 1;
        } else {
            assert_eq!(view.order.status, OrderStatus::Rejected);
        }
    }
    assert_eq!(filled, 5);
    assert_eq!(
        fx.ledger.available_cash(fx.user.id, fx.cash.id).await.unwrap(),
        Decimal::ZERO
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sells_cannot_oversell() {
    let fx = fixture().await;
    fx.deposit(1_500).await;
    fx.market(OrderSide::Buy, 10).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let engine = fx.orders.clone();
        let input = sized(
            order(fx.user.id, fx.stock.id, OrderSide::Sell, OrderKind::Market),
            4,
        );
        handles.push(tokio::spawn(async move { engine.execute_order(&input).await }));
    }
    let mut filled = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().order.status == OrderStatus::Filled {
            filled += 1;
        }
    }
    assert_eq!(filled, 2);
}

#[tokio::test]
async fn lock_wait_timeout_surfaces_as_transient_and_writes_nothing() {
    let fx = fixture_with(MemoryLedger::new(Duration::from_millis(50))).await;
    fx.deposit(1_000).await;

    // Hold the user's rows in an open transaction.
    let mut holder = fx.ledger.begin().await.unwrap();
    holder
        .locked_available_cash(fx.user.id, fx.cash.id)
        .await
        .unwrap();

    let input = sized(
        order(fx.user.id, fx.stock.id, OrderSide::Buy, OrderKind::Market),
        1,
    );
    let err = fx.orders.execute_order(&input).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(fx.ledger.order_count().await, 1);

    holder.rollback().await.unwrap();
    let view = fx.orders.execute_order(&input).await.unwrap();
    assert_eq!(view.order.status, OrderStatus::Filled);
}
