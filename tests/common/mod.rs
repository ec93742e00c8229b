//! Shared fixtures: an in-memory ledger seeded with one user, the cash
//! instrument and one priced stock, wired into both engines.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use order_ledger::execution::OrderEngine;
use order_ledger::ledger::{Ledger, MemoryLedger};
use order_ledger::portfolio::PortfolioEngine;
use order_ledger::types::instrument::{Instrument, InstrumentKind, User};
use order_ledger::types::order::{
    CreateOrderInput, InstrumentId, OrderKind, OrderSide, OrderView, Qty, UserId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub struct Fixture {
    pub ledger: MemoryLedger,
    pub orders: Arc<OrderEngine>,
    pub portfolio: Arc<PortfolioEngine>,
    pub user: User,
    pub cash: Instrument,
    pub stock: Instrument,
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

pub async fn fixture() -> Fixture {
    fixture_with(MemoryLedger::default()).await
}

pub async fn fixture_with(ledger: MemoryLedger) -> Fixture {
    let user = ledger.add_user("trader@example.com", "10001").await;
    let cash = ledger
        .add_instrument("ARS", "Peso", InstrumentKind::Currency)
        .await;
    let stock = ledger
        .add_instrument("PAMP", "Pampa Holding S.A.", InstrumentKind::Stock)
        .await;
    ledger.add_price(stock.id, day(1), dec!(140.00), dec!(138.00)).await;
    ledger.add_price(stock.id, day(4), dec!(150.00), dec!(140.00)).await;

    let shared: Arc<dyn Ledger> = Arc::new(ledger.clone());
    Fixture {
        orders: Arc::new(OrderEngine::new(shared.clone(), cash.id)),
        portfolio: Arc::new(PortfolioEngine::new(shared, cash.id)),
        ledger,
        user,
        cash,
        stock,
    }
}

pub fn order(
    user_id: UserId,
    instrument_id: InstrumentId,
    side: OrderSide,
    kind: OrderKind,
) -> CreateOrderInput {
    CreateOrderInput {
        user_id,
        instrument_id,
        side,
        kind,
        size: None,
        amount: None,
        price: None,
    }
}

pub fn sized(mut input: CreateOrderInput, size: Qty) -> CreateOrderInput {
    input.size = Some(size);
    input
}

pub fn budget(mut input: CreateOrderInput, amount: Decimal) -> CreateOrderInput {
    input.amount = Some(amount);
    input
}

pub fn limit_at(mut input: CreateOrderInput, price: Decimal) -> CreateOrderInput {
    input.price = Some(price);
    input
}

impl Fixture {
    pub async fn deposit(&self, amount: Qty) -> OrderView {
        let input = sized(
            order(self.user.id, self.cash.id, OrderSide::CashIn, OrderKind::Market),
            amount,
        );
        self.orders.execute_order(&input).await.unwrap()
    }

    pub async fn market(&self, side: OrderSide, size: Qty) -> OrderView {
        let input = sized(order(self.user.id, self.stock.id, side, OrderKind::Market), size);
        self.orders.execute_order(&input).await.unwrap()
    }
}
