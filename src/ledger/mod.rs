//! Transactional ledger access: the only path by which the engines read or
//! write ledger rows.
//!
//! Writers open a [`LedgerTx`] through [`Ledger::begin`], pass it by `&mut`
//! into every call that belongs to the same atomic unit, and finish it with
//! [`LedgerTx::commit`] or [`LedgerTx::rollback`]. Dropping an unfinished
//! transaction rolls it back. Locked reads hold their locks until the
//! transaction ends; unlocked reads on [`Ledger`] never block writers.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::types::instrument::{Instrument, PriceSnapshot, User};
use crate::types::order::{
    InstrumentId, LedgerPage, NewOrder, Order, OrderId, OrderStatus, Qty, UserId,
};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Pool-level, unlocked access plus the transaction factory.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Start a READ COMMITTED transaction on a freshly acquired connection.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>>;

    async fn find_instrument(&self, id: InstrumentId) -> Result<Option<Instrument>>;

    async fn find_instrument_by_ticker(&self, ticker: &str) -> Result<Option<Instrument>>;

    async fn latest_price(&self, instrument_id: InstrumentId) -> Result<Option<PriceSnapshot>>;

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// All of a user's orders in ascending creation order.
    async fn find_orders_for_user(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>>;

    /// Newest-first page of at most `limit` orders created strictly before `cursor`.
    async fn page_orders(
        &self,
        user_id: UserId,
        limit: usize,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<LedgerPage>;

    /// Cash aggregate without locks, for read-only valuation.
    async fn available_cash(&self, user_id: UserId, cash_instrument_id: InstrumentId)
    -> Result<Decimal>;
}

/// One open transaction. Not reentrant: a transaction never opens another.
#[async_trait]
pub trait LedgerTx: Send {
    async fn find_user(&mut self, id: UserId) -> Result<Option<User>>;

    async fn find_instrument(&mut self, id: InstrumentId) -> Result<Option<Instrument>>;

    async fn latest_price(&mut self, instrument_id: InstrumentId) -> Result<Option<PriceSnapshot>>;

    /// Signed cash over the user's FILLED orders, with every contributing row
    /// exclusively locked until this transaction ends.
    async fn locked_available_cash(
        &mut self,
        user_id: UserId,
        cash_instrument_id: InstrumentId,
    ) -> Result<Decimal>;

    /// Net FILLED BUY/SELL quantity for one instrument, rows exclusively locked.
    async fn locked_position(&mut self, user_id: UserId, instrument_id: InstrumentId)
    -> Result<Qty>;

    /// Fetch one order holding an exclusive lock on its row.
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>>;

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order>;

    async fn update_order_status(&mut self, id: OrderId, status: OrderStatus) -> Result<Order>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
