//! Postgres-backed ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerTx};
use crate::persistence;
use crate::types::instrument::{Instrument, PriceSnapshot, User};
use crate::types::order::{
    InstrumentId, LedgerPage, NewOrder, Order, OrderId, OrderStatus, Qty, UserId, cash_balance,
};

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    statement_timeout_ms: u64,
    lock_timeout_ms: u64,
}

impl PgLedger {
    pub fn new(pool: PgPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            statement_timeout_ms: config.statement_timeout_ms,
            lock_timeout_ms: config.lock_timeout_ms,
        }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        let statement_timeout = format!("SET LOCAL statement_timeout = {}", self.statement_timeout_ms);
        let lock_timeout = format!("SET LOCAL lock_timeout = {}", self.lock_timeout_ms);
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&statement_timeout).execute(&mut *tx).await?;
        sqlx::query(&lock_timeout).execute(&mut *tx).await?;
        debug!("ledger transaction started");
        Ok(Box::new(PgTx { tx: Some(tx) }))
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        persistence::get_user_by_id(&self.pool, id).await
    }

    async fn find_instrument(&self, id: InstrumentId) -> Result<Option<Instrument>> {
        persistence::get_instrument_by_id(&self.pool, id).await
    }

    async fn find_instrument_by_ticker(&self, ticker: &str) -> Result<Option<Instrument>> {
        persistence::get_instrument_by_ticker(&self.pool, ticker).await
    }

    async fn latest_price(&self, instrument_id: InstrumentId) -> Result<Option<PriceSnapshot>> {
        persistence::get_latest_price(&self.pool, instrument_id).await
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>> {
        persistence::get_order_by_id(&self.pool, id).await
    }

    async fn find_orders_for_user(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>> {
        persistence::list_orders_for_user(&self.pool, user_id, status).await
    }

    async fn page_orders(
        &self,
        user_id: UserId,
        limit: usize,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<LedgerPage> {
        persistence::page_orders_for_user(&self.pool, user_id, limit, cursor).await
    }

    async fn available_cash(
        &self,
        user_id: UserId,
        cash_instrument_id: InstrumentId,
    ) -> Result<Decimal> {
        persistence::sum_available_cash(&self.pool, user_id, cash_instrument_id).await
    }
}

/// Open Postgres transaction. sqlx rolls back a dropped, uncommitted transaction
/// when its connection returns to the pool.
struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| Error::Internal("ledger transaction already finished".to_string()))
    }
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn find_user(&mut self, id: UserId) -> Result<Option<User>> {
        persistence::get_user_by_id(self.conn()?, id).await
    }

    async fn find_instrument(&mut self, id: InstrumentId) -> Result<Option<Instrument>> {
        persistence::get_instrument_by_id(self.conn()?, id).await
    }

    async fn latest_price(&mut self, instrument_id: InstrumentId) -> Result<Option<PriceSnapshot>> {
        persistence::get_latest_price(self.conn()?, instrument_id).await
    }

    async fn locked_available_cash(
        &mut self,
        user_id: UserId,
        cash_instrument_id: InstrumentId,
    ) -> Result<Decimal> {
        // Row locks alone would not make a waiting transaction see rows inserted
        // by the holder, so queue on the user row first.
        persistence::lock_user(self.conn()?, user_id).await?;
        let rows = persistence::lock_cash_rows(self.conn()?, user_id, cash_instrument_id).await?;
        cash_balance(&rows, cash_instrument_id)
    }

    async fn locked_position(
        &mut self,
        user_id: UserId,
        instrument_id: InstrumentId,
    ) -> Result<Qty> {
        persistence::lock_user(self.conn()?, user_id).await?;
        let rows = persistence::lock_position_rows(self.conn()?, user_id, instrument_id).await?;
        Ok(rows.iter().map(Order::position_effect).sum())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        persistence::lock_order_by_id(self.conn()?, id).await
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        persistence::insert_order(self.conn()?, &order).await
    }

    async fn update_order_status(&mut self, id: OrderId, status: OrderStatus) -> Result<Order> {
        persistence::update_order_status(self.conn()?, id, status).await
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!("ledger transaction committed");
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            warn!("ledger transaction rolled back");
        }
        Ok(())
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("ledger transaction dropped without commit, rolling back");
        }
    }
}
