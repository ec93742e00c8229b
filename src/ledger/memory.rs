//! In-process ledger with the same locking contract as Postgres.
//!
//! Locked reads take an exclusive per-user lock held until commit or rollback,
//! mirroring the user-row lock the Postgres ledger queues on. Writes are staged
//! in the transaction and applied atomically on commit; rollback or drop
//! discards them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerTx};
use crate::types::instrument::{Instrument, InstrumentKind, PriceSnapshot, User};
use crate::types::order::{
    InstrumentId, LedgerPage, NewOrder, Order, OrderId, OrderStatus, Qty, UserId, cash_balance,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct State {
    users: BTreeMap<UserId, User>,
    instruments: BTreeMap<InstrumentId, Instrument>,
    prices: Vec<PriceSnapshot>,
    orders: BTreeMap<OrderId, Order>,
}

impl State {
    fn latest_price(&self, instrument_id: InstrumentId) -> Option<PriceSnapshot> {
        self.prices
            .iter()
            .filter(|p| p.instrument_id == instrument_id)
            .max_by_key(|p| p.date)
            .cloned()
    }
}

/// Hands out order ids and strictly increasing microsecond timestamps.
struct Sequencer {
    last_id: OrderId,
    last_ts: DateTime<Utc>,
}

impl Sequencer {
    fn next(&mut self) -> (OrderId, DateTime<Utc>) {
        self.last_id += 1;
        let now = truncate_to_micros(Utc::now());
        self.last_ts = if now > self.last_ts {
            now
        } else {
            self.last_ts + chrono::Duration::microseconds(1)
        };
        (self.last_id, self.last_ts)
    }
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

struct Inner {
    state: RwLock<State>,
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    sequencer: Mutex<Sequencer>,
    lock_timeout: Duration,
}

#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl MemoryLedger {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                user_locks: Mutex::new(HashMap::new()),
                sequencer: Mutex::new(Sequencer {
                    last_id: 0,
                    last_ts: DateTime::<Utc>::MIN_UTC,
                }),
                lock_timeout,
            }),
        }
    }

    pub async fn add_user(&self, email: &str, account_number: &str) -> User {
        let mut state = self.inner.state.write().await;
        let id = state.users.keys().next_back().map_or(1, |last| last + 1);
        let user = User {
            id,
            email: email.to_string(),
            account_number: account_number.to_string(),
        };
        state.users.insert(id, user.clone());
        user
    }

    pub async fn add_instrument(&self, ticker: &str, name: &str, kind: InstrumentKind) -> Instrument {
        let mut state = self.inner.state.write().await;
        let id = state.instruments.keys().next_back().map_or(1, |last| last + 1);
        let instrument = Instrument {
            id,
            ticker: ticker.to_string(),
            name: name.to_string(),
            kind,
        };
        state.instruments.insert(id, instrument.clone());
        instrument
    }

    pub async fn add_price(
        &self,
        instrument_id: InstrumentId,
        date: NaiveDate,
        close: Decimal,
        previous_close: Decimal,
    ) {
        self.inner.state.write().await.prices.push(PriceSnapshot {
            instrument_id,
            date,
            close,
            previous_close,
        });
    }

    /// Append a row outside any engine logic, committed immediately.
    pub async fn append_order(&self, order: NewOrder) -> Order {
        let order = self.inner.stamp(order).await;
        self.inner
            .state
            .write()
            .await
            .orders
            .insert(order.id, order.clone());
        order
    }

    pub async fn order_count(&self) -> usize {
        self.inner.state.read().await.orders.len()
    }
}

impl Inner {
    async fn stamp(&self, order: NewOrder) -> Order {
        let (id, created_at) = self.sequencer.lock().await.next();
        Order {
            id,
            user_id: order.user_id,
            instrument_id: order.instrument_id,
            side: order.side,
            kind: order.kind,
            size: order.size,
            price: order.price,
            status: order.status,
            created_at,
        }
    }

    async fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.user_locks
            .lock()
            .await
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            held: HashMap::new(),
            staged: Vec::new(),
            finished: false,
        }))
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.state.read().await.users.get(&id).cloned())
    }

    async fn find_instrument(&self, id: InstrumentId) -> Result<Option<Instrument>> {
        Ok(self.inner.state.read().await.instruments.get(&id).cloned())
    }

    async fn find_instrument_by_ticker(&self, ticker: &str) -> Result<Option<Instrument>> {
        let state = self.inner.state.read().await;
        Ok(state.instruments.values().find(|i| i.ticker == ticker).cloned())
    }

    async fn latest_price(&self, instrument_id: InstrumentId) -> Result<Option<PriceSnapshot>> {
        Ok(self.inner.state.read().await.latest_price(instrument_id))
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.inner.state.read().await.orders.get(&id).cloned())
    }

    async fn find_orders_for_user(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>> {
        let state = self.inner.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        Ok(orders)
    }

    async fn page_orders(
        &self,
        user_id: UserId,
        limit: usize,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<LedgerPage> {
        let state = self.inner.state.read().await;
        let mut rows: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && cursor.is_none_or(|c| o.created_at < c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit + 1);
        Ok(LedgerPage::from_rows(rows, limit))
    }

    async fn available_cash(
        &self,
        user_id: UserId,
        cash_instrument_id: InstrumentId,
    ) -> Result<Decimal> {
        let state = self.inner.state.read().await;
        cash_balance(
            state.orders.values().filter(|o| o.user_id == user_id),
            cash_instrument_id,
        )
    }
}

enum Staged {
    Insert(Order),
    Status(OrderId, OrderStatus),
}

struct MemoryTx {
    inner: Arc<Inner>,
    held: HashMap<UserId, OwnedMutexGuard<()>>,
    staged: Vec<Staged>,
    finished: bool,
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Internal(
                "ledger transaction already finished".to_string(),
            ));
        }
        Ok(())
    }

    /// Acquire the user's exclusive lock once per transaction.
    async fn lock_user(&mut self, user_id: UserId) -> Result<()> {
        self.ensure_open()?;
        if self.held.contains_key(&user_id) {
            return Ok(());
        }
        let lock = self.inner.user_lock(user_id).await;
        let guard = tokio::time::timeout(self.inner.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                Error::Transient(format!("lock wait timed out for rows of user {user_id}"))
            })?;
        self.held.insert(user_id, guard);
        Ok(())
    }

    /// Committed rows with this transaction's own staged writes applied.
    async fn visible_orders(&self) -> BTreeMap<OrderId, Order> {
        let mut orders = self.inner.state.read().await.orders.clone();
        apply_staged(&mut orders, &self.staged);
        orders
    }

    fn release(&mut self) {
        self.staged.clear();
        self.held.clear();
        self.finished = true;
    }
}

fn apply_staged(orders: &mut BTreeMap<OrderId, Order>, staged: &[Staged]) {
    for change in staged {
        match change {
            Staged::Insert(order) => {
                orders.insert(order.id, order.clone());
            }
            Staged::Status(id, status) => {
                if let Some(order) = orders.get_mut(id) {
                    order.status = *status;
                }
            }
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn find_user(&mut self, id: UserId) -> Result<Option<User>> {
        self.ensure_open()?;
        Ok(self.inner.state.read().await.users.get(&id).cloned())
    }

    async fn find_instrument(&mut self, id: InstrumentId) -> Result<Option<Instrument>> {
        self.ensure_open()?;
        Ok(self.inner.state.read().await.instruments.get(&id).cloned())
    }

    async fn latest_price(&mut self, instrument_id: InstrumentId) -> Result<Option<PriceSnapshot>> {
        self.ensure_open()?;
        Ok(self.inner.state.read().await.latest_price(instrument_id))
    }

    async fn locked_available_cash(
        &mut self,
        user_id: UserId,
        cash_instrument_id: InstrumentId,
    ) -> Result<Decimal> {
        self.lock_user(user_id).await?;
        let visible = self.visible_orders().await;
        cash_balance(
            visible.values().filter(|o| o.user_id == user_id),
            cash_instrument_id,
        )
    }

    async fn locked_position(
        &mut self,
        user_id: UserId,
        instrument_id: InstrumentId,
    ) -> Result<Qty> {
        self.lock_user(user_id).await?;
        Ok(self
            .visible_orders()
            .await
            .values()
            .filter(|o| o.user_id == user_id && o.instrument_id == instrument_id)
            .map(Order::position_effect)
            .sum())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        self.ensure_open()?;
        let owner = match self.visible_orders().await.get(&id) {
            Some(order) => order.user_id,
            None => return Ok(None),
        };
        self.lock_user(owner).await?;
        // Re-read: the previous lock holder may have changed the row.
        Ok(self.visible_orders().await.remove(&id))
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        self.ensure_open()?;
        let order = self.inner.stamp(order).await;
        self.staged.push(Staged::Insert(order.clone()));
        Ok(order)
    }

    async fn update_order_status(&mut self, id: OrderId, status: OrderStatus) -> Result<Order> {
        self.ensure_open()?;
        let mut order = self
            .visible_orders()
            .await
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("Order {id} not found")))?;
        order.status = status;
        self.staged.push(Staged::Status(id, status));
        Ok(order)
    }

    async fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        {
            let mut state = self.inner.state.write().await;
            apply_staged(&mut state.orders, &self.staged);
        }
        debug!(changes = self.staged.len(), "ledger transaction committed");
        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.finished {
            warn!(discarded = self.staged.len(), "ledger transaction rolled back");
            self.release();
        }
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            warn!("ledger transaction dropped without commit, rolling back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::order::{OrderKind, OrderSide};
    use rust_decimal_macros::dec;

    fn cash_in(user_id: UserId, cash_id: InstrumentId, size: Qty) -> NewOrder {
        NewOrder {
            user_id,
            instrument_id: cash_id,
            side: OrderSide::CashIn,
            kind: OrderKind::Market,
            size,
            price: dec!(1),
            status: OrderStatus::Filled,
        }
    }

    #[tokio::test]
    async fn staged_insert_is_invisible_until_commit() {
        let ledger = MemoryLedger::default();
        let user = ledger.add_user("a@example.com", "A1").await;
        let cash = ledger.add_instrument("ARS", "Pesos", InstrumentKind::Currency).await;

        let mut tx = ledger.begin().await.unwrap();
        tx.insert_order(cash_in(user.id, cash.id, 100)).await.unwrap();
        assert_eq!(tx.locked_available_cash(user.id, cash.id).await.unwrap(), dec!(100));
        assert_eq!(ledger.available_cash(user.id, cash.id).await.unwrap(), dec!(0));

        tx.commit().await.unwrap();
        assert_eq!(ledger.available_cash(user.id, cash.id).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes_and_releases_lock() {
        let ledger = MemoryLedger::new(Duration::from_millis(200));
        let user = ledger.add_user("a@example.com", "A1").await;
        let cash = ledger.add_instrument("ARS", "Pesos", InstrumentKind::Currency).await;

        {
            let mut tx = ledger.begin().await.unwrap();
            tx.locked_available_cash(user.id, cash.id).await.unwrap();
            tx.insert_order(cash_in(user.id, cash.id, 100)).await.unwrap();
        }
        assert_eq!(ledger.order_count().await, 0);

        let mut tx = ledger.begin().await.unwrap();
        assert!(tx.locked_available_cash(user.id, cash.id).await.is_ok());
    }

    #[tokio::test]
    async fn lock_wait_times_out_as_transient() {
        let ledger = MemoryLedger::new(Duration::from_millis(50));
        let user = ledger.add_user("a@example.com", "A1").await;
        let cash = ledger.add_instrument("ARS", "Pesos", InstrumentKind::Currency).await;

        let mut holder = ledger.begin().await.unwrap();
        holder.locked_available_cash(user.id, cash.id).await.unwrap();

        let mut waiter = ledger.begin().await.unwrap();
        let err = waiter.locked_position(user.id, 7).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let ledger = MemoryLedger::default();
        let user = ledger.add_user("a@example.com", "A1").await;
        let cash = ledger.add_instrument("ARS", "Pesos", InstrumentKind::Currency).await;
        let a = ledger.append_order(cash_in(user.id, cash.id, 1)).await;
        let b = ledger.append_order(cash_in(user.id, cash.id, 1)).await;
        assert!(b.created_at > a.created_at);
        assert!(b.id > a.id);
    }
}
