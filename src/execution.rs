//! Order execution: intake, price and size resolution, validation under row
//! locks, and a single ledger append per call. Also cancellation and order
//! retrieval.
//!
//! Insufficient funds, insufficient shares and amounts too small for one unit
//! are not errors. They produce a persisted REJECTED order returned through
//! the success path.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerTx};
use crate::types::instrument::{Instrument, PriceSnapshot};
use crate::types::order::{
    CreateOrderInput, InstrumentId, NewOrder, Order, OrderId, OrderKind, OrderPage, OrderSide,
    OrderStatus, OrderView, Price, Qty, UserId, parse_cursor,
};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientFunds,
    InsufficientShares,
    AmountTooSmall,
}

/// Outcome of validating an order, before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Filled,
    /// LIMIT order accepted and resting as NEW.
    Resting,
    Rejected(RejectReason),
}

impl Decision {
    pub fn status(self) -> OrderStatus {
        match self {
            Decision::Filled => OrderStatus::Filled,
            Decision::Resting => OrderStatus::New,
            Decision::Rejected(_) => OrderStatus::Rejected,
        }
    }

    fn accepted(kind: OrderKind) -> Self {
        match kind {
            OrderKind::Market => Decision::Filled,
            OrderKind::Limit => Decision::Resting,
        }
    }
}

/// How the caller sized the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Units(Qty),
    /// Monetary budget; units are floor(amount / price).
    Amount(Decimal),
}

impl Quantity {
    pub fn from_input(input: &CreateOrderInput) -> Result<Self> {
        match (input.size, input.amount) {
            (Some(size), None) if size > 0 => Ok(Quantity::Units(size)),
            (None, Some(amount)) if amount > Decimal::ZERO => Ok(Quantity::Amount(amount)),
            (Some(_), None) => Err(Error::business("Order size must be positive")),
            (None, Some(_)) => Err(Error::business("Order amount must be positive")),
            _ => Err(Error::business(
                "Exactly one of size or amount must be provided",
            )),
        }
    }

    /// Units to execute at `price`. Never rounds up. The resulting notional
    /// must be representable.
    pub fn resolve(self, price: Price) -> Result<Qty> {
        let size = match self {
            Quantity::Units(size) => size,
            Quantity::Amount(amount) => amount
                .checked_div(price)
                .and_then(|units| units.floor().to_i64())
                .ok_or_else(|| Error::business("Order amount is too large"))?,
        };
        cost_of(size, price)?;
        Ok(size)
    }
}

/// LIMIT orders carry a positive price; MARKET orders carry none.
fn check_price_rule(input: &CreateOrderInput) -> Result<()> {
    match (input.kind, input.price) {
        (OrderKind::Limit, Some(price)) if price > Decimal::ZERO => Ok(()),
        (OrderKind::Limit, Some(_)) => Err(Error::business("Limit price must be positive")),
        (OrderKind::Limit, None) => Err(Error::business("Limit orders require a price")),
        (OrderKind::Market, Some(_)) => Err(Error::business("Market orders must not specify a price")),
        (OrderKind::Market, None) => Ok(()),
    }
}

fn cost_of(size: Qty, price: Price) -> Result<Decimal> {
    Decimal::from(size)
        .checked_mul(price)
        .ok_or_else(|| Error::business("Order notional is too large"))
}

pub fn decide_buy(kind: OrderKind, size: Qty, price: Price, available_cash: Decimal) -> Result<Decision> {
    if size == 0 {
        return Ok(Decision::Rejected(RejectReason::AmountTooSmall));
    }
    if cost_of(size, price)? > available_cash {
        return Ok(Decision::Rejected(RejectReason::InsufficientFunds));
    }
    Ok(Decision::accepted(kind))
}

pub fn decide_sell(kind: OrderKind, size: Qty, held: Qty) -> Decision {
    if size == 0 {
        return Decision::Rejected(RejectReason::AmountTooSmall);
    }
    if size > held {
        return Decision::Rejected(RejectReason::InsufficientShares);
    }
    Decision::accepted(kind)
}

pub fn decide_cash(side: OrderSide, size: Qty, available_cash: Option<Decimal>) -> Decision {
    if size == 0 {
        return Decision::Rejected(RejectReason::AmountTooSmall);
    }
    match (side, available_cash) {
        (OrderSide::CashOut, Some(cash)) if Decimal::from(size) > cash => {
            Decision::Rejected(RejectReason::InsufficientFunds)
        }
        _ => Decision::Filled,
    }
}

pub struct OrderEngine {
    ledger: Arc<dyn Ledger>,
    cash_instrument_id: InstrumentId,
}

impl OrderEngine {
    pub fn new(ledger: Arc<dyn Ledger>, cash_instrument_id: InstrumentId) -> Self {
        Self {
            ledger,
            cash_instrument_id,
        }
    }

    /// Execute one order inside a single ledger transaction and return the
    /// persisted row. A REJECTED order is a successful result.
    #[instrument(skip(self, input), fields(user_id = input.user_id, instrument_id = input.instrument_id, side = %input.side))]
    pub async fn execute_order(&self, input: &CreateOrderInput) -> Result<OrderView> {
        let mut tx = self.ledger.begin().await?;
        let executed = self
            .execute_in(tx.as_mut(), input)
            .await
            .and_then(OrderView::try_from);
        match executed {
            Ok(view) => {
                tx.commit().await?;
                Ok(view)
            }
            Err(err) => {
                abort(tx.as_mut(), &err).await;
                Err(err)
            }
        }
    }

    async fn execute_in(&self, tx: &mut dyn LedgerTx, input: &CreateOrderInput) -> Result<Order> {
        let quantity = Quantity::from_input(input)?;
        check_price_rule(input)?;

        tx.find_user(input.user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("User {} not found", input.user_id)))?;
        let instrument = tx
            .find_instrument(input.instrument_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Instrument {} not found", input.instrument_id)))?;

        if input.side.is_cash() {
            self.cash_operation(tx, input, &instrument, quantity).await
        } else {
            self.stock_operation(tx, input, &instrument, quantity).await
        }
    }

    async fn cash_operation(
        &self,
        tx: &mut dyn LedgerTx,
        input: &CreateOrderInput,
        instrument: &Instrument,
        quantity: Quantity,
    ) -> Result<Order> {
        if instrument.id != self.cash_instrument_id {
            return Err(Error::business(format!(
                "{} must use the cash instrument, got {}",
                input.side, instrument.ticker
            )));
        }
        let price = Decimal::ONE;
        let size = quantity.resolve(price)?;
        let available = if input.side == OrderSide::CashOut && size > 0 {
            Some(tx.locked_available_cash(input.user_id, self.cash_instrument_id).await?)
        } else {
            None
        };
        let decision = decide_cash(input.side, size, available);
        let row = ledger_row(input, OrderKind::Market, size, price, decision);
        self.record(tx, row, decision, None).await
    }

    async fn stock_operation(
        &self,
        tx: &mut dyn LedgerTx,
        input: &CreateOrderInput,
        instrument: &Instrument,
        quantity: Quantity,
    ) -> Result<Order> {
        if instrument.id == self.cash_instrument_id {
            return Err(Error::business(format!(
                "{} is the cash instrument and cannot be traded with {}",
                instrument.ticker, input.side
            )));
        }

        // Price snapshots are read without a lock.
        let snapshot = tx.latest_price(instrument.id).await?;
        let price = match input.kind {
            OrderKind::Market => snapshot
                .as_ref()
                .map(|s| s.close)
                .filter(|close| *close > Decimal::ZERO)
                .ok_or_else(|| {
                    Error::business(format!(
                        "No market price available for {}",
                        instrument.ticker
                    ))
                })?,
            OrderKind::Limit => input
                .price
                .ok_or_else(|| Error::business("Limit orders require a price"))?,
        };

        let size = quantity.resolve(price)?;
        let decision = match input.side {
            _ if size == 0 => Decision::Rejected(RejectReason::AmountTooSmall),
            OrderSide::Buy => {
                let cash = tx
                    .locked_available_cash(input.user_id, self.cash_instrument_id)
                    .await?;
                decide_buy(input.kind, size, price, cash)?
            }
            OrderSide::Sell => {
                let held = tx.locked_position(input.user_id, instrument.id).await?;
                decide_sell(input.kind, size, held)
            }
            OrderSide::CashIn | OrderSide::CashOut => {
                return Err(Error::Internal(format!(
                    "{} routed to stock execution",
                    input.side
                )));
            }
        };
        let row = ledger_row(input, input.kind, size, price, decision);
        self.record(tx, row, decision, snapshot.as_ref()).await
    }

    async fn record(
        &self,
        tx: &mut dyn LedgerTx,
        row: NewOrder,
        decision: Decision,
        snapshot: Option<&PriceSnapshot>,
    ) -> Result<Order> {
        let (size, price) = (row.size, row.price);
        let order = tx.insert_order(row).await?;

        let snapshot_date = snapshot.map(|s| s.date);
        match decision {
            Decision::Rejected(reason) => info!(
                order_id = order.id,
                ?reason,
                %price,
                size,
                ?snapshot_date,
                "order rejected"
            ),
            _ => info!(
                order_id = order.id,
                kind = %order.kind,
                status = %order.status,
                %price,
                size,
                ?snapshot_date,
                "order executed"
            ),
        }
        Ok(order)
    }

    /// Cancel a resting order owned by `user_id`. The row stays locked from
    /// read to update so a concurrent fill or cancel cannot interleave.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId, user_id: UserId) -> Result<OrderView> {
        let mut tx = self.ledger.begin().await?;
        match cancel_in(tx.as_mut(), order_id, user_id).await {
            Ok(view) => {
                tx.commit().await?;
                info!(order_id, "order cancelled");
                Ok(view)
            }
            Err(err) => {
                abort(tx.as_mut(), &err).await;
                Err(err)
            }
        }
    }

    pub async fn get_order_by_id(&self, order_id: OrderId) -> Result<OrderView> {
        let order = self
            .ledger
            .find_order(order_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Order {order_id} not found")))?;
        let instrument = self.ledger.find_instrument(order.instrument_id).await?;
        let view = OrderView::try_from(order)?;
        Ok(match instrument {
            Some(i) => view.with_instrument(&i.ticker, &i.name),
            None => view,
        })
    }

    /// Newest-first page of a user's orders. `limit` defaults to 50 and is
    /// clamped to 1..=200.
    pub async fn get_user_orders(
        &self,
        user_id: UserId,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<OrderPage> {
        self.ledger
            .find_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("User {user_id} not found")))?;
        let limit = limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        let cursor = cursor.map(parse_cursor).transpose()?;
        let page = self.ledger.page_orders(user_id, limit, cursor).await?;
        OrderPage::try_from(page)
    }
}

async fn cancel_in(tx: &mut dyn LedgerTx, order_id: OrderId, user_id: UserId) -> Result<OrderView> {
    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Order {order_id} not found")))?;
    if order.user_id != user_id {
        return Err(Error::business(format!(
            "Order {order_id} not found or not owned by user {user_id}"
        )));
    }
    if order.status != OrderStatus::New {
        return Err(Error::business(format!(
            "Order cannot be cancelled: status is {}",
            order.status
        )));
    }
    let updated = tx
        .update_order_status(order_id, OrderStatus::Cancelled)
        .await?;
    let instrument = tx
        .find_instrument(updated.instrument_id)
        .await?
        .ok_or_else(|| Error::Internal(format!("Instrument {} missing", updated.instrument_id)))?;
    Ok(OrderView::try_from(updated)?.with_instrument(&instrument.ticker, &instrument.name))
}

fn ledger_row(
    input: &CreateOrderInput,
    kind: OrderKind,
    size: Qty,
    price: Price,
    decision: Decision,
) -> NewOrder {
    NewOrder {
        user_id: input.user_id,
        instrument_id: input.instrument_id,
        side: input.side,
        kind,
        size,
        price,
        status: decision.status(),
    }
}

/// Roll back after a failed body. The original error is what the caller sees.
async fn abort(tx: &mut dyn LedgerTx, err: &Error) {
    warn!(error = %err, kind = %err.kind(), "rolling back ledger transaction");
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "rollback failed; connection release will discard the transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rust_decimal_macros::dec;

    fn input(size: Option<Qty>, amount: Option<Decimal>) -> CreateOrderInput {
        CreateOrderInput {
            user_id: 1,
            instrument_id: 2,
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            size,
            amount,
            price: None,
        }
    }

    #[test]
    fn amount_floors_to_whole_units() {
        let q = Quantity::from_input(&input(None, Some(dec!(1000)))).unwrap();
        assert_eq!(q.resolve(dec!(150.00)).unwrap(), 6);
        let dust = Quantity::from_input(&input(None, Some(dec!(50)))).unwrap();
        assert_eq!(dust.resolve(dec!(150.00)).unwrap(), 0);
    }

    #[test]
    fn unrepresentable_sizes_are_business_errors() {
        let huge = Quantity::Amount(Decimal::MAX);
        let err = huge.resolve(dec!(0.0000000001)).unwrap_err();
        assert_eq!(err.to_string(), "Order amount is too large");
        let err = Quantity::Amount(dec!(100000000000000000000))
            .resolve(dec!(1))
            .unwrap_err();
        assert_eq!(err.to_string(), "Order amount is too large");
        let err = Quantity::Units(i64::MAX).resolve(dec!(100000000000)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
    }

    #[test]
    fn size_and_amount_are_mutually_exclusive() {
        assert!(Quantity::from_input(&input(Some(1), Some(dec!(10)))).is_err());
        assert!(Quantity::from_input(&input(None, None)).is_err());
        assert!(Quantity::from_input(&input(Some(0), None)).is_err());
        assert!(Quantity::from_input(&input(None, Some(dec!(-5)))).is_err());
    }

    #[test]
    fn price_rule_depends_on_kind() {
        let mut order = input(Some(1), None);
        assert!(check_price_rule(&order).is_ok());
        order.price = Some(dec!(10));
        assert!(check_price_rule(&order).is_err());
        order.kind = OrderKind::Limit;
        assert!(check_price_rule(&order).is_ok());
        order.price = None;
        assert!(check_price_rule(&order).is_err());
    }

    #[test]
    fn buy_decisions() {
        assert_eq!(
            decide_buy(OrderKind::Market, 6, dec!(150), dec!(900)).unwrap(),
            Decision::Filled
        );
        assert_eq!(
            decide_buy(OrderKind::Limit, 6, dec!(150), dec!(900)).unwrap(),
            Decision::Resting
        );
        assert_eq!(
            decide_buy(OrderKind::Market, 7, dec!(150), dec!(900)).unwrap(),
            Decision::Rejected(RejectReason::InsufficientFunds)
        );
        assert_eq!(
            decide_buy(OrderKind::Market, 0, dec!(150), dec!(900)).unwrap(),
            Decision::Rejected(RejectReason::AmountTooSmall)
        );
    }

    #[test]
    fn sell_and_cash_decisions() {
        assert_eq!(decide_sell(OrderKind::Market, 4, 10), Decision::Filled);
        assert_eq!(
            decide_sell(OrderKind::Market, 11, 10),
            Decision::Rejected(RejectReason::InsufficientShares)
        );
        assert_eq!(decide_cash(OrderSide::CashIn, 100, None), Decision::Filled);
        assert_eq!(
            decide_cash(OrderSide::CashOut, 101, Some(dec!(100))),
            Decision::Rejected(RejectReason::InsufficientFunds)
        );
        assert_eq!(
            decide_cash(OrderSide::CashOut, 100, Some(dec!(100))),
            Decision::Filled
        );
    }
}
