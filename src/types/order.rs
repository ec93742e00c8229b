use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub type OrderId = i64;
pub type UserId = i64;
pub type InstrumentId = i64;
pub type Price = Decimal;
pub type Qty = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
    CashIn,
    CashOut,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
            OrderSide::CashIn => "CASH_IN",
            OrderSide::CashOut => "CASH_OUT",
        }
    }

    pub fn is_cash(self) -> bool {
        matches!(self, OrderSide::CashIn | OrderSide::CashOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    #[default]
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
        }
    }
}

/// Lifecycle: NEW -> {FILLED, CANCELLED}; FILLED, REJECTED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

macro_rules! str_codec {
    ($ty:ty, $label:literal, { $($s:literal => $v:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($v),)+
                    other => Err(Error::Internal(format!("unknown {} '{}'", $label, other))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_codec!(OrderSide, "order side", {
    "BUY" => OrderSide::Buy,
    "SELL" => OrderSide::Sell,
    "CASH_IN" => OrderSide::CashIn,
    "CASH_OUT" => OrderSide::CashOut,
});

str_codec!(OrderKind, "order kind", {
    "MARKET" => OrderKind::Market,
    "LIMIT" => OrderKind::Limit,
});

str_codec!(OrderStatus, "order status", {
    "NEW" => OrderStatus::New,
    "FILLED" => OrderStatus::Filled,
    "REJECTED" => OrderStatus::Rejected,
    "CANCELLED" => OrderStatus::Cancelled,
});

/// One ledger row. The ledger is the only source of truth for cash and positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub size: Qty,
    pub price: Price,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// size x price, unrounded.
    pub fn notional(&self) -> Result<Decimal, Error> {
        Decimal::from(self.size)
            .checked_mul(self.price)
            .ok_or_else(|| Error::Internal(format!("Order {} notional overflows", self.id)))
    }

    /// Signed effect on available cash. Only FILLED rows count; cash operations
    /// count only on the cash instrument and BUY/SELL only off it.
    pub fn cash_effect(&self, cash_instrument_id: InstrumentId) -> Result<Decimal, Error> {
        if self.status != OrderStatus::Filled {
            return Ok(Decimal::ZERO);
        }
        let on_cash = self.instrument_id == cash_instrument_id;
        Ok(match self.side {
            OrderSide::CashIn if on_cash => self.notional()?,
            OrderSide::CashOut if on_cash => -self.notional()?,
            OrderSide::Sell if !on_cash => self.notional()?,
            OrderSide::Buy if !on_cash => -self.notional()?,
            _ => Decimal::ZERO,
        })
    }

    /// Signed effect on the held quantity of `self.instrument_id`.
    pub fn position_effect(&self) -> Qty {
        match (self.status, self.side) {
            (OrderStatus::Filled, OrderSide::Buy) => self.size,
            (OrderStatus::Filled, OrderSide::Sell) => -self.size,
            _ => 0,
        }
    }
}

/// Sum of the cash effects of `orders`.
pub fn cash_balance<'a>(
    orders: impl IntoIterator<Item = &'a Order>,
    cash_instrument_id: InstrumentId,
) -> Result<Decimal, Error> {
    orders.into_iter().try_fold(Decimal::ZERO, |acc, order| {
        acc.checked_add(order.cash_effect(cash_instrument_id)?)
            .ok_or_else(|| Error::Internal("cash balance overflows".to_string()))
    })
}

/// Fields of a row about to be appended; id and timestamp come from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub size: Qty,
    pub price: Price,
    pub status: OrderStatus,
}

/// Order request as handed over by the HTTP layer, already shape-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderInput {
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub kind: OrderKind,
    #[serde(default)]
    pub size: Option<Qty>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Price>,
}

/// Rounds to exactly two places for output. Internal arithmetic never rounds.
pub fn round_output(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// Order as returned to callers: the ledger row plus derived fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub total_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TryFrom<Order> for OrderView {
    type Error = Error;

    fn try_from(order: Order) -> Result<Self, Error> {
        let total_amount = round_output(order.notional()?);
        Ok(Self {
            order,
            total_amount,
            ticker: None,
            name: None,
        })
    }
}

impl OrderView {
    pub fn with_instrument(mut self, ticker: &str, name: &str) -> Self {
        self.ticker = Some(ticker.to_string());
        self.name = Some(name.to_string());
        self
    }
}

/// Formats a pagination cursor. Microsecond precision matches Postgres timestamptz.
pub fn format_cursor(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_cursor(cursor: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(cursor)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| Error::business(format!("Invalid cursor '{cursor}': expected an ISO-8601 timestamp")))
}

/// Raw page as read from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPage {
    pub orders: Vec<Order>,
    pub next_cursor: Option<DateTime<Utc>>,
    pub has_more: bool,
}

impl LedgerPage {
    /// Builds a page from up to `limit + 1` rows sorted newest first. The extra
    /// row only signals that another page exists and is dropped.
    pub fn from_rows(mut rows: Vec<Order>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }
        let next_cursor = if has_more {
            rows.last().map(|o| o.created_at)
        } else {
            None
        };
        Self {
            orders: rows,
            next_cursor,
            has_more,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPage {
    pub orders: Vec<OrderView>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl TryFrom<LedgerPage> for OrderPage {
    type Error = Error;

    fn try_from(page: LedgerPage) -> Result<Self, Error> {
        Ok(Self {
            orders: page
                .orders
                .into_iter()
                .map(OrderView::try_from)
                .collect::<Result<_, _>>()?,
            next_cursor: page.next_cursor.map(format_cursor),
            has_more: page.has_more,
        })
    }
}
