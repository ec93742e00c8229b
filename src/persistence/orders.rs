//! Order ledger queries: append, status update, locked and unlocked reads, paging.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgExecutor;

use crate::error::{Error, Result};
use crate::types::order::{
    InstrumentId, LedgerPage, NewOrder, Order, OrderId, OrderStatus, UserId,
};

const ORDER_COLUMNS: &str =
    "id, user_id, instrument_id, side, kind, size, price, status, created_at";

/// Rows that move cash: cash operations on the cash instrument, BUY/SELL off it.
const CASH_ROWS_FILTER: &str = "user_id = $1 AND status = 'FILLED' \
     AND ((instrument_id = $2 AND side IN ('CASH_IN', 'CASH_OUT')) \
       OR (instrument_id <> $2 AND side IN ('BUY', 'SELL')))";

#[derive(Debug, sqlx::FromRow)]
pub struct OrderRow {
    pub id: i64,
    pub user_id: i64,
    pub instrument_id: i64,
    pub side: String,
    pub kind: String,
    pub size: i64,
    pub price: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        if row.size < 0 || row.price.is_sign_negative() {
            return Err(Error::Internal(format!(
                "order {} has negative size or price",
                row.id
            )));
        }
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            instrument_id: row.instrument_id,
            side: row.side.parse()?,
            kind: row.kind.parse()?,
            size: row.size,
            price: row.price,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

fn rows_to_orders(rows: Vec<OrderRow>) -> Result<Vec<Order>> {
    rows.into_iter().map(Order::try_from).collect()
}

/// Append one ledger row and return it with its id and timestamp.
pub async fn insert_order<'e, E: PgExecutor<'e>>(executor: E, order: &NewOrder) -> Result<Order> {
    let sql = format!(
        "INSERT INTO orders (user_id, instrument_id, side, kind, size, price, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {ORDER_COLUMNS}"
    );
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order.user_id)
        .bind(order.instrument_id)
        .bind(order.side.as_str())
        .bind(order.kind.as_str())
        .bind(order.size)
        .bind(order.price)
        .bind(order.status.as_str())
        .fetch_one(executor)
        .await?;
    row.try_into()
}

/// Update order status (NEW -> CANCELLED is the only transition issued by the engine).
pub async fn update_order_status<'e, E: PgExecutor<'e>>(
    executor: E,
    id: OrderId,
    status: OrderStatus,
) -> Result<Order> {
    let sql = format!("UPDATE orders SET status = $1 WHERE id = $2 RETURNING {ORDER_COLUMNS}");
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(status.as_str())
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::not_found(format!("Order {id} not found")))?;
    row.try_into()
}

/// Get a single order by id without locking.
pub async fn get_order_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    order_id: OrderId,
) -> Result<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .fetch_optional(executor)
        .await?;
    row.map(Order::try_from).transpose()
}

/// Get a single order by id, holding an exclusive row lock until the transaction ends.
pub async fn lock_order_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    order_id: OrderId,
) -> Result<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .fetch_optional(executor)
        .await?;
    row.map(Order::try_from).transpose()
}

/// All orders for a user in creation order, optionally filtered by status.
pub async fn list_orders_for_user<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: UserId,
    status: Option<OrderStatus>,
) -> Result<Vec<Order>> {
    let rows = if let Some(status) = status {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 AND status = $2 \
             ORDER BY created_at, id"
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(user_id)
            .bind(status.as_str())
            .fetch_all(executor)
            .await?
    } else {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at, id"
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(user_id)
            .fetch_all(executor)
            .await?
    };
    rows_to_orders(rows)
}

/// Newest-first page keyed on created_at. Reads `limit + 1` rows to detect a next page.
pub async fn page_orders_for_user<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: UserId,
    limit: usize,
    cursor: Option<DateTime<Utc>>,
) -> Result<LedgerPage> {
    let fetch = limit as i64 + 1;
    let rows = if let Some(cursor) = cursor {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 AND created_at < $2 \
             ORDER BY created_at DESC, id DESC LIMIT $3"
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(user_id)
            .bind(cursor)
            .bind(fetch)
            .fetch_all(executor)
            .await?
    } else {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(user_id)
            .bind(fetch)
            .fetch_all(executor)
            .await?
    };
    Ok(LedgerPage::from_rows(rows_to_orders(rows)?, limit))
}

/// FILLED rows contributing to the user's cash, locked FOR UPDATE.
pub async fn lock_cash_rows<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: UserId,
    cash_instrument_id: InstrumentId,
) -> Result<Vec<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {CASH_ROWS_FILTER} FOR UPDATE");
    let rows = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(user_id)
        .bind(cash_instrument_id)
        .fetch_all(executor)
        .await?;
    rows_to_orders(rows)
}

/// FILLED BUY/SELL rows for one instrument, locked FOR UPDATE.
pub async fn lock_position_rows<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: UserId,
    instrument_id: InstrumentId,
) -> Result<Vec<Order>> {
    let sql = format!(
        "SELECT {ORDER_COLUMNS} FROM orders \
         WHERE user_id = $1 AND instrument_id = $2 AND status = 'FILLED' \
           AND side IN ('BUY', 'SELL') \
         FOR UPDATE"
    );
    let rows = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(user_id)
        .bind(instrument_id)
        .fetch_all(executor)
        .await?;
    rows_to_orders(rows)
}

/// Unlocked cash aggregate for read-only paths.
pub async fn sum_available_cash<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: UserId,
    cash_instrument_id: InstrumentId,
) -> Result<Decimal> {
    let sql = format!(
        "SELECT COALESCE(SUM(CASE WHEN side IN ('CASH_IN', 'SELL') THEN size * price \
                                  ELSE -(size * price) END), 0) \
         FROM orders WHERE {CASH_ROWS_FILTER}"
    );
    let cash = sqlx::query_scalar::<_, Decimal>(&sql)
        .bind(user_id)
        .bind(cash_instrument_id)
        .fetch_one(executor)
        .await?;
    Ok(cash)
}
