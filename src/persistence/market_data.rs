//! Price snapshots. Read-only to this crate.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgExecutor};

use crate::error::Result;
use crate::types::instrument::PriceSnapshot;
use crate::types::order::InstrumentId;

#[derive(Debug, FromRow)]
pub struct MarketDataRow {
    pub instrument_id: i64,
    pub date: NaiveDate,
    pub close: Decimal,
    pub previous_close: Decimal,
}

/// Most recent snapshot by date for an instrument.
pub async fn get_latest_price<'e, E: PgExecutor<'e>>(
    executor: E,
    instrument_id: InstrumentId,
) -> Result<Option<PriceSnapshot>> {
    let row = sqlx::query_as::<_, MarketDataRow>(
        "SELECT instrument_id, date, close, previous_close FROM market_data \
         WHERE instrument_id = $1 ORDER BY date DESC, id DESC LIMIT 1",
    )
    .bind(instrument_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|r| PriceSnapshot {
        instrument_id: r.instrument_id,
        date: r.date,
        close: r.close,
        previous_close: r.previous_close,
    }))
}
