//! Instrument reference data.

use sqlx::{FromRow, PgExecutor};

use crate::error::Result;
use crate::types::instrument::Instrument;
use crate::types::order::InstrumentId;

#[derive(Debug, FromRow)]
pub struct InstrumentRow {
    pub id: i64,
    pub ticker: String,
    pub name: String,
    pub kind: String,
}

impl TryFrom<InstrumentRow> for Instrument {
    type Error = crate::error::Error;

    fn try_from(row: InstrumentRow) -> Result<Self> {
        Ok(Instrument {
            id: row.id,
            ticker: row.ticker,
            name: row.name,
            kind: row.kind.parse()?,
        })
    }
}

pub async fn get_instrument_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    id: InstrumentId,
) -> Result<Option<Instrument>> {
    let row = sqlx::query_as::<_, InstrumentRow>(
        "SELECT id, ticker, name, kind FROM instruments WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    row.map(Instrument::try_from).transpose()
}

pub async fn get_instrument_by_ticker<'e, E: PgExecutor<'e>>(
    executor: E,
    ticker: &str,
) -> Result<Option<Instrument>> {
    let row = sqlx::query_as::<_, InstrumentRow>(
        "SELECT id, ticker, name, kind FROM instruments WHERE ticker = $1",
    )
    .bind(ticker)
    .fetch_optional(executor)
    .await?;
    row.map(Instrument::try_from).transpose()
}
