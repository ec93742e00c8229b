use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::order::{InstrumentId, Qty, UserId};

/// A valued holding. Percentages are already multiplied by 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    pub instrument_id: InstrumentId,
    pub ticker: String,
    pub name: String,
    pub quantity: Qty,
    pub average_buy_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub total_return: Decimal,
    pub daily_return: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub user_id: UserId,
    pub total_balance: Decimal,
    pub available_cash: Decimal,
    pub positions: Vec<PositionView>,
}
