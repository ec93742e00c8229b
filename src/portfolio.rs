//! Portfolio valuation: positions replayed from the ledger, valued at the
//! latest price snapshots. Reads take no locks.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::positions::{Holding, replay};
use crate::types::instrument::{Instrument, PriceSnapshot};
use crate::types::order::{InstrumentId, OrderStatus, UserId, round_output};
use crate::types::portfolio::{Portfolio, PositionView};

/// (to - from) / from x 100, or 0 when `from` is not positive. Unrounded.
pub fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    if from <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (to - from) / from * Decimal::ONE_HUNDRED
}

/// Value one holding. Returns the unrounded market value alongside the view.
pub fn value_position(
    instrument: &Instrument,
    holding: &Holding,
    snapshot: &PriceSnapshot,
) -> (Decimal, PositionView) {
    let average_buy_price = holding.average_cost().unwrap_or(Decimal::ZERO);
    let current_price = snapshot.close;
    let market_value = Decimal::from(holding.quantity) * current_price;
    let view = PositionView {
        instrument_id: instrument.id,
        ticker: instrument.ticker.clone(),
        name: instrument.name.clone(),
        quantity: holding.quantity,
        average_buy_price: round_output(average_buy_price),
        current_price,
        market_value: round_output(market_value),
        total_return: round_output(percent_change(average_buy_price, current_price)),
        daily_return: round_output(percent_change(snapshot.previous_close, current_price)),
    };
    (market_value, view)
}

pub struct PortfolioEngine {
    ledger: Arc<dyn Ledger>,
    cash_instrument_id: InstrumentId,
}

impl PortfolioEngine {
    pub fn new(ledger: Arc<dyn Ledger>, cash_instrument_id: InstrumentId) -> Self {
        Self {
            ledger,
            cash_instrument_id,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_user_portfolio(&self, user_id: UserId) -> Result<Portfolio> {
        self.ledger
            .find_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("User {user_id} not found")))?;

        let filled = self
            .ledger
            .find_orders_for_user(user_id, Some(OrderStatus::Filled))
            .await?;
        let available_cash = self
            .ledger
            .available_cash(user_id, self.cash_instrument_id)
            .await?;

        let mut valued: Vec<(Decimal, PositionView)> = Vec::new();
        for (instrument_id, holding) in replay(&filled, self.cash_instrument_id) {
            let Some(snapshot) = self.ledger.latest_price(instrument_id).await? else {
                warn!(instrument_id, "no price snapshot, position omitted");
                continue;
            };
            let Some(instrument) = self.ledger.find_instrument(instrument_id).await? else {
                warn!(instrument_id, "instrument missing, position omitted");
                continue;
            };
            valued.push(value_position(&instrument, &holding, &snapshot));
        }

        valued.sort_by(|a, b| b.0.cmp(&a.0));
        let invested: Decimal = valued.iter().map(|(value, _)| *value).sum();

        Ok(Portfolio {
            user_id,
            total_balance: round_output(available_cash + invested),
            available_cash: round_output(available_cash),
            positions: valued.into_iter().map(|(_, view)| view).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::instrument::InstrumentKind;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn percent_change_guards_non_positive_base() {
        assert_eq!(percent_change(dec!(100), dec!(110)), dec!(10));
        assert_eq!(percent_change(dec!(0), dec!(110)), dec!(0));
        assert_eq!(percent_change(dec!(-1), dec!(110)), dec!(0));
    }

    #[test]
    fn values_a_holding() {
        let instrument = Instrument {
            id: 7,
            ticker: "PAMP".into(),
            name: "Pampa Holding S.A.".into(),
            kind: InstrumentKind::Stock,
        };
        let holding = Holding {
            quantity: 6,
            total_cost: dec!(600),
        };
        let snapshot = PriceSnapshot {
            instrument_id: 7,
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            close: dec!(120),
            previous_close: dec!(112.5),
        };
        let (value, view) = value_position(&instrument, &holding, &snapshot);
        assert_eq!(value, dec!(720));
        assert_eq!(view.average_buy_price, dec!(100));
        assert_eq!(view.market_value, dec!(720));
        assert_eq!(view.total_return, dec!(20));
        assert_eq!(view.daily_return, dec!(6.67));
    }
}
