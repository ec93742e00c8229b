//! Position reconstruction from FILLED ledger rows.
//! Pure and testable without a ledger.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::warn;

use crate::types::order::{InstrumentId, Order, OrderSide, OrderStatus, Qty};

/// Running quantity and cost basis for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Holding {
    pub quantity: Qty,
    pub total_cost: Decimal,
}

impl Holding {
    /// Cost basis per held unit. None when nothing is held.
    pub fn average_cost(&self) -> Option<Decimal> {
        if self.quantity == 0 {
            None
        } else {
            Some(self.total_cost / Decimal::from(self.quantity))
        }
    }

    /// Apply one fill. Buys add at their price; sells remove units at the
    /// current average cost, so the average of what remains is unchanged.
    /// Returns false when a sell arrives against an empty holding.
    pub fn apply(&mut self, side: OrderSide, size: Qty, price: Decimal) -> bool {
        match side {
            OrderSide::Buy => {
                self.quantity += size;
                self.total_cost += Decimal::from(size) * price;
                true
            }
            OrderSide::Sell => match self.average_cost() {
                None => false,
                Some(average) => {
                    self.quantity -= size;
                    self.total_cost -= Decimal::from(size) * average;
                    true
                }
            },
            OrderSide::CashIn | OrderSide::CashOut => true,
        }
    }
}

/// Replay FILLED BUY/SELL orders in creation order into per-instrument
/// holdings. Orders on the cash instrument are ignored and flat holdings are
/// dropped.
pub fn replay(orders: &[Order], cash_instrument_id: InstrumentId) -> BTreeMap<InstrumentId, Holding> {
    let mut fills: Vec<&Order> = orders
        .iter()
        .filter(|o| {
            o.status == OrderStatus::Filled
                && o.instrument_id != cash_instrument_id
                && matches!(o.side, OrderSide::Buy | OrderSide::Sell)
        })
        .collect();
    fills.sort_by_key(|o| (o.created_at, o.id));

    let mut holdings: BTreeMap<InstrumentId, Holding> = BTreeMap::new();
    for order in fills {
        let holding = holdings.entry(order.instrument_id).or_default();
        if !holding.apply(order.side, order.size, order.price) {
            warn!(
                order_id = order.id,
                instrument_id = order.instrument_id,
                "sell replayed against zero quantity, skipping"
            );
        }
    }

    holdings.retain(|_, h| h.quantity != 0);
    holdings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::order::OrderKind;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    const CASH: InstrumentId = 1;
    const STOCK: InstrumentId = 7;

    fn fills(legs: &[(OrderSide, Qty, Decimal)]) -> Vec<Order> {
        let start = Utc::now();
        legs.iter()
            .enumerate()
            .map(|(i, (side, size, price))| Order {
                id: i as i64 + 1,
                user_id: 1,
                instrument_id: STOCK,
                side: *side,
                kind: OrderKind::Market,
                size: *size,
                price: *price,
                status: OrderStatus::Filled,
                created_at: start + Duration::seconds(i as i64),
            })
            .collect()
    }

    #[test]
    fn partial_sell_preserves_average_cost() {
        let orders = fills(&[(OrderSide::Buy, 10, dec!(100)), (OrderSide::Sell, 4, dec!(120))]);
        let holdings = replay(&orders, CASH);
        let h = holdings[&STOCK];
        assert_eq!(h.quantity, 6);
        assert_eq!(h.average_cost(), Some(dec!(100)));
    }

    #[test]
    fn weighted_average_across_buys() {
        let orders = fills(&[(OrderSide::Buy, 10, dec!(100)), (OrderSide::Buy, 5, dec!(130))]);
        let h = replay(&orders, CASH)[&STOCK];
        assert_eq!(h.quantity, 15);
        assert_eq!(h.total_cost, dec!(1650));
        assert_eq!(h.average_cost(), Some(dec!(110)));
    }

    #[test]
    fn full_liquidation_drops_the_position() {
        let orders = fills(&[(OrderSide::Buy, 10, dec!(100)), (OrderSide::Sell, 10, dec!(120))]);
        assert!(replay(&orders, CASH).is_empty());
    }

    #[test]
    fn sell_against_empty_holding_is_skipped() {
        let orders = fills(&[(OrderSide::Sell, 3, dec!(50)), (OrderSide::Buy, 2, dec!(40))]);
        let h = replay(&orders, CASH)[&STOCK];
        assert_eq!(h.quantity, 2);
        assert_eq!(h.total_cost, dec!(80));
    }

    #[test]
    fn replay_orders_by_creation_time_not_input_order() {
        let mut orders = fills(&[(OrderSide::Buy, 10, dec!(100)), (OrderSide::Sell, 4, dec!(120))]);
        orders.reverse();
        let h = replay(&orders, CASH)[&STOCK];
        assert_eq!(h.quantity, 6);
    }

    #[test]
    fn non_filled_and_cash_rows_are_ignored() {
        let mut orders = fills(&[(OrderSide::Buy, 10, dec!(100)), (OrderSide::Buy, 5, dec!(90))]);
        orders[1].status = OrderStatus::New;
        orders.push(Order {
            instrument_id: CASH,
            side: OrderSide::CashIn,
            ..orders[0].clone()
        });
        let holdings = replay(&orders, CASH);
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[&STOCK].quantity, 10);
    }
}
