//! Database layer: pool, migrations, and queries for users, instruments, market data and orders.

mod instruments;
mod market_data;
mod orders;
mod pool;
mod users;

pub use instruments::{InstrumentRow, get_instrument_by_id, get_instrument_by_ticker};
pub use market_data::{MarketDataRow, get_latest_price};
pub use orders::{
    OrderRow, get_order_by_id, insert_order, list_orders_for_user, lock_cash_rows,
    lock_order_by_id, lock_position_rows, page_orders_for_user, sum_available_cash,
    update_order_status,
};
pub use pool::{create_pool_and_migrate, run_migrations};
pub use sqlx::PgPool;
pub use users::{UserRow, get_user_by_id, lock_user};
