use std::sync::Arc;

use order_ledger::api::routes::{AppState, app_router};
use order_ledger::config::Config;
use order_ledger::execution::OrderEngine;
use order_ledger::ledger::{Ledger, PgLedger};
use order_ledger::persistence::create_pool_and_migrate;
use order_ledger::portfolio::PortfolioEngine;
use order_ledger::telemetry;
use order_ledger::types::instrument::InstrumentKind;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "startup failed");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    telemetry::init(config.log_format);

    let pool = create_pool_and_migrate(&config.database).await?;
    let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(pool, &config.database));

    let cash = ledger
        .find_instrument_by_ticker(&config.cash_ticker)
        .await?
        .filter(|i| i.kind == InstrumentKind::Currency)
        .ok_or_else(|| format!("cash instrument {} not found or not a currency", config.cash_ticker))?;
    info!(ticker = %cash.ticker, id = cash.id, "cash instrument resolved");

    let app_state = AppState {
        orders: Arc::new(OrderEngine::new(ledger.clone(), cash.id)),
        portfolio: Arc::new(PortfolioEngine::new(ledger, cash.id)),
    };

    let app = app_router(app_state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
