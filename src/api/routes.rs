use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::Result;
use crate::execution::OrderEngine;
use crate::portfolio::PortfolioEngine;
use crate::types::order::{CreateOrderInput, OrderId, OrderPage, OrderView, UserId};
use crate::types::portfolio::Portfolio;

/// Shared state for all handlers. Engines are stateless and share one ledger.
#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderEngine>,
    pub portfolio: Arc<PortfolioEngine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

async fn health() -> &'static str {
    "healthy"
}

async fn create_order(
    State(state): State<AppState>,
    Json(input): Json<CreateOrderInput>,
) -> Result<(StatusCode, Json<OrderView>)> {
    let order = state.orders.execute_order(&input).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderView>> {
    Ok(Json(state.orders.get_order_by_id(order_id).await?))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<OrderView>> {
    Ok(Json(state.orders.cancel_order(order_id, body.user_id).await?))
}

async fn list_user_orders(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<PageQuery>,
) -> Result<Json<OrderPage>> {
    let page = state
        .orders
        .get_user_orders(user_id, query.limit, query.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

async fn get_portfolio(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Portfolio>> {
    Ok(Json(state.portfolio.get_user_portfolio(user_id).await?))
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(create_order))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/users/{id}/orders", get(list_user_orders))
        .route("/users/{id}/portfolio", get(get_portfolio))
        .with_state(state)
}
