//! Operator-only HTTP handlers.
//!
//! All routes here require `X-Actor-Id` to be the operator:
//! - POST /api/v1/orders/{id}/approve
//! - POST /api/v1/orders/{id}/reject
//! - POST /api/v1/orders/{id}/renew
//! - POST /api/v1/orders/{id}/decline-renewal
//! - POST /api/v1/migrations

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{
    error::AppError,
    models::order::{
        ApprovedOrderResponse, DeclinedRenewalResponse, MigrationRequest, OrderId, OrderResponse,
    },
    services::lifecycle::MigrationReport,
    state::AppState,
};

/// Approve a paid order and provision its keys.
///
/// # Response
///
/// - **Success (200 OK)**: the approved order and its keys
/// - **Error (404)**: unknown order
/// - **Error (409)**: order is not awaiting payment
/// - **Error (502)**: the key server failed; the order is unchanged
pub async fn approve_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<ApprovedOrderResponse>, AppError> {
    let approved = state.engine.approve(order_id).await?;

    Ok(Json(ApprovedOrderResponse {
        order: approved.order.into(),
        keys: approved.keys,
    }))
}

pub async fn reject_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state.engine.reject(order_id).await?;
    Ok(Json(order.into()))
}

/// Extend an approved order by one TTL.
pub async fn renew_order(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state.engine.renew(order_id).await?;
    Ok(Json(order.into()))
}

/// Decline a renewal. The order is closed and its keys revoked.
pub async fn decline_renewal(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<DeclinedRenewalResponse>, AppError> {
    let declined = state.engine.reject_renewal(order_id).await?;

    Ok(Json(DeclinedRenewalResponse {
        order: declined.order.into(),
        revoked: declined.revocation.revoked,
        deferred: declined.revocation.deferred,
    }))
}

/// Move every active order to a new key server.
///
/// # Request Body
///
/// ```json
/// { "endpoint": "https://10.0.0.2:4711/NeWsEcReT" }
/// ```
///
/// # Response
///
/// - **Success (200 OK)**: per-order migration report
/// - **Error (400)**: endpoint is not an http(s) URL
pub async fn migrate_backend(
    State(state): State<AppState>,
    Json(request): Json<MigrationRequest>,
) -> Result<Json<MigrationReport>, AppError> {
    let report = state
        .engine
        .migrate_provisioning_backend(&request.endpoint)
        .await?;

    Ok(Json(report))
}
