//! Ordering flow HTTP handlers.
//!
//! This module implements the owner-facing endpoints the gateway calls:
//! - POST /api/v1/orders/begin - Check quota and offer a key-count menu
//! - POST /api/v1/orders - Place an order
//! - POST /api/v1/orders/cancel - Drop the pending menu

use axum::{Json, extract::State, http::StatusCode};

use crate::{
    error::AppError,
    models::order::{
        BeginOrderResponse, CancelResponse, OwnerRequest, PlaceOrderRequest, PlacedOrderResponse,
    },
    state::AppState,
};

/// Start an order.
///
/// # Endpoint
///
/// `POST /api/v1/orders/begin`
///
/// # Request Body
///
/// ```json
/// { "owner_id": 123456789 }
/// ```
///
/// # Response
///
/// - **Success (200 OK)**: active key count and the key counts on offer
/// - **Error (422)**: the owner's quota is used up
///
/// ```json
/// { "active_keys": 8, "options": [1, 2] }
/// ```
pub async fn begin_order(
    State(state): State<AppState>,
    Json(request): Json<OwnerRequest>,
) -> Result<Json<BeginOrderResponse>, AppError> {
    let menu = state.engine.key_menu(request.owner_id).await?;
    state
        .conversations
        .begin(request.owner_id, menu.options.clone());

    Ok(Json(BeginOrderResponse {
        active_keys: menu.active_keys,
        options: menu.options,
    }))
}

/// Place an order.
///
/// # Endpoint
///
/// `POST /api/v1/orders`
///
/// # Request Body
///
/// ```json
/// {
///   "owner_id": 123456789,
///   "profile": { "username": "alice", "first_name": "Alice", "last_name": null },
///   "key_count": 2
/// }
/// ```
///
/// # Response
///
/// - **Success (201 Created)**: order id, price and payment instructions
/// - **Error (400)**: no live menu from begin (never started, cancelled or
///   expired), or the key count was not on it. The menu is used up either way.
/// - **Error (422)**: quota exceeded or invalid key count
pub async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<PlacedOrderResponse>), AppError> {
    let options = state
        .conversations
        .take(request.owner_id)
        .ok_or_else(|| AppError::InvalidRequest("No order in progress".to_string()))?;
    if !options.contains(&request.key_count) {
        return Err(AppError::InvalidRequest(format!(
            "Key count {} was not offered",
            request.key_count
        )));
    }

    let placed = state
        .engine
        .place(request.owner_id, request.profile, request.key_count)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PlacedOrderResponse {
            order_id: placed.order_id,
            key_count: placed.key_count,
            price: placed.price,
            payment_url: state.engine.policy().payment_url.clone(),
        }),
    ))
}

/// Cancel the pending ordering interaction. Never touches stored orders.
///
/// # Endpoint
///
/// `POST /api/v1/orders/cancel`
pub async fn cancel_order(
    State(state): State<AppState>,
    Json(request): Json<OwnerRequest>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.conversations.cancel(request.owner_id),
    })
}
