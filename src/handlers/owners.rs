//! Owner profile view.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{
    error::AppError,
    models::{access_key::OwnerKeysResponse, order::OwnerId},
    state::AppState,
};

/// List an owner's active keys grouped by order.
///
/// # Endpoint
///
/// `GET /api/v1/owners/{owner_id}/keys`
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "owner_id": 123456789,
///   "orders": [
///     {
///       "order_id": 17,
///       "price": 300,
///       "expires_at": "2025-02-14T10:30:00Z",
///       "keys": [ { "id": "41", "name": "brave-otter", "url": "ss://..." } ]
///     }
///   ]
/// }
/// ```
pub async fn list_owner_keys(
    State(state): State<AppState>,
    Path(owner_id): Path<OwnerId>,
) -> Result<Json<OwnerKeysResponse>, AppError> {
    let orders = state.engine.owner_keys(owner_id).await?;

    Ok(Json(OwnerKeysResponse { owner_id, orders }))
}
