//! Gateway authentication middleware.
//!
//! Every `/api/v1` request comes from the chat gateway:
//! 1. `gateway_auth` checks the bearer token against the configured SHA-256
//! 2. It records who the gateway is acting for (`X-Actor-Id`) in the request
//! 3. `require_operator` additionally limits a route to the operator

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use crate::{error::AppError, models::order::OwnerId, state::AppState};

/// Header naming the chat user the gateway is acting for.
pub const ACTOR_HEADER: &str = "X-Actor-Id";

/// Authentication context attached to authenticated requests.
#[derive(Debug, Clone, Copy)]
pub struct GatewayContext {
    /// `None` when the gateway acts on its own behalf
    pub actor: Option<OwnerId>,
}

/// Hex SHA-256 of a token, as stored in `GATEWAY_TOKEN_SHA256`.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Gateway token authentication middleware.
///
/// # Flow
///
/// 1. Extract `Authorization: Bearer <token>`
/// 2. Hash the token and compare it with the configured digest
/// 3. Parse the optional `X-Actor-Id` header
/// 4. Inject `GatewayContext` and call the next handler
///
/// # Returns
///
/// - `Err(AppError::Unauthorized)` on a missing or wrong token (401)
/// - `Err(AppError::InvalidRequest)` on a malformed actor id (400)
pub async fn gateway_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    if token_digest(token) != *state.gateway_token_sha256 {
        return Err(AppError::Unauthorized);
    }

    let actor = match request.headers().get(ACTOR_HEADER) {
        Some(value) => {
            let id = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| AppError::InvalidRequest(format!("Malformed {ACTOR_HEADER}")))?;
            Some(OwnerId(id))
        }
        None => None,
    };

    request.extensions_mut().insert(GatewayContext { actor });

    Ok(next.run(request).await)
}

/// Limits a route to the operator. Runs after `gateway_auth`.
pub async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let actor = request
        .extensions()
        .get::<GatewayContext>()
        .and_then(|ctx| ctx.actor);

    if !actor.is_some_and(|id| state.engine.is_operator(id)) {
        tracing::warn!(actor = ?actor, path = %request.uri().path(), "Operator route refused");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(request).await)
}
