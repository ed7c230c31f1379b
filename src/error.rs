//! Error types and HTTP error response handling.
//!
//! Each layer has its own error enum:
//! - `StoreError`: persistence faults from the order store
//! - `ProvisioningError`: remote key server faults
//! - `NotificationError`: chat gateway delivery faults (logged, never surfaced)
//! - `ValidationError`: requests rejected before any mutation
//!
//! `AppError` wraps them for callers and maps each to an HTTP response.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::models::order::{IllegalTransition, OrderId};

/// Order store failure.
///
/// On failure mid-transaction the store rolls back, so no partial row state is left behind.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order {0} not found")]
    NotFound(OrderId),

    /// The order is not in a status that allows the write.
    #[error("Order {order_id}: {source}")]
    IllegalTransition {
        order_id: OrderId,
        #[source]
        source: IllegalTransition,
    },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Key provisioning service failure.
///
/// Keys already created earlier in the same batch are not rolled back.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Key server unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The key server does not know this key id.
    #[error("Key {0} not found on key server")]
    NotFound(String),

    #[error("Key server returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Invalid key server endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ProvisioningError {
    /// Deleting a key the server no longer has is as good as deleting it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisioningError::NotFound(_))
    }
}

/// Outbound message delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Gateway unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gateway returned {0}")]
    Rejected(u16),

    #[error("Failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Request rejected before any mutation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Too many active keys: {active} active, {requested} requested, limit {max}")]
    QuotaExceeded { active: i64, requested: i32, max: i64 },

    #[error("Key count must be positive, got {0}")]
    InvalidKeyCount(i32),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

/// Application-wide error type.
///
/// # Status Code Mapping
///
/// - `Validation` → 422 Unprocessable Entity (409 for illegal transitions)
/// - `Store(NotFound)` → 404 Not Found
/// - `Store(IllegalTransition)` → 409 Conflict
/// - `Provisioning` → 502 Bad Gateway
/// - `Unauthorized` → 401, `Forbidden` → 403, `InvalidRequest` → 400
/// - Database/migration faults → 500 (details hidden from client)
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// Gateway token is missing or wrong.
    #[error("Invalid gateway token")]
    Unauthorized,

    /// Operator-only route called by someone else.
    #[error("Operator access required")]
    Forbidden,

    #[error("Invalid request")]
    InvalidRequest(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Store(StoreError::Database(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(ValidationError::IllegalTransition(_)) => {
                (StatusCode::CONFLICT, "illegal_transition", self.to_string())
            }
            AppError::Validation(ValidationError::QuotaExceeded { .. }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "quota_exceeded",
                self.to_string(),
            ),
            AppError::Validation(ValidationError::InvalidKeyCount(_)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_key_count",
                self.to_string(),
            ),
            AppError::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "order_not_found", self.to_string())
            }
            AppError::Store(StoreError::IllegalTransition { .. }) => {
                (StatusCode::CONFLICT, "illegal_transition", self.to_string())
            }
            AppError::Store(StoreError::Constraint(_)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "constraint_violated",
                self.to_string(),
            ),
            AppError::Store(StoreError::Database(_) | StoreError::Migrate(_)) => {
                tracing::error!(error = %self, "Store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Provisioning(ProvisioningError::InvalidEndpoint(msg)) => {
                (StatusCode::BAD_REQUEST, "invalid_endpoint", msg.clone())
            }
            AppError::Provisioning(_) => (
                StatusCode::BAD_GATEWAY,
                "provisioning_failed",
                self.to_string(),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "invalid_gateway_token",
                self.to_string(),
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string()),
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
