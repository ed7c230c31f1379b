//! Shared state handed to every handler and middleware.

use std::sync::Arc;

use crate::conversation::ConversationStore;
use crate::services::lifecycle::LifecycleEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
    pub conversations: Arc<ConversationStore>,
    /// Lowercase hex SHA-256 of the gateway bearer token
    pub gateway_token_sha256: Arc<str>,
}

impl AppState {
    pub fn new(
        engine: LifecycleEngine,
        conversations: Arc<ConversationStore>,
        gateway_token_sha256: &str,
    ) -> Self {
        Self {
            engine,
            conversations,
            gateway_token_sha256: gateway_token_sha256.trim().to_ascii_lowercase().into(),
        }
    }
}
