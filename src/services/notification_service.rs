//! Notification delivery to the chat gateway.
//!
//! This module sends lifecycle events to the gateway with an HMAC signature
//! the gateway verifies. Delivery is best-effort: a failure is returned to
//! the caller to log, never used to undo the state change it reports.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::NotificationError;
use crate::models::notification::Notification;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Sends notifications as signed HTTP POSTs.
///
/// # Headers Sent
///
/// - `Content-Type: application/json`
/// - `X-Signature: sha256=<hex>`
/// - `X-Notification-Id: <uuid>`
/// - `X-Event-Type: <event type>`
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    secret: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, secret: String, timeout: Duration) -> Result<Self, NotificationError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, secret, http })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let payload_json = serde_json::to_string(notification)?;
        let signature = generate_signature(&self.secret, &payload_json);

        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Signature", &signature)
            .header("X-Notification-Id", notification.event_id.to_string())
            .header("X-Event-Type", notification.event_type())
            .body(payload_json)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected(status.as_u16()));
        }

        tracing::debug!(
            event_type = notification.event_type(),
            to = %notification.to,
            "Notification delivered"
        );

        Ok(())
    }
}

/// Generate HMAC-SHA256 signature for a notification body.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
pub fn generate_signature(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
