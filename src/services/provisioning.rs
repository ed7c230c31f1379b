//! Key provisioning client.
//!
//! Talks to the remote key-management API:
//! - `POST {endpoint}/access-keys` with `{"name": ...}` → `{id, name, accessUrl}`
//! - `DELETE {endpoint}/access-keys/{id}` → 204, or 404 if unknown
//!
//! There is no distributed transaction: keys created before a failure in the
//! same batch stay live on the server.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ProvisioningError;
use crate::models::access_key::ProvisionedKey;

#[async_trait]
pub trait KeyProvisioner: Send + Sync {
    /// Base URL this client talks to, for logging.
    fn endpoint(&self) -> &str;

    async fn create_key(&self, name: &str) -> Result<ProvisionedKey, ProvisioningError>;

    /// Fails with `NotFound` if the server no longer has the key.
    async fn delete_key(&self, id: &str) -> Result<(), ProvisioningError>;
}

/// HTTP settings for provisioning clients.
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningSettings {
    pub timeout: Duration,
    /// Key servers are often deployed with self-signed certificates.
    pub accept_invalid_certs: bool,
}

/// Builds a client for a given endpoint. Used when the backend is replaced at runtime.
pub type Connector =
    Arc<dyn Fn(&str) -> Result<Arc<dyn KeyProvisioner>, ProvisioningError> + Send + Sync>;

/// Connector producing [`OutlineClient`]s with fixed settings.
pub fn outline_connector(settings: ProvisioningSettings) -> Connector {
    Arc::new(move |endpoint: &str| {
        let client = OutlineClient::new(endpoint, settings)?;
        Ok(Arc::new(client) as Arc<dyn KeyProvisioner>)
    })
}

/// Validate a key server endpoint.
///
/// # Rules
///
/// - Must be a valid URL
/// - Must be HTTP or HTTPS
/// - Maximum 2048 characters
pub fn validate_endpoint(endpoint: &str) -> Result<url::Url, ProvisioningError> {
    if endpoint.len() > 2048 {
        return Err(ProvisioningError::InvalidEndpoint(
            "URL exceeds 2048 characters".to_string(),
        ));
    }

    let parsed = url::Url::parse(endpoint)
        .map_err(|_| ProvisioningError::InvalidEndpoint("Invalid URL format".to_string()))?;

    match parsed.scheme() {
        "https" | "http" => Ok(parsed),
        _ => Err(ProvisioningError::InvalidEndpoint(
            "URL must use HTTP or HTTPS".to_string(),
        )),
    }
}

#[derive(Debug, Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedKey {
    id: String,
    #[serde(default)]
    name: Option<String>,
    access_url: String,
}

/// Client for an Outline-compatible management API.
#[derive(Debug, Clone)]
pub struct OutlineClient {
    endpoint: String,
    http: reqwest::Client,
}

impl OutlineClient {
    pub fn new(endpoint: &str, settings: ProvisioningSettings) -> Result<Self, ProvisioningError> {
        let url = validate_endpoint(endpoint)?;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;

        Ok(Self {
            endpoint: url.as_str().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn keys_url(&self) -> String {
        format!("{}/access-keys", self.endpoint)
    }
}

async fn remote_error(response: reqwest::Response) -> ProvisioningError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProvisioningError::Remote { status, body }
}

#[async_trait]
impl KeyProvisioner for OutlineClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_key(&self, name: &str) -> Result<ProvisionedKey, ProvisioningError> {
        let response = self
            .http
            .post(self.keys_url())
            .json(&CreateKeyRequest { name })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let created: CreatedKey = response.json().await?;

        Ok(ProvisionedKey {
            id: created.id,
            name: created
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| name.to_string()),
            url: created.access_url,
        })
    }

    async fn delete_key(&self, id: &str) -> Result<(), ProvisioningError> {
        let response = self
            .http
            .delete(format!("{}/{}", self.keys_url(), id))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProvisioningError::NotFound(id.to_string())),
            _ => Err(remote_error(response).await),
        }
    }
}

/// The provisioning client currently in use.
///
/// Swapped when the provisioning backend is migrated; callers take a
/// snapshot per operation so one operation never spans two backends.
pub struct ProvisionerHandle {
    current: RwLock<Arc<dyn KeyProvisioner>>,
}

impl ProvisionerHandle {
    pub fn new(provisioner: Arc<dyn KeyProvisioner>) -> Self {
        Self {
            current: RwLock::new(provisioner),
        }
    }

    pub fn current(&self) -> Arc<dyn KeyProvisioner> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, provisioner: Arc<dyn KeyProvisioner>) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = provisioner;
    }
}
