//! Test doubles shared by engine, scheduler and router tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clock::Clock;
use crate::error::{NotificationError, ProvisioningError};
use crate::models::access_key::ProvisionedKey;
use crate::models::notification::Notification;
use crate::models::order::OwnerId;
use crate::services::lifecycle::{LifecycleEngine, OrderPolicy};
use crate::services::notification_service::Notifier;
use crate::services::provisioning::{
    Connector, KeyProvisioner, ProvisionerHandle, validate_endpoint,
};
use crate::store::memory::InMemoryOrderStore;

pub const OPERATOR: OwnerId = OwnerId(1);
pub const PAYMENT_URL: &str = "https://pay.example.com/keys";

/// Scripted key server that keeps its live keys in memory.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    endpoint: String,
    prefix: String,
    next_id: AtomicU64,
    creates_left: Mutex<Option<usize>>,
    yield_on_create: AtomicBool,
    failing_deletes: Mutex<HashSet<String>>,
    live: Mutex<Vec<ProvisionedKey>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub fn new(endpoint: &str, prefix: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            prefix: prefix.to_string(),
            ..Default::default()
        }
    }

    /// Lets `n` more creates succeed, then fails every one after.
    pub fn fail_creates_after(&self, n: usize) {
        *self.creates_left.lock().unwrap() = Some(n);
    }

    /// Suspends before every create so concurrent callers interleave.
    pub fn yield_between_creates(&self) {
        self.yield_on_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, key_id: &str) {
        self.failing_deletes.lock().unwrap().insert(key_id.to_string());
    }

    pub fn heal_deletes(&self) {
        self.failing_deletes.lock().unwrap().clear();
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.live.lock().unwrap().iter().map(|k| k.id.clone()).collect()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyProvisioner for FakeProvisioner {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_key(&self, name: &str) -> Result<ProvisionedKey, ProvisioningError> {
        if self.yield_on_create.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        {
            let mut left = self.creates_left.lock().unwrap();
            match left.as_mut() {
                Some(0) => {
                    return Err(ProvisioningError::Remote {
                        status: 500,
                        body: "key server unavailable".to_string(),
                    });
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let key = ProvisionedKey {
            id: format!("{}{n}", self.prefix),
            name: name.to_string(),
            url: format!("ss://{}{n}@{}", self.prefix, self.endpoint),
        };
        self.live.lock().unwrap().push(key.clone());
        Ok(key)
    }

    async fn delete_key(&self, id: &str) -> Result<(), ProvisioningError> {
        if self.failing_deletes.lock().unwrap().contains(id) {
            return Err(ProvisioningError::Remote {
                status: 503,
                body: "try again later".to_string(),
            });
        }

        self.deleted.lock().unwrap().push(id.to_string());
        let mut live = self.live.lock().unwrap();
        let before = live.len();
        live.retain(|k| k.id != id);
        if live.len() == before {
            return Err(ProvisioningError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Captures every notification instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn event_types_for(&self, recipient: OwnerId) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.recipient_id == recipient)
            .map(|n| n.event_type())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Rejected(503));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn policy() -> OrderPolicy {
    OrderPolicy {
        order_ttl: Duration::days(30),
        price_per_key: 150,
        max_keys_per_owner: 10,
        operator_id: OPERATOR,
        notify_before_expiry: Duration::days(3),
        payment_url: Some(PAYMENT_URL.to_string()),
    }
}

/// An engine wired to in-memory collaborators, with handles to inspect them.
pub struct Harness {
    pub engine: LifecycleEngine,
    pub store: Arc<InMemoryOrderStore>,
    pub provisioner: Arc<FakeProvisioner>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    /// Key servers handed out by the connector, in connection order.
    pub connected: Arc<Mutex<Vec<Arc<FakeProvisioner>>>>,
}

pub fn harness() -> Harness {
    let store = Arc::new(InMemoryOrderStore::new());
    let provisioner = Arc::new(FakeProvisioner::new("https://keys-a.example.com", "a"));
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(ManualClock::new(start_time()));
    let connected: Arc<Mutex<Vec<Arc<FakeProvisioner>>>> = Arc::default();

    let sink = connected.clone();
    let connector: Connector = Arc::new(move |endpoint: &str| {
        validate_endpoint(endpoint)?;
        let mut sink = sink.lock().unwrap();
        let fake = Arc::new(FakeProvisioner::new(
            endpoint,
            &format!("m{}-", sink.len() + 1),
        ));
        sink.push(fake.clone());
        Ok(fake as Arc<dyn KeyProvisioner>)
    });

    let engine = LifecycleEngine::new(
        store.clone(),
        Arc::new(ProvisionerHandle::new(provisioner.clone())),
        connector,
        notifier.clone(),
        clock.clone(),
        policy(),
    );

    Harness {
        engine,
        store,
        provisioner,
        notifier,
        clock,
        connected,
    }
}
