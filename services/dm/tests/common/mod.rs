//! Shared setup for the deployment manager integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use convoy_dm::store::{InstanceStore, MemoryInstanceStore};
use convoy_dm::targets::{InMemoryTarget, TargetProperties, IN_MEMORY_TARGET_ID, TARGET_HANDLER_PROPERTY};
use convoy_dm::{Config, DmEvent, DmListener, EventKind, Manager};
use convoy_id::InstancePath;
use convoy_model::InstanceStatus;
use convoy_testing::{empty_application, RecordingClient};

pub const APP: &str = "shop";

pub fn test_config() -> Config {
    Config {
        log_level: "debug".to_string(),
        // Background checkers stay out of the way; tests call them directly.
        message_check_interval: Duration::from_secs(3600),
        heartbeat_check_interval: Duration::from_secs(3600),
        heartbeat_grace: Duration::from_secs(180),
        ..Config::default()
    }
}

pub fn path(s: &str) -> InstancePath {
    InstancePath::parse(s).unwrap()
}

pub fn target_properties() -> TargetProperties {
    TargetProperties::from([(TARGET_HANDLER_PROPERTY.to_string(), IN_MEMORY_TARGET_ID.to_string())])
}

/// Listener keeping every event.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<DmEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<DmEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(path, status)` of every instance change, in order.
    pub fn changes(&self) -> Vec<(InstancePath, InstanceStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DmEvent::Instance {
                    kind: EventKind::Changed,
                    path,
                    status,
                    ..
                } => Some((path, status)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl DmListener for EventLog {
    fn listener_id(&self) -> &str {
        "event-log"
    }

    fn on_event(&self, event: &DmEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub manager: Manager,
    pub client: RecordingClient,
    pub target: Arc<InMemoryTarget>,
    pub events: Arc<EventLog>,
}

impl Harness {
    /// A started manager with an in-memory store and the `shop` application.
    pub async fn start() -> Self {
        Self::start_with(Arc::new(MemoryInstanceStore::new()), Arc::new(InMemoryTarget::new())).await
    }

    pub async fn start_with(store: Arc<dyn InstanceStore>, target: Arc<InMemoryTarget>) -> Self {
        let harness = Self::stopped_with(store, target);
        harness.manager.start().await.unwrap();
        harness
            .manager
            .create_application(empty_application(APP), target_properties())
            .await
            .unwrap();
        harness
    }

    /// A manager with messaging and target configured, but not started and
    /// without application.
    pub fn stopped_with(store: Arc<dyn InstanceStore>, target: Arc<InMemoryTarget>) -> Self {
        let manager = Manager::new(test_config(), store);
        let client = RecordingClient::new();
        manager.set_messaging_client(Some(Arc::new(client.clone())));
        manager.register_target(target.clone());

        let events = Arc::new(EventLog::default());
        manager.add_listener(events.clone());

        Self {
            manager,
            client,
            target,
            events,
        }
    }

    pub async fn status(&self, p: &str) -> Option<InstanceStatus> {
        self.manager
            .application(APP)
            .unwrap()
            .status_of(&path(p))
            .await
    }

    pub async fn data(&self, p: &str, key: &str) -> Option<String> {
        let managed = self.manager.application(APP).unwrap();
        let model = managed.snapshot().await;
        model.find(&path(p)).and_then(|i| i.data.get(key).cloned())
    }

    pub fn queued(&self, scope: &str) -> usize {
        self.manager
            .application(APP)
            .unwrap()
            .queue()
            .len(&path(scope))
    }
}

/// Polls `check` until it holds or two seconds elapsed.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
