//! Shared test fixtures.
//!
//! - Sample component graphs and instance trees.
//! - [`RecordingClient`]: a messaging client that remembers every send and
//!   can be told to fail, on top of an [`InMemoryBus`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use convoy_id::ChannelId;
use convoy_messaging::{InMemoryBus, Message, MessagingClient, MessagingError, Subscription};
use convoy_model::{Application, Component, Graphs, Instance, INSTALLER_TARGET};

/// `VM -> {Tomcat -> War, MySQL}`.
///
/// Tomcat exports `Tomcat.ip` and `Tomcat.portAJP=8009` and imports
/// `MySQL.ip` and `MySQL.port`; MySQL exports `MySQL.ip` and
/// `MySQL.port=3306`.
pub fn sample_graphs() -> Graphs {
    Graphs::new()
        .with_component(
            Component::new("VM", INSTALLER_TARGET)
                .child("Tomcat")
                .child("MySQL"),
        )
        .with_component(
            Component::new("Tomcat", "puppet")
                .export("Tomcat.ip", None)
                .export("Tomcat.portAJP", Some("8009"))
                .import("MySQL.ip", false)
                .import("MySQL.port", false)
                .child("War"),
        )
        .with_component(
            Component::new("MySQL", "puppet")
                .export("MySQL.ip", None)
                .export("MySQL.port", Some("3306")),
        )
        .with_component(Component::new("War", "bash").export("War.context", Some("/shop")))
        .with_root("VM")
}

/// Application `name` with graphs from [`sample_graphs`] and no instance.
pub fn empty_application(name: &str) -> Application {
    Application::new(name, "1.0", Arc::new(sample_graphs()))
}

/// `/vm1 (VM) -> /vm1/tomcat (Tomcat)`.
pub fn vm_with_tomcat() -> Instance {
    Instance::new("vm1", "VM").with_child(Instance::new("tomcat", "Tomcat"))
}

/// `/vm1 (VM) -> /vm1/tomcat (Tomcat) -> /vm1/tomcat/war (War)`.
pub fn three_level_tree() -> Instance {
    Instance::new("vm1", "VM")
        .with_child(Instance::new("tomcat", "Tomcat").with_child(Instance::new("war", "War")))
}

/// Two machines: `/vm1` with Tomcat, `/vm2` with MySQL.
pub fn two_machines() -> Vec<Instance> {
    vec![
        vm_with_tomcat(),
        Instance::new("vm2", "VM").with_child(Instance::new("mysql", "MySQL")),
    ]
}

/// Messaging client recording every accepted send.
///
/// Accepted messages are forwarded to an [`InMemoryBus`], so subscriptions
/// work as with the real bus.
#[derive(Clone, Default)]
pub struct RecordingClient {
    inner: Arc<RecordingInner>,
}

#[derive(Default)]
struct RecordingInner {
    bus: InMemoryBus,
    sent: Mutex<Vec<(ChannelId, Message)>>,
    failing: AtomicBool,
    /// Sends accepted before failing, when set.
    budget: Mutex<Option<usize>>,
    attempts: AtomicUsize,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus accepted messages are forwarded to.
    pub fn bus(&self) -> &InMemoryBus {
        &self.inner.bus
    }

    /// Makes every send fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
        if !failing {
            *self.inner.budget.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }

    /// Accepts `count` more sends, then fails.
    pub fn fail_after(&self, count: usize) {
        *self.inner.budget.lock().unwrap_or_else(PoisonError::into_inner) = Some(count);
    }

    /// Every accepted send, in order.
    pub fn sent(&self) -> Vec<(ChannelId, Message)> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accepted messages for one channel, in order.
    pub fn sent_to(&self, channel: &ChannelId) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m)
            .collect()
    }

    /// Accepted message count per channel.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (channel, _) in self.sent() {
            *counts.entry(channel.to_string()).or_default() += 1;
        }
        counts
    }

    /// Number of send calls, accepted or not.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn take_budget(&self) -> bool {
        let mut budget = self.inner.budget.lock().unwrap_or_else(PoisonError::into_inner);
        match budget.as_mut() {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl MessagingClient for RecordingClient {
    fn messaging_type(&self) -> &str {
        "recording"
    }

    fn is_connected(&self) -> bool {
        !self.inner.failing.load(Ordering::SeqCst)
    }

    async fn send(&self, channel: &ChannelId, message: &Message) -> Result<(), MessagingError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() || !self.take_budget() {
            return Err(MessagingError::SendFailed {
                channel: channel.clone(),
                reason: "scripted failure".to_string(),
            });
        }

        self.inner
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.clone(), message.clone()));
        self.inner.bus.send(channel, message).await
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, MessagingError> {
        self.inner.bus.subscribe(channel).await
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), MessagingError> {
        self.inner.bus.unsubscribe(channel).await
    }
}
