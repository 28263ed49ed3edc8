//! End-to-end happy path test.
//!
//! A deployment manager and one agent per machine share an in-memory bus:
//!
//! 1. Create the application and its instances
//! 2. Deploy and start everything
//! 3. Agents apply the commands and publish their exports
//! 4. Imports are resolved on the DM side
//! 5. Ping an agent through the bus
//! 6. Undeploy everything
//!
//! ## Running
//!
//! ```bash
//! cargo test -p convoy-e2e --test happy_path
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use convoy_agent::{heartbeat, AgentProcessor, Config as AgentConfig, LoggerPlugin, PluginRegistry};
use convoy_dm::store::MemoryInstanceStore;
use convoy_dm::targets::{InMemoryTarget, IN_MEMORY_TARGET_ID, TARGET_HANDLER_PROPERTY};
use convoy_dm::{Config, DmEvent, DmListener, Manager};
use convoy_id::InstancePath;
use convoy_messaging::{InMemoryBus, MessagingClient};
use convoy_model::{InstanceStatus, DATA_IP_ADDRESS};
use convoy_testing::{empty_application, two_machines};
use tokio::sync::watch;

const APP: &str = "shop";

fn path(s: &str) -> InstancePath {
    InstancePath::parse(s).unwrap()
}

#[derive(Default)]
struct RawEvents(Mutex<Vec<String>>);

impl DmListener for RawEvents {
    fn listener_id(&self) -> &str {
        "raw-events"
    }

    fn on_event(&self, event: &DmEvent) {
        if let DmEvent::Raw { content, .. } = event {
            self.0.lock().unwrap().push(content.clone());
        }
    }
}

/// Starts an agent for `scope` on `bus`.
async fn spawn_agent(bus: &InMemoryBus, scope: &str, ip: &str, shutdown: watch::Receiver<bool>) {
    let client: Arc<dyn MessagingClient> = Arc::new(bus.clone());
    let config = AgentConfig {
        application: APP.to_string(),
        scoped_instance: path(scope),
        messaging_type: client.messaging_type().to_string(),
        heartbeat_interval_secs: 1,
        ip_address: Some(ip.to_string()),
        log_level: "debug".to_string(),
    };

    let plugins = PluginRegistry::new().with_fallback(Arc::new(LoggerPlugin::new()));
    let processor = AgentProcessor::new(APP, path(scope), client.clone(), plugins);
    let subscription = client.subscribe(&processor.channel()).await.unwrap();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { processor.run(subscription, shutdown).await }
    });
    tokio::spawn(heartbeat::run_heartbeat_loop(config, client, shutdown));
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_happy_path() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let bus = InMemoryBus::new();
    let config = Config {
        message_check_interval: Duration::from_millis(100),
        ..Config::default()
    };
    let manager = Manager::new(config, Arc::new(MemoryInstanceStore::new()));
    manager.set_messaging_client(Some(Arc::new(bus.clone())));
    let target = Arc::new(InMemoryTarget::new());
    manager.register_target(target.clone());
    let raw = Arc::new(RawEvents::default());
    manager.add_listener(raw.clone());
    manager.start().await.unwrap();

    // 1. Application and instances
    let properties = BTreeMap::from([(TARGET_HANDLER_PROPERTY.to_string(), IN_MEMORY_TARGET_ID.to_string())]);
    let managed = manager
        .create_application(empty_application(APP), properties)
        .await
        .unwrap();
    for root in two_machines() {
        manager.add_instance(APP, None, root).await.unwrap();
    }

    // Agents come up with their machines. Commands sent before they
    // subscribe wait in the bus backlog.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_agent(&bus, "/vm1", "10.0.0.1", shutdown_rx.clone()).await;
    spawn_agent(&bus, "/vm2", "10.0.0.2", shutdown_rx.clone()).await;

    // 2. Deploy and start
    manager.deploy_and_start_all(APP, None).await.unwrap();
    assert_eq!(target.running_machines().len(), 2);

    // 3. Agents confirm
    for p in ["/vm1", "/vm1/tomcat", "/vm2", "/vm2/mysql"] {
        eventually(p, || {
            let managed = managed.clone();
            async move { managed.status_of(&path(p)).await == Some(InstanceStatus::DeployedStarted) }
        })
        .await;
    }
    eventually("heartbeat ip", || {
        let managed = managed.clone();
        async move {
            let model = managed.snapshot().await;
            model
                .find(&path("/vm2"))
                .is_some_and(|i| i.data.get(DATA_IP_ADDRESS).map(String::as_str) == Some("10.0.0.2"))
        }
    })
    .await;

    // 4. Tomcat imports what MySQL exports
    eventually("mysql exports", || {
        let managed = managed.clone();
        async move {
            let model = managed.snapshot().await;
            let Some(tomcat) = model.find(&path("/vm1/tomcat")) else {
                return false;
            };
            tomcat
                .imports
                .get("MySQL")
                .is_some_and(|imports| {
                    imports.iter().any(|i| {
                        i.instance_path == path("/vm2/mysql")
                            && i.variables.get("MySQL.port").map(String::as_str) == Some("3306")
                    })
                })
        }
    })
    .await;

    // 5. Ping
    manager.ping_agent(APP, &path("/vm1"), "hello").await.unwrap();
    eventually("pong", || {
        let raw = raw.clone();
        async move { raw.0.lock().unwrap().iter().any(|c| c == "PONG:hello") }
    })
    .await;

    // 6. Undeploy
    manager.undeploy_all(APP, None).await.unwrap();
    assert!(target.running_machines().is_empty());
    // Late agent reports settle on the DM's view.
    for p in ["/vm1", "/vm1/tomcat", "/vm2", "/vm2/mysql"] {
        eventually(p, || {
            let managed = managed.clone();
            async move { managed.status_of(&path(p)).await == Some(InstanceStatus::NotDeployed) }
        })
        .await;
    }
    manager.delete_application(APP).await.unwrap_or_else(|e| panic!("{e}"));

    let _ = shutdown_tx.send(true);
    manager.stop().await;
}
