//! Integration tests for the agent command processor.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_agent::{Action, AgentError, AgentProcessor, LoggerPlugin, Plugin, PluginError, PluginRegistry};
use convoy_agent::instances::LocalInstance;
use convoy_id::{ChannelId, InstancePath};
use convoy_messaging::{InstanceDescriptor, Message};
use convoy_model::InstanceStatus;
use convoy_testing::RecordingClient;

fn path(s: &str) -> InstancePath {
    InstancePath::parse(s).unwrap()
}

fn vm() -> InstanceDescriptor {
    InstanceDescriptor {
        component: "VM".to_string(),
        installer: "target".to_string(),
        exports: BTreeMap::new(),
        imports: BTreeMap::new(),
    }
}

fn mysql() -> InstanceDescriptor {
    InstanceDescriptor {
        component: "MySQL".to_string(),
        installer: "puppet".to_string(),
        exports: BTreeMap::from([("MySQL.port".to_string(), "3306".to_string())]),
        imports: BTreeMap::new(),
    }
}

fn deploy(p: &str, status: InstanceStatus, descriptor: InstanceDescriptor) -> Message {
    Message::ChangeState {
        path: path(p),
        new_status: status,
        instance: Some(descriptor),
    }
}

struct Agent {
    processor: AgentProcessor,
    client: RecordingClient,
    plugin: Arc<LoggerPlugin>,
}

fn agent() -> Agent {
    let client = RecordingClient::new();
    let plugin = Arc::new(LoggerPlugin::new());
    let plugins = PluginRegistry::new().with_plugin("puppet", plugin.clone());
    let processor = AgentProcessor::new("shop", path("/vm2"), Arc::new(client.clone()), plugins);
    Agent {
        processor,
        client,
        plugin,
    }
}

fn replies(client: &RecordingClient) -> Vec<Message> {
    client.sent_to(&ChannelId::dm("shop"))
}

#[tokio::test]
async fn test_deploy_and_start_publishes_exports() {
    let mut a = agent();

    a.processor
        .process(deploy("/vm2", InstanceStatus::DeployedStarted, vm()))
        .await
        .unwrap();
    a.processor
        .process(deploy("/vm2/mysql", InstanceStatus::DeployedStarted, mysql()))
        .await
        .unwrap();

    assert_eq!(
        a.plugin.history(),
        vec![(Action::Deploy, path("/vm2/mysql")), (Action::Start, path("/vm2/mysql"))]
    );
    assert_eq!(
        replies(&a.client),
        vec![
            Message::InstanceChanged {
                path: path("/vm2"),
                status: InstanceStatus::DeployedStarted,
            },
            Message::InstanceChanged {
                path: path("/vm2/mysql"),
                status: InstanceStatus::DeployedStarted,
            },
            Message::ExportAdded {
                path: path("/vm2/mysql"),
                component: "MySQL".to_string(),
                variables: mysql().exports,
            },
        ]
    );
}

#[tokio::test]
async fn test_stop_withdraws_exports() {
    let mut a = agent();
    a.processor
        .process(deploy("/vm2/mysql", InstanceStatus::DeployedStarted, mysql()))
        .await
        .unwrap();
    a.client.clear();

    a.processor
        .process(Message::change_state(path("/vm2/mysql"), InstanceStatus::DeployedStopped))
        .await
        .unwrap();

    assert_eq!(
        replies(&a.client),
        vec![
            Message::InstanceChanged {
                path: path("/vm2/mysql"),
                status: InstanceStatus::DeployedStopped,
            },
            Message::ExportRemoved {
                path: path("/vm2/mysql"),
                component: "MySQL".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn test_undeploy_forgets_the_instance() {
    let mut a = agent();
    a.processor
        .process(deploy("/vm2/mysql", InstanceStatus::DeployedStopped, mysql()))
        .await
        .unwrap();

    a.processor
        .process(Message::change_state(path("/vm2/mysql"), InstanceStatus::NotDeployed))
        .await
        .unwrap();

    assert!(a.processor.instance(&path("/vm2/mysql")).is_none());
    let err = a
        .processor
        .process(Message::change_state(path("/vm2/mysql"), InstanceStatus::DeployedStarted))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::UnknownInstance(_)));
}

#[tokio::test]
async fn test_commands_for_other_machines_are_rejected() {
    let mut a = agent();
    let err = a
        .processor
        .process(deploy("/vm1/tomcat", InstanceStatus::DeployedStarted, mysql()))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::OutOfScope(_)));
    assert!(a.client.sent().is_empty());
}

struct FailingPlugin;

#[async_trait]
impl Plugin for FailingPlugin {
    fn name(&self) -> &str {
        "failing"
    }

    async fn apply(&self, action: Action, instance: &LocalInstance) -> Result<(), PluginError> {
        if action == Action::Start {
            return Err(PluginError::Failed {
                plugin: "failing".to_string(),
                action: action.as_str(),
                path: instance.path.clone(),
                reason: "exit status 1".to_string(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_action_reports_problem() {
    let client = RecordingClient::new();
    let plugins = PluginRegistry::new().with_fallback(Arc::new(FailingPlugin));
    let mut processor = AgentProcessor::new("shop", path("/vm2"), Arc::new(client.clone()), plugins);

    let err = processor
        .process(deploy("/vm2/mysql", InstanceStatus::DeployedStarted, mysql()))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Plugin(_)));
    assert_eq!(
        processor.instance(&path("/vm2/mysql")).map(|i| i.status),
        Some(InstanceStatus::Problem)
    );
    assert_eq!(
        replies(&client),
        vec![Message::InstanceChanged {
            path: path("/vm2/mysql"),
            status: InstanceStatus::Problem,
        }]
    );
}

#[tokio::test]
async fn test_resynchronize_reports_everything() {
    let mut a = agent();
    a.processor
        .process(deploy("/vm2", InstanceStatus::DeployedStarted, vm()))
        .await
        .unwrap();
    a.processor
        .process(deploy("/vm2/mysql", InstanceStatus::DeployedStarted, mysql()))
        .await
        .unwrap();
    a.client.clear();

    a.processor.process(Message::Resynchronize).await.unwrap();

    let sent = replies(&a.client);
    assert_eq!(sent.len(), 3);
    assert!(sent.contains(&Message::ExportAdded {
        path: path("/vm2/mysql"),
        component: "MySQL".to_string(),
        variables: mysql().exports,
    }));
}

#[tokio::test]
async fn test_remove_instance_is_acknowledged() {
    let mut a = agent();
    a.processor
        .process(deploy("/vm2/mysql", InstanceStatus::DeployedStopped, mysql()))
        .await
        .unwrap();
    a.client.clear();

    a.processor
        .process(Message::RemoveInstance {
            path: path("/vm2/mysql"),
        })
        .await
        .unwrap();

    assert_eq!(a.processor.instances().count(), 0);
    assert_eq!(
        replies(&a.client),
        vec![Message::InstanceRemoved {
            path: path("/vm2/mysql")
        }]
    );
}

#[tokio::test]
async fn test_ping_gets_a_pong() {
    let mut a = agent();

    a.processor
        .process(Message::Echo {
            content: "PING:hello".to_string(),
        })
        .await
        .unwrap();
    a.processor
        .process(Message::Echo {
            content: "just saying".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        replies(&a.client),
        vec![Message::Echo {
            content: "PONG:hello".to_string()
        }]
    );
}
