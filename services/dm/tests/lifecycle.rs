//! Integration tests for instance lifecycles.
//!
//! Every test runs a started manager over a recording messaging client and
//! the in-memory target handler.

mod common;

use std::sync::Arc;

use common::{path, Harness, APP};
use convoy_dm::lifecycle::Step;
use convoy_dm::store::MemoryInstanceStore;
use convoy_dm::targets::InMemoryTarget;
use convoy_dm::{DmError, DmEvent, EventKind};
use convoy_id::ChannelId;
use convoy_messaging::Message;
use convoy_model::{Instance, InstanceStatus, DATA_MACHINE_ID};
use convoy_testing::{three_level_tree, vm_with_tomcat};
use rstest::rstest;

fn new_status(message: &Message) -> (String, InstanceStatus) {
    match message {
        Message::ChangeState {
            path, new_status, ..
        } => (path.to_string(), *new_status),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn test_deploy_and_start_machine_with_tomcat() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    h.manager.deploy_and_start_all(APP, None).await.unwrap();

    assert_eq!(h.status("/vm1").await, Some(InstanceStatus::DeployedStarted));
    assert_eq!(h.status("/vm1/tomcat").await, Some(InstanceStatus::DeployedStarted));
    assert_eq!(h.target.running_machines().len(), 1);
    assert!(h.data("/vm1", DATA_MACHINE_ID).await.is_some());

    // Exactly the four commands, all for the agent of /vm1.
    let channel = ChannelId::agent(APP, &path("/vm1"));
    assert_eq!(h.client.counts().len(), 1);
    let sent = h.client.sent_to(&channel);
    let statuses: Vec<_> = sent.iter().map(new_status).collect();
    assert_eq!(
        statuses,
        vec![
            ("/vm1".to_string(), InstanceStatus::DeployedStopped),
            ("/vm1".to_string(), InstanceStatus::DeployedStarted),
            ("/vm1/tomcat".to_string(), InstanceStatus::DeployedStopped),
            ("/vm1/tomcat".to_string(), InstanceStatus::DeployedStarted),
        ]
    );

    // Deploy commands describe the instance.
    match &sent[2] {
        Message::ChangeState {
            instance: Some(descriptor),
            ..
        } => {
            assert_eq!(descriptor.component, "Tomcat");
            assert_eq!(descriptor.exports.get("Tomcat.portAJP").map(String::as_str), Some("8009"));
            assert_eq!(descriptor.imports.get("MySQL.port"), Some(&false));
        }
        other => panic!("deploy without descriptor: {other:?}"),
    }
    assert!(matches!(&sent[3], Message::ChangeState { instance: None, .. }));
    assert_eq!(h.queued("/vm1"), 0);
}

#[tokio::test]
async fn test_start_machine_then_its_children() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    let vm = path("/vm1");

    h.manager
        .change_instance_state(APP, &vm, InstanceStatus::DeployedStarted)
        .await
        .unwrap();
    assert_eq!(h.status("/vm1").await, Some(InstanceStatus::DeployedStarted));
    assert_eq!(h.status("/vm1/tomcat").await, Some(InstanceStatus::NotDeployed));

    h.manager.deploy_and_start_all(APP, Some(&vm)).await.unwrap();
    assert_eq!(h.status("/vm1/tomcat").await, Some(InstanceStatus::DeployedStarted));

    let channel = ChannelId::agent(APP, &vm);
    assert_eq!(h.client.counts().len(), 1);
    assert_eq!(h.client.sent().len(), 4);
    let statuses: Vec<_> = h.client.sent_to(&channel).iter().map(new_status).collect();
    assert_eq!(
        statuses,
        vec![
            ("/vm1".to_string(), InstanceStatus::DeployedStopped),
            ("/vm1".to_string(), InstanceStatus::DeployedStarted),
            ("/vm1/tomcat".to_string(), InstanceStatus::DeployedStopped),
            ("/vm1/tomcat".to_string(), InstanceStatus::DeployedStarted),
        ]
    );
    assert_eq!(h.target.created_count(), 1);
}

#[tokio::test]
async fn test_parents_deploy_first_and_undeploy_last() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, three_level_tree()).await.unwrap();

    h.manager.deploy_and_start_all(APP, None).await.unwrap();
    let started: Vec<_> = h
        .events
        .changes()
        .into_iter()
        .filter(|(_, s)| *s == InstanceStatus::DeployedStarted)
        .map(|(p, _)| p.to_string())
        .collect();
    assert_eq!(started, vec!["/vm1", "/vm1/tomcat", "/vm1/tomcat/war"]);

    h.events.clear();
    h.manager.undeploy_all(APP, None).await.unwrap();
    let undeployed: Vec<_> = h
        .events
        .changes()
        .into_iter()
        .filter(|(_, s)| *s == InstanceStatus::NotDeployed)
        .map(|(p, _)| p.to_string())
        .collect();
    assert_eq!(undeployed, vec!["/vm1/tomcat/war", "/vm1/tomcat", "/vm1"]);

    assert!(h.target.running_machines().is_empty());
    assert!(h.data("/vm1", DATA_MACHINE_ID).await.is_none());
}

#[tokio::test]
async fn test_deploying_emits_transient_statuses_in_order() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    h.manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();

    let statuses: Vec<_> = h.events.changes().into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        statuses,
        vec![
            InstanceStatus::Deploying,
            InstanceStatus::DeployedStopped,
            InstanceStatus::Starting,
            InstanceStatus::DeployedStarted,
        ]
    );
}

#[tokio::test]
async fn test_same_status_is_a_no_op() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    h.events.clear();

    h.manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::NotDeployed)
        .await
        .unwrap();

    assert!(h.events.events().is_empty());
    assert_eq!(h.client.attempts(), 0);
    assert_eq!(h.target.created_count(), 0);
}

#[rstest]
#[case(InstanceStatus::Problem)]
#[case(InstanceStatus::Deploying)]
#[case(InstanceStatus::Undeploying)]
#[tokio::test]
async fn test_non_requestable_status_is_rejected(#[case] target: InstanceStatus) {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    let err = h
        .manager
        .change_instance_state(APP, &path("/vm1"), target)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::InvalidTransition { .. }));
    assert!(err.is_user_error());
    assert_eq!(h.status("/vm1").await, Some(InstanceStatus::NotDeployed));
}

#[tokio::test]
async fn test_child_cannot_deploy_before_its_parent() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    let err = h
        .manager
        .change_instance_state(APP, &path("/vm1/tomcat"), InstanceStatus::DeployedStarted)
        .await
        .unwrap_err();

    assert!(matches!(err, DmError::InvalidTransition { .. }));
    assert_eq!(h.status("/vm1/tomcat").await, Some(InstanceStatus::NotDeployed));
    assert_eq!(h.queued("/vm1"), 0);
}

#[tokio::test]
async fn test_stopped_machine_holds_child_commands() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    h.manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::DeployedStopped)
        .await
        .unwrap();
    h.manager
        .change_instance_state(APP, &path("/vm1/tomcat"), InstanceStatus::DeployedStopped)
        .await
        .unwrap();

    assert_eq!(h.client.attempts(), 0);
    assert_eq!(h.queued("/vm1"), 2);

    h.manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();

    let sent: Vec<_> = h
        .client
        .sent_to(&ChannelId::agent(APP, &path("/vm1")))
        .iter()
        .map(new_status)
        .collect();
    assert_eq!(
        sent,
        vec![
            ("/vm1".to_string(), InstanceStatus::DeployedStopped),
            ("/vm1/tomcat".to_string(), InstanceStatus::DeployedStopped),
            ("/vm1".to_string(), InstanceStatus::DeployedStarted),
        ]
    );
    assert_eq!(h.queued("/vm1"), 0);
}

#[tokio::test]
async fn test_stop_all_keeps_machines() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    h.manager.deploy_and_start_all(APP, None).await.unwrap();

    h.manager.stop_all(APP, None).await.unwrap();

    assert_eq!(h.status("/vm1").await, Some(InstanceStatus::DeployedStopped));
    assert_eq!(h.status("/vm1/tomcat").await, Some(InstanceStatus::DeployedStopped));
    assert_eq!(h.target.running_machines().len(), 1);
}

#[tokio::test]
async fn test_walk_from_missing_instance() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    let err = h
        .manager
        .deploy_and_start_all(APP, Some(&path("/vm9")))
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::InstanceNotFound { .. }));
}

#[tokio::test]
async fn test_remove_only_when_not_deployed() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    h.manager.deploy_and_start_all(APP, None).await.unwrap();

    let err = h.manager.remove_instance(APP, &path("/vm1")).await.unwrap_err();
    assert!(matches!(err, DmError::UnauthorizedAction(_)));
    let err = h
        .manager
        .remove_instance(APP, &path("/vm1/tomcat"))
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::UnauthorizedAction(_)));

    h.manager
        .change_instance_state(APP, &path("/vm1/tomcat"), InstanceStatus::NotDeployed)
        .await
        .unwrap();
    h.client.clear();
    h.manager.remove_instance(APP, &path("/vm1/tomcat")).await.unwrap();

    assert_eq!(h.status("/vm1/tomcat").await, None);
    assert_eq!(
        h.client.sent_to(&ChannelId::agent(APP, &path("/vm1"))),
        vec![Message::RemoveInstance {
            path: path("/vm1/tomcat")
        }]
    );
}

#[tokio::test]
async fn test_add_then_remove_restores_the_model() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    let before = h.manager.application(APP).unwrap().snapshot().await;

    let added = h
        .manager
        .add_instance(APP, Some(&path("/vm1/tomcat")), Instance::new("war", "War"))
        .await
        .unwrap();
    assert_eq!(added, path("/vm1/tomcat/war"));
    h.manager.remove_instance(APP, &added).await.unwrap();

    let after = h.manager.application(APP).unwrap().snapshot().await;
    assert_eq!(after.root_instances, before.root_instances);

    let kinds: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DmEvent::Instance { kind, path, .. } if path.to_string() == "/vm1/tomcat/war" => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![EventKind::Created, EventKind::Deleted]);
}

#[tokio::test]
async fn test_impossible_insertion() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();

    // War cannot run directly on a VM.
    let err = h
        .manager
        .add_instance(APP, Some(&path("/vm1")), Instance::new("war", "War"))
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::ImpossibleInsertion(_)));

    let err = h
        .manager
        .add_instance(APP, None, vm_with_tomcat())
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::ImpossibleInsertion(_)));
}

#[tokio::test]
async fn test_failed_machine_creation() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    h.target.fail_creations(true);

    let err = h
        .manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::DeployedStarted)
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some(Step::Deploy));
    assert_eq!(h.status("/vm1").await, Some(InstanceStatus::NotDeployed));
    assert_eq!(h.queued("/vm1"), 0);
    assert_eq!(h.client.attempts(), 0);
}

#[tokio::test]
async fn test_failed_termination_keeps_committed_steps() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    h.manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();
    h.target.fail_terminations(true);
    h.events.clear();

    let err = h
        .manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::NotDeployed)
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some(Step::Undeploy));
    assert!(!err.is_user_error());
    assert_eq!(h.status("/vm1").await, Some(InstanceStatus::Problem));
    assert_eq!(h.target.running_machines().len(), 1);

    // The stop step went through before the failure.
    let statuses: Vec<_> = h.events.changes().into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        statuses,
        vec![
            InstanceStatus::Stopping,
            InstanceStatus::DeployedStopped,
            InstanceStatus::Undeploying,
            InstanceStatus::Problem,
        ]
    );

    // A problem can still be undeployed once the target recovers.
    h.target.fail_terminations(false);
    h.manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::NotDeployed)
        .await
        .unwrap();
    assert!(h.target.running_machines().is_empty());
}

#[tokio::test]
async fn test_operations_require_a_started_manager() {
    let h = Harness::stopped_with(Arc::new(MemoryInstanceStore::new()), Arc::new(InMemoryTarget::new()));
    h.manager
        .create_application(convoy_testing::empty_application(APP), common::target_properties())
        .await
        .unwrap();

    let err = h
        .manager
        .add_instance(APP, None, vm_with_tomcat())
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::Configuration(_)));

    let err = h
        .manager
        .change_instance_state(APP, &path("/vm1"), InstanceStatus::DeployedStarted)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::Configuration(_)));
}

#[tokio::test]
async fn test_missing_handler_fails_provisioning() {
    let h = Harness::start().await;
    h.manager
        .create_application(convoy_testing::empty_application("other"), Default::default())
        .await
        .unwrap();
    h.manager.add_instance("other", None, vm_with_tomcat()).await.unwrap();

    let err = h
        .manager
        .change_instance_state("other", &path("/vm1"), InstanceStatus::DeployedStopped)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::TargetProvisioning { .. }));
}

#[tokio::test]
async fn test_delete_application_requires_undeployed_roots() {
    let h = Harness::start().await;
    h.manager.add_instance(APP, None, vm_with_tomcat()).await.unwrap();
    h.manager.deploy_and_start_all(APP, None).await.unwrap();

    let err = h.manager.delete_application(APP).await.unwrap_err();
    assert!(matches!(err, DmError::UnauthorizedAction(_)));

    h.manager.undeploy_all(APP, None).await.unwrap();
    h.manager.delete_application(APP).await.unwrap();

    assert!(h.manager.find_application(APP).is_none());
    assert!(h.events.events().contains(&DmEvent::Application {
        kind: EventKind::Deleted,
        name: APP.to_string(),
    }));
}

#[tokio::test]
async fn test_duplicate_application() {
    let h = Harness::start().await;
    let err = h
        .manager
        .create_application(convoy_testing::empty_application(APP), common::target_properties())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DmError::AlreadyExisting(_)));
}
