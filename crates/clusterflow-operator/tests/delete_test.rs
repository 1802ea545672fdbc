mod common;

use clusterflow_cloud::{ActionType, ResourceKind};
use clusterflow_operator::{DeleteReport, DeleteStage, ReconcileOutcome};
use common::{TestOperator, spec, with_domains};

const TEARDOWN: [DeleteStage; 10] = [
    DeleteStage::Namespace,
    DeleteStage::MasterInstances,
    DeleteStage::WorkerInstances,
    DeleteStage::ObjectStoreObjects,
    DeleteStage::LoadBalancer,
    DeleteStage::IdentityPolicy,
    DeleteStage::KeyMaterial,
    DeleteStage::KeyPair,
    DeleteStage::Network,
    DeleteStage::Done,
];

fn deleted(outcome: ReconcileOutcome) -> DeleteReport {
    match outcome {
        ReconcileOutcome::Deleted(report) => report,
        other => panic!("expected deleted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_removes_every_resource() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 2);
    assert!(op.create(&spec).await.is_success());
    let key_id = op.cloud.alias_target("alias/c1-tls").unwrap();
    assert!(op.namespace_dir("c1").exists());

    let report = deleted(op.delete(&spec).await);
    assert_eq!(report.sequence(), TEARDOWN.to_vec());
    assert!(report.is_success(), "failed: {:?}", report.failed_stages());

    let workers = report.stage(DeleteStage::WorkerInstances).unwrap();
    assert_eq!(workers.result.succeeded.len(), 2);

    assert!(op.cloud.live_instances("c1").is_empty());
    assert_eq!(op.cloud.vpc_count("c1"), 0);
    assert!(!op.cloud.has_security_group("c1-sg"));
    assert!(!op.cloud.has_key_pair("c1-key"));
    assert!(!op.cloud.has_role("c1-role"));
    assert!(!op.cloud.has_policy("c1-policy"));
    assert!(!op.cloud.has_instance_profile("c1-profile"));
    assert!(!op.cloud.has_bucket("c1-cloudconfig"));
    assert!(!op.cloud.has_load_balancer("c1-api"));
    assert!(!op.namespace_dir("c1").exists());

    // Key material is only scheduled for deletion
    assert_eq!(op.cloud.alias_target("alias/c1-tls"), None);
    assert_eq!(op.cloud.pending_window(&key_id), Some(7));
}

#[tokio::test]
async fn test_failed_stage_does_not_stop_teardown() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 1);
    assert!(op.create(&spec).await.is_success());
    op.cloud
        .fail_always("DeleteLoadBalancer", "Throttling", "Rate exceeded");

    let outcome = op.delete(&spec).await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.label(), "deleted");

    let report = deleted(outcome);
    assert_eq!(report.sequence(), TEARDOWN.to_vec());
    assert_eq!(report.failed_stages(), vec![DeleteStage::LoadBalancer]);
    assert!(
        report
            .stage(DeleteStage::LoadBalancer)
            .unwrap()
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Rate exceeded"))
    );

    // Later stages still ran
    assert!(!op.cloud.has_role("c1-role"));
    assert!(!op.cloud.has_key_pair("c1-key"));
    assert_eq!(op.cloud.vpc_count("c1"), 0);
    assert!(op.cloud.has_load_balancer("c1-api"));
}

#[tokio::test]
async fn test_stage_continues_after_a_resource_failure() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 0);
    assert!(op.create(&spec).await.is_success());
    op.cloud
        .fail_always("DeletePolicy", "ServiceFailure", "internal error");

    let report = deleted(op.delete(&spec).await);
    let identity = report.stage(DeleteStage::IdentityPolicy).unwrap();
    assert!(identity.error.as_deref().is_some_and(|e| e.contains("internal error")));

    assert!(op.cloud.has_policy("c1-policy"));
    assert!(!op.cloud.has_role("c1-role"));
    assert!(!op.cloud.has_instance_profile("c1-profile"));
    assert_eq!(report.failed_stages(), vec![DeleteStage::IdentityPolicy]);
}

#[tokio::test]
async fn test_delete_removes_dns_records_before_the_load_balancer() {
    let op = TestOperator::new();
    let spec = with_domains(spec("c1", 1, 0));
    assert!(op.create(&spec).await.is_success());

    let report = deleted(op.delete(&spec).await);
    let lb = report.stage(DeleteStage::LoadBalancer).unwrap();
    let kinds: Vec<ResourceKind> = lb.result.succeeded.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::RecordSet,
            ResourceKind::RecordSet,
            ResourceKind::LoadBalancer
        ]
    );
    assert!(
        lb.result
            .succeeded
            .iter()
            .all(|a| a.action_type == ActionType::Delete)
    );
    assert_eq!(op.cloud.count("DeleteHostedZone"), 0);
}

#[tokio::test]
async fn test_delete_of_unknown_cluster_records_missing_resources() {
    let op = TestOperator::new();
    let spec = spec("ghost", 1, 1);

    let report = deleted(op.delete(&spec).await);
    assert_eq!(report.sequence(), TEARDOWN.to_vec());

    let failed = report.failed_stages();
    assert!(failed.contains(&DeleteStage::Namespace));
    assert!(failed.contains(&DeleteStage::LoadBalancer));
    assert!(failed.contains(&DeleteStage::Network));
    // Nothing to terminate is not a failure
    assert!(!failed.contains(&DeleteStage::MasterInstances));
    assert!(!failed.contains(&DeleteStage::WorkerInstances));
}

#[tokio::test]
async fn test_repeated_creates_leave_no_live_key_after_delete() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 0);
    for _ in 0..3 {
        assert!(op.create(&spec).await.is_success());
    }
    assert_eq!(op.cloud.count("CreateKey"), 3);
    assert_eq!(op.cloud.enabled_keys().len(), 1);

    assert!(op.delete(&spec).await.is_success());
    assert!(op.cloud.enabled_keys().is_empty());
}
