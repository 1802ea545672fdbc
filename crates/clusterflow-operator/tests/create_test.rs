mod common;

use clusterflow_cloud::{ActionType, ErrorKind, HasId, ResourceKind};
use clusterflow_cloud_aws::HostedZone;
use clusterflow_operator::{CreateStage, ReconcileOutcome};
use common::{TestOperator, spec, with_domains};

fn instance_ids(op: &TestOperator, cluster_id: &str, prefix: &str) -> Vec<String> {
    op.cloud
        .live_instances(cluster_id)
        .into_iter()
        .filter(|i| i.tag("Name").is_some_and(|n| n.starts_with(prefix)))
        .map(|i| i.instance_id)
        .collect()
}

#[tokio::test]
async fn test_create_runs_every_stage_in_order() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 1);

    let outcome = op.create(&spec).await;
    let report = match outcome {
        ReconcileOutcome::Created(report) => report,
        other => panic!("expected created, got {:?}", other),
    };

    assert_eq!(
        report.sequence(),
        vec![
            CreateStage::Namespace,
            CreateStage::KeyPair,
            CreateStage::Certificates,
            CreateStage::KeyMaterial,
            CreateStage::EncryptedAssets,
            CreateStage::IdentityPolicy,
            CreateStage::ObjectStore,
            CreateStage::MasterInstances { count: 1 },
            CreateStage::LoadBalancer,
            CreateStage::WorkerInstances { count: 1 },
            CreateStage::ConsistencyCheck { passed: true },
            CreateStage::Done,
        ]
    );
    assert!(report.is_success());
    assert_eq!(report.created(ResourceKind::Instance), 2);
    assert_eq!(op.cloud.live_instances("c1").len(), 2);
    assert_eq!(op.cloud.vpc_count("c1"), 1);
    assert!(op.cloud.has_key_pair("c1-key"));
    assert!(op.cloud.has_role("c1-role"));
    assert!(op.cloud.has_policy("c1-policy"));
    assert!(op.cloud.has_instance_profile("c1-profile"));
    assert!(op.cloud.alias_target("alias/c1-tls").is_some());
}

#[tokio::test]
async fn test_cloud_configs_are_uploaded_and_mirrored() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 1);
    assert!(op.create(&spec).await.is_success());

    for role in ["master", "worker"] {
        let body = op
            .cloud
            .object("c1-cloudconfig", &format!("cloudconfig/{}", role))
            .unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("#cloud-config"));
        assert!(text.contains("CLUSTER_ID=c1"));

        let mirrored = op
            .namespace_dir("c1")
            .join(format!("cloudconfig-{}.yaml", role));
        assert_eq!(std::fs::read_to_string(mirrored).unwrap(), text);
    }
}

#[tokio::test]
async fn test_only_masters_sit_behind_the_load_balancer() {
    let op = TestOperator::new();
    let spec = spec("c1", 2, 2);
    assert!(op.create(&spec).await.is_success());

    let mut registered = op.cloud.lb_instances("c1-api");
    let mut masters = instance_ids(&op, "c1", "c1-master-");
    registered.sort();
    masters.sort();
    assert_eq!(masters.len(), 2);
    assert_eq!(registered, masters);
}

#[tokio::test]
async fn test_parallel_launch_creates_every_machine() {
    let op = TestOperator::with_settings(|s| s.parallel_launch = true);
    let spec = spec("c1", 3, 2);
    assert!(op.create(&spec).await.is_success());

    assert_eq!(instance_ids(&op, "c1", "c1-master-").len(), 3);
    assert_eq!(instance_ids(&op, "c1", "c1-worker-").len(), 2);
    assert_eq!(op.cloud.count("RunInstances"), 5);
}

#[tokio::test]
async fn test_rerun_reuses_everything_but_the_key() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 1);
    assert!(op.create(&spec).await.is_success());
    let first_key = op.cloud.alias_target("alias/c1-tls").unwrap();

    let report = match op.create(&spec).await {
        ReconcileOutcome::Created(report) => report,
        other => panic!("expected created, got {:?}", other),
    };

    // The alias already exists, so the fresh key cannot take it over
    let key_stage = report.stage(CreateStage::KeyMaterial).unwrap();
    assert!(!key_stage.is_success());
    assert_eq!(op.cloud.alias_target("alias/c1-tls").unwrap(), first_key);

    assert_eq!(report.created(ResourceKind::Instance), 0);
    assert_eq!(op.cloud.live_instances("c1").len(), 2);
    assert_eq!(op.cloud.vpc_count("c1"), 1);
    assert_eq!(op.cloud.count("RunInstances"), 2);

    let machines = report
        .stage(CreateStage::MasterInstances { count: 1 })
        .unwrap();
    assert!(
        machines
            .result
            .succeeded
            .iter()
            .all(|a| a.action_type == ActionType::Reuse)
    );
}

#[tokio::test]
async fn test_policy_failure_with_new_instances_is_inconsistent() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 0);
    // The profile exists from an earlier attempt, so instances still launch
    op.cloud.seed_instance_profile("c1-profile");
    op.cloud.fail_once("CreatePolicy", "LimitExceeded", "too many policies");

    let outcome = op.create(&spec).await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Inconsistent));
    match outcome {
        ReconcileOutcome::Inconsistent { report, reason } => {
            assert!(reason.contains("IdentityPolicy"));
            assert!(reason.contains("1 instance(s)"));
            assert_eq!(
                report.sequence().last(),
                Some(&CreateStage::ConsistencyCheck { passed: false })
            );
        }
        other => panic!("expected inconsistent, got {:?}", other),
    }
    assert_eq!(op.cloud.live_instances("c1").len(), 1);
}

#[tokio::test]
async fn test_failed_stage_aborts_the_run() {
    let op = TestOperator::new();
    let spec = spec("c1", 1, 1);
    op.cloud.fail_always("CreateBucket", "AccessDenied", "denied");

    match op.create(&spec).await {
        ReconcileOutcome::Failed { report, stage, .. } => {
            assert_eq!(stage, CreateStage::ObjectStore);
            assert_eq!(
                report.sequence().last(),
                Some(&CreateStage::ConsistencyCheck { passed: true })
            );
            assert!(report.stage(CreateStage::LoadBalancer).is_none());
        }
        other => panic!("expected failed, got {:?}", other),
    }
    assert_eq!(op.cloud.count("RunInstances"), 0);
}

#[tokio::test]
async fn test_missing_certificates_fail_before_key_material() {
    let op = TestOperator::with_settings(|s| s.certs_dir = s.certs_dir.join("absent"));
    let spec = spec("c1", 1, 0);

    match op.create(&spec).await {
        ReconcileOutcome::Failed { stage, error, .. } => {
            assert_eq!(stage, CreateStage::Certificates);
            assert_eq!(error.kind(), ErrorKind::Invalid);
        }
        other => panic!("expected failed, got {:?}", other),
    }
    assert_eq!(op.cloud.count("CreateKey"), 0);
}

#[tokio::test]
async fn test_domains_point_at_the_load_balancer() {
    let op = TestOperator::new();
    let spec = with_domains(spec("c1", 1, 0));
    assert!(op.create(&spec).await.is_success());

    let zone = HostedZone::from_existing(op.cloud.route53(), "aws.example.io")
        .await
        .unwrap();
    let records = op.cloud.records(zone.id());
    assert_eq!(
        records,
        vec![
            "api.c1.g8s.eu-west-1.acme.aws.example.io".to_string(),
            "etcd.c1.g8s.eu-west-1.acme.aws.example.io".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_any_call() {
    let op = TestOperator::new();
    let mut spec = spec("c1", 1, 0);
    spec.masters.clear();

    let err = op
        .reconciler
        .handle(clusterflow_operator::ClusterEvent::Add(spec))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(op.cloud.calls().is_empty());
}
