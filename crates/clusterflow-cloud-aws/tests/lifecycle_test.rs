use clusterflow_cloud::{ErrorKind, HasArn, HasId, Resource, RetryConfig, ensure};
use clusterflow_cloud_aws::memory::MemoryCloud;
use clusterflow_cloud_aws::{
    Gateway, Instance, InstanceConfig, InstanceProfile, Policy, Role, SecurityGroup, Vpc,
    terminate_by_pattern,
};
use std::time::Duration;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        deadline: Duration::from_secs(5),
    }
}

struct Boundary {
    vpc: Vpc,
    gateway: Gateway,
    group: SecurityGroup,
}

async fn boundary(cloud: &MemoryCloud) -> (Boundary, [bool; 3]) {
    let mut vpc = Vpc::new(cloud.ec2(), "c1-vpc", "c1", "10.0.0.0/16").with_retry(fast_retry());
    let vpc_created = ensure(&mut vpc).await.unwrap();

    let mut gateway = Gateway::new(cloud.ec2(), "c1-gateway", "c1", vpc.id());
    let gateway_created = ensure(&mut gateway).await.unwrap();

    let mut group = SecurityGroup::new(cloud.ec2(), "c1-sg", "c1", vpc.id())
        .with_ingress_ports([22, 443, 6443])
        .with_retry(fast_retry());
    let group_created = ensure(&mut group).await.unwrap();

    (
        Boundary {
            vpc,
            gateway,
            group,
        },
        [vpc_created, gateway_created, group_created],
    )
}

#[tokio::test]
async fn test_network_boundary_is_idempotent() {
    let cloud = MemoryCloud::new("eu-west-1");

    let (first, created) = boundary(&cloud).await;
    assert_eq!(created, [true, true, true]);

    let (second, created) = boundary(&cloud).await;
    assert_eq!(created, [false, false, false]);
    assert_eq!(first.vpc.id(), second.vpc.id());
    assert_eq!(first.group.id(), second.group.id());
    assert_eq!(cloud.vpc_count("c1"), 1);
    assert_eq!(cloud.count("CreateVpc"), 1);
    assert!(cloud.has_gateway_for(first.vpc.id()));
}

#[tokio::test]
async fn test_network_teardown_respects_dependencies() {
    let cloud = MemoryCloud::new("eu-west-1");
    let (mut net, _) = boundary(&cloud).await;

    // Still holds the gateway and the group
    let err = net.vpc.delete().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(cloud.vpc_count("c1"), 1);

    net.group.delete().await.unwrap();
    net.gateway.delete().await.unwrap();
    net.vpc.delete().await.unwrap();
    assert_eq!(cloud.vpc_count("c1"), 0);
    assert!(!cloud.has_security_group("c1-sg"));
}

#[tokio::test(start_paused = true)]
async fn test_machines_launch_behind_fresh_identity() {
    let cloud = MemoryCloud::new("eu-west-1");
    cloud.set_profile_propagation_attempts(2);
    let (net, _) = boundary(&cloud).await;

    let mut role = Role::new(cloud.iam(), "c1-role");
    ensure(&mut role).await.unwrap();
    let mut policy = Policy::new(
        cloud.iam(),
        "c1-policy",
        "c1-role",
        "arn:aws:kms:eu-west-1:000000000000:key/k1",
        "c1-cloudconfig",
    );
    ensure(&mut policy).await.unwrap();
    let mut profile = InstanceProfile::new(cloud.iam(), "c1-profile", "c1-role");
    ensure(&mut profile).await.unwrap();
    assert!(!profile.arn().is_empty());

    for index in 0..2 {
        let config = InstanceConfig {
            image_id: "ami-0a1b2c3d".into(),
            instance_type: "m5.large".into(),
            availability_zone: "eu-west-1a".into(),
            security_group_id: net.group.id().to_string(),
            instance_profile_name: "c1-profile".into(),
            key_name: None,
            user_data: "IyEvYmluL2Jhc2g=".into(),
        };
        let mut instance = Instance::new(
            cloud.ec2(),
            format!("c1-master-{}", index),
            "c1",
            config,
        )
        .with_retry(fast_retry());
        assert!(ensure(&mut instance).await.unwrap());
    }
    // Two rejected launches while the profile propagated, then two launches
    assert_eq!(cloud.count("RunInstances"), 4);

    let mut names = terminate_by_pattern(cloud.ec2().as_ref(), "c1", "c1-master-")
        .await
        .unwrap();
    names.sort();
    assert_eq!(names, vec!["c1-master-0", "c1-master-1"]);
    assert!(cloud.live_instances("c1").is_empty());
}

#[tokio::test]
async fn test_identity_teardown_order() {
    let cloud = MemoryCloud::new("eu-west-1");

    let mut role = Role::new(cloud.iam(), "c1-role");
    ensure(&mut role).await.unwrap();
    let mut policy = Policy::new(
        cloud.iam(),
        "c1-policy",
        "c1-role",
        "arn:aws:kms:eu-west-1:000000000000:key/k1",
        "c1-cloudconfig",
    );
    ensure(&mut policy).await.unwrap();
    let mut profile = InstanceProfile::new(cloud.iam(), "c1-profile", "c1-role");
    ensure(&mut profile).await.unwrap();

    // Attached and still in the profile
    assert!(role.delete().await.is_err());

    policy.delete().await.unwrap();
    profile.remove_role().await.unwrap();
    role.delete().await.unwrap();
    profile.delete().await.unwrap();

    assert!(!cloud.has_policy("c1-policy"));
    assert!(!cloud.has_role("c1-role"));
    assert!(!cloud.has_instance_profile("c1-profile"));
}
