// Integration tests for instance and node provisioning

mod common;

use common::{live_names, mock_provider, provisioner, template_value, test_settings, TEMPLATE};
use nimbus_common::{ClusterError, InstanceStatus, VmState};
use nimbus_orchestrator::cluster_config::{ClusterConfig, JoinMode};
use nimbus_orchestrator::provisioner::{InstanceRequest, NodePlan};
use nimbus_orchestrator::template::ExtraTemplate;
use nimbus_providers::mock::MockCalls;

fn request(name: &str) -> InstanceRequest {
    InstanceRequest {
        name: name.to_string(),
        machine_type: TEMPLATE.to_string(),
        extra: ExtraTemplate::new(),
        wait_retries: 10,
    }
}

fn plan() -> NodePlan {
    let cluster = common::running_cluster(&mock_provider(), "vfxt", 0);
    NodePlan {
        cluster_name: "vfxt".to_string(),
        machine_type: TEMPLATE.to_string(),
        cluster_config: ClusterConfig::join(&cluster).unwrap().encode().unwrap(),
        options: vec![("MGMT_URL".to_string(), "https://10.1.0.10/".to_string())],
    }
}

#[tokio::test]
async fn test_create_instance_waits_for_running() {
    let mock = mock_provider();
    let prov = provisioner(&test_settings());

    let instance = prov.create_instance(&mock, &request("vm-a")).await.unwrap();
    assert!(instance.status.is_on());
    assert_eq!(instance.name, "vm-a");
    assert_eq!(instance.template_name.as_deref(), Some(TEMPLATE));
    assert_eq!(mock.calls().create, 1);
}

#[tokio::test]
async fn test_existing_name_is_node_exists_without_create_calls() {
    let mock = mock_provider();
    mock.insert_instance("vm-a", Some(TEMPLATE), InstanceStatus::running());
    let prov = provisioner(&test_settings());

    let err = prov.create_instance(&mock, &request("vm-a")).await.unwrap_err();
    assert!(matches!(err, ClusterError::NodeExists(ref n) if n == "vm-a"));
    assert_eq!(mock.calls().create, 0);
    assert_eq!(mock.calls().templates, 0);
}

#[tokio::test]
async fn test_invalid_names_never_reach_the_control_plane() {
    let mock = mock_provider();
    let prov = provisioner(&test_settings());

    let err = prov.create_instance(&mock, &request("Bad_Name")).await.unwrap_err();
    assert!(matches!(err, ClusterError::Configuration(_)));
    assert_eq!(mock.calls(), MockCalls::default());
}

#[tokio::test]
async fn test_template_resolution() {
    let mock = mock_provider();
    let small = mock.add_template("fxt-small");
    mock.add_template("fxt-small");
    let prov = provisioner(&test_settings());

    let by_name = prov.resolve_template(&mock, TEMPLATE).await.unwrap();
    assert_eq!(by_name.name, TEMPLATE);
    let by_id = prov.resolve_template(&mock, &small.to_string()).await.unwrap();
    assert_eq!(by_id.id, small);

    assert!(matches!(
        prov.resolve_template(&mock, "fxt-small").await,
        Err(ClusterError::Configuration(ref m)) if m.contains("ambiguous")
    ));
    assert!(matches!(
        prov.resolve_template(&mock, "fxt-huge").await,
        Err(ClusterError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_boot_failure_is_a_service_failure() {
    let mock = mock_provider();
    mock.script_boot("vm-a", vec![InstanceStatus::active("PROLOG"), InstanceStatus::active("BOOT_FAILURE")]);
    let prov = provisioner(&test_settings());

    let err = prov.create_instance(&mock, &request("vm-a")).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceFailure(ref m) if m.contains("vm-a")));
    // No cleanup at this level.
    assert!(mock.live_instance_named("vm-a").is_some());
}

#[tokio::test]
async fn test_boot_timeout_is_a_service_failure() {
    let mock = mock_provider();
    mock.script_boot("vm-a", vec![InstanceStatus::active("PROLOG"); 20]);
    let prov = provisioner(&test_settings());

    let mut req = request("vm-a");
    req.wait_retries = 3;
    let err = prov.create_instance(&mock, &req).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceFailure(_)));
}

#[tokio::test]
async fn test_create_node_renders_join_context() {
    let mock = mock_provider();
    let prov = provisioner(&test_settings());
    let plan = plan();

    let node = prov.create_node(&mock, &plan, 2).await.unwrap();
    assert_eq!(node.name, "vfxt-02");

    let rendered = mock.extra_template(node.id).unwrap();
    assert_eq!(template_value(&rendered, "MGMT_URL").as_deref(), Some("https://10.1.0.10/"));
    assert_eq!(template_value(&rendered, "MACHINE_TYPE").as_deref(), Some(TEMPLATE));
    assert_eq!(template_value(&rendered, "SET_HOSTNAME").as_deref(), Some("vfxt-02"));
    assert!(rendered.contains("CONTEXT = ["));

    let encoded = template_value(&rendered, "CLUSTER_CFG").unwrap();
    assert!(!encoded.contains(char::is_whitespace));
    let config = ClusterConfig::decode(&encoded).unwrap();
    assert_eq!(config.mode, JoinMode::Join);
    assert_eq!(config.cluster_name, "vfxt");
}

#[tokio::test]
async fn test_create_node_destroys_failed_instance() {
    let mock = mock_provider();
    mock.script_boot("vfxt-01", vec![InstanceStatus::active("PROLOG"), InstanceStatus::active("BOOT_FAILURE")]);
    let prov = provisioner(&test_settings());

    let err = prov.create_node(&mock, &plan(), 1).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceFailure(_)));
    assert!(live_names(&mock).is_empty());
    assert_eq!(mock.calls().delete, 1);
}

#[tokio::test]
async fn test_create_node_never_destroys_an_existing_node() {
    let mock = mock_provider();
    let existing = mock.insert_instance("vfxt-01", Some(TEMPLATE), InstanceStatus::running());
    let prov = provisioner(&test_settings());

    let err = prov.create_node(&mock, &plan(), 1).await.unwrap_err();
    assert!(err.is_node_exists());
    assert_eq!(mock.calls().delete, 0);
    assert!(mock.instance(existing).unwrap().status.is_on());
}

#[tokio::test]
async fn test_create_node_survives_failed_cleanup() {
    let mock = mock_provider();
    mock.script_boot("vfxt-01", vec![InstanceStatus::active("BOOT_FAILURE")]);
    mock.fail_deletion("vfxt-01");
    let prov = provisioner(&test_settings());

    // The original error comes back, not the cleanup error.
    let err = prov.create_node(&mock, &plan(), 1).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceFailure(ref m) if m.contains("did not start")));
}

#[tokio::test]
async fn test_create_node_deletes_failed_boot_even_when_poweroff_is_refused() {
    let mock = mock_provider();
    mock.script_boot("vfxt-01", vec![InstanceStatus::active("BOOT_FAILURE")]);
    mock.fail_stop("vfxt-01");
    let prov = provisioner(&test_settings());

    let err = prov.create_node(&mock, &plan(), 1).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceFailure(_)));
    assert_eq!(mock.calls().delete, 1);
    assert!(live_names(&mock).is_empty());
}

#[tokio::test]
async fn test_create_node_deletes_instance_stuck_pending() {
    let mock = mock_provider();
    mock.script_boot("vfxt-01", vec![InstanceStatus::new(VmState::Pending); 20]);
    mock.fail_stop("vfxt-01");
    let prov = provisioner(&test_settings());

    let err = prov.create_node(&mock, &plan(), 1).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceFailure(_)));
    assert_eq!(mock.calls().stop, 0);
    assert_eq!(mock.calls().delete, 1);
    assert!(live_names(&mock).is_empty());
}
