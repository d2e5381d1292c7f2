// Common test utilities and fixtures
// Everything runs against the in-memory backends from nimbus-providers.
#![allow(dead_code)]

use nimbus_common::{Cluster, ClusterNetwork, InstanceStatus};
use nimbus_orchestrator::addresses::AddressAllocator;
use nimbus_orchestrator::lifecycle::InstanceLifecycle;
use nimbus_orchestrator::poller::StatusPoller;
use nimbus_orchestrator::provisioner::NodeProvisioner;
use nimbus_orchestrator::settings::{BootstrapSettings, Settings};
use nimbus_orchestrator::{ClusterBootstrapper, ConnectionPool};
use nimbus_providers::mock::{MockAddressService, MockManagement, MockProvider};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub const TEMPLATE: &str = "fxt-large";
pub const CLUSTER_UUID: &str = "6f1c2a4e-0b7d-4c1e-9a53-12ab34cd56ef";
pub const MAX_WORKERS: usize = 3;

pub fn netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

/// Fast polling, small budgets.
pub fn test_settings() -> Settings {
    Settings {
        provider: "mock".to_string(),
        poll_interval: Duration::from_millis(1),
        wait_retries: 10,
        max_parallel_nodes: MAX_WORKERS,
        bootstrap: BootstrapSettings {
            mgmt_connect_retries: 5,
            license_retries: 3,
            retry_interval: Duration::from_millis(1),
            ..BootstrapSettings::default()
        },
        ..Settings::default()
    }
}

pub fn poller() -> StatusPoller {
    StatusPoller::new(Duration::from_millis(1))
}

pub fn lifecycle(settings: &Settings) -> InstanceLifecycle {
    InstanceLifecycle::new(
        poller(),
        settings.wait_retries,
        settings.unstoppable_templates.clone(),
    )
}

pub fn provisioner(settings: &Settings) -> NodeProvisioner {
    NodeProvisioner::new(poller(), lifecycle(settings), settings.wait_retries)
}

/// A control plane with the standard template registered.
pub fn mock_provider() -> MockProvider {
    let mock = MockProvider::new();
    mock.add_template(TEMPLATE);
    mock
}

pub struct Harness {
    pub settings: Settings,
    pub mock: MockProvider,
    pub mgmt: MockManagement,
    pub ipam: MockAddressService,
    pub pool: Arc<ConnectionPool>,
    pub bootstrapper: ClusterBootstrapper,
}

/// Bootstrapper wired to mocks, with an IP-management service on 10.1.0.10/24.
pub fn harness() -> Harness {
    harness_with(test_settings(), mock_provider(), true)
}

pub fn harness_with(settings: Settings, mock: MockProvider, with_ipam: bool) -> Harness {
    let mgmt = MockManagement::new(CLUSTER_UUID);
    mgmt.add_node("node1", Some("10.1.0.11"));
    let ipam = MockAddressService::new(Ipv4Addr::new(10, 1, 0, 10), 32);
    let allocator = with_ipam.then(|| {
        AddressAllocator::new(Arc::new(ipam.clone()), "nimbus", "cluster-net", netmask())
    });
    let pool = ConnectionPool::shared(Arc::new(mock.clone()));
    let bootstrapper = ClusterBootstrapper::new(&settings, pool.clone(), allocator, Arc::new(mgmt.clone()));
    Harness {
        settings,
        mock,
        mgmt,
        ipam,
        pool,
        bootstrapper,
    }
}

/// A cluster whose first `nodes` nodes already run on `mock`.
pub fn running_cluster(mock: &MockProvider, name: &str, nodes: u32) -> Cluster {
    let mut cluster = Cluster::new(name, TEMPLATE, "s3cret");
    cluster.network = Some(ClusterNetwork {
        mgmt_ip: Ipv4Addr::new(10, 1, 0, 10),
        netmask: netmask(),
        cluster_ip_start: Ipv4Addr::new(10, 1, 0, 11),
        cluster_ip_end: Ipv4Addr::new(10, 1, 0, 30),
        cluster_ips: Vec::new(),
    });
    for n in 1..=nodes {
        let node_name = cluster.node_name(n);
        let id = mock.insert_instance(&node_name, Some(TEMPLATE), InstanceStatus::running());
        cluster.nodes.push(nimbus_common::InstanceRef { id, name: node_name });
    }
    cluster
}

/// Value of `KEY = "..."` in a rendered extra template.
pub fn template_value(rendered: &str, key: &str) -> Option<String> {
    let needle = format!("{} = \"", key);
    rendered.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(needle.as_str())?;
        let end = rest.find('"')?;
        Some(rest[..end].to_string())
    })
}

pub fn live_names(mock: &MockProvider) -> Vec<String> {
    let mut names: Vec<String> = mock.live_instances().into_iter().map(|i| i.name).collect();
    names.sort();
    names
}
