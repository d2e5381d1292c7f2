//! In-memory backends for local runs and tests.
//!
//! Every handle is a cheap clone over shared state, so a connection pool can
//! hand out as many "connections" as it likes and tests can still inspect
//! what happened through the original handle.

use crate::{inventory, AddressService, ControlPlane, ManagementApi, ManagementConnector};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use nimbus_common::{Instance, InstanceStatus, Template, VmState};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// -----------------------------------------------------------------------------
// Control plane
// -----------------------------------------------------------------------------

/// Number of calls per control-plane operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub find: usize,
    pub get: usize,
    pub templates: usize,
    pub create: usize,
    pub start: usize,
    pub stop: usize,
    pub delete: usize,
}

struct MockVm {
    instance: Instance,
    pending: VecDeque<InstanceStatus>,
    extra_template: String,
}

#[derive(Default)]
struct MockState {
    next_id: i64,
    templates: Vec<Template>,
    vms: BTreeMap<i64, MockVm>,
    calls: MockCalls,
    boot_scripts: HashMap<String, Vec<InstanceStatus>>,
    fail_create: HashMap<String, String>,
    fail_stop: HashSet<String>,
    fail_delete: HashSet<String>,
    read_errors: HashMap<i64, u32>,
    creates_in_flight: usize,
    max_creates_in_flight: usize,
}

#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    latency: Duration,
}

fn default_boot() -> Vec<InstanceStatus> {
    vec![
        InstanceStatus::active("PROLOG"),
        InstanceStatus::active("BOOT"),
        InstanceStatus::running(),
    ]
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every `create_instance`, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_template(&self, name: &str) -> i64 {
        let mut st = self.lock();
        st.next_id += 1;
        let id = 1000 + st.next_id;
        st.templates.push(Template {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Insert an instance that already exists on the platform.
    pub fn insert_instance(&self, name: &str, template: Option<&str>, status: InstanceStatus) -> i64 {
        let mut st = self.lock();
        st.next_id += 1;
        let id = st.next_id;
        let template = template.and_then(|t| st.templates.iter().find(|x| x.name == t).cloned());
        st.vms.insert(
            id,
            MockVm {
                instance: Instance {
                    id,
                    name: name.to_string(),
                    status,
                    ip: Some(mock_ip(id)),
                    template_id: template.as_ref().map(|t| t.id),
                    template_name: template.map(|t| t.name),
                    error: None,
                },
                pending: VecDeque::new(),
                extra_template: String::new(),
            },
        );
        id
    }

    /// Statuses observed by successive polls after `name` is created.
    pub fn script_boot(&self, name: &str, statuses: Vec<InstanceStatus>) {
        self.lock().boot_scripts.insert(name.to_string(), statuses);
    }

    /// Statuses observed by successive polls of an existing instance.
    pub fn script_statuses(&self, id: i64, statuses: Vec<InstanceStatus>) {
        if let Some(vm) = self.lock().vms.get_mut(&id) {
            vm.pending = statuses.into();
        }
    }

    pub fn set_error(&self, id: i64, error: &str) {
        if let Some(vm) = self.lock().vms.get_mut(&id) {
            vm.instance.error = Some(error.to_string());
        }
    }

    pub fn fail_creation(&self, name: &str, message: &str) {
        self.lock()
            .fail_create
            .insert(name.to_string(), message.to_string());
    }

    pub fn fail_stop(&self, name: &str) {
        self.lock().fail_stop.insert(name.to_string());
    }

    pub fn fail_deletion(&self, name: &str) {
        self.lock().fail_delete.insert(name.to_string());
    }

    /// The next `count` reads of `id` fail with a transport error.
    pub fn fail_reads(&self, id: i64, count: u32) {
        self.lock().read_errors.insert(id, count);
    }

    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    pub fn max_concurrent_creates(&self) -> usize {
        self.lock().max_creates_in_flight
    }

    pub fn instance(&self, id: i64) -> Option<Instance> {
        self.lock().vms.get(&id).map(|vm| vm.instance.clone())
    }

    pub fn extra_template(&self, id: i64) -> Option<String> {
        self.lock().vms.get(&id).map(|vm| vm.extra_template.clone())
    }

    /// Instances not yet deleted, ordered by id.
    pub fn live_instances(&self) -> Vec<Instance> {
        self.lock()
            .vms
            .values()
            .filter(|vm| vm.instance.status.state != VmState::Done)
            .map(|vm| vm.instance.clone())
            .collect()
    }

    pub fn live_instance_named(&self, name: &str) -> Option<Instance> {
        self.live_instances().into_iter().find(|i| i.name == name)
    }
}

fn mock_ip(id: i64) -> String {
    format!("10.10.{}.{}", (id / 250) % 250, id % 250 + 1)
}

fn state_filter_matches(filter: inventory::StateFilter, state: VmState) -> bool {
    match filter {
        inventory::StateFilter::Any => true,
        inventory::StateFilter::AnyExceptDone => state != VmState::Done,
        other => other.code() == state.code(),
    }
}

#[async_trait]
impl ControlPlane for MockProvider {
    async fn find_instances(&self, query: &inventory::PoolQuery) -> Result<Vec<Instance>> {
        let mut st = self.lock();
        st.calls.find += 1;
        Ok(st
            .vms
            .values()
            .map(|vm| &vm.instance)
            .filter(|i| query.contains_id(i.id) && state_filter_matches(query.state, i.status.state))
            .cloned()
            .collect())
    }

    async fn get_instance(&self, id: i64) -> Result<Instance> {
        let mut st = self.lock();
        st.calls.get += 1;
        if let Some(left) = st.read_errors.get_mut(&id) {
            if *left > 0 {
                *left -= 1;
                bail!("mock: connection reset while reading vm {}", id);
            }
        }
        let vm = st
            .vms
            .get_mut(&id)
            .ok_or_else(|| anyhow!("mock: vm {} does not exist", id))?;
        if let Some(next) = vm.pending.pop_front() {
            vm.instance.status = next;
        }
        Ok(vm.instance.clone())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let mut st = self.lock();
        st.calls.templates += 1;
        Ok(st.templates.clone())
    }

    async fn create_instance(
        &self,
        template_id: i64,
        name: &str,
        extra_template: &str,
    ) -> Result<i64> {
        {
            let mut st = self.lock();
            st.calls.create += 1;
            st.creates_in_flight += 1;
            st.max_creates_in_flight = st.max_creates_in_flight.max(st.creates_in_flight);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut st = self.lock();
        st.creates_in_flight -= 1;
        if let Some(message) = st.fail_create.get(name) {
            bail!("mock: {}", message);
        }
        let template = st
            .templates
            .iter()
            .find(|t| t.id == template_id)
            .cloned()
            .ok_or_else(|| anyhow!("mock: template {} does not exist", template_id))?;

        st.next_id += 1;
        let id = st.next_id;
        let pending = st.boot_scripts.get(name).cloned().unwrap_or_else(default_boot);
        st.vms.insert(
            id,
            MockVm {
                instance: Instance {
                    id,
                    name: name.to_string(),
                    status: InstanceStatus::new(VmState::Pending),
                    ip: Some(mock_ip(id)),
                    template_id: Some(template.id),
                    template_name: Some(template.name),
                    error: None,
                },
                pending: pending.into(),
                extra_template: extra_template.to_string(),
            },
        );
        Ok(id)
    }

    async fn start_instance(&self, id: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.start += 1;
        let vm = st
            .vms
            .get_mut(&id)
            .ok_or_else(|| anyhow!("mock: vm {} does not exist", id))?;
        vm.pending = vec![InstanceStatus::active("BOOT_POWEROFF"), InstanceStatus::running()].into();
        Ok(())
    }

    async fn stop_instance(&self, id: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.stop += 1;
        let failing = st.fail_stop.clone();
        let vm = st
            .vms
            .get_mut(&id)
            .ok_or_else(|| anyhow!("mock: vm {} does not exist", id))?;
        if failing.contains(&vm.instance.name) {
            bail!("mock: poweroff of {} refused", vm.instance.name);
        }
        vm.pending = vec![InstanceStatus::active("SHUTDOWN_POWEROFF"), InstanceStatus::poweroff()].into();
        Ok(())
    }

    async fn delete_instance(&self, id: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.delete += 1;
        let failing = st.fail_delete.clone();
        let vm = st
            .vms
            .get_mut(&id)
            .ok_or_else(|| anyhow!("mock: vm {} does not exist", id))?;
        if failing.contains(&vm.instance.name) {
            bail!("mock: delete of {} refused", vm.instance.name);
        }
        vm.pending.clear();
        vm.instance.status = InstanceStatus::new(VmState::Done);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Cluster management API
// -----------------------------------------------------------------------------

#[derive(Default)]
struct MockManagementState {
    cluster_uuid: String,
    connect_failures: u32,
    connects: usize,
    license_replies: VecDeque<String>,
    licenses: Vec<String>,
    license_attempts: usize,
    nodes: Vec<(String, Option<String>)>,
}

/// Management API of a pretend cluster. Serves as its own connector.
#[derive(Clone, Default)]
pub struct MockManagement {
    state: Arc<Mutex<MockManagementState>>,
}

impl MockManagement {
    pub fn new(cluster_uuid: &str) -> Self {
        let mgmt = Self::default();
        mgmt.lock().cluster_uuid = cluster_uuid.to_string();
        mgmt
    }

    fn lock(&self) -> MutexGuard<'_, MockManagementState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The first `count` connection attempts fail (node still booting).
    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// Replies for successive `cluster.addLicense` calls; "success" once exhausted.
    pub fn script_license_replies(&self, replies: &[&str]) {
        self.lock().license_replies = replies.iter().map(|r| r.to_string()).collect();
    }

    pub fn add_node(&self, name: &str, primary_cluster_ip: Option<&str>) {
        self.lock()
            .nodes
            .push((name.to_string(), primary_cluster_ip.map(str::to_string)));
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn license_attempts(&self) -> usize {
        self.lock().license_attempts
    }

    /// Licenses the cluster accepted.
    pub fn licenses(&self) -> Vec<String> {
        self.lock().licenses.clone()
    }
}

#[async_trait]
impl ManagementConnector for MockManagement {
    async fn connect(&self, _address: Ipv4Addr, _password: &str) -> Result<Box<dyn ManagementApi>> {
        let mut st = self.lock();
        st.connects += 1;
        if st.connect_failures > 0 {
            st.connect_failures -= 1;
            bail!("mock: management endpoint not reachable yet");
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl ManagementApi for MockManagement {
    async fn list_licenses(&self) -> Result<inventory::LicenseInfo> {
        Ok(inventory::LicenseInfo {
            cluster_uuid: self.lock().cluster_uuid.clone(),
        })
    }

    async fn add_license(&self, key: &str) -> Result<String> {
        let mut st = self.lock();
        st.license_attempts += 1;
        let reply = st
            .license_replies
            .pop_front()
            .unwrap_or_else(|| "success".to_string());
        if reply == "success" {
            st.licenses.push(key.to_string());
        }
        Ok(reply)
    }

    async fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(self.lock().nodes.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn get_node(&self, name: &str) -> Result<inventory::NodeInfo> {
        let st = self.lock();
        let (_, ip) = st
            .nodes
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("mock: no such node {}", name))?;
        Ok(inventory::NodeInfo {
            name: name.to_string(),
            primary_cluster_ip: ip.clone(),
        })
    }
}

// -----------------------------------------------------------------------------
// IP management
// -----------------------------------------------------------------------------

#[derive(Default)]
struct MockAddressState {
    free: VecDeque<String>,
    used: Vec<inventory::AddressUsage>,
    releases: Vec<Vec<String>>,
    fail_allocate: bool,
}

#[derive(Clone, Default)]
pub struct MockAddressService {
    state: Arc<Mutex<MockAddressState>>,
}

impl MockAddressService {
    /// A pool of `size` free addresses starting at `first`.
    pub fn new(first: Ipv4Addr, size: u32) -> Self {
        let svc = Self::default();
        let base = u32::from(first);
        svc.lock().free = (0..size).map(|i| Ipv4Addr::from(base + i).to_string()).collect();
        svc
    }

    fn lock(&self) -> MutexGuard<'_, MockAddressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an address already in use outside our reservations.
    pub fn add_usage(&self, ip: &str, owner: &str) {
        self.lock().used.push(inventory::AddressUsage {
            ip: ip.to_string(),
            owner: Some(owner.to_string()),
        });
    }

    pub fn fail_allocations(&self) {
        self.lock().fail_allocate = true;
    }

    /// Every `release` call, in order.
    pub fn releases(&self) -> Vec<Vec<String>> {
        self.lock().releases.clone()
    }

    fn take(&self, user: &str, count: usize, stride: usize) -> Result<Vec<String>> {
        let mut st = self.lock();
        if st.fail_allocate {
            bail!("mock: address pool unavailable");
        }
        let picked: Vec<usize> = (0..count).map(|i| i * stride).collect();
        if picked.last().map_or(false, |last| *last >= st.free.len()) {
            bail!("mock: only {} free address(es), {} requested", st.free.len(), count);
        }
        // Remove from the back so earlier indexes stay valid.
        let mut taken: Vec<String> = picked
            .iter()
            .rev()
            .filter_map(|i| st.free.remove(*i))
            .collect();
        taken.reverse();
        for ip in &taken {
            st.used.push(inventory::AddressUsage {
                ip: ip.clone(),
                owner: Some(user.to_string()),
            });
        }
        Ok(taken)
    }
}

#[async_trait]
impl AddressService for MockAddressService {
    async fn allocate(&self, user: &str, count: usize, _network: &str) -> Result<Vec<String>> {
        self.take(user, count, 1)
    }

    async fn allocate_noncontiguous(
        &self,
        user: &str,
        count: usize,
        _network: &str,
    ) -> Result<Vec<String>> {
        self.take(user, count, 2)
    }

    async fn release(&self, addresses: &[String]) -> Result<()> {
        let mut st = self.lock();
        st.used.retain(|u| !addresses.contains(&u.ip));
        st.releases.push(addresses.to_vec());
        Ok(())
    }

    async fn dumpinfo(&self) -> Result<Vec<inventory::AddressUsage>> {
        Ok(self.lock().used.clone())
    }
}
