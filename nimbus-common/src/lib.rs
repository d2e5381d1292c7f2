use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

pub mod error;
pub mod policy;
pub mod status;

pub use error::{ClusterError, ClusterResult};
pub use status::{InstanceStatus, StatusTarget, VmState, STATUS_OFF, STATUS_ON};

// --- Control-plane entities ---

/// Snapshot of a control-plane instance. The control plane owns the real
/// object; we only ever change it by issuing calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub status: InstanceStatus,
    pub ip: Option<String>,
    pub template_id: Option<i64>,
    pub template_name: Option<String>,
    /// Error text the control plane attached to the instance, if any.
    pub error: Option<String>,
}

impl Instance {
    pub fn to_ref(&self) -> InstanceRef {
        InstanceRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// What a cluster keeps for each of its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub id: i64,
    pub name: String,
}

/// A named instance blueprint (machine type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
}

// --- Cluster ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    pub mgmt_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub cluster_ip_start: Ipv4Addr,
    pub cluster_ip_end: Ipv4Addr,
    /// Explicit node addresses when the reservation was not contiguous.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_ips: Vec<Ipv4Addr>,
}

impl ClusterNetwork {
    /// Number of node addresses this network provides.
    pub fn node_address_count(&self) -> u64 {
        if !self.cluster_ips.is_empty() {
            return self.cluster_ips.len() as u64;
        }
        let start = u32::from(self.cluster_ip_start) as u64;
        let end = u32::from(self.cluster_ip_end) as u64;
        if end < start {
            0
        } else {
            end - start + 1
        }
    }

    pub fn contains_node_address(&self, ip: Ipv4Addr) -> bool {
        if !self.cluster_ips.is_empty() {
            return self.cluster_ips.contains(&ip);
        }
        ip >= self.cluster_ip_start && ip <= self.cluster_ip_end
    }
}

/// Addresses reserved from the IP-management service on behalf of a cluster.
/// Must be released exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressReservation {
    pub addresses: Vec<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    #[serde(default)]
    pub released: bool,
}

impl AddressReservation {
    pub fn new(addresses: Vec<Ipv4Addr>, netmask: Ipv4Addr) -> Self {
        Self {
            addresses,
            netmask,
            released: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub machine_type: String,
    #[serde(skip)] // Never serialize the admin credential
    pub admin_password: String,
    pub network: Option<ClusterNetwork>,
    pub nodes: Vec<InstanceRef>,
    pub uuid: Option<Uuid>,
    pub allocation: Option<AddressReservation>,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(name: &str, machine_type: &str, admin_password: &str) -> Self {
        Self {
            name: name.to_string(),
            machine_type: machine_type.to_string(),
            admin_password: admin_password.to_string(),
            network: None,
            nodes: Vec::new(),
            uuid: None,
            allocation: None,
            created_at: Utc::now(),
        }
    }

    /// Deterministic node name: `<cluster>-<NN>`.
    pub fn node_name(&self, number: u32) -> String {
        node_name(&self.name, number)
    }

    /// Suffix of a node that belongs to this cluster, if `name` is one.
    pub fn node_number(&self, name: &str) -> Option<u32> {
        node_number(&self.name, name)
    }

    /// `max(existing suffixes) + 1`, starting at 1 for an empty cluster.
    pub fn next_node_number(&self) -> u32 {
        self.nodes
            .iter()
            .filter_map(|n| self.node_number(&n.name))
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn mgmt_ip(&self) -> Option<Ipv4Addr> {
        self.network.as_ref().map(|n| n.mgmt_ip)
    }
}

pub fn node_name(cluster_name: &str, number: u32) -> String {
    format!("{}-{:02}", cluster_name, number)
}

pub fn node_number(cluster_name: &str, name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(cluster_name)?.strip_prefix('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
