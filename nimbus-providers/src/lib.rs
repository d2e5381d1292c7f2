use anyhow::Result;
use async_trait::async_trait;
use nimbus_common::{Instance, InstanceStatus, Template};
use std::net::Ipv4Addr;

pub mod xmlrpc;

/// Capability set every virtualization backend provides.
///
/// The orchestrator only ever talks to the platform through this trait; the
/// backend is picked by configuration (see `ProviderManager` in the
/// orchestrator), never by subclassing.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Filtered query over the instance pool.
    async fn find_instances(&self, query: &inventory::PoolQuery) -> Result<Vec<Instance>>;

    async fn get_instance(&self, id: i64) -> Result<Instance>;

    async fn list_templates(&self) -> Result<Vec<Template>>;

    /// Instantiate `template_id` as `name`, attaching `extra_template`
    /// (`KEY = "VALUE"` lines). Returns the new instance id.
    async fn create_instance(&self, template_id: i64, name: &str, extra_template: &str)
        -> Result<i64>;

    /// Resume / power on.
    async fn start_instance(&self, id: i64) -> Result<()>;

    /// Graceful power off.
    async fn stop_instance(&self, id: i64) -> Result<()>;

    /// Hard delete. No undo.
    async fn delete_instance(&self, id: i64) -> Result<()>;

    async fn instance_status(&self, id: i64) -> Result<InstanceStatus> {
        Ok(self.get_instance(id).await?.status)
    }

    async fn instance_ip(&self, id: i64) -> Result<Option<String>> {
        Ok(self.get_instance(id).await?.ip)
    }
}

/// Remote management API exposed by a booted cluster node.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// `cluster.listLicenses`
    async fn list_licenses(&self) -> Result<inventory::LicenseInfo>;

    /// `cluster.addLicense`; returns the status string (`"success"` on success).
    async fn add_license(&self, key: &str) -> Result<String>;

    /// `node.list`
    async fn list_nodes(&self) -> Result<Vec<String>>;

    /// `node.get`
    async fn get_node(&self, name: &str) -> Result<inventory::NodeInfo>;
}

/// Opens management sessions against a cluster's management address.
#[async_trait]
pub trait ManagementConnector: Send + Sync {
    async fn connect(&self, address: Ipv4Addr, password: &str) -> Result<Box<dyn ManagementApi>>;
}

/// External IP-management service.
#[async_trait]
pub trait AddressService: Send + Sync {
    /// Reserve `count` contiguous addresses on `network` for `user`.
    async fn allocate(&self, user: &str, count: usize, network: &str) -> Result<Vec<String>>;

    async fn allocate_noncontiguous(
        &self,
        user: &str,
        count: usize,
        network: &str,
    ) -> Result<Vec<String>>;

    async fn release(&self, addresses: &[String]) -> Result<()>;

    /// Every address the service knows about, with its owner.
    async fn dumpinfo(&self) -> Result<Vec<inventory::AddressUsage>>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    /// Instance-pool state filter (OpenNebula codes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum StateFilter {
        Any,
        AnyExceptDone,
        Init,
        Pending,
        Hold,
        Active,
        Stopped,
        Suspended,
        Done,
        Failed,
    }

    impl StateFilter {
        pub fn code(&self) -> i64 {
            match self {
                StateFilter::Any => -2,
                StateFilter::AnyExceptDone => -1,
                StateFilter::Init => 0,
                StateFilter::Pending => 1,
                StateFilter::Hold => 2,
                StateFilter::Active => 3,
                StateFilter::Stopped => 4,
                StateFilter::Suspended => 5,
                StateFilter::Done => 6,
                StateFilter::Failed => 7,
            }
        }
    }

    /// Ownership scope of a pool query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Ownership {
        ConnectedUser,
        UserAndGroup,
        All,
        User(u32),
    }

    impl Ownership {
        pub fn code(&self) -> i64 {
            match self {
                Ownership::ConnectedUser => -3,
                Ownership::UserAndGroup => -1,
                Ownership::All => -2,
                Ownership::User(uid) => i64::from(*uid),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PoolQuery {
        /// -1 for "no lower bound".
        pub range_start: i64,
        /// -1 for "no upper bound".
        pub range_end: i64,
        pub state: StateFilter,
        pub ownership: Ownership,
    }

    impl Default for PoolQuery {
        fn default() -> Self {
            Self {
                range_start: -1,
                range_end: -1,
                state: StateFilter::AnyExceptDone,
                ownership: Ownership::UserAndGroup,
            }
        }
    }

    impl PoolQuery {
        /// Whether an instance id falls inside the requested range.
        pub fn contains_id(&self, id: i64) -> bool {
            (self.range_start < 0 || id >= self.range_start)
                && (self.range_end < 0 || id <= self.range_end)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct LicenseInfo {
        pub cluster_uuid: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct NodeInfo {
        pub name: String,
        /// `primaryClusterIP.IP`
        pub primary_cluster_ip: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct AddressUsage {
        pub ip: String,
        pub owner: Option<String>,
    }
}

pub mod ipam;
pub mod management;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "opennebula")]
pub mod opennebula;
