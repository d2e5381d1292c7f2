use crate::addresses::AddressAllocator;
use crate::cluster_config::ClusterConfig;
use crate::connection::ConnectionPool;
use crate::directory;
use crate::license::License;
use crate::lifecycle::InstanceLifecycle;
use crate::logger;
use crate::poller::StatusPoller;
use crate::provisioner::{NodePlan, NodeProvisioner};
use crate::scaler::{ParallelNodeScaler, ScaleOptions};
use crate::settings::{BootstrapSettings, Settings};
use nimbus_common::{
    node_number, Cluster, ClusterError, ClusterNetwork, ClusterResult, InstanceRef,
};
use nimbus_providers::inventory::PoolQuery;
use nimbus_providers::{ManagementApi, ManagementConnector};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const LICENSE_ACCEPTED: &str = "success";

#[derive(Debug, Clone)]
pub struct CreateClusterRequest {
    pub name: String,
    pub machine_type: String,
    pub node_count: u32,
    pub admin_password: String,
    /// Explicit addressing. Leave all of `mgmt_ip`, `cluster_ip_start` and
    /// `cluster_ip_end` unset to reserve addresses instead.
    pub mgmt_ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub cluster_ip_start: Option<Ipv4Addr>,
    pub cluster_ip_end: Option<Ipv4Addr>,
    pub contiguous_addresses: bool,
    /// Extra top-level template attributes for every node.
    pub options: Vec<(String, String)>,
    pub skip_cleanup: bool,
    pub skip_node_config: bool,
}

impl CreateClusterRequest {
    pub fn new(name: &str, machine_type: &str, node_count: u32, admin_password: &str) -> Self {
        Self {
            name: name.to_string(),
            machine_type: machine_type.to_string(),
            node_count,
            admin_password: admin_password.to_string(),
            mgmt_ip: None,
            netmask: None,
            cluster_ip_start: None,
            cluster_ip_end: None,
            contiguous_addresses: true,
            options: Vec::new(),
            skip_cleanup: false,
            skip_node_config: false,
        }
    }

    pub fn with_addresses(mut self, mgmt_ip: Ipv4Addr, netmask: Ipv4Addr, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.mgmt_ip = Some(mgmt_ip);
        self.netmask = Some(netmask);
        self.cluster_ip_start = Some(start);
        self.cluster_ip_end = Some(end);
        self
    }
}

/// Creates, discovers and tears down whole clusters.
pub struct ClusterBootstrapper {
    pool: Arc<ConnectionPool>,
    provisioner: Arc<NodeProvisioner>,
    lifecycle: InstanceLifecycle,
    scaler: ParallelNodeScaler,
    addresses: Option<AddressAllocator>,
    management: Arc<dyn ManagementConnector>,
    settings: BootstrapSettings,
}

impl ClusterBootstrapper {
    pub fn new(
        settings: &Settings,
        pool: Arc<ConnectionPool>,
        addresses: Option<AddressAllocator>,
        management: Arc<dyn ManagementConnector>,
    ) -> Self {
        let poller = StatusPoller::new(settings.poll_interval);
        let lifecycle = InstanceLifecycle::new(
            poller,
            settings.wait_retries,
            settings.unstoppable_templates.clone(),
        );
        let provisioner = Arc::new(NodeProvisioner::new(
            poller,
            lifecycle.clone(),
            settings.wait_retries,
        ));
        let scaler = ParallelNodeScaler::new(
            Arc::clone(&provisioner),
            lifecycle.clone(),
            settings.max_parallel_nodes,
        );
        Self {
            pool,
            provisioner,
            lifecycle,
            scaler,
            addresses,
            management,
            settings: settings.bootstrap.clone(),
        }
    }

    /// Grow an existing cluster by `count` nodes.
    pub async fn add_nodes(
        &self,
        cluster: &mut Cluster,
        count: u32,
        options: &ScaleOptions,
    ) -> ClusterResult<Vec<InstanceRef>> {
        self.scaler
            .add_cluster_nodes(&self.pool, cluster, count, options)
            .await
    }

    /// Bring up a new cluster: node 1 forms it, the others join.
    ///
    /// If node 1 already exists the addresses reserved here are released and
    /// nothing is destroyed. Any other failure releases the addresses and
    /// destroys what was created (unless `skip_cleanup`) and is reported as
    /// `CreateFailure`.
    pub async fn create_cluster(&self, request: &CreateClusterRequest) -> ClusterResult<Cluster> {
        let started = Instant::now();
        let log_id = logger::log_event_with_metadata(
            "CREATE_CLUSTER",
            "in_progress",
            &request.name,
            None,
            Some(serde_json::json!({
                "machine_type": request.machine_type,
                "node_count": request.node_count,
            })),
        );

        let mut cluster = Cluster::new(&request.name, &request.machine_type, &request.admin_password);
        let outcome = self.bootstrap(&mut cluster, request).await;
        let elapsed = || started.elapsed().as_millis() as u64;

        let err = match outcome {
            Ok(()) => {
                tracing::info!(
                    "✅ [bootstrap] cluster {} is up with {} node(s) (mgmt {})",
                    cluster.name,
                    cluster.nodes.len(),
                    cluster.mgmt_ip().map(|ip| ip.to_string()).unwrap_or_default()
                );
                logger::log_event_complete(log_id, "success", elapsed(), None);
                return Ok(cluster);
            }
            Err(err) => err,
        };

        if err.is_node_exists() {
            // Someone else's node: hand back our addresses, touch nothing else.
            let mut cleanup_errors = Vec::new();
            self.release_addresses(&mut cluster, &mut cleanup_errors).await;
            for e in &cleanup_errors {
                tracing::warn!("⚠️ [bootstrap] {}", e);
            }
            logger::log_event_complete(log_id, "failed", elapsed(), Some(&err.to_string()));
            return Err(err);
        }

        let cleanup_errors = if request.skip_cleanup {
            tracing::warn!(
                "⚠️ [bootstrap] leaving partial cluster {} in place ({} node(s))",
                cluster.name,
                cluster.nodes.len()
            );
            Vec::new()
        } else {
            tracing::info!("🧹 [bootstrap] rolling back cluster {}", cluster.name);
            self.teardown(&mut cluster).await
        };
        let err = ClusterError::CreateFailure {
            source: Box::new(err),
            cleanup_errors,
        };
        logger::log_event_complete(log_id, "failed", elapsed(), Some(&err.to_string()));
        Err(err)
    }

    async fn bootstrap(&self, cluster: &mut Cluster, request: &CreateClusterRequest) -> ClusterResult<()> {
        if request.node_count == 0 {
            return Err(ClusterError::Configuration(
                "a cluster needs at least one node".to_string(),
            ));
        }
        NodeProvisioner::validate_name(&cluster.node_name(request.node_count))?;

        let conn = self.pool.checkout().map_err(ClusterError::service)?;
        self.provisioner
            .resolve_template(&*conn, &request.machine_type)
            .await?;

        let network = self.plan_network(cluster, request).await?;
        let mgmt_ip = network.mgmt_ip;
        cluster.network = Some(network);

        let mut options = request.options.clone();
        if !options.iter().any(|(k, _)| k.eq_ignore_ascii_case("MGMT_URL")) {
            options.push(("MGMT_URL".to_string(), format!("https://{}/", mgmt_ip)));
        }
        let plan = NodePlan {
            cluster_name: cluster.name.clone(),
            machine_type: cluster.machine_type.clone(),
            cluster_config: ClusterConfig::bootstrap(cluster, request.node_count)?.encode()?,
            options: options.clone(),
        };

        let first = self.provisioner.create_node(&*conn, &plan, 1).await?;
        cluster.nodes.push(first.to_ref());
        drop(conn);

        let api = self.wait_for_management(mgmt_ip, &request.admin_password).await?;
        self.install_license(cluster, api.as_ref()).await?;
        if !request.skip_node_config {
            self.configure_first_node(cluster, api.as_ref()).await?;
        }

        let scale = ScaleOptions {
            skip_cleanup: request.skip_cleanup,
            options,
        };
        self.add_nodes(cluster, request.node_count - 1, &scale).await?;
        Ok(())
    }

    /// Use the caller's addresses or reserve `node_count + 1` of them.
    async fn plan_network(
        &self,
        cluster: &mut Cluster,
        request: &CreateClusterRequest,
    ) -> ClusterResult<ClusterNetwork> {
        match (request.mgmt_ip, request.cluster_ip_start, request.cluster_ip_end) {
            (Some(mgmt_ip), Some(start), Some(end)) => {
                let netmask = request
                    .netmask
                    .or_else(|| self.addresses.as_ref().map(AddressAllocator::netmask))
                    .ok_or_else(|| ClusterError::Configuration("a netmask is required".to_string()))?;
                let network = ClusterNetwork {
                    mgmt_ip,
                    netmask,
                    cluster_ip_start: start,
                    cluster_ip_end: end,
                    cluster_ips: Vec::new(),
                };
                if network.node_address_count() < u64::from(request.node_count) {
                    tracing::warn!(
                        "⚠️ [bootstrap] cluster range {} - {} holds {} address(es) for {} node(s)",
                        start,
                        end,
                        network.node_address_count(),
                        request.node_count
                    );
                }
                Ok(network)
            }
            (None, None, None) => {
                let allocator = self.addresses.as_ref().ok_or_else(|| {
                    ClusterError::Configuration(
                        "no addresses given and no IP-management service configured".to_string(),
                    )
                })?;
                let reservation = allocator
                    .get_available_addresses(request.node_count as usize + 1, request.contiguous_addresses)
                    .await?;
                let netmask = reservation.netmask;
                let addresses = reservation.addresses.clone();
                cluster.allocation = Some(reservation);

                let (mgmt_ip, nodes) = match addresses.split_first() {
                    Some((mgmt, nodes)) if !nodes.is_empty() => (*mgmt, nodes),
                    _ => {
                        return Err(ClusterError::ServiceFailure(
                            "address reservation is too small".to_string(),
                        ))
                    }
                };
                let start = nodes.iter().min().copied().unwrap_or(mgmt_ip);
                let end = nodes.iter().max().copied().unwrap_or(mgmt_ip);
                Ok(ClusterNetwork {
                    mgmt_ip,
                    netmask,
                    cluster_ip_start: start,
                    cluster_ip_end: end,
                    cluster_ips: if request.contiguous_addresses {
                        Vec::new()
                    } else {
                        nodes.to_vec()
                    },
                })
            }
            _ => Err(ClusterError::Configuration(
                "management address and cluster range must be given together".to_string(),
            )),
        }
    }

    /// Connect and `node.list` until the first node answers.
    async fn wait_for_management(
        &self,
        mgmt_ip: Ipv4Addr,
        password: &str,
    ) -> ClusterResult<Box<dyn ManagementApi>> {
        let retries = self.settings.mgmt_connect_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=retries {
            match self.management.connect(mgmt_ip, password).await {
                Ok(api) => match api.list_nodes().await {
                    Ok(_) => {
                        tracing::info!("🔗 [bootstrap] management API at {} is up", mgmt_ip);
                        return Ok(api);
                    }
                    Err(e) => last_error = format!("{:#}", e),
                },
                Err(e) => last_error = format!("{:#}", e),
            }
            tracing::debug!(
                "⏳ [bootstrap] management API at {} not ready ({}/{}): {}",
                mgmt_ip,
                attempt,
                retries,
                last_error
            );
            if attempt < retries {
                tokio::time::sleep(self.settings.retry_interval).await;
            }
        }
        Err(ClusterError::ServiceTimeout(format!(
            "management API at {} not reachable after {} attempt(s): {}",
            mgmt_ip, retries, last_error
        )))
    }

    async fn install_license(&self, cluster: &mut Cluster, api: &dyn ManagementApi) -> ClusterResult<()> {
        let info = api.list_licenses().await.map_err(ClusterError::service)?;
        let uuid = Uuid::parse_str(info.cluster_uuid.trim()).map_err(|e| {
            ClusterError::ServiceFailure(format!("cluster reported UUID {:?}: {}", info.cluster_uuid, e))
        })?;
        cluster.uuid = Some(uuid);

        let license = License::derive(
            &uuid,
            self.settings.license_days,
            self.settings.license_capacity,
            cluster.created_at.date_naive(),
        );
        let key = license.key();

        let retries = self.settings.license_retries.max(1);
        let mut last = String::new();
        for attempt in 1..=retries {
            match api.add_license(&key).await {
                Ok(status) if status.trim() == LICENSE_ACCEPTED => {
                    tracing::info!(
                        "🔑 [bootstrap] license installed on {} ({})",
                        cluster.name,
                        if license.is_permanent() { "permanent" } else { "timed" }
                    );
                    return Ok(());
                }
                Ok(status) => last = format!("cluster answered {:?}", status),
                Err(e) => last = format!("{:#}", e),
            }
            tracing::debug!("⏳ [bootstrap] license attempt {}/{}: {}", attempt, retries, last);
            if attempt < retries {
                tokio::time::sleep(self.settings.retry_interval).await;
            }
        }
        Err(ClusterError::Configuration(format!(
            "license not accepted after {} attempt(s): {}",
            retries, last
        )))
    }

    /// Check every node's primary cluster address against the planned range.
    async fn configure_first_node(&self, cluster: &Cluster, api: &dyn ManagementApi) -> ClusterResult<()> {
        let Some(network) = cluster.network.as_ref() else {
            return Ok(());
        };
        let names = api.list_nodes().await.map_err(ClusterError::service)?;
        for name in names {
            let node = api.get_node(&name).await.map_err(ClusterError::service)?;
            match node.primary_cluster_ip.as_deref().map(str::parse::<Ipv4Addr>) {
                Some(Ok(ip)) if network.contains_node_address(ip) => {
                    tracing::debug!("✅ [bootstrap] node {} uses {}", name, ip);
                }
                Some(Ok(ip)) => tracing::warn!(
                    "⚠️ [bootstrap] node {} uses {} outside {} - {}",
                    name,
                    ip,
                    network.cluster_ip_start,
                    network.cluster_ip_end
                ),
                Some(Err(_)) | None => {
                    tracing::warn!("⚠️ [bootstrap] node {} has no primary cluster address", name)
                }
            }
        }
        Ok(())
    }

    /// Destroy every node and release the reservation.
    pub async fn destroy_cluster(&self, cluster: &mut Cluster) -> ClusterResult<()> {
        let started = Instant::now();
        let log_id = logger::log_event("DESTROY_CLUSTER", "in_progress", &cluster.name, None);
        let errors = self.teardown(cluster).await;
        let elapsed = started.elapsed().as_millis() as u64;
        if errors.is_empty() {
            logger::log_event_complete(log_id, "success", elapsed, None);
            return Ok(());
        }
        let message = errors.join("; ");
        logger::log_event_complete(log_id, "failed", elapsed, Some(&message));
        Err(ClusterError::ServiceFailure(message))
    }

    /// Nodes that could not be destroyed stay in `cluster.nodes`.
    async fn teardown(&self, cluster: &mut Cluster) -> Vec<String> {
        let mut errors = Vec::new();
        match self.pool.checkout() {
            Ok(conn) => {
                let mut remaining = Vec::new();
                for node in cluster.nodes.drain(..) {
                    tracing::info!("🗑️ [bootstrap] destroying {} (vm {})", node.name, node.id);
                    if let Err(e) = self.lifecycle.destroy(&*conn, node.id).await {
                        errors.push(format!("{}: {}", node.name, e));
                        remaining.push(node);
                    }
                }
                cluster.nodes = remaining;
            }
            Err(e) => errors.push(format!("no control-plane connection: {:#}", e)),
        }
        self.release_addresses(cluster, &mut errors).await;
        errors
    }

    async fn release_addresses(&self, cluster: &mut Cluster, errors: &mut Vec<String>) {
        let Some(reservation) = cluster.allocation.as_mut() else {
            return;
        };
        match &self.addresses {
            Some(allocator) => {
                if let Err(e) = allocator.release(reservation).await {
                    errors.push(format!("address release: {}", e));
                }
            }
            None => errors.push("address release: no IP-management service configured".to_string()),
        }
    }

    /// Rebuild a cluster from the instances named `<name>-<NN>`.
    pub async fn discover_cluster(&self, name: &str) -> ClusterResult<Cluster> {
        let conn = self.pool.checkout().map_err(ClusterError::service)?;
        let mut members: Vec<(u32, nimbus_common::Instance)> = directory::list(&*conn, &PoolQuery::default())
            .await?
            .into_iter()
            .filter_map(|i| node_number(name, &i.name).map(|n| (n, i)))
            .collect();
        if members.is_empty() {
            return Err(ClusterError::Configuration(format!("no cluster named {}", name)));
        }
        members.sort_by_key(|(n, i)| (*n, i.id));

        let machine_type = members
            .iter()
            .find_map(|(_, i)| i.template_name.clone())
            .unwrap_or_default();
        let mut cluster = Cluster::new(name, &machine_type, "");
        cluster.nodes = members.iter().map(|(_, i)| i.to_ref()).collect();
        tracing::info!(
            "🔎 [bootstrap] discovered cluster {} with {} node(s)",
            name,
            cluster.nodes.len()
        );
        Ok(cluster)
    }
}
