use crate::directory;
use crate::lifecycle::InstanceLifecycle;
use crate::poller::StatusPoller;
use crate::template::ExtraTemplate;
use nimbus_common::{node_name, ClusterError, ClusterResult, Instance, StatusTarget, Template};
use nimbus_providers::ControlPlane;
use regex::Regex;

/// Instance names double as hostnames: lowercase DNS labels.
const INSTANCE_NAME: &str = r"^[a-z][a-z0-9-]{0,61}[a-z0-9]$";

/// One instance to create.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub name: String,
    /// Template name or numeric template id.
    pub machine_type: String,
    pub extra: ExtraTemplate,
    /// Polls allowed for the instance to reach RUNNING.
    pub wait_retries: u32,
}

/// What every node of one cluster shares.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub cluster_name: String,
    pub machine_type: String,
    /// Encoded `ClusterConfig` for the `CLUSTER_CFG` context attribute.
    pub cluster_config: String,
    /// Caller options, rendered as top-level template attributes.
    pub options: Vec<(String, String)>,
}

impl NodePlan {
    pub fn node_name(&self, number: u32) -> String {
        node_name(&self.cluster_name, number)
    }
}

pub struct NodeProvisioner {
    poller: StatusPoller,
    lifecycle: InstanceLifecycle,
    wait_retries: u32,
}

impl NodeProvisioner {
    pub fn new(poller: StatusPoller, lifecycle: InstanceLifecycle, wait_retries: u32) -> Self {
        Self {
            poller,
            lifecycle,
            wait_retries,
        }
    }

    pub fn validate_name(name: &str) -> ClusterResult<()> {
        let re = Regex::new(INSTANCE_NAME)
            .map_err(|e| ClusterError::Configuration(format!("instance name pattern: {}", e)))?;
        if re.is_match(name) {
            Ok(())
        } else {
            Err(ClusterError::Configuration(format!(
                "invalid instance name {:?}: use lowercase letters, digits and '-' (max 63)",
                name
            )))
        }
    }

    /// The single template matching `machine_type` by name or id.
    pub async fn resolve_template(
        &self,
        cp: &dyn ControlPlane,
        machine_type: &str,
    ) -> ClusterResult<Template> {
        let wanted = machine_type.trim();
        let by_id = wanted.parse::<i64>().ok();
        let templates = cp.list_templates().await.map_err(ClusterError::service)?;
        let mut matches: Vec<Template> = templates
            .into_iter()
            .filter(|t| t.name == wanted || Some(t.id) == by_id)
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(ClusterError::Configuration(format!(
                "no template matches machine type {:?}",
                wanted
            ))),
            n => Err(ClusterError::Configuration(format!(
                "machine type {:?} is ambiguous: {} templates match",
                wanted, n
            ))),
        }
    }

    /// Create one instance and wait for it to run.
    ///
    /// An existing live instance with the same name yields `NodeExists`
    /// before anything is created. No cleanup happens here.
    pub async fn create_instance(
        &self,
        cp: &dyn ControlPlane,
        request: &InstanceRequest,
    ) -> ClusterResult<Instance> {
        Self::validate_name(&request.name)?;

        if let Some(existing) = directory::find_by_name(cp, &request.name).await? {
            tracing::warn!(
                "⚠️ [provisioner] {} already exists as vm {} ({})",
                request.name,
                existing.id,
                existing.status
            );
            return Err(ClusterError::NodeExists(request.name.clone()));
        }

        let template = self.resolve_template(cp, &request.machine_type).await?;
        let mut extra = request.extra.clone();
        extra.set("MACHINE_TYPE", template.name.as_str());
        let rendered = extra.render()?;

        tracing::info!(
            "🚀 [provisioner] creating {} from template {} ({})",
            request.name,
            template.name,
            template.id
        );
        let id = cp
            .create_instance(template.id, &request.name, &rendered)
            .await
            .map_err(ClusterError::service)?;

        match self
            .poller
            .wait_for_status(cp, id, StatusTarget::On, request.wait_retries)
            .await
        {
            Ok(instance) => {
                tracing::info!(
                    "✅ [provisioner] {} is running (vm {}, ip {})",
                    instance.name,
                    instance.id,
                    instance.ip.as_deref().unwrap_or("-")
                );
                Ok(instance)
            }
            Err(ClusterError::ServiceTimeout(msg)) | Err(ClusterError::ServiceFailure(msg)) => Err(
                ClusterError::ServiceFailure(format!("{} did not start: {}", request.name, msg)),
            ),
            Err(other) => Err(other),
        }
    }

    /// Create node `number` of a cluster. On failure the half-created
    /// instance is destroyed, unless the failure is that it already existed.
    pub async fn create_node(
        &self,
        cp: &dyn ControlPlane,
        plan: &NodePlan,
        number: u32,
    ) -> ClusterResult<Instance> {
        let name = plan.node_name(number);

        let mut extra = ExtraTemplate::new();
        for (key, value) in &plan.options {
            extra.set(key, value.as_str());
        }
        extra
            .set_cluster_config(&plan.cluster_config)
            .set_context("SET_HOSTNAME", name.as_str());

        let request = InstanceRequest {
            name: name.clone(),
            machine_type: plan.machine_type.clone(),
            extra,
            wait_retries: self.wait_retries,
        };

        match self.create_instance(cp, &request).await {
            Ok(instance) => Ok(instance),
            Err(err) if err.is_node_exists() => Err(err),
            Err(err) => {
                tracing::error!("❌ [provisioner] {} failed: {}", name, err);
                self.discard(cp, &name).await;
                Err(err)
            }
        }
    }

    /// Best-effort removal of whatever is left under `name`.
    async fn discard(&self, cp: &dyn ControlPlane, name: &str) {
        let leftover = match directory::find_by_name(cp, name).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("⚠️ [provisioner] could not look up {} for cleanup: {}", name, e);
                return;
            }
        };
        tracing::info!("🧹 [provisioner] removing failed node {} (vm {})", name, leftover.id);
        if let Err(e) = self.lifecycle.destroy(cp, leftover.id).await {
            tracing::warn!("⚠️ [provisioner] cleanup of {} failed: {}", name, e);
        }
    }
}
