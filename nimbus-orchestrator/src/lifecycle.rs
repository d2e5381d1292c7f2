use crate::poller::StatusPoller;
use nimbus_common::policy::template_matches_patterns;
use nimbus_common::{ClusterError, ClusterResult, Instance, StatusTarget, VmState};
use nimbus_providers::ControlPlane;

/// Start/stop/restart/destroy of single instances.
#[derive(Debug, Clone)]
pub struct InstanceLifecycle {
    poller: StatusPoller,
    retries: u32,
    unstoppable_templates: Vec<String>,
}

impl InstanceLifecycle {
    pub fn new(poller: StatusPoller, retries: u32, unstoppable_templates: Vec<String>) -> Self {
        Self {
            poller,
            retries,
            unstoppable_templates,
        }
    }

    /// Instances on local-disk templates lose their data when powered off.
    pub fn can_stop(&self, instance: &Instance) -> bool {
        match &instance.template_name {
            Some(template) => !template_matches_patterns(template, &self.unstoppable_templates),
            None => true,
        }
    }

    fn ensure_stoppable(&self, instance: &Instance) -> ClusterResult<()> {
        if self.can_stop(instance) {
            return Ok(());
        }
        Err(ClusterError::Configuration(format!(
            "{} uses template {} which cannot be powered off",
            instance.name,
            instance.template_name.as_deref().unwrap_or("?")
        )))
    }

    pub async fn stop(&self, cp: &dyn ControlPlane, id: i64) -> ClusterResult<Instance> {
        let instance = cp.get_instance(id).await.map_err(ClusterError::service)?;
        self.ensure_stoppable(&instance)?;
        self.power_off(cp, &instance).await
    }

    pub async fn start(&self, cp: &dyn ControlPlane, id: i64) -> ClusterResult<Instance> {
        tracing::info!("▶️ [lifecycle] starting vm {}", id);
        cp.start_instance(id).await.map_err(ClusterError::service)?;
        self.poller
            .wait_for_status(cp, id, StatusTarget::On, self.retries)
            .await
    }

    pub async fn restart(&self, cp: &dyn ControlPlane, id: i64) -> ClusterResult<Instance> {
        let instance = cp.get_instance(id).await.map_err(ClusterError::service)?;
        self.ensure_stoppable(&instance)?;
        self.power_off(cp, &instance).await?;
        self.start(cp, id).await
    }

    /// Power off a healthy running instance, wait for OFF, then hard delete.
    ///
    /// Instances that never came up (INIT, PENDING, HOLD, FAILED, any
    /// `*FAILURE` state) are deleted directly. A refused or stuck power-off
    /// still falls through to the delete; its error is only reported when
    /// the delete fails as well. The stop policy does not apply here.
    pub async fn destroy(&self, cp: &dyn ControlPlane, id: i64) -> ClusterResult<()> {
        let instance = cp.get_instance(id).await.map_err(ClusterError::service)?;
        let mut power_off_error = None;
        if needs_power_off(&instance) {
            if let Err(e) = self.power_off(cp, &instance).await {
                tracing::warn!(
                    "⚠️ [lifecycle] power-off of vm {} ({}) failed, deleting anyway: {}",
                    id,
                    instance.name,
                    e
                );
                power_off_error = Some(e);
            }
        }

        tracing::info!("🗑️ [lifecycle] deleting vm {} ({})", id, instance.name);
        match (cp.delete_instance(id).await, power_off_error) {
            (Ok(()), _) => Ok(()),
            (Err(e), None) => Err(ClusterError::service(e)),
            (Err(e), Some(power_off)) => Err(ClusterError::ServiceFailure(format!(
                "{:#} (after power-off failed: {})",
                e, power_off
            ))),
        }
    }

    async fn power_off(&self, cp: &dyn ControlPlane, instance: &Instance) -> ClusterResult<Instance> {
        tracing::info!("⏹️ [lifecycle] powering off vm {} ({})", instance.id, instance.name);
        cp.stop_instance(instance.id)
            .await
            .map_err(ClusterError::service)?;
        self.poller
            .wait_for_status(cp, instance.id, StatusTarget::Off, self.retries)
            .await
    }
}

/// Only a healthy ACTIVE instance goes through power-off before deletion.
fn needs_power_off(instance: &Instance) -> bool {
    instance.status.state == VmState::Active && !instance.status.is_failure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::policy::parse_template_patterns;
    use nimbus_common::InstanceStatus;
    use nimbus_providers::mock::MockProvider;
    use std::time::Duration;

    fn lifecycle() -> InstanceLifecycle {
        InstanceLifecycle::new(
            StatusPoller::new(Duration::from_millis(1)),
            5,
            parse_template_patterns(None),
        )
    }

    #[tokio::test]
    async fn local_ssd_instances_refuse_to_stop() {
        let mock = MockProvider::new();
        mock.add_template("fxt-LocalSSD");
        let id = mock.insert_instance("a", Some("fxt-LocalSSD"), InstanceStatus::running());

        let lc = lifecycle();
        assert!(!lc.can_stop(&mock.instance(id).unwrap()));
        let err = lc.stop(&mock, id).await.unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
        assert_eq!(mock.calls().stop, 0);
    }

    #[tokio::test]
    async fn stop_then_start() {
        let mock = MockProvider::new();
        mock.add_template("fxt-large");
        let id = mock.insert_instance("a", Some("fxt-large"), InstanceStatus::running());

        let lc = lifecycle();
        assert!(lc.stop(&mock, id).await.unwrap().status.is_off());
        assert!(lc.start(&mock, id).await.unwrap().status.is_on());

        let restarted = lc.restart(&mock, id).await.unwrap();
        assert!(restarted.status.is_on());
        let calls = mock.calls();
        assert_eq!((calls.stop, calls.start), (2, 2));
    }

    #[tokio::test]
    async fn destroy_skips_poweroff_when_already_off() {
        let mock = MockProvider::new();
        let id = mock.insert_instance("a", None, InstanceStatus::poweroff());

        lifecycle().destroy(&mock, id).await.unwrap();
        assert_eq!(mock.calls().stop, 0);
        assert_eq!(mock.calls().delete, 1);
        assert_eq!(mock.instance(id).unwrap().status.state, VmState::Done);
    }

    #[tokio::test]
    async fn destroy_ignores_the_stop_policy() {
        let mock = MockProvider::new();
        mock.add_template("fxt-ephemeral");
        let id = mock.insert_instance("a", Some("fxt-ephemeral"), InstanceStatus::running());

        lifecycle().destroy(&mock, id).await.unwrap();
        assert_eq!(mock.calls().stop, 1);
        assert!(mock.live_instance_named("a").is_none());
    }

    #[tokio::test]
    async fn destroy_deletes_failed_instances_without_poweroff() {
        let mock = MockProvider::new();
        let boot = mock.insert_instance("a", None, InstanceStatus::active("BOOT_FAILURE"));
        let pending = mock.insert_instance("b", None, InstanceStatus::new(VmState::Pending));
        let held = mock.insert_instance("c", None, InstanceStatus::new(VmState::Hold));

        let lc = lifecycle();
        for id in [boot, pending, held] {
            lc.destroy(&mock, id).await.unwrap();
        }
        assert_eq!(mock.calls().stop, 0);
        assert_eq!(mock.calls().delete, 3);
        assert!(mock.live_instances().is_empty());
    }

    #[tokio::test]
    async fn destroy_deletes_when_poweroff_is_refused() {
        let mock = MockProvider::new();
        let id = mock.insert_instance("a", None, InstanceStatus::running());
        mock.fail_stop("a");

        lifecycle().destroy(&mock, id).await.unwrap();
        assert_eq!(mock.calls().stop, 1);
        assert_eq!(mock.calls().delete, 1);
        assert!(mock.live_instance_named("a").is_none());
    }

    #[tokio::test]
    async fn destroy_reports_both_errors_when_delete_fails_too() {
        let mock = MockProvider::new();
        let id = mock.insert_instance("a", None, InstanceStatus::running());
        mock.fail_stop("a");
        mock.fail_deletion("a");

        let err = lifecycle().destroy(&mock, id).await.unwrap_err();
        match err {
            ClusterError::ServiceFailure(msg) => {
                assert!(msg.contains("delete of a refused"), "{}", msg);
                assert!(msg.contains("poweroff of a refused"), "{}", msg);
            }
            other => panic!("expected a service failure, got {:?}", other),
        }
    }
}
