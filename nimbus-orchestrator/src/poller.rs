use nimbus_common::{ClusterError, ClusterResult, Instance, StatusTarget};
use nimbus_providers::ControlPlane;
use std::time::Duration;

/// "Poll until target state or timeout" over `get_instance`.
#[derive(Debug, Clone, Copy)]
pub struct StatusPoller {
    interval: Duration,
}

impl StatusPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Poll `id` at most `retries` times until its status matches `target`.
    ///
    /// Any `*FAILURE*` status ends the wait at once with `ServiceFailure`.
    /// Read errors are transient: they are logged and use up one attempt.
    /// An exhausted budget yields `ServiceTimeout`, carrying the error text
    /// the control plane last attached to the instance.
    pub async fn wait_for_status(
        &self,
        cp: &dyn ControlPlane,
        id: i64,
        target: StatusTarget,
        retries: u32,
    ) -> ClusterResult<Instance> {
        let mut last: Option<Instance> = None;

        for attempt in 1..=retries {
            match cp.get_instance(id).await {
                Ok(instance) => {
                    if target.matches(&instance.status) {
                        tracing::debug!(
                            "✅ [poller] vm {} reached {} after {} poll(s)",
                            id,
                            target,
                            attempt
                        );
                        return Ok(instance);
                    }
                    if instance.status.is_failure() {
                        tracing::error!(
                            "❌ [poller] vm {} ({}) entered {}",
                            id,
                            instance.name,
                            instance.status
                        );
                        return Err(ClusterError::ServiceFailure(failure_message(&instance)));
                    }
                    tracing::debug!(
                        "⏳ [poller] vm {} is {} (waiting for {}, poll {}/{})",
                        id,
                        instance.status,
                        target,
                        attempt,
                        retries
                    );
                    last = Some(instance);
                }
                Err(e) => {
                    tracing::debug!("⚠️ [poller] reading vm {} failed (poll {}/{}): {:#}", id, attempt, retries, e);
                }
            }

            if attempt < retries {
                tokio::time::sleep(self.interval).await;
            }
        }

        let mut message = format!("vm {} did not reach {} after {} poll(s)", id, target, retries);
        if let Some(instance) = &last {
            message.push_str(&format!(", last status {}", instance.status));
            if let Some(err) = &instance.error {
                message.push_str(&format!(": {}", err));
            }
        }
        tracing::warn!("⏱️ [poller] {}", message);
        Err(ClusterError::ServiceTimeout(message))
    }
}

fn failure_message(instance: &Instance) -> String {
    match &instance.error {
        Some(err) => format!("vm {} ({}) failed with {}: {}", instance.id, instance.name, instance.status, err),
        None => format!("vm {} ({}) failed with {}", instance.id, instance.name, instance.status),
    }
}
