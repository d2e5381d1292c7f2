use thiserror::Error;

/// Errors surfaced by cluster orchestration.
///
/// Low-level operations return the narrow kinds (`Configuration`,
/// `ServiceFailure`, `ServiceTimeout`, `NodeExists`). Cluster creation wraps
/// anything else into `CreateFailure` once rollback has been attempted, and
/// scale-out reports every failed node at once through `ScaleOut`.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service failure: {0}")]
    ServiceFailure(String),

    #[error("timed out: {0}")]
    ServiceTimeout(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("cluster creation failed: {source}{}", render_cleanup(.cleanup_errors))]
    CreateFailure {
        #[source]
        source: Box<ClusterError>,
        cleanup_errors: Vec<String>,
    },

    #[error("{} node(s) failed to join: {}{}", .failures.len(), .failures.join("; "), render_cleanup(.rollback_errors))]
    ScaleOut {
        failures: Vec<String>,
        rollback_errors: Vec<String>,
    },
}

fn render_cleanup(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(" (cleanup errors: {})", errors.join("; "))
    }
}

impl ClusterError {
    /// Remote call failed. Keeps the whole anyhow context chain in the message.
    pub fn service(err: anyhow::Error) -> Self {
        ClusterError::ServiceFailure(format!("{:#}", err))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, ClusterError::NodeExists(_))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_failure_mentions_source_and_cleanup() {
        let err = ClusterError::CreateFailure {
            source: Box::new(ClusterError::ServiceTimeout("node boot".into())),
            cleanup_errors: vec!["release 10.0.0.5: refused".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out: node boot"));
        assert!(msg.contains("cleanup errors: release 10.0.0.5: refused"));
    }

    #[test]
    fn scale_out_enumerates_failures() {
        let err = ClusterError::ScaleOut {
            failures: vec!["c-02: boom".into(), "c-04: bang".into()],
            rollback_errors: vec![],
        };
        assert_eq!(err.to_string(), "2 node(s) failed to join: c-02: boom; c-04: bang");
    }

    #[test]
    fn service_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("one.vm.info");
        let msg = ClusterError::service(err).to_string();
        assert_eq!(msg, "service failure: one.vm.info: connection refused");
    }
}
