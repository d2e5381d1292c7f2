//! Join/bootstrap configuration handed to nodes through `CONTEXT/CLUSTER_CFG`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use nimbus_common::{Cluster, ClusterError, ClusterResult, ClusterNetwork};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// First node: forms a new cluster.
    Bootstrap,
    /// Every other node: attaches to the cluster at `mgmt_ip`.
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub mode: JoinMode,
    pub cluster_name: String,
    pub network: ClusterNetwork,
    /// Number of nodes the cluster is being created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
    /// Only the bootstrap node needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
}

impl ClusterConfig {
    pub fn bootstrap(cluster: &Cluster, node_count: u32) -> ClusterResult<Self> {
        Ok(Self {
            mode: JoinMode::Bootstrap,
            cluster_name: cluster.name.clone(),
            network: network_of(cluster)?,
            node_count: Some(node_count),
            admin_password: Some(cluster.admin_password.clone()),
        })
    }

    pub fn join(cluster: &Cluster) -> ClusterResult<Self> {
        Ok(Self {
            mode: JoinMode::Join,
            cluster_name: cluster.name.clone(),
            network: network_of(cluster)?,
            node_count: None,
            admin_password: None,
        })
    }

    /// Compact JSON, base64 (standard alphabet, no line breaks).
    pub fn encode(&self) -> ClusterResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ClusterError::Configuration(format!("cluster config: {}", e)))?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> ClusterResult<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let json = STANDARD
            .decode(compact)
            .map_err(|e| ClusterError::Configuration(format!("cluster config is not base64: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| ClusterError::Configuration(format!("cluster config: {}", e)))
    }
}

fn network_of(cluster: &Cluster) -> ClusterResult<ClusterNetwork> {
    cluster.network.clone().ok_or_else(|| {
        ClusterError::Configuration(format!(
            "cluster {} has no network configuration",
            cluster.name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new("vfxt", "fxt-large", "s3cret");
        cluster.network = Some(ClusterNetwork {
            mgmt_ip: Ipv4Addr::new(10, 1, 0, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            cluster_ip_start: Ipv4Addr::new(10, 1, 0, 11),
            cluster_ip_end: Ipv4Addr::new(10, 1, 0, 13),
            cluster_ips: Vec::new(),
        });
        cluster
    }

    #[test]
    fn join_config_omits_the_password() {
        let encoded = ClusterConfig::join(&cluster()).unwrap().encode().unwrap();
        assert!(!encoded.contains(char::is_whitespace));
        let json = String::from_utf8(STANDARD.decode(&encoded).unwrap()).unwrap();
        assert!(json.starts_with(r#"{"mode":"join","cluster_name":"vfxt""#));
        assert!(!json.contains("s3cret"));
        assert!(!json.contains("cluster_ips"));
    }

    #[test]
    fn bootstrap_config_decodes_back() {
        let config = ClusterConfig::bootstrap(&cluster(), 3).unwrap();
        let decoded = ClusterConfig::decode(&config.encode().unwrap()).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.admin_password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn network_is_required() {
        let bare = Cluster::new("vfxt", "fxt-large", "pw");
        assert!(matches!(
            ClusterConfig::join(&bare),
            Err(ClusterError::Configuration(_))
        ));
    }
}
