use crate::xmlrpc::{Value, XmlRpcClient};
use crate::{inventory, ManagementApi, ManagementConnector};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const MANAGEMENT_USER: &str = "admin";

/// Management API of a running cluster node, spoken over XML-RPC.
pub struct XmlRpcManagementApi {
    rpc: XmlRpcClient,
}

impl XmlRpcManagementApi {
    pub fn new(rpc: XmlRpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl ManagementApi for XmlRpcManagementApi {
    async fn list_licenses(&self) -> Result<inventory::LicenseInfo> {
        let resp = self.rpc.call("cluster.listLicenses", &[]).await?;
        let uuid = resp
            .get("clusterUUID")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("cluster.listLicenses: missing clusterUUID"))?;
        Ok(inventory::LicenseInfo {
            cluster_uuid: uuid.to_string(),
        })
    }

    async fn add_license(&self, key: &str) -> Result<String> {
        let resp = self.rpc.call("cluster.addLicense", &[key.into()]).await?;
        Ok(resp.as_str().unwrap_or_default().to_string())
    }

    async fn list_nodes(&self) -> Result<Vec<String>> {
        let resp = self.rpc.call("node.list", &[]).await?;
        resp.as_array()
            .ok_or_else(|| anyhow!("node.list: expected a list of names"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("node.list: non-string node name"))
            })
            .collect()
    }

    async fn get_node(&self, name: &str) -> Result<inventory::NodeInfo> {
        let resp = self.rpc.call("node.get", &[name.into()]).await?;
        // node.get answers `{name: {...descriptor...}}`; accept a bare descriptor too.
        let descriptor = resp.get(name).unwrap_or(&resp);
        let primary_cluster_ip = descriptor
            .get("primaryClusterIP")
            .and_then(|ip| ip.get("IP"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(inventory::NodeInfo {
            name: name.to_string(),
            primary_cluster_ip,
        })
    }
}

/// Builds management sessions for `https://<address>/python/rpc.py`.
pub struct XmlRpcManagementConnector {
    timeout: Duration,
}

impl XmlRpcManagementConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ManagementConnector for XmlRpcManagementConnector {
    async fn connect(&self, address: Ipv4Addr, password: &str) -> Result<Box<dyn ManagementApi>> {
        let endpoint = format!("https://{}/python/rpc.py", address);
        // Freshly booted nodes serve a self-signed certificate.
        let rpc = XmlRpcClient::new(&endpoint, self.timeout, true)?
            .with_basic_auth(MANAGEMENT_USER, password);
        Ok(Box::new(XmlRpcManagementApi::new(rpc)))
    }
}
