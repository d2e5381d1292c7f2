use crate::xmlrpc::{Value, XmlRpcClient};
use crate::{inventory, AddressService};
use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// IP-management service reached over XML-RPC.
pub struct XmlRpcAddressService {
    rpc: XmlRpcClient,
}

impl XmlRpcAddressService {
    pub fn new(rpc: XmlRpcClient) -> Self {
        Self { rpc }
    }

    async fn allocate_with(
        &self,
        method: &str,
        user: &str,
        count: usize,
        network: &str,
    ) -> Result<Vec<String>> {
        let count = i64::try_from(count).map_err(|_| anyhow!("address count {} too large", count))?;
        let resp = self
            .rpc
            .call(method, &[user.into(), count.into(), network.into()])
            .await?;
        let addresses = string_list(&resp).ok_or_else(|| anyhow!("{}: expected a list of addresses", method))?;
        tracing::info!(
            "✅ [ipam] {} reserved {} address(es) on {} for {}",
            method,
            addresses.len(),
            network,
            user
        );
        Ok(addresses)
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[async_trait]
impl AddressService for XmlRpcAddressService {
    async fn allocate(&self, user: &str, count: usize, network: &str) -> Result<Vec<String>> {
        self.allocate_with("allocate", user, count, network).await
    }

    async fn allocate_noncontiguous(
        &self,
        user: &str,
        count: usize,
        network: &str,
    ) -> Result<Vec<String>> {
        self.allocate_with("allocate_noncontiguous", user, count, network)
            .await
    }

    async fn release(&self, addresses: &[String]) -> Result<()> {
        let list: Vec<Value> = addresses.iter().map(|a| Value::from(a.as_str())).collect();
        self.rpc.call("release", &[Value::Array(list)]).await?;
        tracing::info!("✅ [ipam] released {} address(es)", addresses.len());
        Ok(())
    }

    async fn dumpinfo(&self) -> Result<Vec<inventory::AddressUsage>> {
        let resp = self.rpc.call("dumpinfo", &[]).await?;
        let rows = resp
            .as_array()
            .ok_or_else(|| anyhow!("dumpinfo: expected a list of entries"))?;

        // Each entry is a tuple `(ip, owner, ...)`.
        let mut usage = Vec::with_capacity(rows.len());
        for row in rows {
            let fields = row
                .as_array()
                .ok_or_else(|| anyhow!("dumpinfo: expected (ip, ...) tuples"))?;
            let ip = fields
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("dumpinfo: entry without an address"))?;
            usage.push(inventory::AddressUsage {
                ip: ip.to_string(),
                owner: fields.get(1).and_then(Value::as_str).map(str::to_string),
            });
        }
        Ok(usage)
    }
}
