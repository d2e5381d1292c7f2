use crate::xmlrpc::{Value, XmlRpcClient};
use crate::{inventory, ControlPlane};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use nimbus_common::{Instance, InstanceStatus, Template};
use serde::Deserialize;

/// OpenNebula control plane (`one.*` XML-RPC API).
pub struct OpenNebulaProvider {
    rpc: XmlRpcClient,
    session: String,
}

impl OpenNebulaProvider {
    pub fn new(rpc: XmlRpcClient, username: &str, password: &str) -> Self {
        Self {
            rpc,
            session: format!("{}:{}", username.trim(), password.trim()),
        }
    }

    /// Every `one.*` call answers `[success, body_or_error, error_code, ...]`.
    async fn call_one(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::from(self.session.as_str()));
        params.extend(args);

        let resp = self.rpc.call(method, &params).await?;
        let items = resp
            .as_array()
            .ok_or_else(|| anyhow!("{}: expected a result array", method))?;
        let ok = items.first().and_then(Value::as_bool).unwrap_or(false);
        let body = items.get(1).cloned().unwrap_or(Value::Nil);
        if !ok {
            let code = items.get(2).and_then(Value::as_i64).unwrap_or(-1);
            let message = body.as_str().unwrap_or("unknown error");
            tracing::warn!("❌ [OpenNebula API] {} failed: code={} message={}", method, code, message);
            bail!("{} failed (code {}): {}", method, code, message);
        }
        Ok(body)
    }

    async fn vm_action(&self, action: &str, id: i64) -> Result<()> {
        tracing::info!("🔵 [OpenNebula API] one.vm.action {} vm={}", action, id);
        self.call_one("one.vm.action", vec![action.into(), id.into()])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for OpenNebulaProvider {
    async fn find_instances(&self, query: &inventory::PoolQuery) -> Result<Vec<Instance>> {
        let body = self
            .call_one(
                "one.vmpool.info",
                vec![
                    query.ownership.code().into(),
                    query.range_start.into(),
                    query.range_end.into(),
                    query.state.code().into(),
                ],
            )
            .await?;
        let xml = body
            .as_str()
            .ok_or_else(|| anyhow!("one.vmpool.info: expected an XML document"))?;
        parse_vm_pool(xml)
    }

    async fn get_instance(&self, id: i64) -> Result<Instance> {
        let body = self.call_one("one.vm.info", vec![id.into()]).await?;
        let xml = body
            .as_str()
            .ok_or_else(|| anyhow!("one.vm.info: expected an XML document"))?;
        parse_vm(xml)
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let body = self
            .call_one("one.templatepool.info", template_pool_args())
            .await?;
        let xml = body
            .as_str()
            .ok_or_else(|| anyhow!("one.templatepool.info: expected an XML document"))?;
        parse_template_pool(xml)
    }

    async fn create_instance(
        &self,
        template_id: i64,
        name: &str,
        extra_template: &str,
    ) -> Result<i64> {
        tracing::info!(
            "🔵 [OpenNebula API] one.template.instantiate template={} name={}",
            template_id,
            name
        );
        let body = self
            .call_one(
                "one.template.instantiate",
                vec![
                    template_id.into(),
                    name.into(),
                    false.into(), // on hold
                    extra_template.into(),
                    false.into(), // persistent copy
                ],
            )
            .await?;
        let id = body
            .as_i64()
            .ok_or_else(|| anyhow!("one.template.instantiate: expected a VM id"))?;
        tracing::info!("✅ [OpenNebula API] VM created: id={} name={}", id, name);
        Ok(id)
    }

    async fn start_instance(&self, id: i64) -> Result<()> {
        self.vm_action("resume", id).await
    }

    async fn stop_instance(&self, id: i64) -> Result<()> {
        self.vm_action("poweroff", id).await
    }

    async fn delete_instance(&self, id: i64) -> Result<()> {
        self.vm_action("terminate-hard", id).await
    }
}

// --- XML documents ---

#[derive(Debug, Deserialize)]
struct VmPoolXml {
    #[serde(rename = "VM", default)]
    vms: Vec<VmXml>,
}

#[derive(Debug, Deserialize)]
struct VmXml {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "NAME")]
    name: String,
    #[serde(rename = "STATE")]
    state: i64,
    #[serde(rename = "LCM_STATE", default)]
    lcm_state: i64,
    #[serde(rename = "TEMPLATE", default)]
    template: VmTemplateXml,
    #[serde(rename = "USER_TEMPLATE", default)]
    user_template: UserTemplateXml,
}

#[derive(Debug, Default, Deserialize)]
struct VmTemplateXml {
    #[serde(rename = "NIC", default)]
    nics: Vec<NicXml>,
    #[serde(rename = "TEMPLATE_ID", default)]
    template_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NicXml {
    #[serde(rename = "IP", default)]
    ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserTemplateXml {
    #[serde(rename = "ERROR", default)]
    error: Option<String>,
    #[serde(rename = "MACHINE_TYPE", default)]
    machine_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplatePoolXml {
    #[serde(rename = "VMTEMPLATE", default)]
    templates: Vec<TemplateXml>,
}

#[derive(Debug, Deserialize)]
struct TemplateXml {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "NAME")]
    name: String,
}

impl TryFrom<VmXml> for Instance {
    type Error = anyhow::Error;

    fn try_from(vm: VmXml) -> Result<Self> {
        let status = InstanceStatus::from_codes(vm.state, vm.lcm_state)
            .ok_or_else(|| anyhow!("VM {} reports unknown state {}", vm.id, vm.state))?;
        Ok(Instance {
            id: vm.id,
            name: vm.name,
            status,
            ip: vm.template.nics.into_iter().find_map(|n| n.ip),
            template_id: vm.template.template_id,
            template_name: vm.user_template.machine_type,
            error: vm.user_template.error.filter(|e| !e.trim().is_empty()),
        })
    }
}

fn parse_vm(xml: &str) -> Result<Instance> {
    let vm: VmXml = quick_xml::de::from_str(xml).context("malformed VM document")?;
    vm.try_into()
}

fn parse_vm_pool(xml: &str) -> Result<Vec<Instance>> {
    let pool: VmPoolXml = quick_xml::de::from_str(xml).context("malformed VM_POOL document")?;
    pool.vms.into_iter().map(Instance::try_from).collect()
}

fn parse_template_pool(xml: &str) -> Result<Vec<Template>> {
    let pool: TemplatePoolXml =
        quick_xml::de::from_str(xml).context("malformed VMTEMPLATE_POOL document")?;
    Ok(pool
        .templates
        .into_iter()
        .map(|t| Template {
            id: t.id,
            name: t.name,
        })
        .collect())
}

/// Templates visible to the session user and their group, any id.
fn template_pool_args() -> Vec<Value> {
    let user_and_group = inventory::Ownership::UserAndGroup.code();
    vec![user_and_group.into(), (-1i64).into(), (-1i64).into()]
}
