use crate::addresses::AddressAllocator;
use crate::connection::ConnectionPool;
use crate::settings::Settings;
use anyhow::{bail, Result};
use nimbus_providers::ipam::XmlRpcAddressService;
use nimbus_providers::management::XmlRpcManagementConnector;
use nimbus_providers::xmlrpc::XmlRpcClient;
use nimbus_providers::{AddressService, ManagementConnector};
use std::sync::Arc;

#[cfg(feature = "provider-mock")]
use nimbus_providers::mock::{MockAddressService, MockManagement, MockProvider};
#[cfg(feature = "provider-opennebula")]
use nimbus_providers::{opennebula::OpenNebulaProvider, ControlPlane};

/// Builds the configured backends.
pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name(settings: &Settings) -> &str {
        settings.provider.as_str()
    }

    /// Pool over the configured control plane. Connections open lazily.
    pub fn connection_pool(settings: &Settings) -> Result<Arc<ConnectionPool>> {
        match Self::current_provider_name(settings) {
            #[cfg(feature = "provider-opennebula")]
            "opennebula" => {
                let cfg = settings.control_plane.clone();
                if cfg.password.is_empty() {
                    tracing::warn!("⚠️ [providers] ONE_PASSWORD is empty");
                }
                Ok(ConnectionPool::new(move || {
                    let rpc = XmlRpcClient::new(&cfg.endpoint, cfg.timeout, cfg.accept_invalid_certs)?;
                    Ok(Arc::new(OpenNebulaProvider::new(rpc, &cfg.username, &cfg.password))
                        as Arc<dyn ControlPlane>)
                }))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                let mock = MockProvider::new();
                let templates = std::env::var("MOCK_TEMPLATES").unwrap_or_else(|_| "mock-small".to_string());
                for name in templates.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    mock.add_template(name);
                }
                Ok(ConnectionPool::shared(Arc::new(mock)))
            }
            other => bail!("unknown or disabled provider {:?}", other),
        }
    }

    /// Allocator over the IP-management service, when one is configured.
    pub fn address_allocator(settings: &Settings) -> Result<Option<AddressAllocator>> {
        if let Some(ipam) = &settings.ipam {
            let rpc = XmlRpcClient::new(&ipam.endpoint, settings.control_plane.timeout, false)?;
            let service: Arc<dyn AddressService> = Arc::new(XmlRpcAddressService::new(rpc));
            return Ok(Some(AddressAllocator::new(
                service,
                &ipam.user,
                &ipam.network,
                ipam.netmask,
            )));
        }
        #[cfg(feature = "provider-mock")]
        {
            if Self::current_provider_name(settings) == "mock" {
                let service: Arc<dyn AddressService> =
                    Arc::new(MockAddressService::new(std::net::Ipv4Addr::new(10, 99, 0, 10), 200));
                return Ok(Some(AddressAllocator::new(
                    service,
                    "nimbus",
                    "mock",
                    std::net::Ipv4Addr::new(255, 255, 255, 0),
                )));
            }
        }
        Ok(None)
    }

    pub fn management_connector(settings: &Settings) -> Arc<dyn ManagementConnector> {
        #[cfg(feature = "provider-mock")]
        {
            if Self::current_provider_name(settings) == "mock" {
                return Arc::new(MockManagement::new(&uuid::Uuid::new_v4().to_string()));
            }
        }
        Arc::new(XmlRpcManagementConnector::new(settings.bootstrap.mgmt_timeout))
    }
}
