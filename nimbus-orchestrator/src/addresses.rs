use ipnetwork::Ipv4Network;
use nimbus_common::{AddressReservation, ClusterError, ClusterResult};
use nimbus_providers::AddressService;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Reserves cluster addresses from the external IP-management service.
///
/// Every call goes to the service; nothing is cached.
#[derive(Clone)]
pub struct AddressAllocator {
    service: Arc<dyn AddressService>,
    user: String,
    network: String,
    netmask: Ipv4Addr,
}

impl AddressAllocator {
    pub fn new(service: Arc<dyn AddressService>, user: &str, network: &str, netmask: Ipv4Addr) -> Self {
        Self {
            service,
            user: user.to_string(),
            network: network.to_string(),
            netmask,
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    /// Reserve `count` addresses on the configured network.
    pub async fn get_available_addresses(
        &self,
        count: usize,
        contiguous: bool,
    ) -> ClusterResult<AddressReservation> {
        if count == 0 {
            return Err(ClusterError::Configuration(
                "at least one address must be requested".to_string(),
            ));
        }
        let raw = if contiguous {
            self.service.allocate(&self.user, count, &self.network).await
        } else {
            self.service
                .allocate_noncontiguous(&self.user, count, &self.network)
                .await
        }
        .map_err(ClusterError::service)?;

        let parsed: Result<Vec<Ipv4Addr>, _> = raw.iter().map(|ip| ip.trim().parse::<Ipv4Addr>()).collect();
        let problem = match &parsed {
            Err(e) => Some(format!("address service returned an invalid address: {}", e)),
            Ok(addresses) if addresses.len() != count => Some(format!(
                "address service returned {} address(es), {} requested",
                addresses.len(),
                count
            )),
            Ok(_) => None,
        };
        if let Some(problem) = problem {
            // Hand back whatever we got so nothing leaks.
            if !raw.is_empty() {
                if let Err(e) = self.service.release(&raw).await {
                    tracing::warn!("⚠️ [addresses] releasing partial reservation failed: {:#}", e);
                }
            }
            return Err(ClusterError::ServiceFailure(problem));
        }

        let addresses = parsed.unwrap_or_default();
        tracing::info!(
            "📍 [addresses] reserved {} address(es) on {}: {}",
            addresses.len(),
            self.network,
            addresses
                .iter()
                .map(Ipv4Addr::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(AddressReservation::new(addresses, self.netmask))
    }

    /// Give a reservation back. A second call is a logged no-op.
    pub async fn release(&self, reservation: &mut AddressReservation) -> ClusterResult<()> {
        if reservation.released {
            tracing::warn!(
                "⚠️ [addresses] reservation of {} address(es) already released",
                reservation.addresses.len()
            );
            return Ok(());
        }
        let addresses: Vec<String> = reservation.addresses.iter().map(Ipv4Addr::to_string).collect();
        self.service
            .release(&addresses)
            .await
            .map_err(ClusterError::service)?;
        reservation.released = true;
        tracing::info!("📍 [addresses] released {}", addresses.join(", "));
        Ok(())
    }

    /// Addresses the service reports as used inside `cidr`, sorted.
    pub async fn in_use_addresses(&self, cidr: &str) -> ClusterResult<Vec<Ipv4Addr>> {
        let block: Ipv4Network = cidr
            .trim()
            .parse()
            .map_err(|e| ClusterError::Configuration(format!("invalid CIDR {:?}: {}", cidr, e)))?;

        let usage = self.service.dumpinfo().await.map_err(ClusterError::service)?;
        let mut used: Vec<Ipv4Addr> = usage
            .iter()
            .filter_map(|u| u.ip.trim().parse::<Ipv4Addr>().ok())
            .filter(|ip| block.contains(*ip))
            .collect();
        used.sort();
        used.dedup();
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_providers::mock::MockAddressService;

    fn allocator(svc: &MockAddressService) -> AddressAllocator {
        AddressAllocator::new(
            Arc::new(svc.clone()),
            "nimbus",
            "cluster-net",
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    #[tokio::test]
    async fn contiguous_reservation_and_single_release() {
        let svc = MockAddressService::new(Ipv4Addr::new(10, 1, 0, 10), 16);
        let alloc = allocator(&svc);

        let mut res = alloc.get_available_addresses(3, true).await.unwrap();
        assert_eq!(
            res.addresses,
            vec![
                Ipv4Addr::new(10, 1, 0, 10),
                Ipv4Addr::new(10, 1, 0, 11),
                Ipv4Addr::new(10, 1, 0, 12)
            ]
        );
        assert_eq!(res.netmask, Ipv4Addr::new(255, 255, 255, 0));

        alloc.release(&mut res).await.unwrap();
        alloc.release(&mut res).await.unwrap();
        assert!(res.released);
        assert_eq!(svc.releases().len(), 1);
    }

    #[tokio::test]
    async fn noncontiguous_reservation() {
        let svc = MockAddressService::new(Ipv4Addr::new(10, 1, 0, 10), 16);
        let res = allocator(&svc).get_available_addresses(2, false).await.unwrap();
        assert_eq!(
            res.addresses,
            vec![Ipv4Addr::new(10, 1, 0, 10), Ipv4Addr::new(10, 1, 0, 12)]
        );
    }

    #[tokio::test]
    async fn service_errors_are_service_failures() {
        let svc = MockAddressService::new(Ipv4Addr::new(10, 1, 0, 10), 2);
        let alloc = allocator(&svc);
        assert!(matches!(
            alloc.get_available_addresses(5, true).await,
            Err(ClusterError::ServiceFailure(_))
        ));
        assert!(matches!(
            alloc.get_available_addresses(0, true).await,
            Err(ClusterError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn in_use_is_limited_to_the_block() {
        let svc = MockAddressService::new(Ipv4Addr::new(10, 1, 0, 10), 16);
        svc.add_usage("10.1.0.200", "someone");
        svc.add_usage("10.2.0.1", "elsewhere");
        svc.add_usage("not-an-ip", "junk");
        let alloc = allocator(&svc);
        alloc.get_available_addresses(1, true).await.unwrap();

        let used = alloc.in_use_addresses("10.1.0.0/24").await.unwrap();
        assert_eq!(
            used,
            vec![Ipv4Addr::new(10, 1, 0, 10), Ipv4Addr::new(10, 1, 0, 200)]
        );
        assert!(matches!(
            alloc.in_use_addresses("10.1.0.0/33").await,
            Err(ClusterError::Configuration(_))
        ));
    }
}
