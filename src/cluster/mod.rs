use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::core::ledger::{CapacityLedger, Footprint, ResourceType};
use crate::core::store::DataStore;
use crate::core::vm::{ClusterId, HostId, HostStatus, ServiceOffering};
use crate::errors::CloudResult;

/// Placement contract: picks a host in a cluster that can take a VM of the
/// given offering.
#[async_trait]
pub trait HostAllocator: Send + Sync {
    async fn find_suitable_host(
        &self,
        cluster_id: Option<ClusterId>,
        offering: &ServiceOffering,
        exclude: &[HostId],
    ) -> CloudResult<Option<HostId>>;
}

/// Least loaded `Up` host that still has room for the offering on both
/// resources. The check is advisory; the state machine admits under the
/// row lock.
pub struct FirstFitAllocator {
    store: Arc<dyn DataStore>,
    ledger: Arc<CapacityLedger>,
}

impl FirstFitAllocator {
    pub fn new(store: Arc<dyn DataStore>, ledger: Arc<CapacityLedger>) -> Self {
        Self { store, ledger }
    }
}

#[async_trait]
impl HostAllocator for FirstFitAllocator {
    async fn find_suitable_host(
        &self,
        cluster_id: Option<ClusterId>,
        offering: &ServiceOffering,
        exclude: &[HostId],
    ) -> CloudResult<Option<HostId>> {
        let footprint = Footprint::from(offering);
        let hosts = self.store.list_hosts(cluster_id).await?;

        let mut best: Option<(f64, HostId)> = None;
        for host in hosts
            .iter()
            .filter(|h| h.status == HostStatus::Up && !exclude.contains(&h.id))
        {
            let records = self.ledger.host_records(host.id).await;
            if records.len() != ResourceType::ALL.len() {
                continue;
            }
            let fits = records
                .iter()
                .all(|r| r.free() >= footprint.amount(r.resource_type));
            if !fits {
                continue;
            }
            let load = records.iter().map(|r| r.load()).fold(0.0, f64::max);
            if best.map_or(true, |(best_load, _)| load < best_load) {
                best = Some((load, host.id));
            }
        }

        debug!(
            cluster_id = ?cluster_id,
            offering = %offering.name,
            host_id = ?best.map(|(_, h)| h),
            "Host allocation"
        );
        Ok(best.map(|(_, host)| host))
    }
}
