#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use cloud_orchestrator::agent::{DriverRegistry, SimulatorAgent};
use cloud_orchestrator::cluster::FirstFitAllocator;
use cloud_orchestrator::config::Settings;
use cloud_orchestrator::core::calibrator::Calibrator;
use cloud_orchestrator::core::clock::ManualClock;
use cloud_orchestrator::core::ledger::{CapacityLedger, CapacitySnapshot, ResourceType};
use cloud_orchestrator::core::store::{DataStore, MemoryStore};
use cloud_orchestrator::core::vm::{
    Cluster, ClusterId, Host, HostId, HostStatus, HypervisorType, PlacementHints, PodId,
    ServiceOffering, VmId, VmSpec, VmType, ZoneId,
};
use cloud_orchestrator::Orchestrator;

pub const HOST_CORES: u32 = 8;
pub const HOST_CORE_MHZ: u32 = 1000;
pub const HOST_MEMORY_MB: u64 = 16_384;

pub struct Fixture {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<CapacityLedger>,
    pub agent: Arc<SimulatorAgent>,
    pub clock: Arc<ManualClock>,
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.orchestrator.agent_timeout_secs = 5;
    settings.orchestrator.agent_retries = 0;
    settings.orchestrator.retry_backoff_ms = 0;
    settings.orchestrator.start_attempts = 3;
    settings
}

/// 2 vCPU x 2000 MHz, 4 GiB.
pub fn medium() -> ServiceOffering {
    ServiceOffering {
        id: 1,
        name: "medium".into(),
        cpu_count: 2,
        cpu_speed_mhz: 2000,
        ram_mb: 4096,
    }
}

/// 1 vCPU x 1000 MHz, 1 GiB.
pub fn small() -> ServiceOffering {
    ServiceOffering {
        id: 2,
        name: "small".into(),
        cpu_count: 1,
        cpu_speed_mhz: 1000,
        ram_mb: 1024,
    }
}

pub fn host(id: u64, cluster: u64) -> Host {
    Host {
        id: HostId(id),
        name: format!("host-{id}"),
        zone_id: ZoneId(1),
        pod_id: PodId(1),
        cluster_id: ClusterId(cluster),
        hypervisor: HypervisorType::Simulator,
        cpu_cores: HOST_CORES,
        cpu_speed_mhz: HOST_CORE_MHZ,
        memory_mb: HOST_MEMORY_MB,
        status: HostStatus::Up,
    }
}

impl Fixture {
    /// Cluster 1 with hosts 1..=`hosts`.
    pub async fn new(hosts: u64) -> Self {
        Self::with(test_settings(), SimulatorAgent::new(), hosts).await
    }

    pub async fn with(settings: Settings, agent: SimulatorAgent, hosts: u64) -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CapacityLedger::new());
        let agent = Arc::new(agent);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let allocator = Arc::new(FirstFitAllocator::new(store.clone(), ledger.clone()));

        let orchestrator = Arc::new(
            Orchestrator::new(
                store.clone(),
                ledger.clone(),
                DriverRegistry::with_dispatcher(agent.clone()),
                allocator,
                clock.clone(),
                settings,
            )
            .unwrap(),
        );

        let fixture = Self {
            orchestrator,
            store,
            ledger,
            agent,
            clock,
        };
        fixture.add_cluster(1).await;
        for id in 1..=hosts {
            fixture.orchestrator.register_host(host(id, 1)).await.unwrap();
        }
        fixture
    }

    pub async fn add_cluster(&self, id: u64) {
        self.store
            .insert_cluster(Cluster {
                id: ClusterId(id),
                name: format!("cluster-{id}"),
                zone_id: ZoneId(1),
                pod_id: PodId(1),
                drs_enabled: true,
            })
            .await
            .unwrap();
    }

    pub async fn allocate(&self, name: &str, offering: ServiceOffering) -> VmId {
        self.allocate_on(name, offering, None).await
    }

    pub async fn allocate_on(
        &self,
        name: &str,
        offering: ServiceOffering,
        host_id: Option<HostId>,
    ) -> VmId {
        self.orchestrator
            .allocate(
                VmSpec {
                    name: name.into(),
                    vm_type: VmType::User,
                    hypervisor: HypervisorType::Simulator,
                },
                offering,
                PlacementHints {
                    zone_id: None,
                    cluster_id: Some(ClusterId(1)),
                    host_id,
                },
            )
            .await
            .unwrap()
    }

    /// Allocates and starts a VM pinned to `host_id`.
    pub async fn running_on(&self, name: &str, offering: ServiceOffering, host_id: u64) -> VmId {
        let vm_id = self.allocate_on(name, offering, Some(HostId(host_id))).await;
        self.orchestrator.start(vm_id).await.unwrap();
        vm_id
    }

    pub async fn capacity(&self, host_id: u64, resource_type: ResourceType) -> CapacitySnapshot {
        self.ledger
            .capacity(HostId(host_id), resource_type)
            .await
            .unwrap()
    }

    pub fn calibrator(&self) -> Calibrator {
        Calibrator::new(
            self.store.clone(),
            self.ledger.clone(),
            self.clock.clone(),
            self.orchestrator.settings().capacity.reservation_retention(),
        )
    }
}
