use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmId(pub Uuid);

impl VmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

numeric_id!(HostId);
numeric_id!(ClusterId);
numeric_id!(PodId);
numeric_id!(ZoneId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Destroyed,
    Error,
    Unknown,
    Expunging,
}

impl VmState {
    pub const ALL: [VmState; 9] = [
        VmState::Starting,
        VmState::Running,
        VmState::Stopping,
        VmState::Stopped,
        VmState::Migrating,
        VmState::Destroyed,
        VmState::Error,
        VmState::Unknown,
        VmState::Expunging,
    ];

    /// States in which the VM is bound to a host (`host_id` is set).
    pub fn is_on_host(&self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Running | VmState::Migrating | VmState::Stopping
        )
    }

    /// A VM in one of these states has an operation in flight and must not
    /// be picked by the DRS planner.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Stopping | VmState::Migrating | VmState::Expunging
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorType {
    Kvm,
    Xen,
    Vmware,
    Simulator,
}

/// Sizing template a VM consumes capacity according to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: u64,
    pub name: String,
    pub cpu_count: u32,
    pub cpu_speed_mhz: u32,
    pub ram_mb: u64,
}

impl ServiceOffering {
    /// CPU footprint in MHz.
    pub fn cpu_mhz(&self) -> u64 {
        self.cpu_count as u64 * self.cpu_speed_mhz as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementHints {
    pub zone_id: Option<ZoneId>,
    pub cluster_id: Option<ClusterId>,
    pub host_id: Option<HostId>,
}

/// What the caller asks for on `allocate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub vm_type: VmType,
    pub hypervisor: HypervisorType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachineInstance {
    pub id: VmId,
    pub name: String,
    pub vm_type: VmType,
    pub hypervisor: HypervisorType,
    pub state: VmState,
    pub host_id: Option<HostId>,
    pub last_host_id: Option<HostId>,
    pub offering: ServiceOffering,
    pub placement: PlacementHints,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub removed: Option<DateTime<Utc>>,
}

impl VirtualMachineInstance {
    pub fn new(
        spec: VmSpec,
        offering: ServiceOffering,
        placement: PlacementHints,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: VmId::new(),
            name: spec.name,
            vm_type: spec.vm_type,
            hypervisor: spec.hypervisor,
            state: VmState::Stopped,
            host_id: None,
            last_host_id: None,
            offering,
            placement,
            version: 0,
            created_at: now,
            updated_at: now,
            removed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Up,
    Down,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    pub cluster_id: ClusterId,
    pub hypervisor: HypervisorType,
    pub cpu_cores: u32,
    pub cpu_speed_mhz: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub status: HostStatus,
}

impl Host {
    pub fn cpu_mhz(&self) -> u64 {
        self.cpu_cores as u64 * self.cpu_speed_mhz as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    #[serde(default = "default_drs_enabled")]
    pub drs_enabled: bool,
}

fn default_drs_enabled() -> bool {
    true
}
