pub mod handlers;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::ledger::ResourceType;
use crate::core::state_machine::VmEvent;
use crate::core::vm::{ClusterId, HostId, HypervisorType, PlanId, VmId, VmState};

pub use handlers::RetryHandler;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("VM error: {0}")]
    Vm(#[from] VmError),

    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("DRS error: {0}")]
    Drs(#[from] DrsError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("VM not found: {vm_id}")]
    NotFound { vm_id: VmId },

    #[error("event {event:?} is not valid for VM {vm_id} in state {state:?}")]
    IllegalTransition {
        vm_id: VmId,
        state: VmState,
        event: VmEvent,
    },

    #[error("VM {vm_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification { vm_id: VmId, expected_version: u64 },

    #[error("invalid request for VM {vm_id}: {message}")]
    InvalidRequest { vm_id: VmId, message: String },
}

#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("insufficient capacity for VM {vm_id}: {reason}")]
    InsufficientCapacity { vm_id: VmId, reason: String },

    #[error("no {resource_type} capacity record for host {host_id}")]
    UnknownRecord {
        host_id: HostId,
        resource_type: ResourceType,
    },
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent on host {host_id} is unavailable: {message}")]
    Unavailable { host_id: HostId, message: String },

    #[error("agent on host {host_id} did not answer within {after:?}")]
    Timeout { host_id: HostId, after: Duration },

    #[error("command failed on host {host_id}: {details}")]
    CommandFailed { host_id: HostId, details: String },

    #[error("no driver registered for hypervisor {0:?}")]
    NoDriver(HypervisorType),
}

#[derive(Error, Debug)]
pub enum DrsError {
    #[error("DRS plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("plan {plan_id} is stale: {reason}")]
    StalePlan { plan_id: PlanId, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("host not found: {0}")]
    HostNotFound(HostId),

    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    #[error("duplicate key: {0}")]
    Duplicate(String),
}

impl CloudError {
    /// True when the failure means the target host could not take the VM,
    /// either because the ledger said so or because placement state moved.
    pub fn is_capacity_conflict(&self) -> bool {
        matches!(
            self,
            CloudError::Capacity(CapacityError::InsufficientCapacity { .. })
                | CloudError::Vm(VmError::ConcurrentModification { .. })
                | CloudError::Vm(VmError::IllegalTransition { .. })
                | CloudError::Drs(DrsError::StalePlan { .. })
        )
    }

    /// The command never reached an agent, so sending it again cannot run
    /// it twice.
    pub fn is_undelivered(&self) -> bool {
        matches!(self, CloudError::Agent(AgentError::Unavailable { .. }))
    }

    /// Agent-layer failures are the only ones worth retrying blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Agent(AgentError::Unavailable { .. })
                | CloudError::Agent(AgentError::Timeout { .. })
        )
    }
}

/// An adjustment that would have pushed a capacity record outside
/// `0 <= used, reserved` and `used + reserved <= total`. The ledger clamps
/// and reports these instead of failing the transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} on host {host_id} {resource_type}: requested {requested}, applied {applied}")]
pub struct ClampViolation {
    pub host_id: HostId,
    pub resource_type: ResourceType,
    pub kind: ClampKind,
    pub requested: u64,
    pub applied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampKind {
    UsedUnderflow,
    ReservedUnderflow,
    Overflow,
}

impl fmt::Display for ClampKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClampKind::UsedUnderflow => write!(f, "used underflow"),
            ClampKind::ReservedUnderflow => write!(f, "reserved underflow"),
            ClampKind::Overflow => write!(f, "capacity overflow"),
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
