pub mod driver;
pub mod simulator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::vm::{HostId, VmId};
use crate::errors::AgentError;

pub use driver::{DriverRegistry, GenericDriver, HypervisorDriver, KvmDriver};
pub use simulator::{Fault, SimulatorAgent, VncPortAllocator};

/// Commands the control plane sends to a host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentCommand {
    StartVm {
        vm_id: VmId,
        name: String,
        cpu_count: u32,
        cpu_speed_mhz: u32,
        ram_mb: u64,
        /// Hypervisor-specific machine definition, if the family needs one.
        definition: Option<String>,
    },
    StopVm {
        vm_id: VmId,
        name: String,
        force: bool,
    },
    RebootVm {
        vm_id: VmId,
        name: String,
    },
    MigrateVm {
        vm_id: VmId,
        name: String,
        dest_host_id: HostId,
    },
    CheckVmState {
        vm_id: VmId,
        name: String,
    },
}

impl AgentCommand {
    pub fn vm_id(&self) -> VmId {
        match self {
            AgentCommand::StartVm { vm_id, .. }
            | AgentCommand::StopVm { vm_id, .. }
            | AgentCommand::RebootVm { vm_id, .. }
            | AgentCommand::MigrateVm { vm_id, .. }
            | AgentCommand::CheckVmState { vm_id, .. } => *vm_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerStatus {
    Success,
    Failed,
    /// Migration only: the destination could not take the VM after the
    /// source had already let go of it.
    FailedOnDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAnswer {
    pub status: AnswerStatus,
    pub details: String,
    pub power_state: Option<PowerState>,
}

impl AgentAnswer {
    pub fn success(details: impl Into<String>) -> Self {
        Self {
            status: AnswerStatus::Success,
            details: details.into(),
            power_state: None,
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            status: AnswerStatus::Failed,
            details: details.into(),
            power_state: None,
        }
    }

    pub fn with_power_state(mut self, state: PowerState) -> Self {
        self.power_state = Some(state);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AnswerStatus::Success
    }
}

/// Delivers commands to host agents. The answer future resolves when the
/// agent reports completion; callers bound the wait themselves.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn send(&self, host_id: HostId, command: AgentCommand) -> Result<AgentAnswer, AgentError>;
}
