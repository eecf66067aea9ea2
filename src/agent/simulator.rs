use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AgentAnswer, AgentCommand, AgentDispatcher, AnswerStatus, PowerState};
use crate::core::vm::{HostId, VmId};
use crate::errors::AgentError;

pub const VNC_BASE_PORT: u16 = 5900;
pub const VNC_PORTS_PER_HOST: usize = 256;

/// Bitmap of VNC display ports on one host.
#[derive(Debug, Clone)]
pub struct VncPortAllocator {
    base: u16,
    in_use: Vec<bool>,
}

impl VncPortAllocator {
    pub fn new(base: u16, size: usize) -> Self {
        Self {
            base,
            in_use: vec![false; size],
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        let slot = self.in_use.iter().position(|used| !used)?;
        self.in_use[slot] = true;
        Some(self.base + slot as u16)
    }

    pub fn release(&mut self, port: u16) {
        if let Some(slot) = port
            .checked_sub(self.base)
            .and_then(|s| self.in_use.get_mut(s as usize))
        {
            *slot = false;
        }
    }

    pub fn allocated(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }
}

impl Default for VncPortAllocator {
    fn default() -> Self {
        Self::new(VNC_BASE_PORT, VNC_PORTS_PER_HOST)
    }
}

/// Misbehaviour a simulated host can be told to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every command errors with `AgentError::Unavailable`.
    Unavailable,
    /// Commands never complete.
    Hang,
    /// Commands complete with a failed answer.
    FailCommands,
    /// Migrations arriving on this host fail after the source let go.
    RejectIncomingMigrations,
}

#[derive(Debug, Clone, Copy)]
struct SimulatedVm {
    host_id: HostId,
    vnc_port: u16,
}

#[derive(Default)]
struct SimState {
    vms: HashMap<VmId, SimulatedVm>,
    ports: HashMap<HostId, VncPortAllocator>,
    faults: HashMap<HostId, Fault>,
}

impl SimState {
    fn place(&mut self, vm_id: VmId, host_id: HostId) -> Result<u16, String> {
        let port = self
            .ports
            .entry(host_id)
            .or_default()
            .allocate()
            .ok_or_else(|| format!("no free VNC port on host {host_id}"))?;
        self.vms.insert(vm_id, SimulatedVm { host_id, vnc_port: port });
        Ok(port)
    }

    fn evict(&mut self, vm_id: VmId) -> Option<SimulatedVm> {
        let vm = self.vms.remove(&vm_id)?;
        if let Some(ports) = self.ports.get_mut(&vm.host_id) {
            ports.release(vm.vnc_port);
        }
        Some(vm)
    }
}

/// In-process stand-in for the host agents. Each instance owns its own VM
/// placement and VNC port bitmaps, so independent simulators never share
/// state.
pub struct SimulatorAgent {
    state: Mutex<SimState>,
    latency: Duration,
}

impl Default for SimulatorAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatorAgent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn set_fault(&self, host_id: HostId, fault: Option<Fault>) {
        let mut state = self.state.lock().await;
        match fault {
            Some(fault) => {
                info!(host_id = %host_id, ?fault, "Simulated host fault injected");
                state.faults.insert(host_id, fault);
            }
            None => {
                state.faults.remove(&host_id);
            }
        }
    }

    pub async fn host_of(&self, vm_id: VmId) -> Option<HostId> {
        self.state.lock().await.vms.get(&vm_id).map(|vm| vm.host_id)
    }

    pub async fn vnc_port(&self, vm_id: VmId) -> Option<u16> {
        self.state.lock().await.vms.get(&vm_id).map(|vm| vm.vnc_port)
    }

    pub async fn running_on(&self, host_id: HostId) -> Vec<VmId> {
        self.state
            .lock()
            .await
            .vms
            .iter()
            .filter(|(_, vm)| vm.host_id == host_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Puts a VM on a host without a command, as if it had been found
    /// running there.
    pub async fn adopt(&self, vm_id: VmId, host_id: HostId) {
        let mut state = self.state.lock().await;
        state.evict(vm_id);
        let _ = state.place(vm_id, host_id);
    }

    fn execute(state: &mut SimState, host_id: HostId, command: AgentCommand) -> AgentAnswer {
        match command {
            AgentCommand::StartVm { vm_id, name, .. } => {
                if let Some(vm) = state.vms.get(&vm_id) {
                    if vm.host_id == host_id {
                        return AgentAnswer::success(format!("{name} already running"))
                            .with_power_state(PowerState::On);
                    }
                    return AgentAnswer::failed(format!(
                        "{name} is running on host {}",
                        vm.host_id
                    ));
                }
                match state.place(vm_id, host_id) {
                    Ok(port) => AgentAnswer::success(format!("{name} started, vnc port {port}"))
                        .with_power_state(PowerState::On),
                    Err(details) => AgentAnswer::failed(details),
                }
            }
            AgentCommand::StopVm { vm_id, name, .. } => {
                state.evict(vm_id);
                AgentAnswer::success(format!("{name} stopped")).with_power_state(PowerState::Off)
            }
            AgentCommand::RebootVm { vm_id, name } => match state.vms.get(&vm_id) {
                Some(vm) if vm.host_id == host_id => {
                    AgentAnswer::success(format!("{name} rebooted")).with_power_state(PowerState::On)
                }
                _ => AgentAnswer::failed(format!("{name} is not running on host {host_id}")),
            },
            AgentCommand::MigrateVm {
                vm_id,
                name,
                dest_host_id,
            } => {
                match state.vms.get(&vm_id) {
                    Some(vm) if vm.host_id == host_id => {}
                    _ => {
                        return AgentAnswer::failed(format!(
                            "{name} is not running on host {host_id}"
                        ))
                    }
                }
                match state.faults.get(&dest_host_id) {
                    Some(Fault::RejectIncomingMigrations) => {
                        state.evict(vm_id);
                        AgentAnswer {
                            status: AnswerStatus::FailedOnDestination,
                            details: format!("host {dest_host_id} rejected {name}"),
                            power_state: Some(PowerState::Off),
                        }
                    }
                    Some(_) => AgentAnswer::failed(format!(
                        "host {dest_host_id} is not accepting migrations"
                    )),
                    None => {
                        state.evict(vm_id);
                        match state.place(vm_id, dest_host_id) {
                            Ok(_) => AgentAnswer::success(format!(
                                "{name} migrated to host {dest_host_id}"
                            ))
                            .with_power_state(PowerState::On),
                            Err(details) => {
                                let _ = state.place(vm_id, host_id);
                                AgentAnswer::failed(details)
                            }
                        }
                    }
                }
            }
            AgentCommand::CheckVmState { vm_id, name } => {
                let power = match state.vms.get(&vm_id) {
                    Some(vm) if vm.host_id == host_id => PowerState::On,
                    Some(_) => PowerState::Missing,
                    None => PowerState::Off,
                };
                AgentAnswer::success(name).with_power_state(power)
            }
        }
    }
}

#[async_trait]
impl AgentDispatcher for SimulatorAgent {
    async fn send(&self, host_id: HostId, command: AgentCommand) -> Result<AgentAnswer, AgentError> {
        let fault = self.state.lock().await.faults.get(&host_id).copied();
        match fault {
            Some(Fault::Unavailable) => {
                return Err(AgentError::Unavailable {
                    host_id,
                    message: "simulated host is unreachable".into(),
                })
            }
            Some(Fault::Hang) => std::future::pending::<()>().await,
            Some(Fault::FailCommands) => {
                return Ok(AgentAnswer::failed(format!(
                    "simulated failure on host {host_id}"
                )))
            }
            Some(Fault::RejectIncomingMigrations) | None => {}
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        debug!(host_id = %host_id, vm_id = %command.vm_id(), "Simulated agent command");
        let mut state = self.state.lock().await;
        Ok(Self::execute(&mut state, host_id, command))
    }
}
