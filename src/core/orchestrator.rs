//! Public operation surface of the control plane.
//!
//! Every operation drives one or more state machine transitions around an
//! agent call. Agent calls are never made while ledger rows are locked, and
//! an agent failure always ends in a compensating transition so the VM is
//! left in a definite state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::{AgentAnswer, AnswerStatus, DriverRegistry, PowerState};
use crate::cluster::HostAllocator;
use crate::config::{CapacitySettings, OrchestratorSettings, Settings};
use crate::core::clock::Clock;
use crate::core::ledger::{CapacityLedger, CapacitySnapshot, ResourceType};
use crate::core::state_machine::{StateMachine, TransitionOutcome, TransitionTable, VmEvent};
use crate::core::store::DataStore;
use crate::core::vm::{
    ClusterId, Host, HostId, HostStatus, PlacementHints, PlanId, ServiceOffering,
    VirtualMachineInstance, VmId, VmSpec, VmState,
};
use crate::errors::{
    AgentError, CapacityError, CloudError, CloudResult, RetryHandler, VmError,
};
use crate::scheduler::drs::{DrsOutcome, DrsPlanner, PurgeReport};
use crate::scheduler::executor::PlanExecutor;
use crate::scheduler::plan::DrsPlanStatus;

pub struct Orchestrator {
    store: Arc<dyn DataStore>,
    ledger: Arc<CapacityLedger>,
    state_machine: StateMachine,
    drivers: DriverRegistry,
    allocator: Arc<dyn HostAllocator>,
    clock: Arc<dyn Clock>,
    planner: DrsPlanner,
    retry: RetryHandler,
    settings: Settings,
}

impl Orchestrator {
    /// Builds the orchestrator over the standard lifecycle table. Fails if
    /// the table does not validate.
    pub fn new(
        store: Arc<dyn DataStore>,
        ledger: Arc<CapacityLedger>,
        drivers: DriverRegistry,
        allocator: Arc<dyn HostAllocator>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> CloudResult<Self> {
        let state_machine = StateMachine::new(
            TransitionTable::standard(),
            store.clone(),
            ledger.clone(),
            clock.clone(),
        )?;
        let planner = DrsPlanner::new(
            store.clone(),
            ledger.clone(),
            clock.clone(),
            settings.drs.clone(),
        );
        let retry = RetryHandler::new(
            settings.orchestrator.agent_retries,
            settings.orchestrator.retry_backoff(),
        );
        Ok(Self {
            store,
            ledger,
            state_machine,
            drivers,
            allocator,
            clock,
            planner,
            retry,
            settings,
        })
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn orchestrator_settings(&self) -> &OrchestratorSettings {
        &self.settings.orchestrator
    }

    fn capacity_settings(&self) -> &CapacitySettings {
        &self.settings.capacity
    }

    /// Adds a host to the inventory and creates its ledger rows, totals
    /// scaled by the overcommit ratios.
    pub async fn register_host(&self, host: Host) -> CloudResult<()> {
        self.store.find_cluster(host.cluster_id).await?;
        let (cpu_total, memory_total) = self.capacity_settings().totals(&host);
        self.ledger
            .register_host(host.id, cpu_total, memory_total)
            .await;
        info!(host_id = %host.id, cluster_id = %host.cluster_id, cpu_total, memory_total, "Host registered");
        self.store.insert_host(host).await
    }

    pub async fn vm(&self, vm_id: VmId) -> CloudResult<VirtualMachineInstance> {
        self.store.find_vm(vm_id).await
    }

    pub async fn allocate(
        &self,
        spec: VmSpec,
        offering: ServiceOffering,
        hints: PlacementHints,
    ) -> CloudResult<VmId> {
        if offering.cpu_count == 0 || offering.cpu_speed_mhz == 0 || offering.ram_mb == 0 {
            return Err(VmError::InvalidRequest {
                vm_id: VmId::new(),
                message: format!("offering {} has an empty footprint", offering.name),
            }
            .into());
        }
        if let Some(cluster_id) = hints.cluster_id {
            self.store.find_cluster(cluster_id).await?;
        }
        if let Some(host_id) = hints.host_id {
            self.store.find_host(host_id).await?;
        }

        let vm = VirtualMachineInstance::new(spec, offering, hints, self.clock.now());
        let vm_id = vm.id;
        info!(vm_id = %vm_id, name = %vm.name, offering = %vm.offering.name, "VM allocated");
        self.store.insert_vm(vm).await?;
        Ok(vm_id)
    }

    /// Starts a stopped VM. Hosts are tried in order: the placement hint,
    /// the last host, then whatever the allocator suggests. A host that
    /// fails to start the VM is excluded and the start moves on through
    /// `OperationRetry` until the attempts run out.
    pub async fn start(&self, vm_id: VmId) -> CloudResult<VmState> {
        let vm = self.store.find_vm(vm_id).await?;
        if vm.state == VmState::Running {
            return Ok(VmState::Running);
        }
        let driver = self.drivers.get(vm.hypervisor)?;
        let attempts = self.orchestrator_settings().start_attempts.max(1) as usize;
        let mut tried: Vec<HostId> = Vec::new();

        let mut outcome = loop {
            let host = self.next_start_host(&vm, &tried).await?;
            match self
                .state_machine
                .apply(vm.clone(), VmEvent::StartRequested, Some(host))
                .await
            {
                Ok(outcome) => break outcome,
                Err(CloudError::Capacity(CapacityError::InsufficientCapacity { .. }))
                    if tried.len() + 1 < attempts =>
                {
                    tried.push(host);
                }
                Err(e) => return Err(e),
            }
        };

        loop {
            let host = current_host(&outcome.vm)?;
            let started = {
                let vm = &outcome.vm;
                self.dispatch(host, "start", self.orchestrator_settings().agent_timeout(), || {
                    driver.start(host, vm)
                })
                .await
                .and_then(|answer| succeeded(host, answer))
            };

            let error = match started {
                Ok(_) => {
                    let done = self
                        .state_machine
                        .apply(outcome.vm, VmEvent::OperationSucceeded, None)
                        .await?;
                    return Ok(done.state());
                }
                Err(e) => e,
            };

            warn!(vm_id = %vm_id, host_id = %host, error = %error, "VM failed to start on host");
            tried.push(host);

            if tried.len() < attempts {
                match self.next_start_host(&outcome.vm, &tried).await {
                    Ok(next) => match self
                        .state_machine
                        .apply(outcome.vm.clone(), VmEvent::OperationRetry, Some(next))
                        .await
                    {
                        Ok(retried) => {
                            info!(vm_id = %vm_id, from = %host, to = %next, "Retrying start on another host");
                            outcome = retried;
                            continue;
                        }
                        Err(e @ CloudError::Capacity(CapacityError::InsufficientCapacity { .. })) => {
                            warn!(vm_id = %vm_id, host_id = %next, error = %e, "Retry host refused the VM");
                        }
                        Err(e) => return Err(e),
                    },
                    Err(e) => {
                        warn!(vm_id = %vm_id, error = %e, "No other host to retry the start on");
                    }
                }
            }

            self.state_machine
                .apply(outcome.vm, VmEvent::OperationFailed, None)
                .await?;
            return Err(error);
        }
    }

    async fn next_start_host(
        &self,
        vm: &VirtualMachineInstance,
        tried: &[HostId],
    ) -> CloudResult<HostId> {
        let usable = |host: &Host| host.status == HostStatus::Up && !tried.contains(&host.id);

        for candidate in [vm.placement.host_id, vm.last_host_id].into_iter().flatten() {
            if tried.contains(&candidate) {
                continue;
            }
            match self.store.find_host(candidate).await {
                Ok(host) if usable(&host) => return Ok(host.id),
                Ok(_) => {}
                Err(CloudError::Store(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let cluster_id: Option<ClusterId> = vm.placement.cluster_id;
        self.allocator
            .find_suitable_host(cluster_id, &vm.offering, tried)
            .await?
            .ok_or_else(|| {
                CapacityError::InsufficientCapacity {
                    vm_id: vm.id,
                    reason: format!(
                        "no host with {} MHz and {} MiB free",
                        vm.offering.cpu_mhz(),
                        vm.offering.ram_mb
                    ),
                }
                .into()
            })
    }

    /// Stops a VM. Stopping a stopped VM succeeds without doing anything.
    /// With `force`, an agent failure still ends in `Stopped`.
    pub async fn stop(&self, vm_id: VmId, force: bool) -> CloudResult<VmState> {
        let vm = self.store.find_vm(vm_id).await?;
        match vm.state {
            VmState::Stopped => return Ok(VmState::Stopped),
            VmState::Unknown if force => {
                let out = self
                    .state_machine
                    .apply(vm, VmEvent::AgentReportStopped, None)
                    .await?;
                return Ok(out.state());
            }
            _ => {}
        }

        let driver = self.drivers.get(vm.hypervisor)?;
        let out = self
            .state_machine
            .apply(vm, VmEvent::StopRequested, None)
            .await?;
        let host = current_host(&out.vm)?;

        let stopped = self
            .dispatch(host, "stop", self.orchestrator_settings().agent_timeout(), || {
                driver.stop(host, &out.vm, force)
            })
            .await
            .and_then(|answer| succeeded(host, answer));

        match stopped {
            Ok(_) => {
                let done = self
                    .state_machine
                    .apply(out.vm, VmEvent::OperationSucceeded, None)
                    .await?;
                Ok(done.state())
            }
            Err(e) if force => {
                warn!(vm_id = %vm_id, host_id = %host, error = %e, "Forced stop, agent did not confirm");
                let done = self
                    .state_machine
                    .apply(out.vm, VmEvent::AgentReportStopped, None)
                    .await?;
                Ok(done.state())
            }
            Err(e) => {
                self.state_machine
                    .apply(out.vm, VmEvent::OperationFailed, None)
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn reboot(&self, vm_id: VmId) -> CloudResult<VmState> {
        let vm = self.store.find_vm(vm_id).await?;
        let driver = self.drivers.get(vm.hypervisor)?;
        let out = self
            .state_machine
            .apply(vm, VmEvent::RebootRequested, None)
            .await?;
        let host = current_host(&out.vm)?;

        self.dispatch(host, "reboot", self.orchestrator_settings().agent_timeout(), || {
            driver.reboot(host, &out.vm)
        })
        .await
        .and_then(|answer| succeeded(host, answer))?;
        Ok(out.state())
    }

    pub async fn migrate(&self, vm_id: VmId, dest_host_id: HostId) -> CloudResult<VmState> {
        self.migrate_within(vm_id, dest_host_id, self.orchestrator_settings().agent_timeout())
            .await
    }

    /// Live-migrates a running VM to another `Up` host of the same cluster,
    /// waiting at most `timeout` for the agent. A migration that fails or
    /// times out on the source leaves the VM running where it was; one that
    /// fails on the destination leaves it stopped.
    pub async fn migrate_within(
        &self,
        vm_id: VmId,
        dest_host_id: HostId,
        timeout: Duration,
    ) -> CloudResult<VmState> {
        let vm = self.store.find_vm(vm_id).await?;
        let source_host_id = vm.host_id.filter(|_| vm.state == VmState::Running).ok_or(
            VmError::IllegalTransition {
                vm_id,
                state: vm.state,
                event: VmEvent::MigrateRequested,
            },
        )?;
        let invalid = |message: String| -> CloudError { VmError::InvalidRequest { vm_id, message }.into() };

        if source_host_id == dest_host_id {
            return Err(invalid(format!("VM is already on host {dest_host_id}")));
        }
        let source = self.store.find_host(source_host_id).await?;
        let dest = self.store.find_host(dest_host_id).await?;
        if source.cluster_id != dest.cluster_id {
            return Err(invalid(format!(
                "host {} is in cluster {}, VM runs in cluster {}",
                dest.id, dest.cluster_id, source.cluster_id
            )));
        }
        if dest.status != HostStatus::Up {
            return Err(invalid(format!("host {} is {:?}", dest.id, dest.status)));
        }
        if dest.hypervisor != vm.hypervisor {
            return Err(invalid(format!(
                "host {} runs {:?}, VM needs {:?}",
                dest.id, dest.hypervisor, vm.hypervisor
            )));
        }

        let driver = self.drivers.get(vm.hypervisor)?;
        let out = self
            .state_machine
            .apply(vm, VmEvent::MigrateRequested, Some(dest_host_id))
            .await?;

        let answer = self
            .dispatch_migration(source_host_id, timeout, || {
                driver.migrate(source_host_id, dest_host_id, &out.vm)
            })
            .await;

        let (event, error) = match answer {
            Ok(answer) if answer.is_success() => {
                let done = self
                    .state_machine
                    .apply(out.vm, VmEvent::OperationSucceeded, None)
                    .await?;
                info!(vm_id = %vm_id, from = %source_host_id, to = %dest_host_id, "VM migrated");
                return Ok(done.state());
            }
            Ok(answer) if answer.status == AnswerStatus::FailedOnDestination => (
                VmEvent::MigrationFailedOnDest,
                AgentError::CommandFailed {
                    host_id: dest_host_id,
                    details: answer.details,
                }
                .into(),
            ),
            Ok(answer) => (
                VmEvent::MigrationFailedOnSource,
                AgentError::CommandFailed {
                    host_id: source_host_id,
                    details: answer.details,
                }
                .into(),
            ),
            Err(e) => (VmEvent::MigrationFailedOnSource, e),
        };

        warn!(vm_id = %vm_id, from = %source_host_id, to = %dest_host_id, error = %error, ?event, "Migration failed");
        self.state_machine.apply(out.vm, event, None).await?;
        Err(error)
    }

    /// Permanently removes a VM: it is destroyed if needed, driven to
    /// `Expunging` and soft-deleted.
    pub async fn expunge(&self, vm_id: VmId) -> CloudResult<VmState> {
        let mut vm = self.store.find_vm(vm_id).await?;
        if matches!(vm.state, VmState::Stopped | VmState::Unknown) {
            vm = self
                .state_machine
                .apply(vm, VmEvent::DestroyRequested, None)
                .await?
                .vm;
        }
        if vm.state != VmState::Expunging {
            vm = self
                .state_machine
                .apply(vm, VmEvent::ExpungeOperation, None)
                .await?
                .vm;
        }
        let out = self
            .state_machine
            .apply(vm, VmEvent::OperationSucceeded, None)
            .await?;
        self.state_machine.mark_removed(vm_id).await?;
        info!(vm_id = %vm_id, "VM expunged");
        Ok(out.state())
    }

    /// Stopped, errored or lost VMs become `Destroyed`, which can still be
    /// recovered until expunged.
    pub async fn destroy(&self, vm_id: VmId) -> CloudResult<VmState> {
        let out = self
            .state_machine
            .transition(vm_id, VmEvent::DestroyRequested, None)
            .await?;
        Ok(out.state())
    }

    pub async fn recover(&self, vm_id: VmId) -> CloudResult<VmState> {
        let out = self
            .state_machine
            .transition(vm_id, VmEvent::RecoveryRequested, None)
            .await?;
        Ok(out.state())
    }

    pub async fn resize(
        &self,
        vm_id: VmId,
        offering: ServiceOffering,
    ) -> CloudResult<VirtualMachineInstance> {
        self.state_machine.resize(vm_id, offering).await
    }

    /// Completion and state reports from host agents.
    pub async fn report_agent_event(
        &self,
        vm_id: VmId,
        event: VmEvent,
        host_id: Option<HostId>,
    ) -> CloudResult<TransitionOutcome> {
        self.state_machine.transition(vm_id, event, host_id).await
    }

    /// Asks the agent on `host_id` whether a lost VM is there. A VM found
    /// running is adopted on that host, one reported off becomes `Stopped`,
    /// and a VM the agent does not have stays `Unknown`.
    pub async fn sync_power_state(&self, vm_id: VmId, host_id: HostId) -> CloudResult<VmState> {
        let vm = self.store.find_vm(vm_id).await?;
        if vm.state != VmState::Unknown {
            return Err(VmError::InvalidRequest {
                vm_id,
                message: format!("VM in {:?} is not lost", vm.state),
            }
            .into());
        }

        let driver = self.drivers.get(vm.hypervisor)?;
        let answer = self
            .dispatch(host_id, "query", self.orchestrator_settings().agent_timeout(), || {
                let driver = driver.clone();
                let vm = vm.clone();
                async move {
                    driver.query(host_id, &vm).await.map(|power| {
                        AgentAnswer::success(format!("{power:?}")).with_power_state(power)
                    })
                }
            })
            .await?;

        let event = match answer.power_state {
            Some(PowerState::On) => VmEvent::AgentReportRunning,
            Some(PowerState::Off) => VmEvent::AgentReportStopped,
            _ => {
                debug!(vm_id = %vm_id, host_id = %host_id, "VM not found on host");
                return Ok(VmState::Unknown);
            }
        };
        let out = self.state_machine.apply(vm, event, Some(host_id)).await?;
        info!(vm_id = %vm_id, host_id = %host_id, state = ?out.state(), "Lost VM found");
        Ok(out.state())
    }

    /// Marks a host down and moves every VM running on it to `Unknown`.
    /// Returns the number of VMs affected.
    pub async fn host_down(&self, host_id: HostId) -> CloudResult<usize> {
        self.store.set_host_status(host_id, HostStatus::Down).await?;
        let running = self
            .store
            .list_vms(&|vm| vm.state == VmState::Running && vm.host_id == Some(host_id))
            .await?;

        let mut affected = 0;
        for vm in running {
            let vm_id = vm.id;
            match self.state_machine.apply(vm, VmEvent::HostDown, None).await {
                Ok(_) => affected += 1,
                Err(e) => warn!(vm_id = %vm_id, host_id = %host_id, error = %e, "Could not mark VM unknown"),
            }
        }
        warn!(host_id = %host_id, vms = affected, "Host down");
        Ok(affected)
    }

    pub async fn set_host_status(&self, host_id: HostId, status: HostStatus) -> CloudResult<()> {
        if status == HostStatus::Down {
            self.host_down(host_id).await?;
            return Ok(());
        }
        self.store.set_host_status(host_id, status).await
    }

    pub async fn run_drs(&self, cluster_id: ClusterId, manual: bool) -> CloudResult<DrsOutcome> {
        self.planner.run(cluster_id, manual).await
    }

    pub async fn execute_plan(self: &Arc<Self>, plan_id: PlanId) -> CloudResult<DrsPlanStatus> {
        PlanExecutor::new(self.clone(), self.settings.drs.clone())
            .execute(plan_id)
            .await
    }

    pub async fn purge_expired(&self) -> CloudResult<PurgeReport> {
        self.planner.purge_expired().await
    }

    pub async fn get_capacity(
        &self,
        host_id: HostId,
        resource_type: ResourceType,
    ) -> CloudResult<CapacitySnapshot> {
        self.ledger.capacity(host_id, resource_type).await
    }

    /// Sends one agent command, bounded by `timeout` and retried while the
    /// error is retryable.
    async fn dispatch<F, Fut>(
        &self,
        host_id: HostId,
        operation: &str,
        timeout: Duration,
        mut call: F,
    ) -> CloudResult<AgentAnswer>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<AgentAnswer, AgentError>>,
    {
        self.retry
            .handle(operation, || {
                let pending = call();
                async move {
                    match tokio::time::timeout(timeout, pending).await {
                        Ok(answer) => answer.map_err(CloudError::from),
                        Err(_) => Err(AgentError::Timeout {
                            host_id,
                            after: timeout,
                        }
                        .into()),
                    }
                }
            })
            .await
    }

    /// A migrate command may still be running on the agent after a timeout,
    /// so only undelivered sends are retried and `timeout` bounds the whole
    /// exchange, backoff included.
    async fn dispatch_migration<F, Fut>(
        &self,
        host_id: HostId,
        timeout: Duration,
        mut call: F,
    ) -> CloudResult<AgentAnswer>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<AgentAnswer, AgentError>>,
    {
        let attempts = self
            .retry
            .handle_when("migrate", CloudError::is_undelivered, || {
                let pending = call();
                async move { pending.await.map_err(CloudError::from) }
            });
        match tokio::time::timeout(timeout, attempts).await {
            Ok(answer) => answer,
            Err(_) => Err(AgentError::Timeout {
                host_id,
                after: timeout,
            }
            .into()),
        }
    }
}

fn current_host(vm: &VirtualMachineInstance) -> CloudResult<HostId> {
    vm.host_id.ok_or_else(|| {
        VmError::InvalidRequest {
            vm_id: vm.id,
            message: format!("VM in {:?} has no host", vm.state),
        }
        .into()
    })
}

fn succeeded(host_id: HostId, answer: AgentAnswer) -> CloudResult<AgentAnswer> {
    if answer.is_success() {
        Ok(answer)
    } else {
        Err(AgentError::CommandFailed {
            host_id,
            details: answer.details,
        }
        .into())
    }
}

