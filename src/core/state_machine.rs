//! VM lifecycle state machine.
//!
//! The legal lifecycle is an explicit table keyed by `(state, event)`. Each
//! entry names the resulting state, how `host_id` / `last_host_id` change,
//! and the capacity adjustments that must be committed together with the
//! state change. [`StateMachine::transition`] applies an entry as one unit:
//! ledger rows are locked, adjustments are staged, the VM row is updated
//! conditionally on its version, and only then are the ledger rows written.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::core::ledger::{CapacityKey, CapacityLedger, Footprint, LedgerTxn, ResourceType};
use crate::core::store::DataStore;
use crate::core::vm::{HostId, ServiceOffering, VirtualMachineInstance, VmId, VmState};
use crate::errors::{CapacityError, ClampViolation, CloudResult, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmEvent {
    StartRequested,
    StopRequested,
    RebootRequested,
    MigrateRequested,
    DestroyRequested,
    RecoveryRequested,
    ExpungeOperation,
    OperationSucceeded,
    OperationFailed,
    OperationFailedToError,
    OperationRetry,
    AgentReportRunning,
    AgentReportStopped,
    HostDown,
    MigrationFailedOnSource,
    MigrationFailedOnDest,
}

/// Which host an effect or check refers to, resolved against the VM as it
/// was before the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    /// `host_id`
    Current,
    /// `last_host_id`
    Last,
    /// The host passed with the event, defaulting to `host_id`.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Reserve,
    CommitUsage,
    ReleaseUsage,
    ReleaseReservation,
    UsageToReservation,
    ReservationToUsage,
}

impl LedgerOp {
    /// Net change of `used + reserved` for an amount of 1.
    fn growth(self) -> i64 {
        match self {
            LedgerOp::Reserve | LedgerOp::CommitUsage => 1,
            LedgerOp::ReleaseUsage | LedgerOp::ReleaseReservation => -1,
            LedgerOp::UsageToReservation | LedgerOp::ReservationToUsage => 0,
        }
    }

    fn apply(self, txn: &mut LedgerTxn, host: HostId, resource_type: ResourceType, amount: u64) {
        match self {
            LedgerOp::Reserve => txn.reserve(host, resource_type, amount),
            LedgerOp::CommitUsage => txn.commit_usage(host, resource_type, amount),
            LedgerOp::ReleaseUsage => txn.release(host, resource_type, amount),
            LedgerOp::ReleaseReservation => txn.release_reservation(host, resource_type, amount),
            LedgerOp::UsageToReservation => txn.usage_to_reservation(host, resource_type, amount),
            LedgerOp::ReservationToUsage => txn.reservation_to_usage(host, resource_type, amount),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    /// `last_host_id` is set and equals the host of the role.
    LastIs(HostRole),
    /// `last_host_id` is unset or differs from the host of the role.
    LastIsNot(HostRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub op: LedgerOp,
    pub on: HostRole,
    pub when: Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostUpdate {
    Keep,
    Clear,
    SetTarget,
    RevertToLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastHostUpdate {
    Keep,
    SetToNewHost,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: VmState,
    pub host: HostUpdate,
    pub last_host: LastHostUpdate,
    /// Host that must have free capacity for the net growth of this
    /// transition, checked under the row lock.
    pub admit_on: Option<HostRole>,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn to(state: VmState) -> Self {
        Self {
            to: state,
            host: HostUpdate::Keep,
            last_host: LastHostUpdate::Keep,
            admit_on: None,
            effects: Vec::new(),
        }
    }

    pub fn host(mut self, update: HostUpdate) -> Self {
        self.host = update;
        self
    }

    pub fn last_host(mut self, update: LastHostUpdate) -> Self {
        self.last_host = update;
        self
    }

    pub fn admit(mut self, role: HostRole) -> Self {
        self.admit_on = Some(role);
        self
    }

    pub fn effect(mut self, op: LedgerOp, on: HostRole, when: Condition) -> Self {
        self.effects.push(Effect { op, on, when });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    entries: HashMap<(VmState, VmEvent), Transition>,
    duplicates: Vec<(VmState, VmEvent)>,
}

impl TransitionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn on(mut self, from: VmState, event: VmEvent, transition: Transition) -> Self {
        if self.entries.insert((from, event), transition).is_some() {
            self.duplicates.push((from, event));
        }
        self
    }

    pub fn get(&self, from: VmState, event: VmEvent) -> Option<&Transition> {
        self.entries.get(&(from, event))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events_for(&self, from: VmState) -> Vec<VmEvent> {
        self.entries
            .keys()
            .filter(|(state, _)| *state == from)
            .map(|(_, event)| *event)
            .collect()
    }

    /// The lifecycle of a managed VM.
    pub fn standard() -> Self {
        use Condition::*;
        use HostRole::*;
        use LedgerOp::*;
        use VmEvent::*;
        use VmState::*;

        let stopped_to_starting = Transition::to(Starting)
            .host(HostUpdate::SetTarget)
            .admit(Target)
            .effect(ReservationToUsage, Target, LastIs(Target))
            .effect(CommitUsage, Target, LastIsNot(Target));
        let start_succeeded = Transition::to(Running)
            .last_host(LastHostUpdate::SetToNewHost)
            .effect(ReleaseReservation, Last, LastIsNot(Current));
        let start_failed = |to| {
            Transition::to(to)
                .host(HostUpdate::Clear)
                .effect(ReleaseUsage, Current, LastIsNot(Current))
                .effect(UsageToReservation, Current, LastIs(Current))
        };
        let stopped_on_current = Transition::to(Stopped)
            .host(HostUpdate::Clear)
            .effect(UsageToReservation, Current, Always);
        let drop_reservation = |to| {
            Transition::to(to)
                .last_host(LastHostUpdate::Clear)
                .effect(ReleaseReservation, Last, Always)
        };

        Self::empty()
            // Stopped
            .on(Stopped, StartRequested, stopped_to_starting)
            .on(Stopped, StopRequested, Transition::to(Stopped))
            .on(Stopped, AgentReportStopped, Transition::to(Stopped))
            .on(Stopped, DestroyRequested, drop_reservation(Destroyed))
            // Starting
            .on(Starting, OperationSucceeded, start_succeeded.clone())
            .on(Starting, AgentReportRunning, start_succeeded)
            .on(Starting, OperationFailed, start_failed(Stopped))
            .on(Starting, OperationFailedToError, start_failed(Error))
            .on(
                Starting,
                OperationRetry,
                Transition::to(Starting)
                    .host(HostUpdate::SetTarget)
                    .admit(Target)
                    .effect(ReleaseUsage, Current, LastIsNot(Current))
                    .effect(UsageToReservation, Current, LastIs(Current))
                    .effect(ReservationToUsage, Target, LastIs(Target))
                    .effect(CommitUsage, Target, LastIsNot(Target)),
            )
            .on(Starting, AgentReportStopped, start_failed(Stopped))
            // Running
            .on(Running, StopRequested, Transition::to(Stopping))
            .on(Running, RebootRequested, Transition::to(Running))
            .on(Running, AgentReportRunning, Transition::to(Running))
            .on(Running, AgentReportStopped, stopped_on_current.clone())
            .on(
                Running,
                MigrateRequested,
                Transition::to(Migrating)
                    .host(HostUpdate::SetTarget)
                    .admit(Target)
                    .effect(Reserve, Target, Always),
            )
            .on(
                Running,
                HostDown,
                Transition::to(Unknown)
                    .host(HostUpdate::Clear)
                    .effect(UsageToReservation, Current, Always),
            )
            // Stopping
            .on(Stopping, OperationSucceeded, stopped_on_current.clone())
            .on(Stopping, AgentReportStopped, stopped_on_current)
            .on(Stopping, OperationFailed, Transition::to(Running))
            .on(Stopping, AgentReportRunning, Transition::to(Running))
            // Migrating: host_id is the destination, last_host_id the source.
            .on(
                Migrating,
                OperationSucceeded,
                Transition::to(Running)
                    .last_host(LastHostUpdate::SetToNewHost)
                    .effect(ReleaseUsage, Last, Always)
                    .effect(ReservationToUsage, Current, Always),
            )
            .on(
                Migrating,
                MigrationFailedOnSource,
                Transition::to(Running)
                    .host(HostUpdate::RevertToLast)
                    .effect(ReleaseReservation, Current, Always),
            )
            .on(
                Migrating,
                MigrationFailedOnDest,
                Transition::to(Stopped)
                    .host(HostUpdate::Clear)
                    .effect(ReleaseUsage, Last, Always)
                    .effect(ReleaseReservation, Current, Always),
            )
            .on(
                Migrating,
                AgentReportStopped,
                Transition::to(Stopped)
                    .host(HostUpdate::Clear)
                    .effect(UsageToReservation, Last, Always)
                    .effect(ReleaseReservation, Current, Always),
            )
            // Unknown
            .on(
                Unknown,
                AgentReportRunning,
                Transition::to(Running)
                    .host(HostUpdate::SetTarget)
                    .last_host(LastHostUpdate::SetToNewHost)
                    .effect(ReservationToUsage, Target, LastIs(Target))
                    .effect(CommitUsage, Target, LastIsNot(Target))
                    .effect(ReleaseReservation, Last, LastIsNot(Target)),
            )
            .on(Unknown, AgentReportStopped, Transition::to(Stopped))
            .on(Unknown, DestroyRequested, drop_reservation(Destroyed))
            // Error
            .on(Error, DestroyRequested, drop_reservation(Destroyed))
            .on(Error, ExpungeOperation, drop_reservation(Expunging))
            // Destroyed
            .on(Destroyed, RecoveryRequested, Transition::to(Stopped))
            .on(Destroyed, ExpungeOperation, Transition::to(Expunging))
            // Expunging
            .on(Expunging, ExpungeOperation, Transition::to(Expunging))
            .on(Expunging, OperationSucceeded, Transition::to(Expunging))
            .on(Expunging, OperationFailed, Transition::to(Expunging))
    }

    /// Checks the table for configuration errors: duplicate entries, host
    /// updates that would break the `host_id` invariant, effects on a
    /// current host that cannot exist, unreachable states, and non-terminal
    /// states without an exit.
    pub fn validate(&self) -> CloudResult<()> {
        let mut problems: Vec<String> = self
            .duplicates
            .iter()
            .map(|(state, event)| format!("duplicate entry for ({state:?}, {event:?})"))
            .collect();

        for ((from, event), t) in &self.entries {
            let entry = format!("({from:?}, {event:?}) -> {:?}", t.to);
            let host_ok = match (from.is_on_host(), t.to.is_on_host(), t.host) {
                (_, true, HostUpdate::SetTarget) => true,
                (true, true, HostUpdate::Keep | HostUpdate::RevertToLast) => true,
                (true, false, HostUpdate::Clear) => true,
                (false, false, HostUpdate::Keep) => true,
                _ => false,
            };
            if !host_ok {
                problems.push(format!("{entry}: host update {:?} breaks the host invariant", t.host));
            }
            let uses_current = t.effects.iter().any(|e| {
                e.on == HostRole::Current
                    || matches!(e.when, Condition::LastIs(HostRole::Current) | Condition::LastIsNot(HostRole::Current))
            });
            if uses_current && !from.is_on_host() {
                problems.push(format!("{entry}: refers to a current host that does not exist"));
            }
            if t.last_host == LastHostUpdate::SetToNewHost && !t.to.is_on_host() {
                problems.push(format!("{entry}: sets last host without a host"));
            }
            if matches!(t.admit_on, Some(role) if role != HostRole::Target) {
                problems.push(format!("{entry}: admission is only checked on the target host"));
            }
        }

        let mut reachable = HashSet::from([VmState::Stopped]);
        let mut queue = VecDeque::from([VmState::Stopped]);
        while let Some(state) = queue.pop_front() {
            for ((from, _), t) in &self.entries {
                if *from == state && reachable.insert(t.to) {
                    queue.push_back(t.to);
                }
            }
        }
        for state in VmState::ALL {
            if !reachable.contains(&state) {
                problems.push(format!("state {state:?} is unreachable from Stopped"));
            }
            let has_exit = self
                .entries
                .iter()
                .any(|((from, _), t)| *from == state && t.to != state);
            if state != VmState::Expunging && !has_exit {
                problems.push(format!("state {state:?} has no outgoing transition"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(config::ConfigError::Message(format!(
                "invalid transition table: {}",
                problems.join("; ")
            ))
            .into())
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub vm: VirtualMachineInstance,
    pub from: VmState,
    pub event: VmEvent,
    pub violations: Vec<ClampViolation>,
}

impl TransitionOutcome {
    pub fn state(&self) -> VmState {
        self.vm.state
    }
}

struct Hosts {
    current: Option<HostId>,
    last: Option<HostId>,
    target: Option<HostId>,
}

impl Hosts {
    fn resolve(&self, role: HostRole) -> Option<HostId> {
        match role {
            HostRole::Current => self.current,
            HostRole::Last => self.last,
            HostRole::Target => self.target,
        }
    }

    fn holds(&self, condition: Condition) -> bool {
        match condition {
            Condition::Always => true,
            Condition::LastIs(role) => self.last.is_some() && self.last == self.resolve(role),
            Condition::LastIsNot(role) => self.last.is_none() || self.last != self.resolve(role),
        }
    }
}

/// The only writer of a VM's `state`, `host_id` and `last_host_id`.
pub struct StateMachine {
    table: TransitionTable,
    store: Arc<dyn DataStore>,
    ledger: Arc<CapacityLedger>,
    clock: Arc<dyn Clock>,
}

impl StateMachine {
    /// Fails if the table does not validate.
    pub fn new(
        table: TransitionTable,
        store: Arc<dyn DataStore>,
        ledger: Arc<CapacityLedger>,
        clock: Arc<dyn Clock>,
    ) -> CloudResult<Self> {
        table.validate()?;
        Ok(Self {
            table,
            store,
            ledger,
            clock,
        })
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub async fn transition(
        &self,
        vm_id: VmId,
        event: VmEvent,
        target: Option<HostId>,
    ) -> CloudResult<TransitionOutcome> {
        let vm = self.store.find_vm(vm_id).await?;
        self.apply(vm, event, target).await
    }

    /// Applies `event` to a VM row the caller has already read. If the row
    /// changed since, the result is `ConcurrentModification` and nothing is
    /// written.
    pub async fn apply(
        &self,
        vm: VirtualMachineInstance,
        event: VmEvent,
        target: Option<HostId>,
    ) -> CloudResult<TransitionOutcome> {
        let transition = self.table.get(vm.state, event).ok_or(VmError::IllegalTransition {
            vm_id: vm.id,
            state: vm.state,
            event,
        })?;

        let hosts = Hosts {
            current: vm.host_id,
            last: vm.last_host_id,
            target: target.or(vm.host_id),
        };
        let new_host = match transition.host {
            HostUpdate::Keep => vm.host_id,
            HostUpdate::Clear => None,
            HostUpdate::SetTarget => hosts.target,
            HostUpdate::RevertToLast => vm.last_host_id,
        };
        if transition.to.is_on_host() && new_host.is_none() {
            return Err(VmError::InvalidRequest {
                vm_id: vm.id,
                message: format!("{event:?} needs a host to move to {:?}", transition.to),
            }
            .into());
        }

        let ops: Vec<(LedgerOp, HostId)> = transition
            .effects
            .iter()
            .filter(|e| hosts.holds(e.when))
            .filter_map(|e| hosts.resolve(e.on).map(|host| (e.op, host)))
            .collect();
        let admit_on = transition.admit_on.and_then(|role| hosts.resolve(role));

        let mut keys = BTreeSet::new();
        for host in ops.iter().map(|(_, h)| *h).chain(admit_on) {
            keys.extend(CapacityKey::both(host));
        }

        let footprint = Footprint::from(&vm.offering);
        let mut txn = self.ledger.lock(keys).await;

        if let Some(host) = admit_on {
            for resource_type in ResourceType::ALL {
                let amount = footprint.amount(resource_type) as i64;
                let growth: i64 = ops
                    .iter()
                    .filter(|(_, h)| *h == host)
                    .map(|(op, _)| op.growth() * amount)
                    .sum();
                let free = txn.free(host, resource_type);
                if growth > 0 && free < growth as u64 {
                    return Err(CapacityError::InsufficientCapacity {
                        vm_id: vm.id,
                        reason: format!(
                            "host {host} has {free} {resource_type} free, {growth} needed"
                        ),
                    }
                    .into());
                }
            }
        }

        for (op, host) in &ops {
            for resource_type in ResourceType::ALL {
                op.apply(&mut txn, *host, resource_type, footprint.amount(resource_type));
            }
        }

        let mut updated = vm.clone();
        updated.state = transition.to;
        updated.host_id = new_host;
        updated.last_host_id = match transition.last_host {
            LastHostUpdate::Keep => vm.last_host_id,
            LastHostUpdate::SetToNewHost => new_host,
            LastHostUpdate::Clear => None,
        };
        updated.version = vm.version + 1;
        updated.updated_at = self.clock.now();

        if !self.store.update_vm_if_unchanged(&updated, vm.version).await? {
            return Err(VmError::ConcurrentModification {
                vm_id: vm.id,
                expected_version: vm.version,
            }
            .into());
        }
        let violations = txn.commit();

        info!(
            vm_id = %vm.id,
            from = ?vm.state,
            to = ?updated.state,
            event = ?event,
            host_id = ?updated.host_id,
            "VM state transition"
        );
        Ok(TransitionOutcome {
            vm: updated,
            from: vm.state,
            event,
            violations,
        })
    }

    /// Changes the offering of a stopped VM. A reservation held on the last
    /// host is grown or shrunk by the footprint delta in the same unit.
    pub async fn resize(
        &self,
        vm_id: VmId,
        offering: ServiceOffering,
    ) -> CloudResult<VirtualMachineInstance> {
        let vm = self.store.find_vm(vm_id).await?;
        if vm.state != VmState::Stopped {
            return Err(VmError::InvalidRequest {
                vm_id,
                message: format!("resize needs a stopped VM, found {:?}", vm.state),
            }
            .into());
        }

        let old = Footprint::from(&vm.offering);
        let new = Footprint::from(&offering);
        let keys = vm.last_host_id.into_iter().flat_map(CapacityKey::both);
        let mut txn = self.ledger.lock(keys).await;
        if let Some(host) = vm.last_host_id {
            for resource_type in ResourceType::ALL {
                let (before, after) = (old.amount(resource_type), new.amount(resource_type));
                if after > before {
                    txn.reserve(host, resource_type, after - before);
                } else if before > after {
                    txn.release_reservation(host, resource_type, before - after);
                }
            }
        }

        let mut updated = vm.clone();
        updated.offering = offering;
        updated.version = vm.version + 1;
        updated.updated_at = self.clock.now();
        if !self.store.update_vm_if_unchanged(&updated, vm.version).await? {
            return Err(VmError::ConcurrentModification {
                vm_id,
                expected_version: vm.version,
            }
            .into());
        }
        txn.commit();
        info!(vm_id = %vm_id, offering = %updated.offering.name, "VM resized");
        Ok(updated)
    }

    /// Soft-deletes an expunging VM.
    pub async fn mark_removed(&self, vm_id: VmId) -> CloudResult<()> {
        let vm = self.store.find_vm(vm_id).await?;
        if vm.state != VmState::Expunging {
            return Err(VmError::InvalidRequest {
                vm_id,
                message: format!("only expunging VMs can be removed, found {:?}", vm.state),
            }
            .into());
        }
        let mut updated = vm.clone();
        let now = self.clock.now();
        updated.removed = Some(now);
        updated.version = vm.version + 1;
        updated.updated_at = now;
        if !self.store.update_vm_if_unchanged(&updated, vm.version).await? {
            return Err(VmError::ConcurrentModification {
                vm_id,
                expected_version: vm.version,
            }
            .into());
        }
        debug!(vm_id = %vm_id, "VM removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::core::store::MemoryStore;
    use crate::core::vm::{HypervisorType, PlacementHints, VmSpec, VmType};
    use crate::errors::CloudError;

    #[test]
    fn standard_table_validates() {
        let table = TransitionTable::standard();
        table.validate().unwrap();
        assert!(table.events_for(VmState::Expunging).len() >= 1);
    }

    #[test]
    fn missing_host_update_is_a_configuration_error() {
        let table = TransitionTable::standard().on(
            VmState::Stopped,
            VmEvent::StartRequested,
            Transition::to(VmState::Starting),
        );
        let err = table.validate().unwrap_err();
        assert!(matches!(err, CloudError::Config(_)));
        assert!(err.to_string().contains("duplicate entry"));
        assert!(err.to_string().contains("host invariant"));
    }

    #[test]
    fn dead_end_state_is_detected() {
        let table = TransitionTable::empty()
            .on(
                VmState::Stopped,
                VmEvent::DestroyRequested,
                Transition::to(VmState::Destroyed),
            );
        let err = table.validate().unwrap_err().to_string();
        assert!(err.contains("Destroyed has no outgoing transition"));
        assert!(err.contains("Running is unreachable"));
    }

    fn offering() -> ServiceOffering {
        ServiceOffering {
            id: 1,
            name: "medium".into(),
            cpu_count: 2,
            cpu_speed_mhz: 2000,
            ram_mb: 4096,
        }
    }

    async fn machine() -> (StateMachine, Arc<MemoryStore>, Arc<CapacityLedger>, VmId) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CapacityLedger::new());
        ledger.register_host(HostId(1), 16_000, 16_384).await;
        ledger.register_host(HostId(2), 16_000, 16_384).await;
        let clock = Arc::new(SystemClock);
        let vm = VirtualMachineInstance::new(
            VmSpec {
                name: "vm-1".into(),
                vm_type: VmType::User,
                hypervisor: HypervisorType::Simulator,
            },
            offering(),
            PlacementHints::default(),
            clock.now(),
        );
        let id = vm.id;
        store.insert_vm(vm).await.unwrap();
        let sm = StateMachine::new(
            TransitionTable::standard(),
            store.clone(),
            ledger.clone(),
            clock,
        )
        .unwrap();
        (sm, store, ledger, id)
    }

    async fn used_reserved(ledger: &CapacityLedger, host: u64) -> (u64, u64) {
        let cpu = ledger.capacity(HostId(host), ResourceType::Cpu).await.unwrap();
        (cpu.used, cpu.reserved)
    }

    #[tokio::test]
    async fn start_commits_usage_and_success_sets_last_host() {
        let (sm, _, ledger, id) = machine().await;

        let out = sm
            .transition(id, VmEvent::StartRequested, Some(HostId(1)))
            .await
            .unwrap();
        assert_eq!(out.state(), VmState::Starting);
        assert_eq!(out.vm.host_id, Some(HostId(1)));
        assert_eq!(out.vm.last_host_id, None);
        assert_eq!(used_reserved(&ledger, 1).await, (4000, 0));

        let out = sm
            .transition(id, VmEvent::OperationSucceeded, None)
            .await
            .unwrap();
        assert_eq!(out.state(), VmState::Running);
        assert_eq!(out.vm.last_host_id, Some(HostId(1)));
    }

    #[tokio::test]
    async fn illegal_event_has_no_side_effects() {
        let (sm, store, ledger, id) = machine().await;

        let err = sm
            .transition(id, VmEvent::MigrateRequested, Some(HostId(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Vm(VmError::IllegalTransition { .. })));
        assert_eq!(used_reserved(&ledger, 2).await, (0, 0));
        assert_eq!(store.find_vm(id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn failed_commit_leaves_vm_and_ledger_untouched() {
        let (sm, store, ledger, id) = machine().await;
        store.inject_vm_conflicts(1);

        let err = sm
            .transition(id, VmEvent::StartRequested, Some(HostId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Vm(VmError::ConcurrentModification { .. })));
        assert_eq!(store.find_vm(id).await.unwrap().state, VmState::Stopped);
        assert_eq!(used_reserved(&ledger, 1).await, (0, 0));
    }

    #[tokio::test]
    async fn start_is_refused_when_host_is_full() {
        let (sm, store, ledger, id) = machine().await;
        ledger.register_host(HostId(3), 2000, 16_384).await;

        let err = sm
            .transition(id, VmEvent::StartRequested, Some(HostId(3)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudError::Capacity(CapacityError::InsufficientCapacity { .. })
        ));
        assert_eq!(store.find_vm(id).await.unwrap().state, VmState::Stopped);
        assert_eq!(used_reserved(&ledger, 3).await, (0, 0));
    }

    #[tokio::test]
    async fn failed_start_on_last_host_keeps_the_reservation() {
        let (sm, _, ledger, id) = machine().await;
        sm.transition(id, VmEvent::StartRequested, Some(HostId(1))).await.unwrap();
        sm.transition(id, VmEvent::OperationSucceeded, None).await.unwrap();
        sm.transition(id, VmEvent::AgentReportStopped, None).await.unwrap();
        assert_eq!(used_reserved(&ledger, 1).await, (0, 4000));

        sm.transition(id, VmEvent::StartRequested, Some(HostId(1))).await.unwrap();
        assert_eq!(used_reserved(&ledger, 1).await, (4000, 0));
        let out = sm.transition(id, VmEvent::OperationFailed, None).await.unwrap();
        assert_eq!(out.state(), VmState::Stopped);
        assert_eq!(used_reserved(&ledger, 1).await, (0, 4000));
    }

    #[tokio::test]
    async fn resize_adjusts_the_held_reservation() {
        let (sm, _, ledger, id) = machine().await;
        sm.transition(id, VmEvent::StartRequested, Some(HostId(1))).await.unwrap();
        sm.transition(id, VmEvent::OperationSucceeded, None).await.unwrap();
        sm.transition(id, VmEvent::AgentReportStopped, None).await.unwrap();

        let mut bigger = offering();
        bigger.cpu_count = 4;
        let vm = sm.resize(id, bigger).await.unwrap();
        assert_eq!(vm.offering.cpu_count, 4);
        assert_eq!(used_reserved(&ledger, 1).await, (0, 8000));
    }
}
