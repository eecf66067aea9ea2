use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::core::vm::{
    Cluster, ClusterId, Host, HostId, HostStatus, PlanId, VirtualMachineInstance, VmId,
};
use crate::errors::{CloudResult, DrsError, StoreError, VmError};
use crate::scheduler::plan::{
    DrsEvent, DrsEventType, DrsPlan, DrsPlanMigration, DrsPlanStatus, JobStatus,
};

pub type VmPredicate<'a> = &'a (dyn Fn(&VirtualMachineInstance) -> bool + Send + Sync);

/// Data-access contract the control plane runs on. Every method is a unit
/// of its own; `update_vm_if_unchanged` and `claim_next_migration` are the
/// conditional writes the core relies on for linearisation.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn insert_vm(&self, vm: VirtualMachineInstance) -> CloudResult<()>;

    /// Soft-deleted VMs are not found.
    async fn find_vm(&self, id: VmId) -> CloudResult<VirtualMachineInstance>;

    async fn list_vms(&self, predicate: VmPredicate<'_>) -> CloudResult<Vec<VirtualMachineInstance>>;

    /// Writes `vm` (with its version already bumped) only if the stored
    /// version still equals `expected_version`. Returns false otherwise.
    async fn update_vm_if_unchanged(
        &self,
        vm: &VirtualMachineInstance,
        expected_version: u64,
    ) -> CloudResult<bool>;

    async fn insert_cluster(&self, cluster: Cluster) -> CloudResult<()>;
    async fn find_cluster(&self, id: ClusterId) -> CloudResult<Cluster>;
    async fn list_clusters(&self) -> CloudResult<Vec<Cluster>>;

    async fn insert_host(&self, host: Host) -> CloudResult<()>;
    async fn find_host(&self, id: HostId) -> CloudResult<Host>;
    async fn list_hosts(&self, cluster_id: Option<ClusterId>) -> CloudResult<Vec<Host>>;
    async fn set_host_status(&self, id: HostId, status: HostStatus) -> CloudResult<()>;

    async fn insert_drs_event(&self, event: DrsEvent) -> CloudResult<()>;
    async fn latest_drs_event(
        &self,
        cluster_id: ClusterId,
        event_type: DrsEventType,
    ) -> CloudResult<Option<DrsEvent>>;
    async fn purge_drs_events(&self, before: DateTime<Utc>) -> CloudResult<usize>;

    async fn insert_plan(&self, plan: DrsPlan) -> CloudResult<()>;
    async fn find_plan(&self, id: PlanId) -> CloudResult<DrsPlan>;
    async fn list_plans(
        &self,
        cluster_id: ClusterId,
        statuses: &[DrsPlanStatus],
    ) -> CloudResult<Vec<DrsPlan>>;

    /// Moves the plan to `to` if its current status is one of `from`.
    async fn update_plan_status(
        &self,
        id: PlanId,
        from: &[DrsPlanStatus],
        to: DrsPlanStatus,
        now: DateTime<Utc>,
    ) -> CloudResult<bool>;

    /// Atomically picks the first migration with no job status and marks it
    /// `InProgress`. Two callers never receive the same entry, and nothing is
    /// claimed once the plan has left `InProgress`.
    async fn claim_next_migration(
        &self,
        id: PlanId,
        now: DateTime<Utc>,
    ) -> CloudResult<Option<(usize, DrsPlanMigration)>>;

    async fn update_migration_status(
        &self,
        id: PlanId,
        index: usize,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> CloudResult<()>;

    /// Removes plans that are not in progress and were last updated
    /// before `before`.
    async fn purge_plans(&self, before: DateTime<Utc>) -> CloudResult<usize>;
}

/// In-process implementation of [`DataStore`].
#[derive(Default)]
pub struct MemoryStore {
    vms: RwLock<HashMap<VmId, VirtualMachineInstance>>,
    clusters: RwLock<BTreeMap<ClusterId, Cluster>>,
    hosts: RwLock<BTreeMap<HostId, Host>>,
    drs_events: Mutex<Vec<DrsEvent>>,
    plans: Mutex<HashMap<PlanId, DrsPlan>>,
    forced_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` conditional VM updates fail as if another writer
    /// had committed first.
    pub fn inject_vm_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Writes a VM row unconditionally, bypassing the state machine. Only
    /// meant for simulating out-of-band row changes.
    pub async fn overwrite_vm(&self, vm: VirtualMachineInstance) {
        self.vms.write().await.insert(vm.id, vm);
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn insert_vm(&self, vm: VirtualMachineInstance) -> CloudResult<()> {
        let mut vms = self.vms.write().await;
        if vms.contains_key(&vm.id) {
            return Err(StoreError::Duplicate(format!("vm {}", vm.id)).into());
        }
        vms.insert(vm.id, vm);
        Ok(())
    }

    async fn find_vm(&self, id: VmId) -> CloudResult<VirtualMachineInstance> {
        self.vms
            .read()
            .await
            .get(&id)
            .filter(|vm| vm.removed.is_none())
            .cloned()
            .ok_or_else(|| VmError::NotFound { vm_id: id }.into())
    }

    async fn list_vms(&self, predicate: VmPredicate<'_>) -> CloudResult<Vec<VirtualMachineInstance>> {
        Ok(self
            .vms
            .read()
            .await
            .values()
            .filter(|vm| vm.removed.is_none() && predicate(vm))
            .cloned()
            .collect())
    }

    async fn update_vm_if_unchanged(
        &self,
        vm: &VirtualMachineInstance,
        expected_version: u64,
    ) -> CloudResult<bool> {
        let mut vms = self.vms.write().await;
        let current = vms
            .get_mut(&vm.id)
            .ok_or(VmError::NotFound { vm_id: vm.id })?;
        if current.version != expected_version || self.take_forced_conflict() {
            debug!(vm_id = %vm.id, expected_version, found = current.version, "Conditional update lost");
            return Ok(false);
        }
        *current = vm.clone();
        Ok(true)
    }

    async fn insert_cluster(&self, cluster: Cluster) -> CloudResult<()> {
        self.clusters.write().await.insert(cluster.id, cluster);
        Ok(())
    }

    async fn find_cluster(&self, id: ClusterId) -> CloudResult<Cluster> {
        self.clusters
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::ClusterNotFound(id).into())
    }

    async fn list_clusters(&self) -> CloudResult<Vec<Cluster>> {
        Ok(self.clusters.read().await.values().cloned().collect())
    }

    async fn insert_host(&self, host: Host) -> CloudResult<()> {
        self.hosts.write().await.insert(host.id, host);
        Ok(())
    }

    async fn find_host(&self, id: HostId) -> CloudResult<Host> {
        self.hosts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::HostNotFound(id).into())
    }

    async fn list_hosts(&self, cluster_id: Option<ClusterId>) -> CloudResult<Vec<Host>> {
        Ok(self
            .hosts
            .read()
            .await
            .values()
            .filter(|h| cluster_id.map_or(true, |c| h.cluster_id == c))
            .cloned()
            .collect())
    }

    async fn set_host_status(&self, id: HostId, status: HostStatus) -> CloudResult<()> {
        let mut hosts = self.hosts.write().await;
        let host = hosts.get_mut(&id).ok_or(StoreError::HostNotFound(id))?;
        host.status = status;
        Ok(())
    }

    async fn insert_drs_event(&self, event: DrsEvent) -> CloudResult<()> {
        self.drs_events.lock().await.push(event);
        Ok(())
    }

    async fn latest_drs_event(
        &self,
        cluster_id: ClusterId,
        event_type: DrsEventType,
    ) -> CloudResult<Option<DrsEvent>> {
        Ok(self
            .drs_events
            .lock()
            .await
            .iter()
            .filter(|e| e.cluster_id == cluster_id && e.event_type == event_type)
            .max_by_key(|e| e.executed_at)
            .cloned())
    }

    async fn purge_drs_events(&self, before: DateTime<Utc>) -> CloudResult<usize> {
        let mut events = self.drs_events.lock().await;
        let count = events.len();
        events.retain(|e| e.executed_at >= before);
        Ok(count - events.len())
    }

    async fn insert_plan(&self, plan: DrsPlan) -> CloudResult<()> {
        let mut plans = self.plans.lock().await;
        if plans.contains_key(&plan.id) {
            return Err(StoreError::Duplicate(format!("plan {}", plan.id)).into());
        }
        plans.insert(plan.id, plan);
        Ok(())
    }

    async fn find_plan(&self, id: PlanId) -> CloudResult<DrsPlan> {
        self.plans
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DrsError::PlanNotFound(id).into())
    }

    async fn list_plans(
        &self,
        cluster_id: ClusterId,
        statuses: &[DrsPlanStatus],
    ) -> CloudResult<Vec<DrsPlan>> {
        let mut plans: Vec<DrsPlan> = self
            .plans
            .lock()
            .await
            .values()
            .filter(|p| p.cluster_id == cluster_id && statuses.contains(&p.status))
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    async fn update_plan_status(
        &self,
        id: PlanId,
        from: &[DrsPlanStatus],
        to: DrsPlanStatus,
        now: DateTime<Utc>,
    ) -> CloudResult<bool> {
        let mut plans = self.plans.lock().await;
        let plan = plans.get_mut(&id).ok_or(DrsError::PlanNotFound(id))?;
        if !from.contains(&plan.status) {
            return Ok(false);
        }
        plan.status = to;
        plan.updated_at = now;
        Ok(true)
    }

    async fn claim_next_migration(
        &self,
        id: PlanId,
        now: DateTime<Utc>,
    ) -> CloudResult<Option<(usize, DrsPlanMigration)>> {
        let mut plans = self.plans.lock().await;
        let plan = plans.get_mut(&id).ok_or(DrsError::PlanNotFound(id))?;
        if plan.status != DrsPlanStatus::InProgress {
            return Ok(None);
        }
        let Some((index, entry)) = plan
            .migrations
            .iter_mut()
            .enumerate()
            .find(|(_, m)| m.job_status.is_none())
        else {
            return Ok(None);
        };
        entry.job_status = Some(JobStatus::InProgress);
        let claimed = entry.clone();
        plan.updated_at = now;
        Ok(Some((index, claimed)))
    }

    async fn update_migration_status(
        &self,
        id: PlanId,
        index: usize,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> CloudResult<()> {
        let mut plans = self.plans.lock().await;
        let plan = plans.get_mut(&id).ok_or(DrsError::PlanNotFound(id))?;
        if let Some(entry) = plan.migrations.get_mut(index) {
            entry.job_status = Some(status);
            plan.updated_at = now;
        }
        Ok(())
    }

    async fn purge_plans(&self, before: DateTime<Utc>) -> CloudResult<usize> {
        let mut plans = self.plans.lock().await;
        let count = plans.len();
        plans.retain(|_, p| p.status == DrsPlanStatus::InProgress || p.updated_at >= before);
        Ok(count - plans.len())
    }
}
