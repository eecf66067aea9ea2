use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DrsSettings;
use crate::core::orchestrator::Orchestrator;
use crate::core::vm::{PlanId, VmState};
use crate::errors::{CloudResult, DrsError};
use crate::scheduler::plan::{DrsPlanMigration, DrsPlanStatus, JobStatus};

/// Drains a `Ready` plan through `Orchestrator::migrate`.
///
/// Workers claim entries one at a time. The first failed entry cancels the
/// plan; entries nobody claimed yet keep an empty job status.
pub struct PlanExecutor {
    orchestrator: Arc<Orchestrator>,
    settings: DrsSettings,
}

impl PlanExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: DrsSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    pub async fn execute(&self, plan_id: PlanId) -> CloudResult<DrsPlanStatus> {
        let store = self.orchestrator.store();
        let clock = self.orchestrator.clock();

        let plan = store.find_plan(plan_id).await?;
        let started = store
            .update_plan_status(
                plan_id,
                &[DrsPlanStatus::Ready],
                DrsPlanStatus::InProgress,
                clock.now(),
            )
            .await?;
        if !started {
            return Err(DrsError::StalePlan {
                plan_id,
                reason: format!("plan is {:?}, not Ready", plan.status),
            }
            .into());
        }
        info!(plan_id = %plan_id, migrations = plan.migrations.len(), "Executing DRS plan");

        let workers = self.settings.max_parallel_migrations.max(1);
        let results = join_all((0..workers).map(|worker| self.worker(plan_id, worker))).await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            store
                .update_plan_status(
                    plan_id,
                    &[DrsPlanStatus::InProgress],
                    DrsPlanStatus::Cancelled,
                    clock.now(),
                )
                .await?;
            return Err(err);
        }

        store
            .update_plan_status(
                plan_id,
                &[DrsPlanStatus::InProgress],
                DrsPlanStatus::Completed,
                clock.now(),
            )
            .await?;
        let status = store.find_plan(plan_id).await?.status;
        info!(plan_id = %plan_id, ?status, "DRS plan finished");
        Ok(status)
    }

    async fn worker(&self, plan_id: PlanId, worker: usize) -> CloudResult<()> {
        let store = self.orchestrator.store();
        let clock = self.orchestrator.clock();

        while let Some((index, entry)) = store.claim_next_migration(plan_id, clock.now()).await? {
            match self.migrate(&entry).await {
                Ok(()) => {
                    store
                        .update_migration_status(plan_id, index, JobStatus::Succeeded, clock.now())
                        .await?;
                }
                Err(reason) => {
                    warn!(
                        plan_id = %plan_id,
                        worker,
                        vm_id = %entry.vm_id,
                        reason = %reason,
                        "Plan migration failed, cancelling plan"
                    );
                    store
                        .update_migration_status(plan_id, index, JobStatus::Failed { reason }, clock.now())
                        .await?;
                    store
                        .update_plan_status(
                            plan_id,
                            &[DrsPlanStatus::InProgress],
                            DrsPlanStatus::Cancelled,
                            clock.now(),
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Migrates one entry if the VM is still where the plan saw it.
    async fn migrate(&self, entry: &DrsPlanMigration) -> Result<(), String> {
        let vm = self
            .orchestrator
            .vm(entry.vm_id)
            .await
            .map_err(|e| e.to_string())?;
        if vm.state != VmState::Running || vm.host_id != Some(entry.source_host_id) {
            return Err(format!(
                "stale entry: VM is {:?} on {:?}, planned from host {}",
                vm.state, vm.host_id, entry.source_host_id
            ));
        }

        self.orchestrator
            .migrate_within(entry.vm_id, entry.dest_host_id, self.settings.migration_timeout())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
