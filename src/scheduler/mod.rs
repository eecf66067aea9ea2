pub mod drs;
pub mod executor;
pub mod plan;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::core::calibrator::Calibrator;
use crate::core::orchestrator::Orchestrator;
use crate::core::vm::ClusterId;
use crate::errors::CloudResult;

pub use drs::{DrsOutcome, DrsPlanner, PurgeReport};
pub use executor::PlanExecutor;
pub use plan::{DrsEvent, DrsEventType, DrsPlan, DrsPlanMigration, DrsPlanStatus, JobStatus};

/// Owns the background loops of the control plane: capacity calibration,
/// automated DRS per cluster, and purging of expired DRS records.
pub struct ControlPlane {
    orchestrator: Arc<Orchestrator>,
    calibrator: Arc<Calibrator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let calibrator = Arc::new(Calibrator::new(
            orchestrator.store().clone(),
            orchestrator.ledger().clone(),
            orchestrator.clock().clone(),
            orchestrator.settings().capacity.reservation_retention(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            orchestrator,
            calibrator,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn calibrator(&self) -> &Arc<Calibrator> {
        &self.calibrator
    }

    pub fn start(&mut self) {
        let settings = self.orchestrator.settings().clone();
        info!(
            calibration_secs = settings.capacity.calibration_interval_secs,
            drs_secs = settings.drs.interval_secs,
            maintenance_secs = settings.drs.maintenance_interval_secs,
            "Starting control plane background tasks"
        );

        let calibrator = self.calibrator.clone();
        self.tasks.push(spawn_loop(
            "calibration",
            settings.capacity.calibration_interval(),
            self.shutdown.subscribe(),
            move || {
                let calibrator = calibrator.clone();
                async move {
                    if let Err(e) = calibrator.calibrate().await {
                        error!(error = %e, "Capacity calibration failed");
                    }
                }
            },
        ));

        let orchestrator = self.orchestrator.clone();
        self.tasks.push(spawn_loop(
            "drs",
            settings.drs.interval(),
            self.shutdown.subscribe(),
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Err(e) = run_drs_cycle(&orchestrator).await {
                        error!(error = %e, "DRS cycle failed");
                    }
                }
            },
        ));

        let orchestrator = self.orchestrator.clone();
        self.tasks.push(spawn_loop(
            "maintenance",
            settings.drs.maintenance_interval(),
            self.shutdown.subscribe(),
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Err(e) = orchestrator.purge_expired().await {
                        error!(error = %e, "Purging DRS records failed");
                    }
                }
            },
        ));
    }

    /// One automated DRS pass over every cluster.
    pub async fn run_drs_cycle(&self) -> CloudResult<Vec<(ClusterId, DrsOutcome)>> {
        run_drs_cycle(&self.orchestrator).await
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Control plane stopped");
    }
}

/// Plans every cluster and executes the non-empty plans. A failing cluster
/// is logged and does not stop the others.
pub async fn run_drs_cycle(
    orchestrator: &Arc<Orchestrator>,
) -> CloudResult<Vec<(ClusterId, DrsOutcome)>> {
    let mut outcomes = Vec::new();
    for cluster in orchestrator.store().list_clusters().await? {
        let outcome = match orchestrator.run_drs(cluster.id, false).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(cluster_id = %cluster.id, error = %e, "DRS planning failed");
                continue;
            }
        };
        if let DrsOutcome::Planned { plan_id, migrations } = &outcome {
            if *migrations > 0 {
                if let Err(e) = orchestrator.execute_plan(*plan_id).await {
                    error!(cluster_id = %cluster.id, plan_id = %plan_id, error = %e, "DRS plan execution failed");
                }
            }
        }
        outcomes.push((cluster.id, outcome));
    }
    Ok(outcomes)
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(task = name, "Background task stopped");
    })
}
