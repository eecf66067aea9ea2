//! Cluster DRS planner.
//!
//! A pass takes one snapshot of the cluster's `Up` hosts and pairs hosts
//! above the mean load with hosts below it. Each host gets a budget from
//! the snapshot (how much it may shed, or absorb, before crossing the mean)
//! and moves are charged against those budgets; loads are not recomputed
//! while the pass runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DrsSettings;
use crate::core::clock::Clock;
use crate::core::ledger::{CapacityLedger, CapacityRecord, Footprint, ResourceType};
use crate::core::store::DataStore;
use crate::core::vm::{
    ClusterId, HostId, HostStatus, PlanId, VirtualMachineInstance, VmId, VmState, VmType,
};
use crate::errors::CloudResult;
use crate::scheduler::plan::{
    DrsEvent, DrsEventType, DrsPlan, DrsPlanMigration, DrsPlanStatus, JobStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrsOutcome {
    Planned { plan_id: PlanId, migrations: usize },
    /// An automated run happened within the cooldown window.
    Cooldown { last_run: DateTime<Utc> },
    /// DRS is switched off, globally or for the cluster.
    Disabled,
}

impl DrsOutcome {
    pub fn plan_id(&self) -> Option<PlanId> {
        match self {
            DrsOutcome::Planned { plan_id, .. } => Some(*plan_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub events: usize,
    pub plans: usize,
}

/// Snapshot of one host as the planner sees it.
#[derive(Debug, Clone)]
struct HostLoad {
    host_id: HostId,
    load: f64,
    free: Footprint,
    /// Metric units this host may shed (source) or absorb (destination).
    budget: u64,
}

impl HostLoad {
    fn from_records(host_id: HostId, records: &[CapacityRecord], metric: ResourceType) -> Option<Self> {
        let record = |rt: ResourceType| records.iter().find(|r| r.resource_type == rt);
        let main = record(metric)?;
        Some(Self {
            host_id,
            load: main.load(),
            free: Footprint {
                cpu_mhz: record(ResourceType::Cpu)?.free(),
                memory_mb: record(ResourceType::Memory)?.free(),
            },
            budget: 0,
        })
    }

    fn fits(&self, footprint: &Footprint) -> bool {
        self.free.cpu_mhz >= footprint.cpu_mhz && self.free.memory_mb >= footprint.memory_mb
    }
}

pub struct DrsPlanner {
    store: Arc<dyn DataStore>,
    ledger: Arc<CapacityLedger>,
    clock: Arc<dyn Clock>,
    settings: DrsSettings,
    /// Serialises runs so the cooldown check and the event write are one step.
    runs: Mutex<()>,
}

impl DrsPlanner {
    pub fn new(
        store: Arc<dyn DataStore>,
        ledger: Arc<CapacityLedger>,
        clock: Arc<dyn Clock>,
        settings: DrsSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            settings,
            runs: Mutex::new(()),
        }
    }

    pub async fn run(&self, cluster_id: ClusterId, manual: bool) -> CloudResult<DrsOutcome> {
        let _guard = self.runs.lock().await;
        let cluster = self.store.find_cluster(cluster_id).await?;
        let now = self.clock.now();
        let event_type = if manual {
            DrsEventType::Manual
        } else {
            DrsEventType::Automated
        };

        if !manual {
            if !self.settings.enabled || !cluster.drs_enabled {
                debug!(cluster_id = %cluster_id, "DRS disabled, automated run declined");
                return Ok(DrsOutcome::Disabled);
            }
            if let Some(last) = self
                .store
                .latest_drs_event(cluster_id, DrsEventType::Automated)
                .await?
            {
                if now - last.executed_at < self.settings.cooldown() {
                    info!(
                        cluster_id = %cluster_id,
                        last_run = %last.executed_at,
                        cooldown_minutes = self.settings.cooldown_minutes,
                        "DRS run declined, cluster is in cooldown"
                    );
                    return Ok(DrsOutcome::Cooldown {
                        last_run: last.executed_at,
                    });
                }
            }
        }

        let migrations = self.plan(cluster_id).await?;
        let plan = DrsPlan {
            id: PlanId::new(),
            cluster_id,
            event_type,
            status: DrsPlanStatus::Ready,
            created_at: now,
            updated_at: now,
            migrations,
        };
        let plan_id = plan.id;
        let count = plan.migrations.len();
        self.store.insert_plan(plan).await?;
        self.store
            .insert_drs_event(DrsEvent {
                cluster_id,
                event_type,
                executed_at: now,
            })
            .await?;

        info!(cluster_id = %cluster_id, plan_id = %plan_id, migrations = count, ?event_type, "DRS plan created");
        Ok(DrsOutcome::Planned {
            plan_id,
            migrations: count,
        })
    }

    /// Computes the migrations of one pass without persisting anything.
    pub async fn plan(&self, cluster_id: ClusterId) -> CloudResult<Vec<DrsPlanMigration>> {
        let metric = self.settings.metric;
        let mut hosts = Vec::new();
        for host in self.store.list_hosts(Some(cluster_id)).await? {
            if host.status != HostStatus::Up {
                continue;
            }
            let records = self.ledger.host_records(host.id).await;
            if let Some(load) = HostLoad::from_records(host.id, &records, metric) {
                hosts.push((load, records));
            }
        }
        if hosts.len() < 2 {
            return Ok(Vec::new());
        }

        let (min, max) = hosts.iter().fold((f64::MAX, f64::MIN), |(lo, hi), (h, _)| {
            (lo.min(h.load), hi.max(h.load))
        });
        if max - min < self.settings.imbalance_threshold {
            debug!(cluster_id = %cluster_id, spread = max - min, "Cluster is balanced");
            return Ok(Vec::new());
        }
        let mean = hosts.iter().map(|(h, _)| h.load).sum::<f64>() / hosts.len() as f64;

        let mut sources = Vec::new();
        let mut dests = Vec::new();
        for (mut host, records) in hosts {
            let total = records
                .iter()
                .find(|r| r.resource_type == metric)
                .map_or(0, |r| r.total) as f64;
            if host.load > mean {
                host.budget = ((host.load - mean) * total).round() as u64;
                sources.push(host);
            } else if host.load < mean {
                host.budget = ((mean - host.load) * total).round() as u64;
                dests.push(host);
            }
        }
        sources.sort_by(|a, b| b.load.total_cmp(&a.load));
        dests.sort_by(|a, b| a.load.total_cmp(&b.load));

        let source_ids: HashSet<HostId> = sources.iter().map(|h| h.host_id).collect();
        let busy = self.vms_in_active_plans(cluster_id).await?;
        let mut candidates: BTreeMap<HostId, Vec<VirtualMachineInstance>> = BTreeMap::new();
        for vm in self
            .store
            .list_vms(&|vm| vm.state == VmState::Running && vm.vm_type == VmType::User)
            .await?
        {
            match vm.host_id {
                Some(host) if source_ids.contains(&host) && !busy.contains(&vm.id) => {
                    candidates.entry(host).or_default().push(vm)
                }
                _ => {}
            }
        }
        for vms in candidates.values_mut() {
            vms.sort_by_key(|vm| std::cmp::Reverse(Footprint::from(&vm.offering).amount(metric)));
        }

        let mut migrations = Vec::new();
        'sources: for source in &mut sources {
            let Some(vms) = candidates.get(&source.host_id) else {
                continue;
            };
            for vm in vms {
                if migrations.len() >= self.settings.max_migrations {
                    break 'sources;
                }
                let footprint = Footprint::from(&vm.offering);
                let amount = footprint.amount(metric);
                if amount > source.budget {
                    continue;
                }
                let Some(dest) = dests
                    .iter_mut()
                    .find(|d| d.budget >= amount && d.fits(&footprint))
                else {
                    continue;
                };

                source.budget -= amount;
                dest.budget -= amount;
                dest.free.cpu_mhz -= footprint.cpu_mhz;
                dest.free.memory_mb -= footprint.memory_mb;
                debug!(vm_id = %vm.id, from = %source.host_id, to = %dest.host_id, amount, "DRS move planned");
                migrations.push(DrsPlanMigration {
                    vm_id: vm.id,
                    source_host_id: source.host_id,
                    dest_host_id: dest.host_id,
                    job_status: None,
                });
            }
        }
        Ok(migrations)
    }

    async fn vms_in_active_plans(&self, cluster_id: ClusterId) -> CloudResult<HashSet<VmId>> {
        let plans = self
            .store
            .list_plans(
                cluster_id,
                &[DrsPlanStatus::Ready, DrsPlanStatus::InProgress],
            )
            .await?;
        Ok(plans
            .iter()
            .flat_map(|p| p.migrations.iter())
            .filter(|m| matches!(m.job_status, None | Some(JobStatus::InProgress)))
            .map(|m| m.vm_id)
            .collect())
    }

    /// Drops DRS events and finished plans past their retention.
    pub async fn purge_expired(&self) -> CloudResult<PurgeReport> {
        let now = self.clock.now();
        let report = PurgeReport {
            events: self
                .store
                .purge_drs_events(now - self.settings.event_retention())
                .await?,
            plans: self
                .store
                .purge_plans(now - self.settings.plan_retention())
                .await?,
        };
        if report.events > 0 || report.plans > 0 {
            info!(events = report.events, plans = report.plans, "Purged expired DRS records");
        }
        Ok(report)
    }

    pub fn settings(&self) -> &DrsSettings {
        &self.settings
    }
}

/// Per-host load of a cluster on the given metric, highest first.
pub async fn cluster_loads(
    store: &dyn DataStore,
    ledger: &CapacityLedger,
    cluster_id: ClusterId,
    metric: ResourceType,
) -> CloudResult<Vec<(HostId, f64)>> {
    let mut loads = Vec::new();
    for host in store.list_hosts(Some(cluster_id)).await? {
        let records = ledger.host_records(host.id).await;
        if let Some(record) = records.iter().find(|r| r.resource_type == metric) {
            loads.push((host.id, record.load()));
        }
    }
    loads.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(loads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::store::MemoryStore;
    use crate::core::vm::{
        Cluster, Host, HypervisorType, PlacementHints, PodId, ServiceOffering, VmSpec, ZoneId,
    };
    use chrono::TimeZone;

    async fn cluster(hosts: &[(u64, u64)]) -> (DrsPlanner, Arc<MemoryStore>, Arc<CapacityLedger>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CapacityLedger::new());
        store
            .insert_cluster(Cluster {
                id: ClusterId(1),
                name: "c1".into(),
                zone_id: ZoneId(1),
                pod_id: PodId(1),
                drs_enabled: true,
            })
            .await
            .unwrap();

        for &(id, running_vms) in hosts {
            store
                .insert_host(Host {
                    id: HostId(id),
                    name: format!("h{id}"),
                    zone_id: ZoneId(1),
                    pod_id: PodId(1),
                    cluster_id: ClusterId(1),
                    hypervisor: HypervisorType::Simulator,
                    cpu_cores: 10,
                    cpu_speed_mhz: 1000,
                    memory_mb: 10_240,
                    status: HostStatus::Up,
                })
                .await
                .unwrap();
            ledger.register_host(HostId(id), 10_000, 10_240).await;

            let mut txn = ledger.lock(crate::core::ledger::CapacityKey::both(HostId(id))).await;
            for n in 0..running_vms {
                let mut vm = VirtualMachineInstance::new(
                    VmSpec {
                        name: format!("h{id}-vm{n}"),
                        vm_type: VmType::User,
                        hypervisor: HypervisorType::Simulator,
                    },
                    ServiceOffering {
                        id: 1,
                        name: "small".into(),
                        cpu_count: 1,
                        cpu_speed_mhz: 1000,
                        ram_mb: 1024,
                    },
                    PlacementHints::default(),
                    Utc::now(),
                );
                vm.state = VmState::Running;
                vm.host_id = Some(HostId(id));
                vm.last_host_id = Some(HostId(id));
                txn.commit_usage(HostId(id), ResourceType::Cpu, 1000);
                txn.commit_usage(HostId(id), ResourceType::Memory, 1024);
                store.insert_vm(vm).await.unwrap();
            }
            txn.commit();
        }

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let planner = DrsPlanner::new(store.clone(), ledger.clone(), clock, DrsSettings::default());
        (planner, store, ledger)
    }

    #[tokio::test]
    async fn balanced_cluster_gets_an_empty_plan() {
        let (planner, _, _) = cluster(&[(1, 3), (2, 3)]).await;
        assert!(planner.plan(ClusterId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn moves_stop_at_the_mean() {
        // 80% vs 0%: mean 40%, four 10% VMs should move.
        let (planner, _, _) = cluster(&[(1, 8), (2, 0)]).await;
        let plan = planner.plan(ClusterId(1)).await.unwrap();
        assert_eq!(plan.len(), 4);
        assert!(plan
            .iter()
            .all(|m| m.source_host_id == HostId(1) && m.dest_host_id == HostId(2)));
    }

    #[tokio::test]
    async fn max_migrations_caps_the_plan() {
        let (_, store, ledger) = cluster(&[(1, 8), (2, 0)]).await;
        let mut settings = DrsSettings::default();
        settings.max_migrations = 2;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let planner = DrsPlanner::new(store, ledger, clock, settings);
        assert_eq!(planner.plan(ClusterId(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn vms_in_a_ready_plan_are_not_planned_twice() {
        let (planner, _, _) = cluster(&[(1, 8), (2, 0)]).await;
        let first = planner.run(ClusterId(1), true).await.unwrap();
        assert!(matches!(first, DrsOutcome::Planned { migrations: 4, .. }));

        let second = planner.plan(ClusterId(1)).await.unwrap();
        let first_plan = planner
            .store
            .find_plan(first.plan_id().unwrap())
            .await
            .unwrap();
        let planned: HashSet<VmId> = first_plan.migrations.iter().map(|m| m.vm_id).collect();
        assert!(second.iter().all(|m| !planned.contains(&m.vm_id)));
    }
}
