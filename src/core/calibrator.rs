use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::ledger::{CapacityKey, CapacityLedger, CapacitySnapshot, Footprint, ResourceType};
use crate::core::store::DataStore;
use crate::core::vm::{HostId, VirtualMachineInstance, VmState};
use crate::errors::CloudResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalibrationDrift {
    pub host_id: HostId,
    pub resource_type: ResourceType,
    pub before: CapacitySnapshot,
    pub after: CapacitySnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CalibrationReport {
    pub hosts: usize,
    pub drifted: Vec<CalibrationDrift>,
}

impl CalibrationReport {
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Expected {
    used: Footprint,
    reserved: Footprint,
}

fn add(into: &mut Footprint, vm: &VirtualMachineInstance) {
    let footprint = Footprint::from(&vm.offering);
    into.cpu_mhz += footprint.cpu_mhz;
    into.memory_mb += footprint.memory_mb;
}

/// Recomputes used/reserved of every ledger row from the VM rows and
/// overwrites the ledger where it drifted. Totals are never touched.
pub struct Calibrator {
    store: Arc<dyn DataStore>,
    ledger: Arc<CapacityLedger>,
    clock: Arc<dyn Clock>,
    reservation_retention: chrono::Duration,
}

impl Calibrator {
    pub fn new(
        store: Arc<dyn DataStore>,
        ledger: Arc<CapacityLedger>,
        clock: Arc<dyn Clock>,
        reservation_retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            reservation_retention,
        }
    }

    pub async fn calibrate(&self) -> CloudResult<CalibrationReport> {
        let mut report = CalibrationReport::default();
        for host_id in self.ledger.hosts().await {
            self.calibrate_host(host_id, &mut report).await?;
            report.hosts += 1;
        }

        if report.is_clean() {
            debug!(hosts = report.hosts, "Capacity calibration found no drift");
        } else {
            info!(
                hosts = report.hosts,
                drifted = report.drifted.len(),
                "Capacity calibration corrected drift"
            );
        }
        Ok(report)
    }

    /// VM rows are read while the host's rows are locked, so no transition
    /// touching this host can commit in between.
    async fn calibrate_host(&self, host_id: HostId, report: &mut CalibrationReport) -> CloudResult<()> {
        let mut txn = self.ledger.lock(CapacityKey::both(host_id)).await;
        let vms = self
            .store
            .list_vms(&|vm| vm.host_id == Some(host_id) || vm.last_host_id == Some(host_id))
            .await?;
        let expected = self.expected(host_id, &vms);

        for resource_type in ResourceType::ALL {
            let Some(before) = txn.record(host_id, resource_type).map(|r| r.snapshot()) else {
                continue;
            };
            let used = expected.used.amount(resource_type);
            let reserved = expected.reserved.amount(resource_type);
            if txn.overwrite(host_id, resource_type, used, reserved) {
                let after = CapacitySnapshot {
                    total: before.total,
                    used,
                    reserved,
                };
                warn!(
                    host_id = %host_id,
                    resource_type = %resource_type,
                    used_before = before.used,
                    reserved_before = before.reserved,
                    used_after = used,
                    reserved_after = reserved,
                    "Capacity drift corrected"
                );
                report.drifted.push(CalibrationDrift {
                    host_id,
                    resource_type,
                    before,
                    after,
                });
            }
        }
        txn.commit();
        Ok(())
    }

    fn expected(&self, host_id: HostId, vms: &[VirtualMachineInstance]) -> Expected {
        let cutoff = self.clock.now() - self.reservation_retention;
        let mut expected = Expected::default();

        for vm in vms {
            let on_host = vm.host_id == Some(host_id);
            let last_here = vm.last_host_id == Some(host_id);
            match vm.state {
                // Destination holds a reservation, source still runs the VM.
                VmState::Migrating => {
                    if on_host {
                        add(&mut expected.reserved, vm);
                    } else if last_here {
                        add(&mut expected.used, vm);
                    }
                }
                state if state.is_on_host() => {
                    if on_host {
                        add(&mut expected.used, vm);
                    } else if last_here && vm.updated_at >= cutoff {
                        // Starting elsewhere; the old reservation is dropped on success.
                        add(&mut expected.reserved, vm);
                    }
                }
                _ => {
                    if last_here && vm.updated_at >= cutoff {
                        add(&mut expected.reserved, vm);
                    }
                }
            }
        }
        expected
    }
}
