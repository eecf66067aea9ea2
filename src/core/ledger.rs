use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::core::vm::{HostId, ServiceOffering};
use crate::errors::{CapacityError, ClampKind, ClampViolation, CloudResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Cpu, ResourceType::Memory];
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "CPU"),
            ResourceType::Memory => write!(f, "Memory"),
        }
    }
}

/// Row key. The derived ordering (host first, then resource type) is the
/// global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapacityKey {
    pub host_id: HostId,
    pub resource_type: ResourceType,
}

impl CapacityKey {
    pub fn new(host_id: HostId, resource_type: ResourceType) -> Self {
        Self {
            host_id,
            resource_type,
        }
    }

    pub fn both(host_id: HostId) -> [CapacityKey; 2] {
        [
            CapacityKey::new(host_id, ResourceType::Cpu),
            CapacityKey::new(host_id, ResourceType::Memory),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub host_id: HostId,
    pub resource_type: ResourceType,
    pub total: u64,
    pub used: u64,
    pub reserved: u64,
}

impl CapacityRecord {
    pub fn free(&self) -> u64 {
        self.total
            .saturating_sub(self.used.saturating_add(self.reserved))
    }

    /// `(used + reserved) / total`, 1.0 for a zero-sized record.
    pub fn load(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.used + self.reserved) as f64 / self.total as f64
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            total: self.total,
            used: self.used,
            reserved: self.reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub total: u64,
    pub used: u64,
    pub reserved: u64,
}

/// Capacity a VM consumes on a host, per resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
}

impl Footprint {
    pub fn amount(&self, resource_type: ResourceType) -> u64 {
        match resource_type {
            ResourceType::Cpu => self.cpu_mhz,
            ResourceType::Memory => self.memory_mb,
        }
    }
}

impl From<&ServiceOffering> for Footprint {
    fn from(offering: &ServiceOffering) -> Self {
        Self {
            cpu_mhz: offering.cpu_mhz(),
            memory_mb: offering.ram_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Delta {
    sub_used: u64,
    sub_reserved: u64,
    add_used: u64,
    add_reserved: u64,
}

/// Per-host, per-resource accounting of total/used/reserved capacity.
///
/// Every mutation goes through a [`LedgerTxn`], which holds exclusive row
/// locks on the records it touches. Locks are always taken in ascending
/// [`CapacityKey`] order so transactions spanning two hosts cannot deadlock.
#[derive(Default)]
pub struct CapacityLedger {
    rows: RwLock<BTreeMap<CapacityKey, Arc<Mutex<CapacityRecord>>>>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or resets the totals of) the CPU and memory records of a host.
    pub async fn register_host(&self, host_id: HostId, cpu_total: u64, memory_total: u64) {
        for (resource_type, total) in [
            (ResourceType::Cpu, cpu_total),
            (ResourceType::Memory, memory_total),
        ] {
            let key = CapacityKey::new(host_id, resource_type);
            let existing = self.rows.read().await.get(&key).cloned();
            match existing {
                Some(row) => {
                    row.lock().await.total = total;
                }
                None => {
                    self.rows.write().await.entry(key).or_insert_with(|| {
                        Arc::new(Mutex::new(CapacityRecord {
                            host_id,
                            resource_type,
                            total,
                            used: 0,
                            reserved: 0,
                        }))
                    });
                }
            }
        }
        debug!(host_id = %host_id, cpu_total, memory_total, "Registered host capacity");
    }

    pub async fn capacity(
        &self,
        host_id: HostId,
        resource_type: ResourceType,
    ) -> CloudResult<CapacitySnapshot> {
        let key = CapacityKey::new(host_id, resource_type);
        let row = self.rows.read().await.get(&key).cloned().ok_or(
            CapacityError::UnknownRecord {
                host_id,
                resource_type,
            },
        )?;
        let record = row.lock().await;
        Ok(record.snapshot())
    }

    pub async fn free(&self, host_id: HostId, resource_type: ResourceType) -> CloudResult<u64> {
        let snapshot = self.capacity(host_id, resource_type).await?;
        Ok(snapshot
            .total
            .saturating_sub(snapshot.used.saturating_add(snapshot.reserved)))
    }

    /// Changes the total of one record after a host was reconfigured.
    /// Used and reserved are left alone even if they now exceed the total.
    pub async fn set_total(
        &self,
        host_id: HostId,
        resource_type: ResourceType,
        total: u64,
    ) -> CloudResult<()> {
        let key = CapacityKey::new(host_id, resource_type);
        let row = self.rows.read().await.get(&key).cloned().ok_or(
            CapacityError::UnknownRecord {
                host_id,
                resource_type,
            },
        )?;
        let mut record = row.lock().await;
        if record.used + record.reserved > total {
            warn!(
                host_id = %host_id,
                resource_type = %resource_type,
                total,
                used = record.used,
                reserved = record.reserved,
                "New total is below current consumption"
            );
        }
        record.total = total;
        Ok(())
    }

    /// Consistent copy of both records of a host.
    pub async fn host_records(&self, host_id: HostId) -> Vec<CapacityRecord> {
        let txn = self.lock(CapacityKey::both(host_id)).await;
        txn.records()
    }

    pub async fn hosts(&self) -> Vec<HostId> {
        let rows = self.rows.read().await;
        let hosts: BTreeSet<HostId> = rows.keys().map(|k| k.host_id).collect();
        hosts.into_iter().collect()
    }

    /// Locks the given rows in global order. Keys without a record are
    /// skipped with a warning: bookkeeping for a host that no longer exists
    /// must not block a lifecycle transition.
    pub async fn lock(&self, keys: impl IntoIterator<Item = CapacityKey>) -> LedgerTxn {
        let wanted: BTreeSet<CapacityKey> = keys.into_iter().collect();
        let handles: Vec<(CapacityKey, Arc<Mutex<CapacityRecord>>)> = {
            let rows = self.rows.read().await;
            wanted
                .iter()
                .filter_map(|key| match rows.get(key) {
                    Some(row) => Some((*key, row.clone())),
                    None => {
                        warn!(
                            host_id = %key.host_id,
                            resource_type = %key.resource_type,
                            "No capacity record, skipping"
                        );
                        None
                    }
                })
                .collect()
        };

        let mut rows = BTreeMap::new();
        for (key, handle) in handles {
            let guard = handle.lock_owned().await;
            let staged = guard.clone();
            rows.insert(key, LockedRow { guard, staged });
        }
        LedgerTxn {
            rows,
            violations: Vec::new(),
        }
    }
}

struct LockedRow {
    guard: OwnedMutexGuard<CapacityRecord>,
    staged: CapacityRecord,
}

/// A set of locked capacity rows with staged changes. Dropping the
/// transaction without calling [`LedgerTxn::commit`] discards the changes.
pub struct LedgerTxn {
    rows: BTreeMap<CapacityKey, LockedRow>,
    violations: Vec<ClampViolation>,
}

impl LedgerTxn {
    pub fn reserve(&mut self, host_id: HostId, resource_type: ResourceType, amount: u64) {
        self.adjust(
            CapacityKey::new(host_id, resource_type),
            Delta {
                add_reserved: amount,
                ..Default::default()
            },
        );
    }

    pub fn commit_usage(&mut self, host_id: HostId, resource_type: ResourceType, amount: u64) {
        self.adjust(
            CapacityKey::new(host_id, resource_type),
            Delta {
                add_used: amount,
                ..Default::default()
            },
        );
    }

    /// Releases usage.
    pub fn release(&mut self, host_id: HostId, resource_type: ResourceType, amount: u64) {
        self.adjust(
            CapacityKey::new(host_id, resource_type),
            Delta {
                sub_used: amount,
                ..Default::default()
            },
        );
    }

    pub fn release_reservation(
        &mut self,
        host_id: HostId,
        resource_type: ResourceType,
        amount: u64,
    ) {
        self.adjust(
            CapacityKey::new(host_id, resource_type),
            Delta {
                sub_reserved: amount,
                ..Default::default()
            },
        );
    }

    pub fn usage_to_reservation(
        &mut self,
        host_id: HostId,
        resource_type: ResourceType,
        amount: u64,
    ) {
        self.adjust(
            CapacityKey::new(host_id, resource_type),
            Delta {
                sub_used: amount,
                add_reserved: amount,
                ..Default::default()
            },
        );
    }

    pub fn reservation_to_usage(
        &mut self,
        host_id: HostId,
        resource_type: ResourceType,
        amount: u64,
    ) {
        self.adjust(
            CapacityKey::new(host_id, resource_type),
            Delta {
                sub_reserved: amount,
                add_used: amount,
                ..Default::default()
            },
        );
    }

    /// Replaces used/reserved wholesale. Returns true if anything changed.
    pub fn overwrite(
        &mut self,
        host_id: HostId,
        resource_type: ResourceType,
        used: u64,
        reserved: u64,
    ) -> bool {
        match self.rows.get_mut(&CapacityKey::new(host_id, resource_type)) {
            Some(row) if row.staged.used != used || row.staged.reserved != reserved => {
                row.staged.used = used;
                row.staged.reserved = reserved;
                true
            }
            _ => false,
        }
    }

    pub fn record(&self, host_id: HostId, resource_type: ResourceType) -> Option<&CapacityRecord> {
        self.rows
            .get(&CapacityKey::new(host_id, resource_type))
            .map(|row| &row.staged)
    }

    pub fn free(&self, host_id: HostId, resource_type: ResourceType) -> u64 {
        self.record(host_id, resource_type)
            .map(CapacityRecord::free)
            .unwrap_or(0)
    }

    pub fn records(&self) -> Vec<CapacityRecord> {
        self.rows.values().map(|row| row.staged.clone()).collect()
    }

    pub fn violations(&self) -> &[ClampViolation] {
        &self.violations
    }

    /// Writes the staged records back and releases the locks.
    pub fn commit(self) -> Vec<ClampViolation> {
        for (_, mut row) in self.rows {
            *row.guard = row.staged;
        }
        self.violations
    }

    fn adjust(&mut self, key: CapacityKey, delta: Delta) {
        let Some(row) = self.rows.get_mut(&key) else {
            warn!(
                host_id = %key.host_id,
                resource_type = %key.resource_type,
                "Capacity row not locked, adjustment dropped"
            );
            return;
        };
        let record = &mut row.staged;
        let mut found = Vec::new();

        if delta.sub_used > record.used {
            found.push((ClampKind::UsedUnderflow, delta.sub_used, record.used));
        }
        let used = record.used.saturating_sub(delta.sub_used);

        if delta.sub_reserved > record.reserved {
            found.push((
                ClampKind::ReservedUnderflow,
                delta.sub_reserved,
                record.reserved,
            ));
        }
        let reserved = record.reserved.saturating_sub(delta.sub_reserved);

        let mut headroom = record.total.saturating_sub(used.saturating_add(reserved));
        let add_used = delta.add_used.min(headroom);
        headroom -= add_used;
        let add_reserved = delta.add_reserved.min(headroom);
        let requested = delta.add_used + delta.add_reserved;
        if add_used + add_reserved < requested {
            found.push((ClampKind::Overflow, requested, add_used + add_reserved));
        }

        record.used = used + add_used;
        record.reserved = reserved + add_reserved;

        for (kind, requested, applied) in found {
            let violation = ClampViolation {
                host_id: key.host_id,
                resource_type: key.resource_type,
                kind,
                requested,
                applied,
            };
            warn!(%violation, "Capacity adjustment clamped");
            self.violations.push(violation);
        }
    }
}
