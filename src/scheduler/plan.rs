use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::vm::{ClusterId, HostId, PlanId, VmId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrsEventType {
    Automated,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrsEvent {
    pub cluster_id: ClusterId,
    pub event_type: DrsEventType,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrsPlanStatus {
    Ready,
    InProgress,
    Completed,
    Cancelled,
}

impl DrsPlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DrsPlanStatus::Completed | DrsPlanStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrsPlanMigration {
    pub vm_id: VmId,
    pub source_host_id: HostId,
    pub dest_host_id: HostId,
    pub job_status: Option<JobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrsPlan {
    pub id: PlanId,
    pub cluster_id: ClusterId,
    pub event_type: DrsEventType,
    pub status: DrsPlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub migrations: Vec<DrsPlanMigration>,
}

impl DrsPlan {
    pub fn pending(&self) -> usize {
        self.migrations
            .iter()
            .filter(|m| m.job_status.is_none())
            .count()
    }
}
