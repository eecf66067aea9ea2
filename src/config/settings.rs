/*
* Control plane configuration
* ---------------------------
* Layers, lowest priority first:
*
* 1. Built-in defaults
* 2. <CONFIG_PATH>/default.toml
* 3. <CONFIG_PATH>/local.toml
* 4. Environment, e.g. CLOUD_DRS__COOLDOWN_MINUTES=30
*
* Sections:
* - orchestrator: agent timeouts and retry policy
* - capacity: calibration cadence, reservation retention, overcommit
* - drs: planner and executor knobs, retention of events and plans
* - inventory: clusters, hosts, offerings and VMs the simulator daemon seeds
*/

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::core::ledger::ResourceType;
use crate::core::vm::{
    Cluster, ClusterId, Host, HostId, HypervisorType, ServiceOffering, VmType,
};

pub const ENV_PREFIX: &str = "CLOUD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorSettings,
    pub capacity: CapacitySettings,
    pub drs: DrsSettings,
    pub inventory: InventorySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Upper bound on a single agent command.
    pub agent_timeout_secs: u64,
    /// Extra attempts for commands that failed with a retryable agent error.
    pub agent_retries: u32,
    pub retry_backoff_ms: u64,
    /// Hosts tried by one `start` before it gives up.
    pub start_attempts: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 30,
            agent_retries: 2,
            retry_backoff_ms: 500,
            start_attempts: 3,
        }
    }
}

impl OrchestratorSettings {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacitySettings {
    pub calibration_interval_secs: u64,
    /// How long a stopped VM keeps its reservation on its last host.
    pub reservation_retention_secs: u64,
    pub cpu_overcommit_ratio: f64,
    pub memory_overcommit_ratio: f64,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            calibration_interval_secs: 300,
            reservation_retention_secs: 86_400,
            cpu_overcommit_ratio: 1.0,
            memory_overcommit_ratio: 1.0,
        }
    }
}

impl CapacitySettings {
    pub fn calibration_interval(&self) -> Duration {
        Duration::from_secs(self.calibration_interval_secs)
    }

    pub fn reservation_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_retention_secs as i64)
    }

    /// Ledger totals of a host: physical capacity times the overcommit ratio.
    pub fn totals(&self, host: &Host) -> (u64, u64) {
        (
            (host.cpu_mhz() as f64 * self.cpu_overcommit_ratio) as u64,
            (host.memory_mb as f64 * self.memory_overcommit_ratio) as u64,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrsSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub cooldown_minutes: u64,
    pub metric: ResourceType,
    /// Spread of per-host load (0.0 - 1.0) above which a cluster is rebalanced.
    pub imbalance_threshold: f64,
    pub max_migrations: usize,
    pub max_parallel_migrations: usize,
    pub migration_timeout_secs: u64,
    pub event_retention_hours: u64,
    pub plan_retention_hours: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for DrsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
            cooldown_minutes: 60,
            metric: ResourceType::Cpu,
            imbalance_threshold: 0.2,
            max_migrations: 10,
            max_parallel_migrations: 2,
            migration_timeout_secs: 600,
            event_retention_hours: 168,
            plan_retention_hours: 168,
            maintenance_interval_secs: 3600,
        }
    }
}

impl DrsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes as i64)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.event_retention_hours as i64)
    }

    pub fn plan_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.plan_retention_hours as i64)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventorySettings {
    pub clusters: Vec<Cluster>,
    pub hosts: Vec<Host>,
    pub offerings: Vec<ServiceOffering>,
    pub vms: Vec<VmSeed>,
}

/// A VM the daemon allocates at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSeed {
    pub name: String,
    /// Name of an entry in `inventory.offerings`.
    pub offering: String,
    pub cluster_id: Option<ClusterId>,
    /// Pins the first start to a host.
    #[serde(default)]
    pub host_id: Option<HostId>,
    #[serde(default = "default_vm_type")]
    pub vm_type: VmType,
    #[serde(default = "default_hypervisor")]
    pub hypervisor: HypervisorType,
    #[serde(default)]
    pub start: bool,
}

fn default_vm_type() -> VmType {
    VmType::User
}

fn default_hypervisor() -> HypervisorType {
    HypervisorType::Simulator
}

impl Settings {
    /// Loads from `CONFIG_PATH` (default `config`).
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::load(&config_path)
    }

    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_path);

        let config = Config::builder()
            .set_default("drs.metric", "cpu")?
            .set_default("drs.enabled", true)?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.capacity.cpu_overcommit_ratio <= 0.0 || self.capacity.memory_overcommit_ratio <= 0.0 {
            problems.push("overcommit ratios must be positive".to_string());
        }
        if !(self.drs.imbalance_threshold > 0.0 && self.drs.imbalance_threshold <= 1.0) {
            problems.push("drs.imbalance_threshold must be in (0, 1]".to_string());
        }
        if self.drs.max_parallel_migrations == 0 {
            problems.push("drs.max_parallel_migrations must be at least 1".to_string());
        }
        if self.capacity.calibration_interval_secs == 0
            || self.drs.interval_secs == 0
            || self.drs.maintenance_interval_secs == 0
        {
            problems.push("background intervals must be at least one second".to_string());
        }
        if self.orchestrator.start_attempts == 0 {
            problems.push("orchestrator.start_attempts must be at least 1".to_string());
        }
        for seed in &self.inventory.vms {
            if !self.inventory.offerings.iter().any(|o| o.name == seed.offering) {
                problems.push(format!(
                    "vm {} refers to unknown offering {}",
                    seed.name, seed.offering
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Message(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.drs.cooldown(), chrono::Duration::minutes(60));
        assert_eq!(settings.drs.metric, ResourceType::Cpu);
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let settings = Settings::load("/nonexistent/cloud-orchestrator").unwrap();
        assert_eq!(settings.orchestrator.start_attempts, 3);
        assert!(settings.inventory.hosts.is_empty());
    }

    #[test]
    fn bad_threshold_is_rejected() {
        let mut settings = Settings::default();
        settings.drs.imbalance_threshold = 1.5;
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("imbalance_threshold"));
    }

    #[test]
    fn overcommit_scales_totals() {
        let mut settings = Settings::default();
        settings.capacity.cpu_overcommit_ratio = 2.0;
        let host = Host {
            id: HostId(1),
            name: "h1".into(),
            zone_id: crate::core::vm::ZoneId(1),
            pod_id: crate::core::vm::PodId(1),
            cluster_id: ClusterId(1),
            hypervisor: HypervisorType::Kvm,
            cpu_cores: 4,
            cpu_speed_mhz: 2500,
            memory_mb: 8192,
            status: Default::default(),
        };
        assert_eq!(settings.capacity.totals(&host), (20_000, 8192));
    }
}
