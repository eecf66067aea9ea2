pub mod agent;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod scheduler;

// Re-exports
pub use crate::config::Settings;
pub use crate::core::orchestrator::Orchestrator;
pub use crate::errors::{CloudError, CloudResult};
pub use crate::scheduler::{ControlPlane, DrsOutcome};
