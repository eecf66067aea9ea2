pub mod settings;

pub use settings::{
    CapacitySettings, DrsSettings, InventorySettings, OrchestratorSettings, Settings, VmSeed,
};
