pub mod calibrator;
pub mod clock;
pub mod ledger;
pub mod orchestrator;
pub mod state_machine;
pub mod store;
pub mod vm;

pub use calibrator::{CalibrationReport, Calibrator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{CapacityLedger, CapacitySnapshot, ResourceType};
pub use orchestrator::Orchestrator;
pub use state_machine::{StateMachine, TransitionTable, VmEvent};
pub use store::{DataStore, MemoryStore};
pub use vm::{VirtualMachineInstance, VmId, VmState};
