mod state_machine;

pub use state_machine::{run_state_machine, Memory, RoiState, StateMachineError};
