//! Lifecycle state machine and the orchestrator that drives it.

pub mod orchestrator;
pub mod state_machine;

pub use orchestrator::Orchestrator;
pub use state_machine::{
    LifecycleAction, LifecycleEvent, LifecycleState, LifecycleStateMachine, StageOutcome,
    TransitionRejection, TransitionResult,
};
