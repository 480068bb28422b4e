//! Legal transitions of the server lifecycle.
//!
//! All transition logic lives in the pure [`compute_transition`] table; the
//! [`LifecycleStateMachine`] wraps it with the mutex-held current state.
//! Side effects never happen here. A transition hands back an action and the
//! orchestrator performs it.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::events::DownloadProgress;

/// Where the lifecycle currently is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum LifecycleState {
    /// Nothing running, nothing in flight
    Idle,
    /// Model weights transfer in flight
    #[serde(rename_all = "camelCase")]
    Downloading { progress: DownloadProgress },
    /// Engine build in flight
    Building,
    /// Server spawned, waiting for readiness
    Starting,
    /// Server accepting connections
    #[serde(rename_all = "camelCase")]
    Running { pid: u32 },
    /// Graceful shutdown in flight
    Stopping,
    /// A stage failed; requires an explicit reset
    #[serde(rename_all = "camelCase")]
    Failed { reason: String },
}

/// Terminal outcome of a download or build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// Everything that can move the lifecycle.
#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum LifecycleEvent {
    /// Caller asked for a full start; flags capture what can be skipped
    StartRequested {
        model_present: bool,
        build_needed: bool,
    },
    /// Download stage ended; `build_needed` decides the next stage
    DownloadFinished {
        outcome: StageOutcome,
        build_needed: bool,
    },
    /// Build stage ended
    BuildFinished { outcome: StageOutcome },
    /// Server accepted its first connection
    ServerReady { pid: u32 },
    /// Server never became ready within the bound
    StartupFailed { reason: String },
    /// Server process ended, by request or on its own
    ServerExited { crashed: bool },
    /// Caller asked to stop whatever is in flight
    StopRequested,
    /// Caller acknowledged a failure
    ResetRequested,
}

/// Work the orchestrator must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    BeginDownload,
    BeginBuild,
    BeginStart,
    /// Cancel the in-flight stage; the stage's terminal event finishes the job
    CancelStage,
    StopServer,
}

/// What `transition` did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    Changed {
        from: LifecycleState,
        to: LifecycleState,
        action: Option<LifecycleAction>,
    },
    /// Event was legal but the state stays put (idempotent stop, cancel
    /// request against an in-flight stage)
    Unchanged { action: Option<LifecycleAction> },
}

/// Event not legal in the current state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot apply {attempted_event} while {current_state}")]
pub struct TransitionRejection {
    pub current_state: LifecycleState,
    pub attempted_event: LifecycleEvent,
}

enum Step {
    Go(LifecycleState, Option<LifecycleAction>),
    Stay(Option<LifecycleAction>),
}

/// The transition table. Pure; no side effects, no locking.
fn compute_transition(current: &LifecycleState, event: &LifecycleEvent) -> Option<Step> {
    use LifecycleAction as A;
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (current, event) {
        // Failed requires no explicit reset before retrying; a new start is
        // itself an acknowledgement of the failure
        (
            S::Idle | S::Failed { .. },
            E::StartRequested {
                model_present,
                build_needed,
            },
        ) => Some(match (model_present, build_needed) {
            (false, _) => Step::Go(
                S::Downloading {
                    progress: DownloadProgress::default(),
                },
                Some(A::BeginDownload),
            ),
            (true, true) => Step::Go(S::Building, Some(A::BeginBuild)),
            (true, false) => Step::Go(S::Starting, Some(A::BeginStart)),
        }),

        (
            S::Downloading { .. },
            E::DownloadFinished {
                outcome,
                build_needed,
            },
        ) => Some(match outcome {
            StageOutcome::Completed if *build_needed => Step::Go(S::Building, Some(A::BeginBuild)),
            StageOutcome::Completed => Step::Go(S::Starting, Some(A::BeginStart)),
            StageOutcome::Failed { reason } => Step::Go(
                S::Failed {
                    reason: reason.clone(),
                },
                None,
            ),
            StageOutcome::Cancelled => Step::Go(S::Idle, None),
        }),

        (S::Building, E::BuildFinished { outcome }) => Some(match outcome {
            StageOutcome::Completed => Step::Go(S::Starting, Some(A::BeginStart)),
            StageOutcome::Failed { reason } => Step::Go(
                S::Failed {
                    reason: reason.clone(),
                },
                None,
            ),
            StageOutcome::Cancelled => Step::Go(S::Idle, None),
        }),

        (S::Starting, E::ServerReady { pid }) => Some(Step::Go(S::Running { pid: *pid }, None)),
        (S::Starting, E::StartupFailed { reason }) => Some(Step::Go(
            S::Failed {
                reason: reason.clone(),
            },
            None,
        )),
        (S::Starting, E::ServerExited { crashed: true }) => Some(Step::Go(
            S::Failed {
                reason: "server exited during startup".to_string(),
            },
            None,
        )),
        (S::Starting, E::ServerExited { crashed: false }) => Some(Step::Go(S::Idle, None)),

        (S::Running { .. }, E::StopRequested) => Some(Step::Go(S::Stopping, Some(A::StopServer))),
        (S::Running { .. }, E::ServerExited { crashed: true }) => Some(Step::Go(
            S::Failed {
                reason: "server exited unexpectedly".to_string(),
            },
            None,
        )),
        (S::Running { .. }, E::ServerExited { crashed: false }) => Some(Step::Go(S::Idle, None)),

        (S::Stopping, E::ServerExited { .. }) => Some(Step::Go(S::Idle, None)),

        // Stop against an in-flight stage cancels it; the stage's terminal
        // event performs the actual state change
        (S::Downloading { .. } | S::Building | S::Starting, E::StopRequested) => {
            Some(Step::Stay(Some(A::CancelStage)))
        }

        // Idempotent stop outside any activity, including a repeated stop
        // while a shutdown is already in flight
        (S::Idle | S::Failed { .. } | S::Stopping, E::StopRequested) => Some(Step::Stay(None)),

        (S::Failed { .. }, E::ResetRequested) => Some(Step::Go(S::Idle, None)),
        (S::Idle, E::ResetRequested) => Some(Step::Stay(None)),

        _ => None,
    }
}

/// Mutex-guarded current state plus the transition table.
pub struct LifecycleStateMachine {
    state: Mutex<LifecycleState>,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    pub fn current(&self) -> LifecycleState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `event` atomically. Concurrent callers serialize on the state
    /// lock; the loser of a race sees the winner's state and may be rejected.
    pub fn transition(
        &self,
        event: LifecycleEvent,
    ) -> Result<TransitionResult, TransitionRejection> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        match compute_transition(&state, &event) {
            Some(Step::Go(next, action)) => {
                let from = state.clone();
                *state = next.clone();
                Ok(TransitionResult::Changed {
                    from,
                    to: next,
                    action,
                })
            }
            Some(Step::Stay(action)) => Ok(TransitionResult::Unchanged { action }),
            None => Err(TransitionRejection {
                current_state: state.clone(),
                attempted_event: event,
            }),
        }
    }
}
