//! Sequencing of download, build and server start.
//!
//! The orchestrator owns the state machine and the three stage runners. It
//! applies events, emits every state change through the sink, and performs
//! the action each transition hands back. Stage outcomes arrive on worker
//! tasks; rejected transitions there mean the caller already moved the
//! machine (a cancel racing a completion) and are logged, not escalated.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::{EngineSettings, ServerConfig};
use crate::error::Error;
use crate::events::EventSink;
use crate::lifecycle::state_machine::{
    LifecycleAction, LifecycleEvent, LifecycleState, LifecycleStateMachine, StageOutcome,
    TransitionResult,
};
use crate::models::catalog::ModelDescriptor;
use crate::models::downloader::{DownloadOutcome, Downloader};
use crate::models::store::ModelStore;
use crate::process::build::{BuildOutcome, BuildSupervisor};
use crate::process::server::{ServerExit, ServerHandle, ServerProcessSupervisor};

/// Cancellation bookkeeping for the in-flight stage.
///
/// The machine enters a stage before the stage's token or server handle is
/// registered. A stop landing in that window sets `pending`; registration
/// honors it by cancelling immediately, so no stop request is ever dropped.
#[derive(Default)]
struct CancelState {
    stage_token: Option<CancellationToken>,
    server_handle: Option<ServerHandle>,
    pending: bool,
}

/// Drives a model from "maybe not even downloaded" to a ready server.
pub struct Orchestrator {
    machine: LifecycleStateMachine,
    store: ModelStore,
    downloader: Downloader,
    build: BuildSupervisor,
    server: ServerProcessSupervisor,
    engine: EngineSettings,
    sink: Arc<dyn EventSink>,
    cancel: Mutex<CancelState>,
}

impl Orchestrator {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        engine: EngineSettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            machine: LifecycleStateMachine::new(),
            store: ModelStore::new(models_dir),
            downloader: Downloader::new(),
            build: BuildSupervisor::new(
                engine.build_program.clone(),
                engine.engine_dir.clone(),
                engine.grace_period,
            ),
            server: ServerProcessSupervisor::new(&engine),
            engine,
            sink,
            cancel: Mutex::new(CancelState::default()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.current()
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Kick off the full start sequence for `descriptor`.
    ///
    /// Skips the download when the weights are already in the store and the
    /// build when the server binary exists (unless a rebuild is configured).
    /// Legal from `Idle` and from `Failed` (a retry doubles as the reset);
    /// everything after this call arrives through the sink.
    pub fn start(
        self: &Arc<Self>,
        descriptor: ModelDescriptor,
        config: ServerConfig,
    ) -> Result<(), Error> {
        let model_present = match &config.model_path {
            Some(path) => path.is_file(),
            None => self.store.exists(&descriptor),
        };
        let build_needed = self.engine.rebuild || !self.engine.server_binary.is_file();

        let result = self.machine.transition(LifecycleEvent::StartRequested {
            model_present,
            build_needed,
        })?;
        self.follow(result, &descriptor, &config, build_needed);
        Ok(())
    }

    /// Stop whatever is happening.
    ///
    /// From `Running` this is a graceful shutdown; mid-stage it cancels the
    /// stage and the stage's terminal event returns the machine to `Idle`.
    /// A no-op when nothing is in flight.
    pub fn stop(&self) {
        match self.machine.transition(LifecycleEvent::StopRequested) {
            Ok(result) => {
                // descriptor/config are irrelevant to stop-side actions
                self.follow_stop(result);
            }
            Err(rejection) => log::warn!("stop rejected: {}", rejection),
        }
    }

    /// Acknowledge a failure and return to `Idle`.
    pub fn reset(&self) -> Result<(), Error> {
        let result = self.machine.transition(LifecycleEvent::ResetRequested)?;
        if let TransitionResult::Changed { to, .. } = result {
            self.sink.on_state_change(&to);
        }
        Ok(())
    }

    /// Apply a worker-side event and perform what follows from it.
    fn apply(
        self: &Arc<Self>,
        event: LifecycleEvent,
        descriptor: &ModelDescriptor,
        config: &ServerConfig,
        build_needed: bool,
    ) {
        match self.machine.transition(event) {
            Ok(result) => self.follow(result, descriptor, config, build_needed),
            Err(rejection) => log::warn!("stale lifecycle event ignored: {}", rejection),
        }
    }

    fn follow(
        self: &Arc<Self>,
        result: TransitionResult,
        descriptor: &ModelDescriptor,
        config: &ServerConfig,
        build_needed: bool,
    ) {
        let action = match result {
            TransitionResult::Changed { to, action, .. } => {
                self.sink.on_state_change(&to);
                action
            }
            TransitionResult::Unchanged { action } => action,
        };

        match action {
            Some(LifecycleAction::BeginDownload) => {
                self.begin_download(descriptor.clone(), config.clone(), build_needed)
            }
            Some(LifecycleAction::BeginBuild) => {
                self.begin_build(descriptor.clone(), config.clone())
            }
            Some(LifecycleAction::BeginStart) => {
                self.begin_start(descriptor.clone(), config.clone())
            }
            Some(LifecycleAction::CancelStage) => self.cancel_stage(),
            Some(LifecycleAction::StopServer) => self.stop_server(),
            None => {}
        }
    }

    fn follow_stop(&self, result: TransitionResult) {
        let action = match result {
            TransitionResult::Changed { to, action, .. } => {
                self.sink.on_state_change(&to);
                action
            }
            TransitionResult::Unchanged { action } => action,
        };

        match action {
            Some(LifecycleAction::CancelStage) => self.cancel_stage(),
            Some(LifecycleAction::StopServer) => self.stop_server(),
            _ => {}
        }
    }

    fn begin_download(self: &Arc<Self>, descriptor: ModelDescriptor, config: ServerConfig, build_needed: bool) {
        let this = Arc::clone(self);
        let done_descriptor = descriptor.clone();
        let done_config = config.clone();
        let started = self.downloader.start(
            descriptor.clone(),
            self.store.clone(),
            Arc::clone(&self.sink),
            move |outcome| {
                this.clear_stage_cancel();
                let outcome = match outcome {
                    DownloadOutcome::Success => StageOutcome::Completed,
                    DownloadOutcome::Failure(e) => StageOutcome::Failed {
                        reason: format!("download failed: {}", e),
                    },
                    DownloadOutcome::Cancelled => StageOutcome::Cancelled,
                };
                this.apply(
                    LifecycleEvent::DownloadFinished {
                        outcome,
                        build_needed,
                    },
                    &done_descriptor,
                    &done_config,
                    build_needed,
                );
            },
        );

        match started {
            Ok(token) => self.set_stage_cancel(token),
            Err(e) => {
                log::error!("could not begin download of {}: {}", descriptor.file_name, e);
                self.apply(
                    LifecycleEvent::DownloadFinished {
                        outcome: StageOutcome::Failed {
                            reason: format!("download failed: {}", e),
                        },
                        build_needed,
                    },
                    &descriptor,
                    &config,
                    build_needed,
                );
            }
        }
    }

    fn begin_build(self: &Arc<Self>, descriptor: ModelDescriptor, config: ServerConfig) {
        let this = Arc::clone(self);
        let done_descriptor = descriptor.clone();
        let done_config = config.clone();
        let started = self.build.start(
            &config.extra_build_args,
            &config.extra_env_vars,
            Arc::clone(&self.sink),
            move |outcome| {
                this.clear_stage_cancel();
                let outcome = match outcome {
                    BuildOutcome::Success => StageOutcome::Completed,
                    BuildOutcome::Failure { exit_code } => StageOutcome::Failed {
                        reason: format!("build exited with code {}", exit_code),
                    },
                    BuildOutcome::Cancelled => StageOutcome::Cancelled,
                };
                this.apply(
                    LifecycleEvent::BuildFinished { outcome },
                    &done_descriptor,
                    &done_config,
                    false,
                );
            },
        );

        match started {
            Ok(token) => self.set_stage_cancel(token),
            Err(e) => {
                log::error!("could not begin build: {}", e);
                self.apply(
                    LifecycleEvent::BuildFinished {
                        outcome: StageOutcome::Failed {
                            reason: format!("build failed to start: {}", e),
                        },
                    },
                    &descriptor,
                    &config,
                    false,
                );
            }
        }
    }

    fn begin_start(self: &Arc<Self>, descriptor: ModelDescriptor, config: ServerConfig) {
        let model_path = config
            .model_path
            .clone()
            .unwrap_or_else(|| self.store.model_path(&descriptor));

        let ready_this = Arc::clone(self);
        let ready_descriptor = descriptor.clone();
        let ready_config = config.clone();
        let exit_this = Arc::clone(self);
        let exit_descriptor = descriptor.clone();
        let exit_config = config.clone();

        let started = self.server.start(
            &model_path,
            &config,
            Arc::clone(&self.sink),
            move |pid| {
                ready_this.apply(
                    LifecycleEvent::ServerReady { pid },
                    &ready_descriptor,
                    &ready_config,
                    false,
                );
            },
            move |exit| {
                exit_this.clear_server_handle();
                let event = match exit {
                    ServerExit::ReadyTimeout => LifecycleEvent::StartupFailed {
                        reason: "server did not become ready in time".to_string(),
                    },
                    ServerExit::Crashed { exit_code } => {
                        log::error!("server process exited (code {:?})", exit_code);
                        LifecycleEvent::ServerExited { crashed: true }
                    }
                    ServerExit::Stopped { forced } => {
                        if forced {
                            log::warn!("server had to be force-killed");
                        }
                        LifecycleEvent::ServerExited { crashed: false }
                    }
                };
                exit_this.apply(event, &exit_descriptor, &exit_config, false);
            },
        );

        match started {
            Ok(handle) => self.set_server_handle(handle),
            Err(e) => {
                log::error!("could not spawn server: {}", e);
                self.apply(
                    LifecycleEvent::StartupFailed {
                        reason: format!("server failed to spawn: {}", e),
                    },
                    &descriptor,
                    &config,
                    false,
                );
            }
        }
    }

    /// Cancel whatever stage is in flight. The stage's terminal event moves
    /// the machine; nothing changes here. With nothing registered yet the
    /// cancel is recorded and applied at registration.
    fn cancel_stage(&self) {
        let (token, handle) = {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if slot.stage_token.is_none() && slot.server_handle.is_none() {
                slot.pending = true;
            }
            (slot.stage_token.clone(), slot.server_handle.clone())
        };
        if let Some(token) = token {
            token.cancel();
        }
        // A start in flight has no stage token, only a server handle
        if let Some(handle) = handle {
            self.server.stop(&handle);
        }
    }

    fn stop_server(&self) {
        let handle = {
            let slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            slot.server_handle.clone()
        };
        if let Some(handle) = handle {
            self.server.stop(&handle);
        }
    }

    fn set_stage_cancel(&self, token: CancellationToken) {
        let pending = {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            slot.stage_token = Some(token.clone());
            std::mem::take(&mut slot.pending)
        };
        if pending {
            token.cancel();
        }
    }

    fn set_server_handle(&self, handle: ServerHandle) {
        let pending = {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            slot.server_handle = Some(handle.clone());
            std::mem::take(&mut slot.pending)
        };
        if pending {
            self.server.stop(&handle);
        }
    }

    fn clear_stage_cancel(&self) {
        let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        slot.stage_token = None;
        slot.pending = false;
    }

    fn clear_server_handle(&self) {
        let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        slot.server_handle = None;
        slot.pending = false;
    }
}
