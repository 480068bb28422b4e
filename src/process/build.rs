//! Supervision of the native engine build.
//!
//! Runs the build command in the engine directory with the configured
//! argument and environment overlays, streams its output line by line, and
//! reports a single terminal outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::process::{spawn_line_reader, terminate};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to spawn build command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("a build is already in progress")]
    AlreadyInProgress,
}

/// Terminal result of one build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Exit status zero
    Success,
    /// Non-zero exit; `-1` when the process died without a status
    Failure { exit_code: i32 },
    /// Cancelled via the token; the process was terminated
    Cancelled,
}

/// One-at-a-time build runner.
pub struct BuildSupervisor {
    program: PathBuf,
    workdir: PathBuf,
    grace_period: Duration,
    active: Arc<AtomicBool>,
}

impl BuildSupervisor {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
            grace_period,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the build and watch it to completion.
    ///
    /// Spawn failures surface synchronously; everything after a successful
    /// spawn arrives through `on_done`, exactly once, after the output
    /// streams are drained.
    pub fn start(
        &self,
        args: &[String],
        env: &HashMap<String, String>,
        sink: Arc<dyn EventSink>,
        on_done: impl FnOnce(BuildOutcome) + Send + 'static,
    ) -> Result<CancellationToken, BuildError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(BuildError::AlreadyInProgress);
        }

        let mut child = match Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(BuildError::Spawn(e));
            }
        };

        log::info!(
            "build started: {} {} (pid {:?})",
            self.program.display(),
            args.join(" "),
            child.id()
        );

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_line_reader(out, Arc::clone(&sink), false));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_line_reader(err, Arc::clone(&sink), true));

        let token = CancellationToken::new();
        let task_token = token.clone();
        let active = Arc::clone(&self.active);
        let grace = self.grace_period;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => BuildOutcome::Success,
                    Ok(status) => BuildOutcome::Failure {
                        exit_code: status.code().unwrap_or(-1),
                    },
                    Err(e) => {
                        log::error!("waiting on build process failed: {}", e);
                        BuildOutcome::Failure { exit_code: -1 }
                    }
                },
                _ = task_token.cancelled() => {
                    terminate(&mut child, grace).await;
                    BuildOutcome::Cancelled
                }
            };

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            active.store(false, Ordering::SeqCst);
            on_done(outcome);
        });

        Ok(token)
    }
}
