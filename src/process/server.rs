//! Supervision of the inference server process.
//!
//! Spawns the compiled server binary, probes the configured port until it
//! accepts a connection, then watches the child until it exits or is asked to
//! stop. Every path ends in exactly one `on_exit` callback.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{EngineSettings, ServerConfig};
use crate::events::EventSink;
use crate::process::{spawn_line_reader, terminate};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to spawn server binary: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("the server is already running")]
    AlreadyRunning,
}

/// How a supervised server run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerExit {
    /// Stopped on request; `forced` when the grace period ran out
    Stopped { forced: bool },
    /// Exited on its own
    Crashed { exit_code: Option<i32> },
    /// Never became ready within the bound; the process was killed
    ReadyTimeout,
}

/// Handle to a running (or starting) server process.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub pid: u32,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// One-at-a-time server process runner.
pub struct ServerProcessSupervisor {
    binary: PathBuf,
    workdir: PathBuf,
    ready_timeout: Duration,
    poll_interval: Duration,
    grace_period: Duration,
    active: Arc<AtomicBool>,
}

impl ServerProcessSupervisor {
    pub fn new(engine: &EngineSettings) -> Self {
        Self {
            binary: engine.server_binary.clone(),
            workdir: engine.engine_dir.clone(),
            ready_timeout: engine.ready_timeout,
            poll_interval: engine.poll_interval,
            grace_period: engine.grace_period,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the server and supervise it.
    ///
    /// `on_ready` fires once when the port accepts a connection; `on_exit`
    /// fires exactly once for every successfully spawned process, ready or
    /// not. Spawn failures surface synchronously and fire neither.
    pub fn start(
        &self,
        model_path: &Path,
        config: &ServerConfig,
        sink: Arc<dyn EventSink>,
        on_ready: impl FnOnce(u32) + Send + 'static,
        on_exit: impl FnOnce(ServerExit) + Send + 'static,
    ) -> Result<ServerHandle, ServerError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let mut args: Vec<String> = vec![
            "-m".into(),
            model_path.display().to_string(),
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            config.port.to_string(),
            "--ctx-size".into(),
            config.context_size.to_string(),
            "--threads".into(),
            config.thread_count.to_string(),
        ];
        args.extend(config.extra_server_args.iter().cloned());

        let mut child = match Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(ServerError::Spawn(e));
            }
        };

        // A spawned child always has a pid until waited on
        let pid = child.id().unwrap_or(0);
        log::info!(
            "server started: {} on port {} (pid {})",
            self.binary.display(),
            config.port,
            pid
        );

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_line_reader(out, Arc::clone(&sink), false));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_line_reader(err, Arc::clone(&sink), true));

        let shutdown = CancellationToken::new();
        let handle = ServerHandle {
            pid,
            shutdown: shutdown.clone(),
        };

        let active = Arc::clone(&self.active);
        let port = config.port;
        let ready_timeout = self.ready_timeout;
        let poll_interval = self.poll_interval;
        let grace = self.grace_period;

        tokio::spawn(async move {
            let exit = supervise(
                &mut child,
                pid,
                port,
                ready_timeout,
                poll_interval,
                grace,
                shutdown,
                on_ready,
            )
            .await;

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            active.store(false, Ordering::SeqCst);
            on_exit(exit);
        });

        Ok(handle)
    }

    /// Request shutdown of a running server. Idempotent; a handle from a
    /// run that already ended cancels nothing.
    pub fn stop(&self, handle: &ServerHandle) {
        handle.stop();
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    child: &mut Child,
    pid: u32,
    port: u16,
    ready_timeout: Duration,
    poll_interval: Duration,
    grace: Duration,
    shutdown: CancellationToken,
    on_ready: impl FnOnce(u32) + Send + 'static,
) -> ServerExit {
    let deadline = Instant::now() + ready_timeout;

    // Startup phase: wait for the port, the child's death, or a stop request
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit_code = status.ok().and_then(|s| s.code());
                log::error!("server exited during startup (code {:?})", exit_code);
                return ServerExit::Crashed { exit_code };
            }
            _ = shutdown.cancelled() => {
                let forced = terminate(child, grace).await;
                return ServerExit::Stopped { forced };
            }
            _ = tokio::time::sleep(poll_interval) => {
                if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    break;
                }
                if Instant::now() >= deadline {
                    log::error!("server not ready after {:?}, killing pid {}", ready_timeout, pid);
                    terminate(child, grace).await;
                    return ServerExit::ReadyTimeout;
                }
            }
        }
    }

    on_ready(pid);

    // Running phase: only a crash or a stop request ends it
    tokio::select! {
        status = child.wait() => {
            let exit_code = status.ok().and_then(|s| s.code());
            ServerExit::Crashed { exit_code }
        }
        _ = shutdown.cancelled() => {
            let forced = terminate(child, grace).await;
            ServerExit::Stopped { forced }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::DownloadProgress;
    use std::sync::mpsc;

    struct NullSink;
    impl EventSink for NullSink {
        fn on_log_line(&self, _line: &str, _is_error: bool) {}
        fn on_progress(&self, _progress: &DownloadProgress) {}
        fn on_state_change(&self, _state: &crate::lifecycle::LifecycleState) {}
    }

    /// Executable shell script standing in for the server binary.
    /// It ignores the launch arguments and runs `body`.
    fn fake_server(dir: &tempfile::TempDir, body: &str) -> EngineSettings {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join("fake-server");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut engine = EngineSettings::new(dir.path());
        engine.server_binary = script;
        engine.ready_timeout = Duration::from_secs(5);
        engine.poll_interval = Duration::from_millis(50);
        engine.grace_period = Duration::from_millis(500);
        engine
    }

    fn config_on_free_port() -> (ServerConfig, std::net::TcpListener) {
        // Bind port 0 to find a free port, keep the listener for tests that
        // need the readiness probe to succeed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ServerConfig::new(2048, 4, port).unwrap();
        (config, listener)
    }

    async fn wait_exit(rx: mpsc::Receiver<ServerExit>) -> ServerExit {
        tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ready_fires_when_port_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let (config, listener) = config_on_free_port();
        let supervisor = ServerProcessSupervisor::new(&fake_server(&dir, "sleep 30"));

        let (ready_tx, ready_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let handle = supervisor
            .start(
                Path::new("/dev/null"),
                &config,
                Arc::new(NullSink),
                move |pid| ready_tx.send(pid).unwrap(),
                move |exit| exit_tx.send(exit).unwrap(),
            )
            .unwrap();

        // The listener bound by the test is the readiness signal
        let pid = tokio::task::spawn_blocking(move || ready_rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(pid, handle.pid);
        drop(listener);

        supervisor.stop(&handle);
        assert!(matches!(wait_exit(exit_rx).await, ServerExit::Stopped { .. }));
    }

    #[tokio::test]
    async fn never_ready_times_out_and_kills() {
        // No listener on the port; the child just sleeps
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = ServerConfig::new(2048, 4, port).unwrap();

        let mut engine = fake_server(&dir, "sleep 30");
        engine.ready_timeout = Duration::from_millis(300);
        let supervisor = ServerProcessSupervisor::new(&engine);
        let (exit_tx, exit_rx) = mpsc::channel();
        supervisor
            .start(
                Path::new("/dev/null"),
                &config,
                Arc::new(NullSink),
                |_| panic!("must not become ready"),
                move |exit| exit_tx.send(exit).unwrap(),
            )
            .unwrap();

        assert_eq!(wait_exit(exit_rx).await, ServerExit::ReadyTimeout);
        assert!(!supervisor.active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn crash_during_startup_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (config, _listener) = config_on_free_port();
        let supervisor = ServerProcessSupervisor::new(&fake_server(&dir, "exit 7"));

        let (exit_tx, exit_rx) = mpsc::channel();
        supervisor
            .start(
                Path::new("/dev/null"),
                &config,
                Arc::new(NullSink),
                |_| {},
                move |exit| exit_tx.send(exit).unwrap(),
            )
            .unwrap();

        assert_eq!(
            wait_exit(exit_rx).await,
            ServerExit::Crashed { exit_code: Some(7) }
        );
    }

    #[tokio::test]
    async fn crash_while_running_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (config, listener) = config_on_free_port();
        let supervisor = ServerProcessSupervisor::new(&fake_server(&dir, "sleep 30"));

        let (ready_tx, ready_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let handle = supervisor
            .start(
                Path::new("/dev/null"),
                &config,
                Arc::new(NullSink),
                move |pid| ready_tx.send(pid).unwrap(),
                move |exit| exit_tx.send(exit).unwrap(),
            )
            .unwrap();

        tokio::task::spawn_blocking(move || ready_rx.recv().unwrap())
            .await
            .unwrap();
        drop(listener);

        // Kill from outside to simulate a crash
        std::process::Command::new("kill")
            .args(["-9", &handle.pid.to_string()])
            .output()
            .unwrap();

        assert_eq!(
            wait_exit(exit_rx).await,
            ServerExit::Crashed { exit_code: None }
        );
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let (config, listener) = config_on_free_port();
        let supervisor = ServerProcessSupervisor::new(&fake_server(&dir, "sleep 30"));

        let (exit_tx, exit_rx) = mpsc::channel();
        let handle = supervisor
            .start(
                Path::new("/dev/null"),
                &config,
                Arc::new(NullSink),
                |_| {},
                move |exit| exit_tx.send(exit).unwrap(),
            )
            .unwrap();

        let second = supervisor.start(
            Path::new("/dev/null"),
            &config,
            Arc::new(NullSink),
            |_| {},
            |_| {},
        );
        assert!(matches!(second, Err(ServerError::AlreadyRunning)));

        drop(listener);
        supervisor.stop(&handle);
        wait_exit(exit_rx).await;
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous() {
        let mut engine = EngineSettings::new(std::env::temp_dir());
        engine.server_binary = PathBuf::from("/nonexistent/server");
        let supervisor = ServerProcessSupervisor::new(&engine);
        let config = ServerConfig::default();

        let result = supervisor.start(
            Path::new("/dev/null"),
            &config,
            Arc::new(NullSink),
            |_| {},
            |_| panic!("on_exit must not fire for spawn failures"),
        );
        assert!(matches!(result, Err(ServerError::Spawn(_))));
        assert!(!supervisor.active.load(Ordering::SeqCst));
    }
}
