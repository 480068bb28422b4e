//! Child process supervision for the engine build and the inference server.

pub mod build;
pub mod server;

pub use build::{BuildError, BuildOutcome, BuildSupervisor};
pub use server::{ServerError, ServerExit, ServerHandle, ServerProcessSupervisor};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;

use crate::events::EventSink;

/// Forward each line of a child's output stream to the sink.
pub(crate) fn spawn_line_reader<R>(
    reader: R,
    sink: Arc<dyn EventSink>,
    is_error: bool,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.on_log_line(&line, is_error);
        }
    })
}

/// Terminate a child gracefully, escalating to a kill after `grace`.
///
/// Returns `true` when the kill was forced. On unix the graceful signal is
/// SIGTERM; elsewhere we go straight to the forced kill.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> bool {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-15", &pid.to_string()])
            .output();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return false,
            Err(_) => {
                log::warn!("process {} ignored SIGTERM, killing", pid);
            }
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
    true
}
