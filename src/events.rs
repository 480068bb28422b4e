//! Observer interface between the orchestrator core and whatever UI consumes it.
//!
//! The core emits log lines, download progress and state snapshots from
//! background worker tasks. Consumers must not assume any particular thread;
//! marshalling onto a UI event loop is the consumer's job.

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleState;

/// Byte-level progress of an in-flight model download.
///
/// Recomputed on each received chunk; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Bytes written to the partial file so far
    pub bytes_received: u64,
    /// Total size if known (descriptor or Content-Length)
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    pub fn new(bytes_received: u64, total_bytes: Option<u64>) -> Self {
        Self {
            bytes_received,
            total_bytes,
        }
    }

    /// Percentage completed, when the total is known and non-zero.
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some((self.bytes_received as f64 / total as f64) * 100.0),
            _ => None,
        }
    }
}

/// Sink for everything the orchestrator wants a user to see.
///
/// Within one sub-operation (download, build, server start) callbacks arrive
/// in the order produced, and the terminal callback for that sub-operation is
/// always delivered after the last log/progress callback.
pub trait EventSink: Send + Sync {
    /// One line of build/server output. `is_error` marks stderr lines.
    fn on_log_line(&self, line: &str, is_error: bool);

    /// Download progress update, throttled at the source.
    fn on_progress(&self, progress: &DownloadProgress);

    /// A lifecycle transition happened. Exactly one call per transition.
    fn on_state_change(&self, state: &LifecycleState);
}

/// Sink that forwards everything to the `log` facade.
///
/// Used by the CLI; also a reasonable default for headless embedding.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn on_log_line(&self, line: &str, is_error: bool) {
        if is_error {
            log::warn!("[server] {}", line);
        } else {
            log::info!("[server] {}", line);
        }
    }

    fn on_progress(&self, progress: &DownloadProgress) {
        match progress.percentage() {
            Some(pct) => log::info!(
                "download progress: {:.1}% ({} bytes)",
                pct,
                progress.bytes_received
            ),
            None => log::info!("download progress: {} bytes", progress.bytes_received),
        }
    }

    fn on_state_change(&self, state: &LifecycleState) {
        log::info!("lifecycle state: {}", state);
    }
}
