//! Streamed model downloads with verification and cancellation.
//!
//! Weights stream into `<file>.part`; the partial file is renamed into place
//! only after the size (and digest, when the catalog carries one) checks out.
//! On any failure or cancellation the partial file is deleted, so the store
//! never sees an unverified final file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::events::{DownloadProgress, EventSink};
use crate::models::catalog::ModelDescriptor;
use crate::models::store::ModelStore;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("downloaded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("checksum mismatch for {file}")]
    ChecksumMismatch { file: String },
    #[error("a download of {0} is already in progress")]
    AlreadyInProgress(String),
}

/// Terminal result of one download attempt.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Verified file renamed into place
    Success,
    /// Partial file deleted
    Failure(DownloadError),
    /// Cancelled via the token; partial file deleted
    Cancelled,
}

/// One-at-a-time model downloader.
///
/// `start` returns immediately with a cancellation token; the transfer runs
/// on a spawned task and reports through the sink and the `on_done` callback.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    active: Arc<Mutex<Option<String>>>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin downloading `descriptor` into `store`.
    ///
    /// At most one download may be in flight per `Downloader`; a second
    /// `start` fails with [`DownloadError::AlreadyInProgress`]. `on_done`
    /// fires exactly once, after the last progress callback.
    pub fn start(
        &self,
        descriptor: ModelDescriptor,
        store: ModelStore,
        sink: Arc<dyn EventSink>,
        on_done: impl FnOnce(DownloadOutcome) + Send + 'static,
    ) -> Result<CancellationToken, DownloadError> {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(in_flight) = active.as_ref() {
                return Err(DownloadError::AlreadyInProgress(in_flight.clone()));
            }
            *active = Some(descriptor.file_name.clone());
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let client = self.client.clone();
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let part_path = store.part_path(&descriptor);
            let outcome = run_download(
                client,
                &descriptor,
                &store,
                Arc::clone(&sink),
                task_token,
            )
            .await;

            // The final file only ever appears on success
            if !matches!(outcome, DownloadOutcome::Success) {
                if let Err(e) = tokio::fs::remove_file(&part_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("failed to remove partial file {:?}: {}", part_path, e);
                    }
                }
            }

            {
                let mut active = active.lock().unwrap_or_else(|e| e.into_inner());
                *active = None;
            }
            on_done(outcome);
        });

        Ok(token)
    }
}

async fn run_download(
    client: reqwest::Client,
    descriptor: &ModelDescriptor,
    store: &ModelStore,
    sink: Arc<dyn EventSink>,
    token: CancellationToken,
) -> DownloadOutcome {
    match stream_to_part_file(client, descriptor, store, sink, token).await {
        Ok(Some(part_path)) => match finalize(descriptor, store, part_path).await {
            Ok(()) => DownloadOutcome::Success,
            Err(e) => DownloadOutcome::Failure(e),
        },
        Ok(None) => DownloadOutcome::Cancelled,
        Err(e) => DownloadOutcome::Failure(e),
    }
}

/// Stream the response body into the `.part` file.
/// Returns `Ok(None)` when cancelled mid-transfer.
async fn stream_to_part_file(
    client: reqwest::Client,
    descriptor: &ModelDescriptor,
    store: &ModelStore,
    sink: Arc<dyn EventSink>,
    token: CancellationToken,
) -> Result<Option<PathBuf>, DownloadError> {
    let response = client.get(&descriptor.download_url).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus(response.status().as_u16()));
    }

    let total_bytes = descriptor
        .expected_size_bytes
        .or_else(|| response.content_length());

    store.ensure_dir().map_err(|e| match e {
        crate::models::store::StoreError::Io(io) => DownloadError::Io(io),
        other => DownloadError::Io(std::io::Error::other(other.to_string())),
    })?;
    let part_path = store.part_path(descriptor);
    let mut file = tokio::fs::File::create(&part_path).await?;

    let mut stream = response.bytes_stream();
    let mut bytes_received: u64 = 0;
    let mut last_report = Instant::now() - PROGRESS_INTERVAL;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Ok(None);
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await?;
                        bytes_received += bytes.len() as u64;

                        if last_report.elapsed() >= PROGRESS_INTERVAL {
                            sink.on_progress(&DownloadProgress::new(bytes_received, total_bytes));
                            last_report = Instant::now();
                        }
                    }
                    Some(Err(e)) => return Err(DownloadError::Network(e)),
                    None => break,
                }
            }
        }
    }

    file.flush().await?;
    drop(file);

    // Final progress emit so consumers see 100%
    sink.on_progress(&DownloadProgress::new(bytes_received, total_bytes));

    if let Some(expected) = descriptor.expected_size_bytes {
        if bytes_received != expected {
            return Err(DownloadError::SizeMismatch {
                expected,
                actual: bytes_received,
            });
        }
    }

    Ok(Some(part_path))
}

/// Verify the digest when the catalog carries one, then rename into place.
async fn finalize(
    descriptor: &ModelDescriptor,
    store: &ModelStore,
    part_path: PathBuf,
) -> Result<(), DownloadError> {
    if let Some(expected_hex) = &descriptor.sha256 {
        let actual_hex = compute_sha256(&part_path).await?;
        if !actual_hex.eq_ignore_ascii_case(expected_hex) {
            return Err(DownloadError::ChecksumMismatch {
                file: descriptor.file_name.clone(),
            });
        }
    }

    tokio::fs::rename(&part_path, store.model_path(descriptor)).await?;
    Ok(())
}

async fn compute_sha256(path: &PathBuf) -> Result<String, DownloadError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::ModelFamily;
    use std::sync::mpsc;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    struct RecordingSink {
        progress: Mutex<Vec<DownloadProgress>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                progress: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for RecordingSink {
        fn on_log_line(&self, _line: &str, _is_error: bool) {}
        fn on_progress(&self, progress: &DownloadProgress) {
            self.progress.lock().unwrap().push(*progress);
        }
        fn on_state_change(&self, _state: &crate::lifecycle::LifecycleState) {}
    }

    /// Minimal HTTP server delivering `body` once, then closing.
    /// When `stall` is set, the body is withheld until the listener task is
    /// dropped, keeping the transfer open for cancellation tests.
    async fn serve_once(body: Vec<u8>, stall: bool) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            if stall {
                // Hold the connection open without sending the body
                std::future::pending::<()>().await;
            }
            socket.write_all(&body).await.unwrap();
            socket.flush().await.unwrap();
        });
        (format!("http://{}", addr), handle)
    }

    fn test_descriptor(url: String, size: Option<u64>) -> ModelDescriptor {
        ModelDescriptor {
            family: ModelFamily::CodeLlama,
            parameter_size_b: 7,
            quantization_bits: 4,
            file_name: "test-model.gguf".into(),
            download_url: url,
            expected_size_bytes: size,
            sha256: None,
            estimated_ram_mb: 1,
        }
    }

    #[tokio::test]
    async fn successful_download_renames_into_place() {
        let body = b"model weights payload".to_vec();
        let (url, _server) = serve_once(body.clone(), false).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let descriptor = test_descriptor(url, Some(body.len() as u64));
        let sink = RecordingSink::new();

        let (tx, rx) = mpsc::channel();
        let downloader = Downloader::new();
        downloader
            .start(descriptor.clone(), store.clone(), sink.clone(), move |o| {
                tx.send(o).unwrap();
            })
            .unwrap();

        let outcome = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::Success));
        assert!(store.exists(&descriptor));
        assert_eq!(store.partial_bytes(&descriptor), None);

        let progress = sink.progress.lock().unwrap();
        let last = progress.last().expect("at least the final emit");
        assert_eq!(last.bytes_received, body.len() as u64);
        assert_eq!(last.percentage(), Some(100.0));
    }

    #[tokio::test]
    async fn size_mismatch_fails_and_removes_partial() {
        let body = b"short".to_vec();
        let (url, _server) = serve_once(body, false).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        // Claim a larger expected size than the fixture serves
        let descriptor = test_descriptor(url, Some(9999));
        let sink = RecordingSink::new();

        let (tx, rx) = mpsc::channel();
        let downloader = Downloader::new();
        downloader
            .start(descriptor.clone(), store.clone(), sink, move |o| {
                tx.send(o).unwrap();
            })
            .unwrap();

        let outcome = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        match outcome {
            DownloadOutcome::Failure(DownloadError::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, 9999);
                assert_eq!(actual, 5);
            }
            other => panic!("expected SizeMismatch, got {:?}", other),
        }
        assert!(!store.exists(&descriptor));
        assert_eq!(store.partial_bytes(&descriptor), None);
    }

    #[tokio::test]
    async fn cancellation_removes_partial_and_reports_cancelled() {
        let (url, _server) = serve_once(b"never delivered".to_vec(), true).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let descriptor = test_descriptor(url, Some(15));
        let sink = RecordingSink::new();

        let (tx, rx) = mpsc::channel();
        let downloader = Downloader::new();
        let token = downloader
            .start(descriptor.clone(), store.clone(), sink, move |o| {
                tx.send(o).unwrap();
            })
            .unwrap();

        // Let the transfer reach the stalled body read, then cancel
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let outcome = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::Cancelled));
        assert!(!store.exists(&descriptor));
        assert_eq!(store.partial_bytes(&descriptor), None);
    }

    #[tokio::test]
    async fn matching_digest_passes_verification() {
        let body = b"verified model weights".to_vec();
        let (url, _server) = serve_once(body.clone(), false).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let mut descriptor = test_descriptor(url, Some(body.len() as u64));
        // Uppercase hex must compare equal too
        descriptor.sha256 = Some(format!("{:X}", Sha256::digest(&body)));
        let sink = RecordingSink::new();

        let (tx, rx) = mpsc::channel();
        let downloader = Downloader::new();
        downloader
            .start(descriptor.clone(), store.clone(), sink, move |o| {
                tx.send(o).unwrap();
            })
            .unwrap();

        let outcome = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::Success));
        assert!(store.exists(&descriptor));
    }

    #[tokio::test]
    async fn digest_mismatch_fails_and_keeps_no_file() {
        let body = b"corrupted in transit".to_vec();
        let (url, _server) = serve_once(body.clone(), false).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let mut descriptor = test_descriptor(url, Some(body.len() as u64));
        descriptor.sha256 = Some(format!("{:x}", Sha256::digest(b"what was published")));
        let sink = RecordingSink::new();

        let (tx, rx) = mpsc::channel();
        let downloader = Downloader::new();
        downloader
            .start(descriptor.clone(), store.clone(), sink, move |o| {
                tx.send(o).unwrap();
            })
            .unwrap();

        let outcome = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        match outcome {
            DownloadOutcome::Failure(DownloadError::ChecksumMismatch { file }) => {
                assert_eq!(file, "test-model.gguf");
            }
            other => panic!("expected ChecksumMismatch, got {:?}", other),
        }
        assert!(!store.exists(&descriptor));
        assert_eq!(store.partial_bytes(&descriptor), None);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let (url, _server) = serve_once(b"stalled".to_vec(), true).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let descriptor = test_descriptor(url, None);
        let sink = RecordingSink::new();

        let downloader = Downloader::new();
        let token = downloader
            .start(descriptor.clone(), store.clone(), sink.clone(), |_| {})
            .unwrap();

        let second = downloader.start(descriptor, store, sink, |_| {});
        assert!(matches!(
            second,
            Err(DownloadError::AlreadyInProgress(name)) if name == "test-model.gguf"
        ));

        token.cancel();
    }

    #[tokio::test]
    async fn http_error_status_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let descriptor = test_descriptor(format!("http://{}", addr), None);
        let sink = RecordingSink::new();

        let (tx, rx) = mpsc::channel();
        let downloader = Downloader::new();
        downloader
            .start(descriptor.clone(), store.clone(), sink, move |o| {
                tx.send(o).unwrap();
            })
            .unwrap();

        let outcome = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DownloadOutcome::Failure(DownloadError::HttpStatus(404))
        ));
        assert!(!store.exists(&descriptor));
    }
}
