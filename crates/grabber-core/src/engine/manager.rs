//! Download Manager - tracks all transfers by URL
//!
//! This is the top-level coordinator that:
//! - Starts/pauses/resumes/cancels transfers
//! - Keeps the URL → transfer and URL → resume token tables
//! - Forwards transfer outcomes to the observer
//!
//! Both tables sit behind one lock. Worker tasks finish on arbitrary runtime
//! threads and update the tables themselves, so a URL never keeps a stale
//! entry once its terminal event has fired.

use crate::engine::host_limiter::HostLimiter;
use crate::engine::notifier::{DownloadObserver, Notifier};
use crate::engine::resume::{remove_partial, ResumeToken};
use crate::engine::transfer::{Control, TransferOutcome, TransferWorker};
use crate::error::DownloadError;
use grabber_types::{DownloadEvent, ManagerConfig};
use parking_lot::Mutex;
use reqwest::header::CONTENT_LENGTH;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Result of asking for a transfer to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh transfer was started
    Started,
    /// A paused transfer continues from its resume token
    Resumed,
    /// The URL already has a running transfer; nothing was started
    AlreadyActive,
}

/// Result of pausing a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// No running transfer for the URL (it may have just finished)
    NotActive,
    /// The transfer stopped. When `resumable` is false no token was produced
    /// and resuming starts over.
    Paused { resumable: bool },
}

/// Handle to a running transfer
struct TransferHandle {
    /// Generation; workers only clear entries carrying their own id
    id: u64,
    control: oneshot::Sender<Control>,
    _task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Tables {
    active: HashMap<Url, TransferHandle>,
    resume_tokens: HashMap<Url, ResumeToken>,
}

impl Tables {
    fn remove_if_current(&mut self, url: &Url, id: u64) {
        if self.active.get(url).map(|h| h.id == id).unwrap_or(false) {
            self.active.remove(url);
        }
    }
}

/// Download manager that coordinates all transfers
pub struct DownloadManager {
    tables: Arc<Mutex<Tables>>,
    notifier: Arc<Notifier>,
    /// HTTP client
    client: Client,
    limiter: HostLimiter,
    runtime: Handle,
    next_id: AtomicU64,
    config: ManagerConfig,
}

impl DownloadManager {
    /// Create a new download manager
    pub async fn new(config: ManagerConfig) -> Result<Self, DownloadError> {
        // Workers are spawned onto the runtime that created the manager
        let runtime = Handle::try_current().map_err(|e| DownloadError::Unknown(e.to_string()))?;

        // Create directory for partial files
        tokio::fs::create_dir_all(&config.temp_dir).await?;

        // Create HTTP client
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .map_err(|e| DownloadError::Unknown(e.to_string()))?;

        info!(
            "Download manager ready (max {} connections per host, partial files in {})",
            config.max_connections_per_host,
            config.temp_dir.display()
        );

        Ok(Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            notifier: Arc::new(Notifier::new(config.event_capacity)),
            client,
            limiter: HostLimiter::new(config.max_connections_per_host),
            runtime,
            next_id: AtomicU64::new(1),
            config,
        })
    }

    /// Create a download manager with the default configuration
    pub async fn with_defaults() -> Result<Self, DownloadError> {
        Self::new(ManagerConfig::default()).await
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ========================================================================
    // Observer
    // ========================================================================

    /// Register the observer. Only a weak reference is kept; the caller owns it.
    pub fn set_observer(&self, observer: &Arc<dyn DownloadObserver>) {
        self.notifier.set_observer(observer);
    }

    pub fn clear_observer(&self) {
        self.notifier.clear_observer();
    }

    /// Subscribe to broadcast events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.notifier.subscribe()
    }

    // ========================================================================
    // Transfer Operations
    // ========================================================================

    /// Start a fresh download of `url`.
    ///
    /// A URL that is already downloading is left alone. Any resume token
    /// left for the URL is discarded, since the new transfer supersedes it.
    pub fn start_download(&self, url: &Url) -> StartOutcome {
        let stale = {
            let mut tables = self.tables.lock();
            if tables.active.contains_key(url) {
                warn!("Download of {} is already running", url);
                return StartOutcome::AlreadyActive;
            }
            let stale = tables.resume_tokens.remove(url);
            self.spawn_transfer(&mut tables, url, None);
            stale
        };

        if let Some(token) = stale {
            debug!("Discarding resume token for {}", url);
            self.runtime.spawn(async move { token.discard().await });
        }

        StartOutcome::Started
    }

    /// Pause a download, keeping what was received when the server allows it.
    ///
    /// Returns once the worker has stopped and any token is stored. The
    /// worker does not wait for the network to stop, only for its own file
    /// flush.
    pub async fn pause_download(&self, url: &Url) -> PauseOutcome {
        let handle = self.tables.lock().active.remove(url);
        let Some(handle) = handle else {
            return PauseOutcome::NotActive;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.control.send(Control::Pause(reply_tx)).is_err() {
            // Worker already finished and reported its outcome
            return PauseOutcome::NotActive;
        }

        let token = match reply_rx.await {
            Ok(token) => token,
            Err(_) => return PauseOutcome::NotActive,
        };

        let resumable = match token {
            Some(token) => {
                let superseded = {
                    let mut tables = self.tables.lock();
                    if tables.active.contains_key(url) {
                        // Restarted while we were waiting; the new transfer wins
                        Some(token)
                    } else {
                        tables.resume_tokens.insert(url.clone(), token);
                        None
                    }
                };
                match superseded {
                    Some(token) => {
                        token.discard().await;
                        false
                    }
                    None => true,
                }
            }
            None => false,
        };

        info!("Paused {} (resumable: {})", url, resumable);
        self.notifier.paused(url, resumable);
        PauseOutcome::Paused { resumable }
    }

    /// Resume a paused download, or start it fresh if there is no token
    pub fn resume_download(&self, url: &Url) -> StartOutcome {
        {
            let mut tables = self.tables.lock();
            if tables.active.contains_key(url) {
                warn!("Download of {} is already running", url);
                return StartOutcome::AlreadyActive;
            }
            if let Some(token) = tables.resume_tokens.remove(url) {
                info!("Resuming {} from {} bytes", url, token.bytes_received());
                self.spawn_transfer(&mut tables, url, Some(token));
                return StartOutcome::Resumed;
            }
        }

        self.start_download(url)
    }

    /// Cancel a download and discard its data.
    ///
    /// The observer receives `on_failed` with [`DownloadError::Cancelled`].
    /// Returns whether a running transfer was found. Resume tokens are left
    /// untouched.
    pub fn cancel_download(&self, url: &Url) -> bool {
        let handle = self.tables.lock().active.remove(url);
        match handle {
            Some(handle) => {
                info!("Cancelling download of {}", url);
                // A closed channel means the worker already finished
                let _ = handle.control.send(Control::Cancel);
                true
            }
            None => false,
        }
    }

    /// Ask the server for the size of `url` without downloading it.
    ///
    /// Any failure, or a response without `Content-Length`, yields `None`.
    /// A non-2xx answer yields `None` even when it carries `Content-Length`.
    /// The request does not wait for a connection slot, so it is never held up
    /// by transfers running against the same host.
    pub async fn fetch_size(&self, url: &Url) -> Option<u64> {
        match self.request_size(url).await {
            Ok(size) => size,
            Err(e) => {
                debug!("Size request for {} failed: {}", url, e);
                None
            }
        }
    }

    async fn request_size(&self, url: &Url) -> Result<Option<u64>, DownloadError> {
        let response = self.client.head(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::ServerError {
                status: status.as_u16(),
                message: format!("Size request for {} rejected", url),
            });
        }

        // Read the header directly; the body of a HEAD response is always empty
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok()))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Check if a download is running
    pub fn is_active(&self, url: &Url) -> bool {
        self.tables.lock().active.contains_key(url)
    }

    /// Get count of running downloads
    pub fn active_count(&self) -> usize {
        self.tables.lock().active.len()
    }

    pub fn has_resume_token(&self, url: &Url) -> bool {
        self.tables.lock().resume_tokens.contains_key(url)
    }

    /// Copy of the resume token held for `url`
    pub fn resume_token(&self, url: &Url) -> Option<ResumeToken> {
        self.tables.lock().resume_tokens.get(url).cloned()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Spawn a worker and record its handle. Caller holds the table lock.
    fn spawn_transfer(&self, tables: &mut Tables, url: &Url, resume: Option<ResumeToken>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let partial_path = resume
            .as_ref()
            .map(|token| token.partial_path().to_path_buf())
            .unwrap_or_else(|| self.fresh_partial_path());

        let (control_tx, control_rx) = oneshot::channel();
        let worker = TransferWorker::new(
            url.clone(),
            partial_path,
            resume,
            self.client.clone(),
            self.limiter.clone(),
            self.notifier.clone(),
            control_rx,
        );

        // Clone for cleanup task
        let tables_ref = self.tables.clone();
        let notifier = self.notifier.clone();
        let task_url = url.clone();

        let task = self.runtime.spawn(async move {
            let outcome = worker.run().await;
            finish_transfer(&tables_ref, &notifier, &task_url, id, outcome).await;
        });

        tables.active.insert(
            url.clone(),
            TransferHandle {
                id,
                control: control_tx,
                _task: task,
            },
        );
    }

    fn fresh_partial_path(&self) -> PathBuf {
        self.config
            .temp_dir
            .join(format!("{}.part", Uuid::new_v4()))
    }
}

/// Clear the table entry and report the outcome
async fn finish_transfer(
    tables: &Mutex<Tables>,
    notifier: &Notifier,
    url: &Url,
    id: u64,
    outcome: TransferOutcome,
) {
    // Entry goes first so the observer may restart the URL from its callback
    tables.lock().remove_if_current(url, id);

    match outcome {
        TransferOutcome::Completed { path, bytes } => {
            notifier.completed(url, &path, bytes);
            // Whatever the observer did not move is ours to clean up
            remove_partial(&path).await;
        }
        TransferOutcome::Failed(error) => {
            warn!("Download of {} failed: {}", url, error);
            notifier.failed(url, Some(&error));
        }
        TransferOutcome::Cancelled => {
            notifier.failed(url, Some(&DownloadError::Cancelled));
        }
        TransferOutcome::Paused => {}
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        let mut tables = self.tables.lock();
        for (url, handle) in tables.active.drain() {
            debug!("Cancelling {} on shutdown", url);
            let _ = handle.control.send(Control::Cancel);
        }
        // Tokens do not outlive the manager, so neither do their files
        for (_, token) in tables.resume_tokens.drain() {
            let _ = std::fs::remove_file(token.partial_path());
        }
    }
}
