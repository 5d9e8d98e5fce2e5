//! Observer registration and event delivery
//!
//! Events go to two places: the single registered [`DownloadObserver`] and
//! the broadcast channel returned by `DownloadManager::subscribe`. The
//! observer is held weakly; the manager never keeps it alive.

use crate::error::DownloadError;
use grabber_types::DownloadEvent;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::trace;
use url::Url;

/// Listener notified of transfer progress and outcomes.
///
/// Callbacks run on the runtime's worker threads. For one transfer they
/// arrive in order: zero or more `on_progress`, then exactly one of
/// `on_completed` or `on_failed`. Pausing ends a transfer without either.
pub trait DownloadObserver: Send + Sync {
    /// `progress` is within `[0, 1]`, or `-1` when the total size is unknown
    fn on_progress(&self, url: &Url, progress: f32);

    /// `location` is only valid until this call returns. Move or copy the
    /// file before returning; whatever is left there is deleted afterwards.
    fn on_completed(&self, url: &Url, location: &Path);

    /// Network failures, HTTP error statuses and explicit cancellation all
    /// end up here.
    fn on_failed(&self, url: &Url, error: Option<&DownloadError>);
}

/// Delivers events to the observer and the broadcast channel
pub(crate) struct Notifier {
    observer: RwLock<Option<Weak<dyn DownloadObserver>>>,
    event_tx: broadcast::Sender<DownloadEvent>,
}

impl Notifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            observer: RwLock::new(None),
            event_tx,
        }
    }

    pub(crate) fn set_observer(&self, observer: &Arc<dyn DownloadObserver>) {
        *self.observer.write() = Some(Arc::downgrade(observer));
    }

    pub(crate) fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    #[cfg(test)]
    pub(crate) fn has_observer(&self) -> bool {
        self.observer
            .read()
            .as_ref()
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn progress(&self, url: &Url, progress: f32) {
        if let Some(observer) = self.observer() {
            observer.on_progress(url, progress);
        }
        self.emit(DownloadEvent::Progress {
            url: url.clone(),
            progress,
        });
    }

    pub(crate) fn completed(&self, url: &Url, location: &Path, bytes: u64) {
        if let Some(observer) = self.observer() {
            observer.on_completed(url, location);
        }
        self.emit(DownloadEvent::Completed {
            url: url.clone(),
            bytes,
        });
    }

    pub(crate) fn failed(&self, url: &Url, error: Option<&DownloadError>) {
        if let Some(observer) = self.observer() {
            observer.on_failed(url, error);
        }
        self.emit(DownloadEvent::Failed {
            url: url.clone(),
            error: error.map(|e| e.to_string()),
        });
    }

    pub(crate) fn paused(&self, url: &Url, resumable: bool) {
        self.emit(DownloadEvent::Paused {
            url: url.clone(),
            resumable,
        });
    }

    /// Upgrade the registration; the read lock is released before any callback runs
    fn observer(&self) -> Option<Arc<dyn DownloadObserver>> {
        let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
        if observer.is_none() {
            trace!("No live observer registered");
        }
        observer
    }

    fn emit(&self, event: DownloadEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}
