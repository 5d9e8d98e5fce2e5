//! Per-host connection limiter
//!
//! Caps how many requests may be in flight against one host at a time.
//! reqwest pools connections but never refuses to open more, so the cap is
//! enforced here with one semaphore per host. A permit is held for the whole
//! life of a request, including the body stream.

use crate::error::DownloadError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

/// Shared limiter handing out per-host connection permits
#[derive(Clone, Debug)]
pub struct HostLimiter {
    state: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    max_per_host: usize,
}

impl HostLimiter {
    /// Create a limiter allowing `max_per_host` concurrent requests per host
    pub fn new(max_per_host: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            // A zero cap would park every request forever
            max_per_host: max_per_host.max(1),
        }
    }

    pub fn max_per_host(&self) -> usize {
        self.max_per_host
    }

    /// Wait for a connection slot for the host of `url`
    pub async fn acquire(&self, url: &Url) -> Result<OwnedSemaphorePermit, DownloadError> {
        let semaphore = self.semaphore_for(url);
        semaphore
            .acquire_owned()
            .await
            .map_err(|e| DownloadError::Unknown(e.to_string()))
    }

    /// Number of free slots for the host of `url`
    pub fn available(&self, url: &Url) -> usize {
        self.semaphore_for(url).available_permits()
    }

    fn semaphore_for(&self, url: &Url) -> Arc<Semaphore> {
        let key = host_key(url);
        let mut hosts = self.state.lock();
        hosts
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }
}

/// Key identifying a connection target: scheme, host and effective port
fn host_key(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}
