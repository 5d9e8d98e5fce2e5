//! Grabber Core - Download Manager
//!
//! This crate provides the download manager behind Grabber. It starts HTTP(S)
//! downloads, reports per-URL progress to an observer and supports
//! pause/resume through byte-range resumption tokens.
//!
//! ```no_run
//! use grabber_core::{DownloadManager, DownloadObserver, DownloadError};
//! use std::path::Path;
//! use std::sync::Arc;
//! use url::Url;
//!
//! struct Printer;
//!
//! impl DownloadObserver for Printer {
//!     fn on_progress(&self, url: &Url, progress: f32) {
//!         println!("{url}: {progress}");
//!     }
//!     fn on_completed(&self, url: &Url, location: &Path) {
//!         let _ = std::fs::rename(location, "file.bin");
//!     }
//!     fn on_failed(&self, url: &Url, error: Option<&DownloadError>) {
//!         eprintln!("{url} failed: {error:?}");
//!     }
//! }
//!
//! # async fn run() -> Result<(), DownloadError> {
//! let manager = DownloadManager::with_defaults().await?;
//! let observer: Arc<dyn DownloadObserver> = Arc::new(Printer);
//! manager.set_observer(&observer);
//!
//! let url = grabber_core::parse_url("https://example.com/file.bin")?;
//! manager.start_download(&url);
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;

pub use engine::*;
pub use error::*;
pub use grabber_types::{DownloadEvent, ManagerConfig, Progress, INDETERMINATE_PROGRESS, MAX_CONNECTIONS_PER_HOST};

/// Parse and validate a download URL. Only `http` and `https` are accepted.
pub fn parse_url(url: &str) -> Result<url::Url, DownloadError> {
    let parsed = url::Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(DownloadError::InvalidUrl(url.to_string())),
    }
}
