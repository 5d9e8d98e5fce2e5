//! Shared types for Grabber
//!
//! This crate contains the data structures shared between the core
//! download manager and the CLI: events, progress values and configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Default cap on simultaneous connections to a single host
pub const MAX_CONNECTIONS_PER_HOST: usize = 5;

/// Progress value reported when the total size of a transfer is unknown
pub const INDETERMINATE_PROGRESS: f32 = -1.0;

// ============================================================================
// Progress
// ============================================================================

/// Progress of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    /// Fraction of the expected bytes written, always within `[0, 1]`
    Fraction(f32),
    /// Total size unknown
    Indeterminate,
}

impl Progress {
    /// Compute progress from bytes written and the expected total.
    ///
    /// A missing or zero total yields [`Progress::Indeterminate`]. Servers
    /// that send more than they announced are clamped to `1.0`.
    pub fn from_bytes(written: u64, expected: Option<u64>) -> Self {
        match expected {
            Some(total) if total > 0 => {
                let fraction = (written as f64 / total as f64).clamp(0.0, 1.0);
                Progress::Fraction(fraction as f32)
            }
            _ => Progress::Indeterminate,
        }
    }

    /// The value handed to observers: the fraction, or `-1` when indeterminate
    pub fn as_f32(&self) -> f32 {
        match self {
            Progress::Fraction(f) => *f,
            Progress::Indeterminate => INDETERMINATE_PROGRESS,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Progress::Indeterminate)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the download manager
///
/// These mirror the observer callbacks. `Completed` carries the byte count
/// instead of the file location, since the location is only valid while the
/// observer callback runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    Progress {
        url: Url,
        progress: f32,
    },
    Completed {
        url: Url,
        bytes: u64,
    },
    Failed {
        url: Url,
        error: Option<String>,
    },
    Paused {
        url: Url,
        resumable: bool,
    },
}

impl DownloadEvent {
    /// URL the event belongs to
    pub fn url(&self) -> &Url {
        match self {
            DownloadEvent::Progress { url, .. }
            | DownloadEvent::Completed { url, .. }
            | DownloadEvent::Failed { url, .. }
            | DownloadEvent::Paused { url, .. } => url,
        }
    }

    /// Whether this event ends a transfer's lifecycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress { .. })
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Download manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum simultaneous connections to one host
    pub max_connections_per_host: usize,
    /// Directory holding partial files of running and paused transfers
    pub temp_dir: PathBuf,
    pub user_agent: String,
    /// Connect timeout in seconds; transfers themselves have no deadline
    pub connect_timeout_secs: u64,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    1000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: MAX_CONNECTIONS_PER_HOST,
            temp_dir: dirs::cache_dir()
                .map(|p| p.join("grabber").join("partial"))
                .unwrap_or_else(|| std::env::temp_dir().join("grabber")),
            user_agent: concat!("Grabber/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            event_capacity: default_event_capacity(),
        }
    }
}
