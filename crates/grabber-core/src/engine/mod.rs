//! Download Engine
//!
//! This module implements the URL-keyed download manager:
//! - One worker task per transfer, streaming into a partial file
//! - Per-host connection limiting
//! - Pause/resume through byte-range resumption tokens
//! - Progress and outcome delivery to a single observer

mod host_limiter;
mod manager;
mod notifier;
mod resume;
mod transfer;


pub use host_limiter::*;
pub use manager::*;
pub use notifier::DownloadObserver;
pub use resume::{ResumeToken, Validators};
