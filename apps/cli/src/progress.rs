//! Progress bar utilities for CLI downloads

use console::style;
use grabber_types::DownloadEvent;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use url::Url;

/// Bar length; progress fractions are scaled to this many steps
const BAR_STEPS: u64 = 1000;

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<Url, ProgressBar>>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Create a progress bar for a download
    pub fn add_download(&self, url: &Url) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(BAR_STEPS));
        pb.set_style(bar_style());
        pb.set_message(url.to_string());
        self.bars.lock().insert(url.clone(), pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &DownloadEvent) {
        let bars = self.bars.lock();
        let Some(pb) = bars.get(event.url()) else {
            return;
        };

        match event {
            DownloadEvent::Progress { progress, .. } => {
                if *progress < 0.0 {
                    // Size unknown: spin instead of filling
                    if pb.length().is_some() {
                        pb.set_style(spinner_style());
                        pb.unset_length();
                    }
                    pb.tick();
                } else {
                    pb.set_position((*progress as f64 * BAR_STEPS as f64) as u64);
                }
            }
            DownloadEvent::Completed { .. } => {
                pb.finish_with_message(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    event.url()
                ));
            }
            DownloadEvent::Failed { error, .. } => {
                pb.abandon_with_message(format!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    event.url(),
                    error.as_deref().unwrap_or("Unknown error")
                ));
            }
            DownloadEvent::Paused { .. } => {
                pb.abandon_with_message(format!("{} {} paused", style("⏸").yellow(), event.url()));
            }
        }
    }

    /// Clear all progress bars
    pub fn clear(&self) {
        for (_, pb) in self.bars.lock().drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
