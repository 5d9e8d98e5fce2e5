//! CLI command implementations

use crate::output::{format_bytes, print_output};
use crate::progress::DownloadProgress;
use crate::OutputFormat;
use anyhow::{anyhow, Context, Result};
use console::style;
use grabber_core::{DownloadError, DownloadManager, DownloadObserver, PauseOutcome};
use grabber_types::ManagerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

// ============================================================================
// Observer
// ============================================================================

/// Moves completed files into the destination directory and records how
/// each transfer ended.
///
/// The manager deletes the file once `on_completed` returns, so the move has
/// to happen inside the callback. Outcomes are kept here rather than read off
/// the event stream, which may drop events when the reader falls behind.
struct SaveToDirectory {
    destination: PathBuf,
    reports: Mutex<HashMap<Url, TransferReport>>,
}

impl SaveToDirectory {
    fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            reports: Mutex::new(HashMap::new()),
        }
    }

    fn take(&self, url: &Url) -> Option<TransferReport> {
        self.reports.lock().remove(url)
    }
}

impl DownloadObserver for SaveToDirectory {
    fn on_progress(&self, _url: &Url, _progress: f32) {}

    fn on_completed(&self, url: &Url, location: &Path) {
        let bytes = std::fs::metadata(location).map(|m| m.len()).ok();
        let target = unique_path(&self.destination.join(filename_for(url)));
        let report = match move_file(location, &target) {
            Ok(()) => TransferReport::completed(url, target, bytes),
            Err(e) => TransferReport::failed(
                url,
                Some(format!("Downloaded but could not be saved: {}", e)),
            ),
        };
        self.reports.lock().insert(url.clone(), report);
    }

    fn on_failed(&self, url: &Url, error: Option<&DownloadError>) {
        let report = TransferReport::failed(url, error.map(|e| e.to_string()));
        self.reports.lock().insert(url.clone(), report);
    }
}

/// Last non-empty path segment of the URL, or `download`
fn filename_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "download".to_string())
}

/// `name.ext`, then `name (1).ext`, `name (2).ext`, ... until one is free
fn unique_path(path: &Path) -> PathBuf {
    let mut counter = 1;
    let mut new_path = path.to_path_buf();

    while new_path.exists() {
        let stem = path.file_stem().unwrap_or_default().to_string_lossy();
        let new_name = match path.extension() {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext.to_string_lossy()),
            None => format!("{} ({})", stem, counter),
        };
        new_path = path.with_file_name(new_name);
        counter += 1;

        if counter > 10000 {
            return new_path;
        }
    }

    new_path
}

/// Rename, falling back to copy when the temp dir is on another filesystem
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum TransferStatus {
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Serialize)]
struct TransferReport {
    url: Url,
    status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resumable: Option<bool>,
}

impl TransferReport {
    fn completed(url: &Url, path: PathBuf, bytes: Option<u64>) -> Self {
        Self {
            url: url.clone(),
            status: TransferStatus::Completed,
            path: Some(path),
            bytes,
            error: None,
            resumable: None,
        }
    }

    fn failed(url: &Url, error: Option<String>) -> Self {
        Self {
            url: url.clone(),
            status: TransferStatus::Failed,
            path: None,
            bytes: None,
            error,
            resumable: None,
        }
    }

    fn paused(url: &Url, resumable: bool) -> Self {
        Self {
            url: url.clone(),
            status: TransferStatus::Paused,
            path: None,
            bytes: None,
            error: None,
            resumable: Some(resumable),
        }
    }
}

#[derive(Debug, Serialize)]
struct GetSummary {
    transfers: Vec<TransferReport>,
}

impl GetSummary {
    fn failures(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| matches!(t.status, TransferStatus::Failed))
            .count()
    }
}

impl fmt::Display for GetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.transfers {
            match report.status {
                TransferStatus::Completed => {
                    write!(f, "{} {}", style("✓").green().bold(), report.url)?;
                    if let Some(path) = &report.path {
                        write!(f, " → {}", style(path.display()).cyan())?;
                    }
                    if let Some(bytes) = report.bytes {
                        write!(f, " ({})", format_bytes(bytes))?;
                    }
                }
                TransferStatus::Failed => {
                    write!(
                        f,
                        "{} {}: {}",
                        style("✗").red().bold(),
                        report.url,
                        report.error.as_deref().unwrap_or("Unknown error")
                    )?;
                }
                TransferStatus::Paused => {
                    write!(f, "{} {} paused", style("⏸").yellow(), report.url)?;
                    if report.resumable == Some(false) {
                        write!(f, " (server does not support resuming)")?;
                    }
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Move every pending URL the observer has an outcome for into `finished`
fn collect_finished(
    saver: &SaveToDirectory,
    pending: &mut HashSet<Url>,
    finished: &mut HashMap<Url, TransferReport>,
) {
    pending.retain(|url| match saver.take(url) {
        Some(report) => {
            finished.insert(url.clone(), report);
            false
        }
        None => true,
    });
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(
    config: ManagerConfig,
    urls: &[String],
    destination: PathBuf,
    format: OutputFormat,
) -> Result<()> {
    let mut targets = Vec::new();
    for raw in urls {
        let url = grabber_core::parse_url(raw)?;
        if !targets.contains(&url) {
            targets.push(url);
        }
    }

    tokio::fs::create_dir_all(&destination)
        .await
        .with_context(|| format!("Cannot create {}", destination.display()))?;

    let manager = DownloadManager::new(config).await?;
    let saver = Arc::new(SaveToDirectory::new(destination));
    let observer: Arc<dyn DownloadObserver> = saver.clone();
    manager.set_observer(&observer);

    // Subscribe before starting so no event is missed
    let mut events = manager.subscribe();
    let progress = matches!(format, OutputFormat::Human).then(DownloadProgress::new);

    for url in &targets {
        if let Some(progress) = &progress {
            progress.add_download(url);
        }
        manager.start_download(url);
    }

    let mut pending: HashSet<Url> = targets.iter().cloned().collect();
    let mut finished: HashMap<Url, TransferReport> = HashMap::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let interrupted = loop {
        if pending.is_empty() {
            break false;
        }

        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(progress) = &progress {
                        progress.handle_event(&event);
                    }
                    if event.is_terminal() {
                        collect_finished(&saver, &mut pending, &mut finished);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Skipped events may include terminal ones
                    tracing::debug!("Skipped {} events", skipped);
                    collect_finished(&saver, &mut pending, &mut finished);
                }
                Err(RecvError::Closed) => break false,
            },
            _ = &mut ctrl_c => break true,
        }
    };

    if interrupted {
        let stopping: Vec<Url> = pending.iter().cloned().collect();
        for url in stopping {
            if let PauseOutcome::Paused { resumable } = manager.pause_download(&url).await {
                pending.remove(&url);
                finished.insert(url.clone(), TransferReport::paused(&url, resumable));
            }
        }

        // The rest finished while being stopped; wait briefly for their outcome
        let deadline = tokio::time::sleep(Duration::from_secs(2));
        tokio::pin!(deadline);
        collect_finished(&saver, &mut pending, &mut finished);
        while !pending.is_empty() {
            tokio::select! {
                _ = events.recv() => collect_finished(&saver, &mut pending, &mut finished),
                _ = &mut deadline => break,
            }
        }
    }

    if let Some(progress) = &progress {
        progress.clear();
    }

    let summary = GetSummary {
        transfers: targets
            .iter()
            .filter_map(|url| finished.remove(url))
            .collect(),
    };
    print_output(&summary, format)?;

    match summary.failures() {
        0 => Ok(()),
        n => Err(anyhow!("{} download(s) failed", n)),
    }
}

// ============================================================================
// Size Command
// ============================================================================

#[derive(Debug, Serialize)]
struct SizeReport {
    url: String,
    size: Option<u64>,
}

pub async fn size(config: ManagerConfig, urls: &[String], format: OutputFormat) -> Result<()> {
    let parsed = urls
        .iter()
        .map(|raw| grabber_core::parse_url(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let manager = DownloadManager::new(config).await?;
    let sizes = futures::future::join_all(parsed.iter().map(|url| manager.fetch_size(url))).await;

    let reports: Vec<SizeReport> = parsed
        .iter()
        .zip(sizes)
        .map(|(url, size)| SizeReport {
            url: url.to_string(),
            size,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct SizeRow {
                url: String,
                size: String,
            }

            let rows: Vec<SizeRow> = reports
                .iter()
                .map(|r| SizeRow {
                    url: r.url.clone(),
                    size: r.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for report in &reports {
                match report.size {
                    Some(size) => println!("{}  {}", style(format_bytes(size)).bold(), report.url),
                    None => println!("{}  {}", style("unknown").dim(), report.url),
                }
            }
        }
    }

    Ok(())
}
