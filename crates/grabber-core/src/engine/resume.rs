//! Resumption tokens
//!
//! A token is produced when a transfer is paused after it has received data
//! from a server that accepts byte ranges. It points at the partial file and
//! records the validators needed to ask the server for the rest.

use crate::error::DownloadError;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Entity validators captured from a response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        Self {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        }
    }

    /// Value for an `If-Range` header.
    ///
    /// Weak entity tags are not allowed in `If-Range`, so those fall back to
    /// `Last-Modified`.
    pub fn if_range(&self) -> Option<&str> {
        match self.etag.as_deref() {
            Some(etag) if !etag.starts_with("W/") => Some(etag),
            _ => self.last_modified.as_deref(),
        }
    }
}

/// Opaque state letting a paused transfer continue where it stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    url: Url,
    partial_path: PathBuf,
    bytes_received: u64,
    total: Option<u64>,
    validators: Validators,
    created_at: DateTime<Utc>,
}

impl ResumeToken {
    pub(crate) fn new(
        url: Url,
        partial_path: PathBuf,
        bytes_received: u64,
        total: Option<u64>,
        validators: Validators,
    ) -> Self {
        Self {
            url,
            partial_path,
            bytes_received,
            total,
            validators,
            created_at: Utc::now(),
        }
    }

    /// Encode the token as an opaque byte blob
    pub fn to_bytes(&self) -> Result<Vec<u8>, DownloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a token previously produced by [`ResumeToken::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DownloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Total size announced by the server, if any
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Offset the partial file can be continued from.
    ///
    /// Returns `None` when the file is gone or its length no longer matches
    /// what the token recorded; the transfer must then start over.
    pub(crate) async fn verified_offset(&self) -> Option<u64> {
        match tokio::fs::metadata(&self.partial_path).await {
            Ok(meta) if meta.len() == self.bytes_received => Some(self.bytes_received),
            Ok(meta) => {
                debug!(
                    "Partial file {} has {} bytes, token expected {}",
                    self.partial_path.display(),
                    meta.len(),
                    self.bytes_received
                );
                None
            }
            Err(e) => {
                debug!("Partial file {} unusable: {}", self.partial_path.display(), e);
                None
            }
        }
    }

    /// Remove the partial file this token points at
    pub(crate) async fn discard(&self) {
        remove_partial(&self.partial_path).await;
    }
}

/// Delete a partial file, ignoring files that are already gone
pub(crate) async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}
