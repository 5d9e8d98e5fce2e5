//! Error types for Grabber core

use thiserror::Error;

/// Errors that can occur in Grabber core
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DownloadError {
    /// Check if this error came from the network or the remote server
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DownloadError::Network(_) | DownloadError::ServerError { .. }
        )
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::InvalidResumeToken(error.to_string())
    }
}
