//! Transfer worker - streams one download into a partial file
//!
//! Each worker owns its partial file and runs in its own task. It races the
//! network against the control channel, so a pause or cancel takes effect
//! without waiting for the server to send the next chunk.

use crate::engine::host_limiter::HostLimiter;
use crate::engine::notifier::Notifier;
use crate::engine::resume::{remove_partial, ResumeToken, Validators};
use crate::error::DownloadError;
use futures::StreamExt;
use grabber_types::Progress;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_RANGE, IF_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info};
use url::Url;

/// Instruction sent to a running worker
#[derive(Debug)]
pub(crate) enum Control {
    /// Stop and answer with a resumption token, if one can be produced
    Pause(oneshot::Sender<Option<ResumeToken>>),
    /// Stop and throw the partial data away
    Cancel,
}

/// How a transfer ended
#[derive(Debug)]
pub(crate) enum TransferOutcome {
    Completed { path: PathBuf, bytes: u64 },
    /// The token, if any, was already handed to the pauser
    Paused,
    Cancelled,
    Failed(DownloadError),
}

/// What the worker learned from the response headers
struct ResponseInfo {
    /// Byte offset the body starts at within the file
    offset: u64,
    total: Option<u64>,
    accepts_ranges: bool,
    validators: Validators,
}

/// First byte of a `206` body, from `Content-Range: bytes <start>-<end>/<total>`
fn content_range_start(headers: &HeaderMap) -> Result<u64, DownloadError> {
    let invalid = |reason: &str| DownloadError::ServerError {
        status: StatusCode::PARTIAL_CONTENT.as_u16(),
        message: format!("Invalid Content-Range header: {}", reason),
    };

    let value = headers
        .get(CONTENT_RANGE)
        .ok_or_else(|| invalid("missing"))?
        .to_str()
        .map_err(|_| invalid("not valid utf-8"))?;
    let (unit, range) = value.trim().split_once(' ').ok_or_else(|| invalid(value))?;
    if unit != "bytes" {
        return Err(invalid(value));
    }
    let (start, _) = range.split_once('-').ok_or_else(|| invalid(value))?;
    start.trim().parse().map_err(|_| invalid(value))
}

/// A worker that downloads one URL to a partial file
pub(crate) struct TransferWorker {
    url: Url,
    partial_path: PathBuf,
    resume: Option<ResumeToken>,
    client: Client,
    limiter: HostLimiter,
    notifier: Arc<Notifier>,
    control: oneshot::Receiver<Control>,
}

impl TransferWorker {
    pub(crate) fn new(
        url: Url,
        partial_path: PathBuf,
        resume: Option<ResumeToken>,
        client: Client,
        limiter: HostLimiter,
        notifier: Arc<Notifier>,
        control: oneshot::Receiver<Control>,
    ) -> Self {
        Self {
            url,
            partial_path,
            resume,
            client,
            limiter,
            notifier,
            control,
        }
    }

    /// Run the transfer to its end
    pub(crate) async fn run(mut self) -> TransferOutcome {
        // Wait for a connection slot, still honouring pause/cancel
        let permit = tokio::select! {
            permit = self.limiter.acquire(&self.url) => permit,
            control = &mut self.control => return self.stop_before_streaming(control).await,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(e) => return self.fail(e).await,
        };

        // Continue from the partial file only if it still matches the token
        let resume_from = match &self.resume {
            Some(token) => token.verified_offset().await,
            None => None,
        };

        let request = self.build_request(resume_from);
        let response = tokio::select! {
            response = request.send() => response,
            control = &mut self.control => return self.stop_before_streaming(control).await,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return self.fail(e.into()).await,
        };

        let info = match self.inspect_response(&response, resume_from) {
            Ok(info) => info,
            Err(e) => return self.fail(e).await,
        };

        let file = match self.open_partial(info.offset).await {
            Ok(file) => file,
            Err(e) => return self.fail(e.into()).await,
        };

        self.stream(response, file, info).await
    }

    fn build_request(&self, resume_from: Option<u64>) -> reqwest::RequestBuilder {
        let request = self.client.get(self.url.as_str());
        match (resume_from, &self.resume) {
            (Some(offset), Some(token)) if offset > 0 => {
                info!("Resuming {} from byte {}", self.url, offset);
                let request = request.header(RANGE, format!("bytes={}-", offset));
                match token.validators().if_range() {
                    Some(validator) => request.header(IF_RANGE, validator),
                    None => request,
                }
            }
            _ => {
                info!("Starting fresh download of {}", self.url);
                request
            }
        }
    }

    /// Validate the status and work out where the body belongs
    fn inspect_response(
        &self,
        response: &Response,
        resume_from: Option<u64>,
    ) -> Result<ResponseInfo, DownloadError> {
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::ServerError {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string(),
            });
        }

        let headers = response.headers();
        let mut validators = Validators::from_headers(headers);
        let accepts_ranges = status == StatusCode::PARTIAL_CONTENT
            || headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);

        let requested = resume_from.unwrap_or(0);
        let offset = if status == StatusCode::PARTIAL_CONTENT {
            // The server may answer with another range than the one asked for
            match content_range_start(headers)? {
                start if start == requested => start,
                0 => {
                    info!("Server restarted {} from byte zero", self.url);
                    0
                }
                start => {
                    return Err(DownloadError::ServerError {
                        status: status.as_u16(),
                        message: format!(
                            "Content-Range starts at byte {} but {} was requested",
                            start, requested
                        ),
                    })
                }
            }
        } else {
            if requested > 0 {
                // Range ignored or the entity changed: the whole body follows
                info!("Server sent the full body for {}, restarting from zero", self.url);
            }
            0
        };

        // 206 responses may omit validators; keep the ones we resumed with
        if offset > 0 && validators == Validators::default() {
            if let Some(token) = &self.resume {
                validators = token.validators().clone();
            }
        }

        // Content-Range "bytes 100-999/1000" carries the full size
        let total_from_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|range| range.rsplit('/').next())
            .filter(|total| *total != "*")
            .and_then(|total| total.parse::<u64>().ok());

        let total = total_from_range.or_else(|| {
            response
                .content_length()
                .map(|len| offset.saturating_add(len))
        });

        debug!(
            "Response for {}: status={}, offset={}, total={:?}, accepts_ranges={}",
            self.url, status, offset, total, accepts_ranges
        );

        Ok(ResponseInfo {
            offset,
            total,
            accepts_ranges,
            validators,
        })
    }

    /// Open the partial file, appending when continuing from `offset`
    async fn open_partial(&self, offset: u64) -> std::io::Result<File> {
        if let Some(parent) = self.partial_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if offset > 0 {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options.open(&self.partial_path).await
    }

    /// Stream the body into the file until it ends or we are told to stop
    async fn stream(mut self, response: Response, mut file: File, info: ResponseInfo) -> TransferOutcome {
        let mut stream = response.bytes_stream();
        let mut written = info.offset;

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if let Err(e) = file.write_all(&chunk).await {
                            return self.fail(e.into()).await;
                        }
                        written += chunk.len() as u64;
                        let progress = Progress::from_bytes(written, info.total);
                        self.notifier.progress(&self.url, progress.as_f32());
                    }
                    Some(Err(e)) => return self.fail(e.into()).await,
                    None => break,
                },
                control = &mut self.control => {
                    if let Err(e) = file.flush().await {
                        return self.fail(e.into()).await;
                    }
                    drop(file);
                    return self.stop_while_streaming(control, written, &info).await;
                }
            }
        }

        if let Err(e) = file.flush().await {
            return self.fail(e.into()).await;
        }
        if let Err(e) = file.sync_all().await {
            return self.fail(e.into()).await;
        }

        info!("Download of {} complete ({} bytes)", self.url, written);
        TransferOutcome::Completed {
            path: self.partial_path,
            bytes: written,
        }
    }

    /// Handle pause/cancel arriving before any body byte was written.
    ///
    /// A resumed transfer has not touched its partial file yet, so its token
    /// is still good and is handed back as-is.
    async fn stop_before_streaming(
        self,
        control: Result<Control, oneshot::error::RecvError>,
    ) -> TransferOutcome {
        match control {
            Ok(Control::Pause(reply)) => {
                debug!("Paused {} before any data arrived", self.url);
                let token = self.resume;
                if let Err(Some(token)) = reply.send(token) {
                    token.discard().await;
                }
                TransferOutcome::Paused
            }
            _ => {
                remove_partial(&self.partial_path).await;
                TransferOutcome::Cancelled
            }
        }
    }

    async fn stop_while_streaming(
        self,
        control: Result<Control, oneshot::error::RecvError>,
        written: u64,
        info: &ResponseInfo,
    ) -> TransferOutcome {
        match control {
            Ok(Control::Pause(reply)) => {
                let token = if written > 0 && info.accepts_ranges {
                    Some(ResumeToken::new(
                        self.url.clone(),
                        self.partial_path.clone(),
                        written,
                        info.total,
                        info.validators.clone(),
                    ))
                } else {
                    debug!("{} cannot be resumed, dropping partial data", self.url);
                    remove_partial(&self.partial_path).await;
                    None
                };
                info!("Paused {} at {} bytes (resumable: {})", self.url, written, token.is_some());
                // Nobody waiting for the token means nobody can ever use it
                if let Err(Some(token)) = reply.send(token) {
                    token.discard().await;
                }
                TransferOutcome::Paused
            }
            // A dropped control sender means the manager is gone
            _ => {
                info!("Cancelled {} at {} bytes", self.url, written);
                remove_partial(&self.partial_path).await;
                TransferOutcome::Cancelled
            }
        }
    }

    async fn fail(self, error: DownloadError) -> TransferOutcome {
        remove_partial(&self.partial_path).await;
        TransferOutcome::Failed(error)
    }
}
