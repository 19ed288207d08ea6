use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::errors::{LauncherError, Result};

/// Cooperative control for an in-flight transfer. Paused is sustained, not
/// terminal; the transfer holds its connection and waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferControl {
    Running,
    Paused,
    Cancelled,
}

#[derive(Clone, Copy, Debug)]
pub struct TransferUpdate {
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
}

pub type TransferObserver = dyn Fn(TransferUpdate) + Send + Sync;

/// Byte-transfer capability the coordinator depends on. The default
/// implementation is HTTP, but tests and embedders can substitute their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        headers: &[(String, String)],
        control: watch::Receiver<TransferControl>,
        on_progress: &TransferObserver,
    ) -> Result<()>;
}

/// Blocks while paused; `Cancelled` surfaces as an error so the caller can
/// unwind without touching the destination file.
pub async fn wait_for_running(control: &mut watch::Receiver<TransferControl>) -> Result<()> {
    loop {
        let state = *control.borrow();
        match state {
            TransferControl::Running => return Ok(()),
            TransferControl::Paused => {
                control
                    .changed()
                    .await
                    .map_err(|_| LauncherError::Config("transfer control closed".to_string()))?;
            }
            TransferControl::Cancelled => return Err(LauncherError::Cancelled),
        }
    }
}

enum AttemptError {
    Retryable(LauncherError),
    Fatal(LauncherError),
}

pub struct HttpTransport {
    client: reqwest::Client,
    max_attempts: usize,
    retry_wait: Duration,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let request_timeout_seconds = env_u64("LAUNCHER_HTTP_TIMEOUT_SECONDS")
            .unwrap_or(600)
            .clamp(60, 7200);
        let connect_timeout_seconds = env_u64("LAUNCHER_HTTP_CONNECT_TIMEOUT_SECONDS")
            .unwrap_or(20)
            .clamp(5, 120);
        let max_attempts = env_u64("LAUNCHER_HTTP_MAX_ATTEMPTS")
            .unwrap_or(4)
            .clamp(1, 8) as usize;
        let retry_wait_ms = env_u64("LAUNCHER_HTTP_RETRY_WAIT_MS")
            .unwrap_or(900)
            .clamp(0, 30_000);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_seconds))
            .connect_timeout(Duration::from_secs(connect_timeout_seconds))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            max_attempts,
            retry_wait: Duration::from_millis(retry_wait_ms),
        })
    }

    async fn attempt_download(
        &self,
        url: &str,
        destination: &Path,
        headers: &[(String, String)],
        control: &mut watch::Receiver<TransferControl>,
        on_progress: &TransferObserver,
    ) -> std::result::Result<(), AttemptError> {
        // A partially written destination is picked up where the previous
        // attempt stopped; servers without range support answer 200 and the
        // file starts over.
        let existing = tokio::fs::metadata(destination)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if existing > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", existing));
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            let body = response.text().await.unwrap_or_default();
            let snippet = trim_text_snippet(&body);
            let failure = if snippet.is_empty() {
                LauncherError::Http(format!("HTTP {}", status))
            } else {
                LauncherError::Http(format!("HTTP {} ({})", status, snippet))
            };
            return Err(if retryable {
                AttemptError::Retryable(failure)
            } else {
                AttemptError::Fatal(failure)
            });
        }

        let resuming = status == reqwest::StatusCode::PARTIAL_CONTENT && existing > 0;
        let body_length = response.content_length().unwrap_or(0);
        let (mut transferred, total_bytes) = if resuming {
            (existing, existing + body_length)
        } else {
            (0, body_length)
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(destination)
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;

        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let session_start = transferred;

        loop {
            tokio::select! {
                changed = control.changed() => {
                    changed.map_err(|_| AttemptError::Fatal(
                        LauncherError::Config("transfer control closed".to_string()),
                    ))?;
                    let state = *control.borrow();
                    match state {
                        TransferControl::Running => {}
                        TransferControl::Paused => {
                            wait_for_running(control)
                                .await
                                .map_err(AttemptError::Fatal)?;
                        }
                        TransferControl::Cancelled => {
                            return Err(AttemptError::Fatal(LauncherError::Cancelled));
                        }
                    }
                }
                next = stream.next() => {
                    let Some(next) = next else { break; };
                    let bytes = next.map_err(classify_request_error)?;
                    file.write_all(&bytes)
                        .await
                        .map_err(|err| AttemptError::Fatal(err.into()))?;
                    transferred += bytes.len() as u64;

                    let elapsed = started.elapsed().as_secs_f64();
                    let bytes_per_second = if elapsed > 0.0 {
                        ((transferred - session_start) as f64 / elapsed) as u64
                    } else {
                        0
                    };
                    on_progress(TransferUpdate {
                        transferred_bytes: transferred,
                        total_bytes: total_bytes.max(transferred),
                        bytes_per_second,
                    });
                }
            }
        }

        file.flush()
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        headers: &[(String, String)],
        mut control: watch::Receiver<TransferControl>,
        on_progress: &TransferObserver,
    ) -> Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_failure: Option<LauncherError> = None;
        for attempt in 1..=self.max_attempts {
            wait_for_running(&mut control).await?;
            match self
                .attempt_download(url, destination, headers, &mut control, on_progress)
                .await
            {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retryable(err)) => {
                    if attempt < self.max_attempts {
                        tracing::warn!(
                            "transfer attempt {}/{} failed for {}: {}",
                            attempt,
                            self.max_attempts,
                            url,
                            err
                        );
                        sleep(self.retry_wait * attempt as u32).await;
                    }
                    last_failure = Some(err);
                }
            }
        }

        Err(last_failure
            .unwrap_or_else(|| LauncherError::Http("all transfer attempts failed".to_string())))
    }
}

fn classify_request_error(err: reqwest::Error) -> AttemptError {
    if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() {
        AttemptError::Retryable(err.into())
    } else {
        AttemptError::Fatal(err.into())
    }
}

fn trim_text_snippet(value: &str) -> String {
    value.chars().take(200).collect::<String>().trim().to_string()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}
