//! Readiness probes.
//!
//! A step's readiness window closes when its fixed delay has elapsed and
//! every probe of its instances reports ready. Probes are polled until a
//! bounded timeout; roles without a probe rely on the delay alone.

use async_trait::async_trait;
use procmesh_core::{OrchestratorError, ProbeSpec, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A single readiness check, polled repeatedly.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// One attempt; `true` once the instance is ready.
    async fn is_ready(&self) -> bool;
}

/// A TCP connect succeeds.
pub struct TcpCheck {
    address: String,
}

impl TcpCheck {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for TcpCheck {
    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }

    async fn is_ready(&self) -> bool {
        tokio::net::TcpStream::connect(&self.address).await.is_ok()
    }
}

/// An HTTP GET returns a 2xx status.
pub struct HttpCheck {
    url: String,
    client: reqwest::Client,
}

impl HttpCheck {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| OrchestratorError::InvalidConfig(format!("http probe client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ReadinessCheck for HttpCheck {
    fn describe(&self) -> String {
        format!("http {}", self.url)
    }

    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::trace!(url = %self.url, error = %e, "http probe attempt failed");
                false
            }
        }
    }
}

/// A line of a log file matches a regex.
///
/// Only bytes past `offset` are scanned, so lines appended by an earlier
/// run of the same instance never count.
pub struct LogLineCheck {
    path: PathBuf,
    offset: u64,
    pattern: Regex,
}

impl LogLineCheck {
    pub fn new(path: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            OrchestratorError::InvalidConfig(format!("log_line probe pattern: {}", e))
        })?;
        Ok(Self {
            path: path.into(),
            offset: 0,
            pattern,
        })
    }

    /// Ignore everything before byte `offset` of the log.
    pub fn after(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

#[async_trait]
impl ReadinessCheck for LogLineCheck {
    fn describe(&self) -> String {
        format!("log line /{}/ in {}", self.pattern, self.path.display())
    }

    async fn is_ready(&self) -> bool {
        let Ok(bytes) = tokio::fs::read(&self.path).await else {
            return false;
        };
        // a log shorter than the offset was truncated; scan all of it
        let start = usize::try_from(self.offset)
            .ok()
            .filter(|&o| o <= bytes.len())
            .unwrap_or(0);
        String::from_utf8_lossy(&bytes[start..])
            .lines()
            .any(|l| self.pattern.is_match(l))
    }
}

/// Build the check for a rendered probe. `stdout_log` is the instance's
/// captured stdout with the offset its output starts at, required by
/// `log_line` probes.
pub fn check_for(
    spec: &ProbeSpec,
    stdout_log: Option<(&Path, u64)>,
    request_timeout: Duration,
) -> Result<Box<dyn ReadinessCheck>> {
    match spec {
        ProbeSpec::Tcp { address } => Ok(Box::new(TcpCheck::new(address.clone()))),
        ProbeSpec::Http { url } => Ok(Box::new(HttpCheck::new(url.clone(), request_timeout)?)),
        ProbeSpec::LogLine { pattern } => {
            let (path, offset) = stdout_log.ok_or_else(|| {
                OrchestratorError::InvalidConfig(
                    "log_line probe requires captured stdout (settings.log_dir)".to_string(),
                )
            })?;
            Ok(Box::new(LogLineCheck::new(path, pattern)?.after(offset)))
        }
    }
}

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// Poll `check` every `interval` until it succeeds, `timeout` elapses, or
/// `cancel` fires. Each attempt is bounded by the remaining time. A timeout
/// too large to represent as a deadline is treated as unbounded.
pub async fn wait_until_ready(
    check: &dyn ReadinessCheck,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let deadline = deadline_from(Instant::now(), timeout);
    loop {
        if cancel.is_cancelled() {
            return ProbeOutcome::Cancelled;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout(remaining, check.is_ready());
        tokio::select! {
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            res = attempt => {
                if matches!(res, Ok(true)) {
                    return ProbeOutcome::Ready;
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(probe = %check.describe(), "readiness probe timed out");
            return ProbeOutcome::TimedOut;
        }

        tokio::select! {
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            _ = tokio::time::sleep(interval.min(remaining)) => {}
        }
    }
}

/// `start + after`, saturating at a far-future instant instead of
/// overflowing.
pub(crate) fn deadline_from(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

// roughly 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
