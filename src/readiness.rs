//! # Readiness Monitor - Health Polling With Concurrent Log Draining
//!
//! After launch, a NIM container spends anywhere from seconds to many
//! minutes downloading weights and warming up. The monitor polls the
//! health endpoint on a fixed interval and, on every iteration, drains
//! whatever the container process has written so far.
//!
//! ## Poll Loop
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ drain stdout/stderr (non-blocking) ──► LineSink          │
//! │ GET <health_url>  ── 200 ──► ready, return elapsed       │
//! │        │ error / non-200                                 │
//! │        ▼                                                 │
//! │ process exited? ── yes ──► ContainerExited               │
//! │ elapsed ≥ timeout? ── yes ──► ReadinessTimeout           │
//! │ sleep(min(interval, remaining)) ─────────────────────────┘
//! ```
//!
//! Network errors and non-200 responses mean "not yet ready" and are never
//! escalated. The timeout is an elapsed-time cutoff: the container is not
//! killed when it fires.

use crate::constants::{DEFAULT_POLL_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use crate::error::{Error, Result};
pub use crate::exec::OutputStream;
use crate::exec::ProcessHandle;
use crate::models::ModelIdentity;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

// ============================================================================
// Log Sink
// ============================================================================

/// Receives output lines from container and pull processes.
pub trait LineSink: Send + Sync {
    /// Handles one line.
    fn line(&self, model: ModelIdentity, stream: OutputStream, line: &str);
}

/// [`LineSink`] that emits each line as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&self, model: ModelIdentity, stream: OutputStream, line: &str) {
        info!(model = %model, stream = %stream, "{}", line);
    }
}

// ============================================================================
// Health Probe
// ============================================================================

/// Checks whether a health URL reports ready.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true only for an HTTP 200 response.
    async fn is_ready(&self, url: &str) -> bool;
}

/// [`HealthProbe`] issuing real HTTP GET requests.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Creates a probe with the default per-request timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    /// Creates a probe with a custom per-request timeout.
    pub fn with_timeout(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_ready(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!("Health probe {} failed: {}", url, e);
                false
            }
        }
    }
}

// ============================================================================
// ReadinessMonitor
// ============================================================================

/// Polls a health endpoint while draining a process's output.
pub struct ReadinessMonitor<'a> {
    probe: &'a dyn HealthProbe,
    sink: &'a dyn LineSink,
    interval: Duration,
}

impl<'a> ReadinessMonitor<'a> {
    /// Creates a monitor with the default poll interval.
    pub fn new(probe: &'a dyn HealthProbe, sink: &'a dyn LineSink) -> Self {
        Self {
            probe,
            sink,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Waits until `health_url` answers 200 and returns the elapsed time.
    ///
    /// # Errors
    ///
    /// - [`Error::ContainerExited`] if the process exits first
    /// - [`Error::ReadinessTimeout`] once elapsed time reaches `timeout`;
    ///   neither the sleep nor a slow probe is allowed to run past it
    pub async fn wait_ready(
        &self,
        model: ModelIdentity,
        process: &mut ProcessHandle,
        health_url: &str,
        timeout: Duration,
    ) -> Result<Duration> {
        debug!("Waiting for {} at {} (timeout {:?})", model, health_url, timeout);
        let start = Instant::now();

        loop {
            self.drain(model, process);

            // A hung endpoint must not carry the loop past the deadline.
            let remaining = timeout.saturating_sub(start.elapsed());
            let ready = tokio::time::timeout(remaining, self.probe.is_ready(health_url))
                .await
                .unwrap_or(false);

            if ready {
                let elapsed = start.elapsed();
                info!("{} ready after {:.1}s", model, elapsed.as_secs_f64());
                return Ok(elapsed);
            }

            if let Some(exit_code) = process.try_wait()? {
                // Flush whatever the process wrote before dying.
                self.drain(model, process);
                return Err(Error::ContainerExited {
                    model: model.to_string(),
                    exit_code,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::ReadinessTimeout {
                    model: model.to_string(),
                    elapsed,
                    timeout,
                });
            }

            tokio::time::sleep(self.interval.min(timeout - elapsed)).await;
        }
    }

    /// Forwards every buffered line to the sink.
    fn drain(&self, model: ModelIdentity, process: &mut ProcessHandle) {
        while let Some(line) = process.try_stdout_line() {
            self.sink.line(model, OutputStream::Stdout, &line);
        }
        while let Some(line) = process.try_stderr_line() {
            self.sink.line(model, OutputStream::Stderr, &line);
        }
    }
}
