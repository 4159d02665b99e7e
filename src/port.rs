//! Host port probing and allocation.
//!
//! Allocation is liveness-based: a port is free if nothing accepts a TCP
//! connection on it right now. Nothing is reserved, so two allocations
//! racing before either container binds could pick the same port; the
//! orchestrator avoids that by running deployments one at a time.

use crate::constants::{LOCALHOST, PORT_PROBE_TIMEOUT};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Tests whether a localhost TCP port is already bound.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Returns true if something accepts connections on `port`.
    async fn is_in_use(&self, port: u16) -> bool;
}

/// [`PortProbe`] that attempts a real TCP connection.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    connect_timeout: Duration,
}

impl TcpPortProbe {
    /// Creates a probe with the default connect timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: PORT_PROBE_TIMEOUT,
        }
    }

    /// Creates a probe with a custom connect timeout.
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        // The stream is dropped at the end of the match, closing the socket.
        match timeout(self.connect_timeout, TcpStream::connect((LOCALHOST, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

/// Finds the first port in `base..=max` that is not in use.
///
/// # Errors
///
/// [`Error::PortExhausted`] if every port in the range is taken.
pub async fn allocate_port(probe: &dyn PortProbe, base: u16, max: u16) -> Result<u16> {
    for port in base..=max {
        if probe.is_in_use(port).await {
            debug!("Port {} in use, trying next", port);
            continue;
        }
        return Ok(port);
    }
    Err(Error::PortExhausted { base })
}
