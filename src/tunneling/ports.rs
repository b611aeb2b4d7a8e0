use std::{net::Ipv4Addr, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;

#[cfg(test)]
use mockall::automock;

pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// tells whether a local port is already taken by someone, managed or not
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait PortProbe: Send + Sync {
    async fn is_port_in_use(&self, port: u16) -> bool;
}

/// probes `127.0.0.1` with a short connect
pub(crate) struct LoopbackProbe {
    timeout: Duration,
}
impl LoopbackProbe {
    pub fn new() -> Self {
        LoopbackProbe {
            timeout: PROBE_TIMEOUT,
        }
    }
}
#[async_trait]
impl PortProbe for LoopbackProbe {
    async fn is_port_in_use(&self, port: u16) -> bool {
        is_port_in_use(port, self.timeout).await
    }
}

/// true iff something accepts a connection on `127.0.0.1:port`; the probe
/// connection is dropped right away
pub(crate) async fn is_port_in_use(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::trace!(port, "probe refused: {}", e);
            false
        }
        Err(_) => false,
    }
}
