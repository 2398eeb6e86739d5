//! Transport-level TCP probing.
//!
//! No external binaries (ping, nc) are required: a probe is a plain async
//! TCP connect bounded by a timeout, dropped as soon as it succeeds.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Tier 1 probe: can a TCP connection be made?
#[async_trait]
pub trait TcpProber: Send + Sync {
    /// Never errors; unreachable and timed out both report `false`
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Probes with real sockets
#[derive(Debug, Clone, Default)]
pub struct TokioTcpProber;

#[async_trait]
impl TcpProber for TokioTcpProber {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("TCP probe {}:{} failed: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!("TCP probe {}:{} timed out after {:?}", host, port, timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TokioTcpProber.connect("127.0.0.1", port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!TokioTcpProber.connect("127.0.0.1", port, Duration::from_secs(2)).await);
    }
}
