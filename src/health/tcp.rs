//! TCP readiness probe.

use super::{HealthError, Probe};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Ready when a TCP connection can be established.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let address = self.address();
        match timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => {
                debug!(%address, "tcp probe connected");
                Ok(())
            }
            Ok(Err(err)) => Err(HealthError::Connect(err)),
            Err(_) => Err(HealthError::Timeout(self.timeout)),
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address())
    }
}
