//! HTTP readiness probe.

use super::{HealthError, Probe};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// GETs a url and checks the status code. `expect_status` of `None` accepts any 2xx.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    expect_status: Option<u16>,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: String, expect_status: Option<u16>, timeout: Duration) -> Self {
        Self {
            url,
            expect_status,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn accepts(&self, status: u16) -> bool {
        match self.expect_status {
            Some(expected) => status == expected,
            None => (200..=299).contains(&status),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()?;

        let response = client.get(&self.url).send().await?;
        let status = response.status().as_u16();
        debug!(url = %self.url, status, "http probe response");

        if self.accepts(status) {
            Ok(())
        } else {
            Err(HealthError::UnexpectedStatus(status))
        }
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_status(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(body.as_bytes()).await;
            }
        });
        port
    }

    #[test]
    fn status_expectations() {
        let any = HttpProbe::new("http://x".into(), None, Duration::from_secs(1));
        assert!(any.accepts(200));
        assert!(any.accepts(204));
        assert!(!any.accepts(301));
        assert!(!any.accepts(503));

        let exact = HttpProbe::new("http://x".into(), Some(204), Duration::from_secs(1));
        assert!(exact.accepts(204));
        assert!(!exact.accepts(200));
    }

    #[tokio::test]
    async fn healthy_endpoint_passes() {
        let port = serve_status("200 OK").await;
        let probe = HttpProbe::new(
            format!("http://127.0.0.1:{port}/health"),
            None,
            Duration::from_secs(2),
        );
        probe.check().await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_endpoint_reports_status() {
        let port = serve_status("503 Service Unavailable").await;
        let probe = HttpProbe::new(
            format!("http://127.0.0.1:{port}/health"),
            None,
            Duration::from_secs(2),
        );
        let err = probe.check().await.unwrap_err();
        assert!(matches!(err, HealthError::UnexpectedStatus(503)));
    }
}
