//! Raw TCP dialer (for testing and internal networks)

use super::{BrowserProfile, Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Raw TCP dialer; the fingerprint profile is ignored
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(
        &self,
        host: &str,
        port: u16,
        _profile: BrowserProfile,
    ) -> Result<Self::Stream, TransportError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}
