//! Transport layer
//!
//! Dialers that produce the byte stream the registration exchange runs on:
//! - TLS with per-disguise fingerprint mimicry (production)
//! - Raw TCP (testing and internal networks)

mod fingerprint;
mod tcp;
mod tls;

pub use fingerprint::{build_tls_config, BrowserProfile, CertificateVerification, FingerprintError};
pub use tcp::TcpDialer;
pub use tls::TlsDialer;

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Timeout")]
    Timeout,
}

/// A bidirectional byte stream owned by a tunnel session
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Type-erased stream handed from the establisher to the proxy
pub type BoxedStream = Box<dyn ByteStream>;

/// Opens the stream a registration request is sent on
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Stream type produced by this dialer
    type Stream: ByteStream + 'static;

    /// Connect to `host:port` presenting the given client fingerprint
    async fn dial(
        &self,
        host: &str,
        port: u16,
        profile: BrowserProfile,
    ) -> Result<Self::Stream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Budget for the TCP connect and, separately, the TLS handshake
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}
