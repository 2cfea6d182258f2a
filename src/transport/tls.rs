//! TLS dialer with fingerprint mimicry
//!
//! Opens a TCP connection and performs the TLS handshake using the
//! fingerprint of the disguise being attempted. Client configs are built
//! once per profile and reused across attempts.

use super::{
    build_tls_config, BrowserProfile, CertificateVerification, Dialer, TransportConfig,
    TransportError,
};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

/// TLS dialer
pub struct TlsDialer {
    config: TransportConfig,
    verification: CertificateVerification,
    /// SNI override; defaults to the destination host
    sni: Option<String>,
    configs: Mutex<HashMap<BrowserProfile, Arc<rustls::ClientConfig>>>,
}

impl TlsDialer {
    /// Create a new TLS dialer
    pub fn new(config: TransportConfig, verification: CertificateVerification) -> Self {
        Self {
            config,
            verification,
            sni: None,
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// Send this SNI instead of the destination host
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Certificate policy in effect
    pub fn verification(&self) -> CertificateVerification {
        self.verification
    }

    fn client_config(
        &self,
        profile: BrowserProfile,
    ) -> Result<Arc<rustls::ClientConfig>, TransportError> {
        let mut configs = self.configs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(config) = configs.get(&profile) {
            return Ok(config.clone());
        }

        let config = Arc::new(
            build_tls_config(profile, self.verification)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        );
        configs.insert(profile, config.clone());
        Ok(config)
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Stream = TlsStream<TcpStream>;

    async fn dial(
        &self,
        host: &str,
        port: u16,
        profile: BrowserProfile,
    ) -> Result<Self::Stream, TransportError> {
        let timeout = self.config.connect_timeout;

        let tcp_stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tcp_stream.set_nodelay(true).ok();

        let connector = TlsConnector::from(self.client_config(profile)?);

        // This is what appears in the ClientHello
        let sni = self.sni.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| TransportError::InvalidServerName(format!("{}: {}", sni, e)))?;

        let tls_stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        debug!("TLS handshake complete with {}:{} (SNI: {}, profile: {:?})", host, port, sni, profile);
        Ok(tls_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_client_config_cached() {
        let dialer = TlsDialer::new(TransportConfig::default(), CertificateVerification::WebPki);
        let a = dialer.client_config(BrowserProfile::Chrome).unwrap();
        let b = dialer.client_config(BrowserProfile::Chrome).unwrap();
        let c = dialer.client_config(BrowserProfile::Firefox).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_handshake_failure_against_plain_tcp() {
        // A peer that speaks HTTP instead of TLS
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let dialer = TlsDialer::new(
            TransportConfig {
                connect_timeout: Duration::from_secs(5),
            },
            CertificateVerification::Disabled,
        );
        let err = dialer
            .dial("127.0.0.1", addr.port(), BrowserProfile::Chrome)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)), "got {:?}", err);
    }
}
