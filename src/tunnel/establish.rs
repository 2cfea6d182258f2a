//! Registration establisher over any dialer

use super::{register, Destination, Establisher, RegistrationRequest, TunnelError, TunnelSession};
use crate::disguise::DisguiseProfile;
use crate::transport::{Dialer, TcpDialer, TlsDialer};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Budget for closing a stream after a failed attempt
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Production establisher: TLS with fingerprint mimicry
pub type TlsEstablisher = RegistrationEstablisher<TlsDialer>;

/// Plain TCP establisher (testing and internal networks)
pub type TcpEstablisher = RegistrationEstablisher<TcpDialer>;

/// Dials the registration port and performs the disguised exchange
pub struct RegistrationEstablisher<D> {
    dialer: D,
    tunnel_type: String,
    read_timeout: Duration,
}

impl<D: Dialer> RegistrationEstablisher<D> {
    /// Create an establisher
    pub fn new(dialer: D, tunnel_type: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            dialer,
            tunnel_type: tunnel_type.into(),
            read_timeout,
        }
    }

    /// Underlying dialer
    pub fn dialer(&self) -> &D {
        &self.dialer
    }
}

#[async_trait]
impl<D: Dialer> Establisher for RegistrationEstablisher<D> {
    async fn establish(
        &self,
        destination: &Destination,
        disguise: &'static DisguiseProfile,
        auth_token: &str,
    ) -> Result<TunnelSession, TunnelError> {
        let request = RegistrationRequest::new(destination, disguise, auth_token, &self.tunnel_type);
        request.validate()?;

        debug!("Dialing {} as {}", destination, disguise.id);

        let mut stream = self
            .dialer
            .dial(
                &destination.host,
                destination.registration_port,
                disguise.tls_profile,
            )
            .await?;

        match register(&mut stream, &request.encode(), self.read_timeout).await {
            Ok(_) => {
                info!("Registered with {} using {}", destination, disguise);
                Ok(TunnelSession::new(disguise, Box::new(stream)))
            }
            Err(e) => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await;
                Err(e)
            }
        }
    }
}
