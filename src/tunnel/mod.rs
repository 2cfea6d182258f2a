//! Tunnel layer - disguised registration
//!
//! Provides:
//! - Destination parsing
//! - Registration request encoding and response validation
//! - The establisher that turns one disguise attempt into a live session

mod destination;
mod establish;
mod request;

pub use destination::{Destination, DEFAULT_DATA_PORT, DEFAULT_REGISTRATION_PORT};
pub use establish::{RegistrationEstablisher, TcpEstablisher, TlsEstablisher};
pub use request::{
    check_auth_token, check_tunnel_type, read_response_head, register, RegistrationRequest,
    ResponseHead, MAX_HEADER_LINES, MAX_LINE_LEN,
};

use crate::disguise::DisguiseProfile;
use crate::transport::{BoxedStream, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Default tunnel type announced to the server
pub const DEFAULT_TUNNEL_TYPE: &str = "wireguard";

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Registration rejected with status {0}")]
    Rejected(u16),

    #[error("Timeout")]
    Timeout,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for TunnelError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => TunnelError::Timeout,
            other => TunnelError::HandshakeFailed(other.to_string()),
        }
    }
}

/// An established tunnel: the disguise that worked plus the open stream
///
/// Dropping the session closes the stream.
pub struct TunnelSession {
    disguise: &'static DisguiseProfile,
    stream: BoxedStream,
    established_at: DateTime<Utc>,
}

impl TunnelSession {
    /// Wrap a stream that has completed registration
    pub fn new(disguise: &'static DisguiseProfile, stream: BoxedStream) -> Self {
        Self {
            disguise,
            stream,
            established_at: Utc::now(),
        }
    }

    /// Disguise used for this session
    pub fn disguise(&self) -> &'static DisguiseProfile {
        self.disguise
    }

    /// When registration succeeded
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Hand the stream over to its consumer
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("disguise", &self.disguise.id)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

/// Performs one registration attempt with one disguise
#[async_trait]
pub trait Establisher: Send + Sync {
    /// Open a connection to `destination` and register under `disguise`
    async fn establish(
        &self,
        destination: &Destination,
        disguise: &'static DisguiseProfile,
        auth_token: &str,
    ) -> Result<TunnelSession, TunnelError>;
}
