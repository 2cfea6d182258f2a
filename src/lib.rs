//! # Veil Tunnel
//!
//! Disguised registration and datagram relay for a VPN tunnel in networks
//! that block recognizable VPN handshakes.
//!
//! ## Features
//!
//! - **Disguised registration**: the tunnel is opened with one HTTP/1.1
//!   request that looks like a well-known application's traffic
//! - **TLS fingerprint mimicry** matching each disguise
//! - **Adaptive fallback** through the disguise catalog, remembering what
//!   worked per server
//! - **Datagram relay** between the local tunnel engine and the stream
//! - **Stall detection** and automatic reconnection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Connection Controller                  │
//! │        (state machine, events, reconnection)         │
//! ├──────────────────────────┬──────────────────────────┤
//! │      Datagram Proxy      │      Health Monitor       │
//! │  (UDP <-> framed stream) │   (downlink stall check)  │
//! ├──────────────────────────┴──────────────────────────┤
//! │        Fallback Driver  +  Selection Ledger          │
//! │      (candidate order, persisted preferences)        │
//! ├─────────────────────────────────────────────────────┤
//! │           Tunnel Establisher  +  Disguises           │
//! │     (registration request, response validation)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │          (TLS with fingerprint mimicry, TCP)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod disguise;
pub mod fallback;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod probe;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use controller::{ConnectionController, ConnectionState, FailureReason, TunnelEvent};
pub use tunnel::{Destination, TunnelSession};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disguise error: {0}")]
    Disguise(#[from] disguise::DisguiseError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::LedgerError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error(transparent)]
    AllAttemptsFailed(#[from] fallback::AllAttemptsFailed),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Already connected")]
    AlreadyConnected,
}
