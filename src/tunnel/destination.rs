//! Tunnel destination parsing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default TLS port of the registration endpoint
pub const DEFAULT_REGISTRATION_PORT: u16 = 8443;

/// Default data port of the tunnel engine
pub const DEFAULT_DATA_PORT: u16 = 51820;

/// Where the tunnel lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Host name or IP literal (no brackets)
    pub host: String,
    /// TLS port used for the disguised registration
    pub registration_port: u16,
    /// Port of the tunnel engine's own data channel
    pub data_port: u16,
}

impl Destination {
    /// Parse a caller-supplied endpoint string
    ///
    /// Accepted forms: `host`, `host:port`, `[v6]:port`, bare IPv6, any of
    /// them optionally prefixed with `https://` and followed by a path.
    /// The port, when present, is the data port.
    pub fn parse(endpoint: &str, registration_port: u16) -> Result<Self, crate::Error> {
        let invalid = |why: &str| crate::Error::Config(format!("Invalid endpoint '{}': {}", endpoint, why));

        let mut rest = endpoint.trim();
        for scheme in ["https://", "http://"] {
            if let Some(stripped) = rest.strip_prefix(scheme) {
                rest = stripped;
            }
        }
        if let Some((authority, _path)) = rest.split_once('/') {
            rest = authority;
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '['"))?;
            match tail {
                "" => (host, None),
                _ => {
                    let port = tail
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("garbage after ']'"))?;
                    (host, Some(port))
                }
            }
        } else if rest.matches(':').count() > 1 {
            // Bare IPv6 literal, no port
            (rest, None)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        if host.chars().any(|c| c.is_whitespace()) {
            return Err(invalid("whitespace in host"));
        }

        let data_port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid("bad port")),
                Ok(port) => port,
            },
            None => DEFAULT_DATA_PORT,
        };

        if registration_port == 0 {
            return Err(invalid("registration port must be non-zero"));
        }

        Ok(Self {
            host: host.to_string(),
            registration_port,
            data_port,
        })
    }

    /// `host` formatted for a `Host:` header or socket address
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.authority(), self.registration_port)
    }
}
