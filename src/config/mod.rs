//! Configuration management

use crate::controller::ControllerSettings;
use crate::disguise::Catalog;
use crate::health::HealthSettings;
use crate::proxy::{ProxySettings, DEFAULT_LOCAL_BIND};
use crate::transport::{CertificateVerification, TransportConfig};
use crate::tunnel::{
    check_auth_token, check_tunnel_type, Destination, DEFAULT_REGISTRATION_PORT,
    DEFAULT_TUNNEL_TYPE,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Timeouts, cooldowns and health thresholds
    #[serde(default)]
    pub timing: TimingConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// The `[client]` section
    pub fn client(&self) -> Result<&ClientConfig, crate::Error> {
        self.client
            .as_ref()
            .ok_or_else(|| crate::Error::Config("No [client] section in config".to_string()))
    }

    /// Controller settings from `[client]` and `[timing]`
    pub fn controller_settings(&self) -> Result<ControllerSettings, crate::Error> {
        let client = self.client()?;
        Ok(ControllerSettings {
            proxy: self.timing.proxy_settings(client.local_bind_addr()?),
            health: self.timing.health_settings(),
            attempt_cooldown: Duration::from_millis(self.timing.attempt_cooldown_ms),
            reconnect_cooldown: Duration::from_millis(self.timing.reconnect_cooldown_ms),
            mimicry_enabled: client.mimicry_enabled,
        })
    }
}

/// Client configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint: `host`, `host:port`, `[v6]:port`, optional `https://`
    pub endpoint: String,
    /// Bearer token sent with the registration request
    pub auth_token: String,
    /// Walk the whole disguise catalog (false: canonical disguise only)
    pub mimicry_enabled: bool,
    /// Allow-list of disguise ids (all built-in disguises when unset)
    pub disguises: Option<Vec<String>>,
    /// TLS port of the registration endpoint
    pub registration_port: u16,
    /// Tunnel type announced to the server
    pub tunnel_type: String,
    /// Loopback endpoint the tunnel engine sends its datagrams to
    pub local_bind: String,
    /// Skip server certificate verification (development only)
    pub insecure_skip_verify: bool,
    /// Selection ledger file
    pub ledger_path: Option<String>,
    /// SNI override for the TLS handshake
    pub sni: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: String::new(),
            mimicry_enabled: true,
            disguises: None,
            registration_port: DEFAULT_REGISTRATION_PORT,
            tunnel_type: DEFAULT_TUNNEL_TYPE.to_string(),
            local_bind: DEFAULT_LOCAL_BIND.to_string(),
            insecure_skip_verify: false,
            ledger_path: None,
            sni: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &format_args!("<{} bytes>", self.auth_token.len()))
            .field("mimicry_enabled", &self.mimicry_enabled)
            .field("disguises", &self.disguises)
            .field("registration_port", &self.registration_port)
            .field("tunnel_type", &self.tunnel_type)
            .field("local_bind", &self.local_bind)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("ledger_path", &self.ledger_path)
            .field("sni", &self.sni)
            .finish()
    }
}

impl ClientConfig {
    /// Parse the endpoint; fails before any network I/O
    pub fn destination(&self) -> Result<Destination, crate::Error> {
        if self.endpoint.trim().is_empty() {
            return Err(crate::Error::Config("No endpoint configured".to_string()));
        }
        Destination::parse(&self.endpoint, self.registration_port)
    }

    /// Built-in catalog restricted to the allow-list
    pub fn catalog(&self) -> Result<Catalog, crate::Error> {
        match &self.disguises {
            Some(ids) => Ok(Catalog::with_enabled(ids.as_slice())?),
            None => Ok(Catalog::builtin()),
        }
    }

    pub fn verification(&self) -> CertificateVerification {
        if self.insecure_skip_verify {
            CertificateVerification::Disabled
        } else {
            CertificateVerification::WebPki
        }
    }

    /// Configured ledger file, or `~/.veil/selection.json`
    pub fn ledger_path(&self) -> PathBuf {
        match &self.ledger_path {
            Some(path) => PathBuf::from(path),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".veil")
                .join("selection.json"),
        }
    }

    /// Loopback address for the datagram proxy
    pub fn local_bind_addr(&self) -> Result<SocketAddr, crate::Error> {
        let addr: SocketAddr = self.local_bind.parse().map_err(|e| {
            crate::Error::Config(format!("Invalid local_bind '{}': {}", self.local_bind, e))
        })?;
        if !addr.ip().is_loopback() {
            return Err(crate::Error::Config(format!(
                "local_bind must be a loopback address, got {}",
                addr
            )));
        }
        Ok(addr)
    }

    /// Check everything that can be checked offline
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.destination()?;
        self.catalog()?;
        self.local_bind_addr()?;
        if self.auth_token.is_empty() {
            return Err(crate::Error::Config("No auth_token configured".to_string()));
        }
        check_auth_token(&self.auth_token)
            .and_then(|_| check_tunnel_type(&self.tunnel_type))
            .map_err(|e| crate::Error::Config(e.to_string()))
    }
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// TCP connect and TLS handshake budget, each
    pub connect_timeout_secs: u64,
    /// Budget for the whole registration response head
    pub read_timeout_secs: u64,
    /// Pause between fallback candidates
    pub attempt_cooldown_ms: u64,
    /// Pause before reconnecting after a failure
    pub reconnect_cooldown_ms: u64,
    /// Delay before the first health sample
    pub warmup_secs: u64,
    /// Health observation window
    pub observation_window_secs: u64,
    /// Fewest downlink datagrams per window for a healthy tunnel
    pub min_downlink_datagrams: u64,
    /// Grace period for stopping the relay loops
    pub stop_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 15,
            attempt_cooldown_ms: 2000,
            reconnect_cooldown_ms: 2000,
            warmup_secs: 10,
            observation_window_secs: 15,
            min_downlink_datagrams: 5,
            stop_grace_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn attempt_cooldown(&self) -> Duration {
        Duration::from_millis(self.attempt_cooldown_ms)
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            warmup: Duration::from_secs(self.warmup_secs),
            window: Duration::from_secs(self.observation_window_secs),
            min_downlink_datagrams: self.min_downlink_datagrams,
        }
    }

    pub fn proxy_settings(&self, bind_addr: SocketAddr) -> ProxySettings {
        ProxySettings {
            bind_addr,
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            ..ProxySettings::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: Some(ClientConfig {
            endpoint: "vpn.example.com:51820".to_string(),
            auth_token: "replace-with-your-token".to_string(),
            ..ClientConfig::default()
        }),
        timing: TimingConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            endpoint = "vpn.example.com"
            auth_token = "abc"
            "#,
        )
        .unwrap();

        let client = config.client().unwrap();
        assert!(client.mimicry_enabled);
        assert_eq!(client.registration_port, 8443);
        assert_eq!(client.tunnel_type, "wireguard");
        assert_eq!(client.local_bind_addr().unwrap(), "127.0.0.1:51821".parse().unwrap());
        assert_eq!(client.verification(), CertificateVerification::WebPki);
        assert_eq!(client.catalog().unwrap().len(), Catalog::builtin().len());
        assert!(client.validate().is_ok());

        assert_eq!(config.timing.read_timeout(), Duration::from_secs(15));
        assert_eq!(config.logging.level, "info");

        let settings = config.controller_settings().unwrap();
        assert_eq!(settings.attempt_cooldown, Duration::from_secs(2));
        assert_eq!(settings.health.min_downlink_datagrams, 5);
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [client]
            endpoint = "https://[2001:db8::1]:4000"
            auth_token = "abc"
            mimicry_enabled = false
            disguises = ["zoom", "https"]
            registration_port = 443
            insecure_skip_verify = true
            ledger_path = "/tmp/ledger.json"

            [timing]
            attempt_cooldown_ms = 250
            min_downlink_datagrams = 2

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        let client = config.client().unwrap();
        let destination = client.destination().unwrap();
        assert_eq!(destination.host, "2001:db8::1");
        assert_eq!(destination.data_port, 4000);
        assert_eq!(destination.registration_port, 443);

        let ids: Vec<&str> = client.catalog().unwrap().list_all().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["https", "zoom"]);
        assert_eq!(client.verification(), CertificateVerification::Disabled);
        assert_eq!(client.ledger_path(), PathBuf::from("/tmp/ledger.json"));

        let settings = config.controller_settings().unwrap();
        assert!(!settings.mimicry_enabled);
        assert_eq!(settings.attempt_cooldown, Duration::from_millis(250));
        assert_eq!(config.timing.connect_timeout_secs, 10);
    }

    #[test]
    fn test_precondition_failures() {
        let base = generate_example_config().client.unwrap();

        let bad_endpoint = ClientConfig {
            endpoint: "".to_string(),
            ..base.clone()
        };
        assert!(matches!(bad_endpoint.validate(), Err(crate::Error::Config(_))));

        let unknown_disguise = ClientConfig {
            disguises: Some(vec!["carrier-pigeon".to_string()]),
            ..base.clone()
        };
        assert!(matches!(unknown_disguise.validate(), Err(crate::Error::Disguise(_))));

        let empty_catalog = ClientConfig {
            disguises: Some(vec![]),
            ..base.clone()
        };
        assert!(matches!(empty_catalog.validate(), Err(crate::Error::Disguise(_))));

        let public_bind = ClientConfig {
            local_bind: "0.0.0.0:51821".to_string(),
            ..base.clone()
        };
        assert!(matches!(public_bind.validate(), Err(crate::Error::Config(_))));

        let no_token = ClientConfig {
            auth_token: String::new(),
            ..base
        };
        assert!(matches!(no_token.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_header_breaking_values_rejected() {
        let base = generate_example_config().client.unwrap();

        for token in ["abc\r\nX-Injected: 1", "abc def", "tab\there"] {
            let client = ClientConfig {
                auth_token: token.to_string(),
                ..base.clone()
            };
            assert!(matches!(client.validate(), Err(crate::Error::Config(_))), "{:?}", token);
        }

        for tunnel_type in ["", "wireguard\r\nHost: evil", "wg&protocol=x", "wire guard"] {
            let client = ClientConfig {
                tunnel_type: tunnel_type.to_string(),
                ..base.clone()
            };
            assert!(matches!(client.validate(), Err(crate::Error::Config(_))), "{:?}", tunnel_type);
        }

        let custom = ClientConfig {
            tunnel_type: "open_vpn-2.6".to_string(),
            auth_token: "eyJhbGciOi.J9-_~+/=".to_string(),
            ..base
        };
        assert!(custom.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = generate_example_config().client.unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("replace-with-your-token"));
        assert!(debug.contains("<23 bytes>"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        let client = loaded.client().unwrap();
        assert_eq!(client.endpoint, "vpn.example.com:51820");
        assert_eq!(client.registration_port, 8443);
        assert_eq!(loaded.timing.warmup_secs, 10);
    }

    #[test]
    fn test_missing_client_section() {
        let config: Config = toml::from_str("[logging]\nlevel = \"warn\"\nformat = \"compact\"\n").unwrap();
        assert!(matches!(config.client(), Err(crate::Error::Config(_))));
    }
}
