//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of keys; missing fields get their compiled
//! default during deserialization.

use std::net::Ipv6Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8093;

/// Default upper bound for a (possibly fragmented) inbound message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20_000_000;

/// Largest accepted `maxMessageSize`, in bytes.
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 1 << 30;

/// Default cap on text queued for one client but not yet written, in bytes.
pub const DEFAULT_MAX_OUTBOUND_BYTES: usize = 64 * 1024 * 1024;

/// Root settings type for the gateway.
///
/// ```json
/// {
///   "server": { "port": 9000, "maxMessageSize": 1048576 },
///   "tls": { "enabled": true, "certChainPath": "/etc/wsgate/chain.pem",
///            "privateKeyPath": "/etc/wsgate/key.pem" },
///   "tenants": ["wiki1", "wiki2"]
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and protocol limits.
    pub server: ServerSettings,
    /// TLS termination.
    pub tls: TlsSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Tenants for which the binary registers its built-in handlers.
    pub tenants: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            tls: TlsSettings::default(),
            logging: LoggingSettings::default(),
            tenants: vec!["default".to_string()],
        }
    }
}

impl GatewaySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be greater than zero".to_string(),
            ));
        }
        if self.server.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(SettingsError::InvalidValue(format!(
                "server.maxMessageSize must not exceed {MAX_MESSAGE_SIZE_LIMIT}"
            )));
        }
        if self.server.max_outbound_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxOutboundBytes must be greater than zero".to_string(),
            ));
        }
        if self.server.bind_address.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "server.bindAddress must not be empty".to_string(),
            ));
        }
        if self.tls.cert_chain_path.is_some() != self.tls.private_key_path.is_some() {
            return Err(SettingsError::IncompleteTlsPaths);
        }
        Ok(())
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    ///
    /// IPv6 literals are bracketed.
    pub fn bind_target(&self) -> String {
        let host = self.server.bind_address.trim();
        if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{host}]:{}", self.server.port)
        } else {
            format!("{host}:{}", self.server.port)
        }
    }
}

/// Listener and protocol limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// IP address to bind to.
    pub bind_address: String,
    /// Port to listen on (`0` picks a free port).
    pub port: u16,
    /// Maximum size of one inbound message after reassembly, in bytes.
    pub max_message_size: usize,
    /// Text bytes that may wait for one slow client before it is
    /// disconnected with 1008.
    pub max_outbound_bytes: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_nodelay: bool,
    /// Seconds to wait for live connections to finish on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_outbound_bytes: DEFAULT_MAX_OUTBOUND_BYTES,
            tcp_nodelay: true,
            shutdown_timeout_secs: 10,
        }
    }
}

/// TLS termination settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    /// Serve `wss://` instead of `ws://`.
    pub enabled: bool,
    /// PEM file with the server certificate followed by intermediates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_chain_path: Option<PathBuf>,
    /// PEM file with the private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    /// Generate a self-signed certificate when enabled without paths.
    pub auto_generate: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_chain_path: None,
            private_key_path: None,
            auto_generate: true,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.server.bind_address, "0.0.0.0");
        assert_eq!(settings.server.port, 8093);
        assert_eq!(settings.server.max_message_size, 20_000_000);
        assert_eq!(settings.server.max_outbound_bytes, 64 * 1024 * 1024);
        assert!(settings.server.tcp_nodelay);
        assert!(!settings.tls.enabled);
        assert!(settings.tls.auto_generate);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.tenants, vec!["default".to_string()]);
    }

    #[test]
    fn defaults_validate() {
        GatewaySettings::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"server":{"port":9000},"tls":{"enabled":true}}"#;
        let settings: GatewaySettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(settings.tls.enabled);
        assert!(settings.tls.cert_chain_path.is_none());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(GatewaySettings::default()).unwrap();
        assert!(json["server"].get("bindAddress").is_some());
        assert!(json["server"].get("maxMessageSize").is_some());
        assert!(json["tls"].get("autoGenerate").is_some());
        // Unset paths are omitted
        assert!(json["tls"].get("certChainPath").is_none());
    }

    #[test]
    fn zero_max_message_size_rejected() {
        let mut settings = GatewaySettings::default();
        settings.server.max_message_size = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("maxMessageSize"));
    }

    #[test]
    fn max_message_size_is_capped() {
        let mut settings = GatewaySettings::default();
        settings.server.max_message_size = MAX_MESSAGE_SIZE_LIMIT;
        settings.validate().unwrap();
        settings.server.max_message_size = MAX_MESSAGE_SIZE_LIMIT + 1;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
        settings.server.max_message_size = usize::MAX;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_outbound_limit_rejected() {
        let mut settings = GatewaySettings::default();
        settings.server.max_outbound_bytes = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("maxOutboundBytes"));
    }

    #[test]
    fn half_tls_pair_rejected() {
        let mut settings = GatewaySettings::default();
        settings.tls.cert_chain_path = Some(PathBuf::from("/tmp/chain.pem"));
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::IncompleteTlsPaths)
        ));
    }

    #[test]
    fn bind_target_joins_host_and_port() {
        let mut settings = GatewaySettings::default();
        settings.server.bind_address = "127.0.0.1".into();
        settings.server.port = 0;
        assert_eq!(settings.bind_target(), "127.0.0.1:0");
    }

    #[test]
    fn bind_target_brackets_ipv6() {
        let mut settings = GatewaySettings::default();
        settings.server.bind_address = "::".into();
        assert_eq!(settings.bind_target(), "[::]:8093");
        settings.server.bind_address = "::1".into();
        settings.server.port = 0;
        assert_eq!(settings.bind_target(), "[::1]:0");
        assert!(settings.bind_target().parse::<std::net::SocketAddr>().is_ok());
        settings.server.bind_address = "localhost".into();
        assert_eq!(settings.bind_target(), "localhost:0");
    }
}
