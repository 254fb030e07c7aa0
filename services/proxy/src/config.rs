//! Proxy configuration.
//!
//! Everything is environment-driven; see [`Config::from_env`].

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{OfflineConfig, ProxySettings, DEFAULT_MAX_CONNECTIONS};

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the management database holding servers and bans.
    pub database_path: PathBuf,

    /// Interface the per-server listeners bind on.
    pub bind_ip: IpAddr,

    /// Registry refresh period.
    pub refresh_interval: Duration,

    /// Connection handling parameters.
    pub proxy: ProxySettings,

    /// Maximum concurrent connections per listener.
    pub max_connections: usize,

    /// Content of the reply sent when a backend is down.
    pub offline: OfflineConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = lookup("SHIELD_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/shield.db"));

        let bind_ip = parse_var::<IpAddr, _>(&lookup, "SHIELD_BIND_IP")
            .context("SHIELD_BIND_IP must be an IP address.")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let refresh_secs: u64 = parse_var(&lookup, "SHIELD_REFRESH_INTERVAL_SECS")
            .context("SHIELD_REFRESH_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        let connect_timeout_ms: u64 = parse_var(&lookup, "SHIELD_CONNECT_TIMEOUT_MS")
            .context("SHIELD_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let handshake_timeout_ms: u64 = parse_var(&lookup, "SHIELD_HANDSHAKE_TIMEOUT_MS")
            .context("SHIELD_HANDSHAKE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(10_000);

        let max_handshake_bytes: usize = parse_var(&lookup, "SHIELD_MAX_HANDSHAKE_BYTES")
            .context("SHIELD_MAX_HANDSHAKE_BYTES must be an integer.")?
            .unwrap_or(shield_wire::DEFAULT_MAX_HANDSHAKE_BYTES);

        let max_connections: usize = parse_var(&lookup, "SHIELD_MAX_CONNECTIONS")
            .context("SHIELD_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let mut offline = OfflineConfig::default();
        if let Some(name) = lookup("SHIELD_OFFLINE_NAME") {
            offline.version_name = name;
        }
        if let Some(protocol) = parse_var(&lookup, "SHIELD_OFFLINE_PROTOCOL")
            .context("SHIELD_OFFLINE_PROTOCOL must be an integer.")?
        {
            offline.protocol = protocol;
        }
        if let Some(motd) = lookup("SHIELD_OFFLINE_MOTD") {
            offline.description = motd;
        }

        let log_level = lookup("SHIELD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            database_path,
            bind_ip,
            refresh_interval: Duration::from_secs(refresh_secs.max(1)),
            proxy: ProxySettings {
                connect_timeout: Duration::from_millis(connect_timeout_ms.max(50)),
                handshake_timeout: Duration::from_millis(handshake_timeout_ms.max(100)),
                max_handshake_bytes: max_handshake_bytes.max(64),
            },
            max_connections: max_connections.max(1),
            offline,
            log_level,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_path, PathBuf::from("./data/shield.db"));
        assert_eq!(config.bind_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.refresh_interval, Duration::from_secs(30));
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.proxy.max_handshake_bytes, 4096);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.offline.protocol, 47);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides_and_clamping() {
        let config = load(&[
            ("SHIELD_REFRESH_INTERVAL_SECS", "0"),
            ("SHIELD_CONNECT_TIMEOUT_MS", "250"),
            ("SHIELD_MAX_HANDSHAKE_BYTES", "8"),
            ("SHIELD_BIND_IP", "::"),
            ("SHIELD_OFFLINE_MOTD", "down for maintenance"),
        ])
        .unwrap();

        assert_eq!(config.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.proxy.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.proxy.max_handshake_bytes, 64);
        assert!(config.bind_ip.is_ipv6());
        assert_eq!(config.offline.description, "down for maintenance");
    }

    #[test]
    fn test_invalid_integer_is_rejected() {
        let err = load(&[("SHIELD_REFRESH_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(format!("{err:#}").contains("SHIELD_REFRESH_INTERVAL_SECS"));
    }
}
