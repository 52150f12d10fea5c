//! `config.toml` settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub debug: bool,
    /// The intercepted hostname.
    pub host: String,
    /// DNS-over-HTTPS JSON endpoint used to find the real upstream.
    #[serde(rename = "hostDNS")]
    pub host_dns: String,
    /// Upstream address used when resolution fails.
    #[serde(rename = "defaultIP")]
    pub default_ip: IpAddr,
    pub proxy: ProxySettings,
    pub resolver: ResolverSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySettings {
    pub listen: IpAddr,
    pub port: u16,
    pub upstream_port: u16,
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// JSON DNS-over-HTTPS against `hostDNS`.
    Doh,
    /// Plain DNS against `nameserver`.
    Dns,
    /// No lookup, `defaultIP` is the upstream.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolverSettings {
    pub kind: ResolverKind,
    pub nameserver: SocketAddr,
    /// Public-address service whose answer is sent to DoH as the client
    /// subnet. Empty disables it.
    pub client_ip_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathSettings {
    pub bundle_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            host: "service.mkey.163.com".into(),
            host_dns: "https://dns.alidns.com/resolve".into(),
            default_ip: IpAddr::V4(Ipv4Addr::new(42, 186, 193, 21)),
            proxy: ProxySettings::default(),
            resolver: ResolverSettings::default(),
            paths: PathSettings::default(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 443,
            upstream_port: 443,
            drain_timeout_secs: 5,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            kind: ResolverKind::Doh,
            nameserver: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(223, 5, 5, 5)), 53),
            client_ip_endpoint: "https://www.ip.cn/api/index".into(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from("."),
            log_dir: PathBuf::from("log"),
        }
    }
}

impl ProxySettings {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads `path`, or writes the defaults there when it does not exist.
    /// The flag is true when the file was created.
    pub fn load_or_create(path: &Path) -> Result<(Self, bool)> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok((Self::from_toml(&text)?, false)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                settings.save(path)?;
                Ok((settings, true))
            }
            Err(e) => Err(Error::io(format!("read {}", path.display()), e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| Error::io(format!("write {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_key_names_are_understood() {
        let settings = Settings::from_toml(
            r#"
            debug = true
            host = "example.com"
            hostDNS = "https://doh.example/resolve"
            defaultIP = "10.0.0.1"
            "#,
        )
        .unwrap();

        assert!(settings.debug);
        assert_eq!(settings.host, "example.com");
        assert_eq!(settings.host_dns, "https://doh.example/resolve");
        assert_eq!(settings.default_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(settings.proxy, ProxySettings::default());
    }

    #[test]
    fn nested_tables_override_defaults() {
        let settings = Settings::from_toml(
            r#"
            [proxy]
            port = 8443
            drainTimeoutSecs = 1

            [resolver]
            kind = "dns"
            clientIpEndpoint = ""
            "#,
        )
        .unwrap();

        assert_eq!(settings.proxy.port, 8443);
        assert_eq!(settings.proxy.upstream_port, 443);
        assert_eq!(settings.proxy.drain_timeout(), Duration::from_secs(1));
        assert_eq!(settings.resolver.kind, ResolverKind::Dns);
        assert!(settings.resolver.client_ip_endpoint.is_empty());
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(matches!(Settings::from_toml("debug = ["), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let (settings, created) = Settings::load_or_create(&path).unwrap();
        assert!(created);
        assert_eq!(settings, Settings::default());

        let (reloaded, created) = Settings::load_or_create(&path).unwrap();
        assert!(!created);
        assert_eq!(reloaded, settings);
    }
}
