//! `config.toml`: discovery, session and server settings.
//!
//! Every field has a default, so an empty file (or none at all) is a
//! valid configuration.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::discovery::prober::Prober;
use crate::discovery::protocol::{DEFAULT_DISCOVERY_PORT, DEFAULT_MAX_USERS, PROTOCOL_VERSION};
use crate::discovery::responder::ResponderConfig;
use crate::discovery::service::DiscoveryOptions;
use crate::session::SessionConfig;

const TEMPLATE: &str = r#"# lanchat configuration. Every key is optional; shown values are the defaults.

[discovery]
# port = 37020
# broadcast_address = "255.255.255.255"
# probe_timeout_secs = 3.0
# quick_timeout_secs = 1.5
# interval_secs = 30.0
# max_cache_age_secs = 300.0
# error_backoff_secs = 5.0
# stop_grace_secs = 2.0

[session]
# max_reconnect_attempts = 5
# backoff_base_secs = 2.0
# backoff_cap_secs = 10.0
# read_timeout_secs = 25.0
# auth_timeout_secs = 10.0
# connect_timeout_secs = 10.0
# require_auth_ack = true   # false: treat the session as active right after sending auth

[server]
# name = "Local Messenger Server"
# host = "0.0.0.0"
# port = 8000
# description = ""
# max_users = 50
# password_protected = false
# version = "1.0"
"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery: DiscoverySettings,
    pub session: SessionSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub port: u16,
    pub broadcast_address: Ipv4Addr,
    pub probe_timeout_secs: f64,
    pub quick_timeout_secs: f64,
    pub interval_secs: f64,
    pub max_cache_age_secs: f64,
    pub error_backoff_secs: f64,
    pub stop_grace_secs: f64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: Ipv4Addr::BROADCAST,
            probe_timeout_secs: 3.0,
            quick_timeout_secs: 1.5,
            interval_secs: 30.0,
            max_cache_age_secs: 300.0,
            error_backoff_secs: 5.0,
            stop_grace_secs: 2.0,
        }
    }
}

impl DiscoverySettings {
    pub fn prober(&self) -> Prober {
        let target = SocketAddr::V4(SocketAddrV4::new(self.broadcast_address, self.port));
        Prober::new(target, secs(self.probe_timeout_secs))
            .with_quick_timeout(secs(self.quick_timeout_secs))
    }

    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            interval: secs(self.interval_secs),
            max_cache_age: secs(self.max_cache_age_secs),
            error_backoff: secs(self.error_backoff_secs),
            stop_grace: secs(self.stop_grace_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_reconnect_attempts: u32,
    pub backoff_base_secs: f64,
    pub backoff_cap_secs: f64,
    pub read_timeout_secs: f64,
    pub auth_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    pub require_auth_ack: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff_base_secs: 2.0,
            backoff_cap_secs: 10.0,
            read_timeout_secs: 25.0,
            auth_timeout_secs: 10.0,
            connect_timeout_secs: 10.0,
            require_auth_ack: true,
        }
    }
}

impl SessionSettings {
    /// Session parameters for one user on one server.
    pub fn session_config(
        &self,
        host: impl Into<String>,
        port: u16,
        user_id: u64,
        token: impl Into<String>,
    ) -> SessionConfig {
        let mut config = SessionConfig::new(host, port, user_id, token);
        config.max_reconnect_attempts = self.max_reconnect_attempts;
        config.backoff_base = secs(self.backoff_base_secs);
        config.backoff_cap = secs(self.backoff_cap_secs);
        config.read_timeout = secs(self.read_timeout_secs);
        config.auth_timeout = secs(self.auth_timeout_secs);
        config.connect_timeout = secs(self.connect_timeout_secs);
        config.require_auth_ack = self.require_auth_ack;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub description: String,
    pub max_users: u32,
    pub password_protected: bool,
    pub version: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "Local Messenger Server".to_string(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            description: String::new(),
            max_users: DEFAULT_MAX_USERS,
            password_protected: false,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ServerSettings {
    /// What the discovery responder advertises for this server.
    pub fn responder_config(&self, broadcast_port: u16) -> ResponderConfig {
        ResponderConfig {
            name: self.name.clone(),
            server_port: self.port,
            bind_host: self.host,
            broadcast_port,
            description: self.description.clone(),
            max_users: self.max_users,
            password_required: self.password_protected,
            version: self.version.clone(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let cfg: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads `path`, or writes the commented template there and returns the
    /// defaults when it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create config dir {:?}", dir))?;
            }
        }
        fs::write(path, TEMPLATE)
            .with_context(|| format!("Failed to write default config {:?}", path))?;
        info!("Default config created at {:?}", path);
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        let s = &self.session;
        let durations = [
            ("discovery.probe_timeout_secs", d.probe_timeout_secs),
            ("discovery.quick_timeout_secs", d.quick_timeout_secs),
            ("discovery.interval_secs", d.interval_secs),
            ("discovery.max_cache_age_secs", d.max_cache_age_secs),
            ("discovery.error_backoff_secs", d.error_backoff_secs),
            ("discovery.stop_grace_secs", d.stop_grace_secs),
            ("session.backoff_base_secs", s.backoff_base_secs),
            ("session.backoff_cap_secs", s.backoff_cap_secs),
            ("session.read_timeout_secs", s.read_timeout_secs),
            ("session.auth_timeout_secs", s.auth_timeout_secs),
            ("session.connect_timeout_secs", s.connect_timeout_secs),
        ];
        for (key, value) in durations {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number of seconds, got {}", key, value);
            }
        }
        if s.max_reconnect_attempts == 0 {
            bail!("session.max_reconnect_attempts must be at least 1");
        }
        Ok(())
    }
}

/// `<config dir>/lanchat/config.toml`, falling back to the working directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("lanchat"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.discovery.port, 37020);
        assert_eq!(cfg.session.max_reconnect_attempts, 5);
        assert!(cfg.session.require_auth_ack);
        assert_eq!(cfg.server.name, "Local Messenger Server");
    }

    #[test]
    fn template_parses_to_defaults() {
        let cfg: AppConfig = toml::from_str(TEMPLATE).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn partial_sections() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [discovery]
            broadcast_address = "192.168.1.255"
            quick_timeout_secs = 0.5

            [session]
            require_auth_ack = false
            backoff_cap_secs = 6
            "#,
        )
        .unwrap();

        let prober = cfg.discovery.prober();
        assert_eq!(prober.target(), "192.168.1.255:37020".parse().unwrap());
        assert_eq!(prober.timeout(), Duration::from_secs(3));

        let session = cfg.session.session_config("10.0.0.2", 8000, 4, "tok");
        assert!(!session.require_auth_ack);
        assert_eq!(session.backoff_cap, Duration::from_secs(6));
        assert_eq!(session.read_timeout, Duration::from_secs(25));
    }

    #[test]
    fn server_section_feeds_the_responder() {
        let mut server = ServerSettings::default();
        server.port = 9001;
        server.password_protected = true;
        let responder = server.responder_config(40000);
        assert_eq!(responder.server_port, 9001);
        assert_eq!(responder.broadcast_port, 40000);
        assert!(responder.password_required);
        assert_eq!(responder.max_users, 50);
        assert_eq!(server.listen_addr(), "0.0.0.0:9001".parse().unwrap());
    }

    #[test]
    fn missing_file_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let cfg = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert!(fs::read_to_string(&path).unwrap().contains("[session]"));

        fs::write(&path, "[server]\nport = 8100\n").unwrap();
        let cfg = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.server.port, 8100);
    }

    #[test]
    fn rejects_nonsense() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "[session]\nread_timeout_secs = -1.0\n").unwrap();
        assert!(AppConfig::load(&path).is_err());

        fs::write(&path, "[session]\nmax_reconnect_attempts = 0\n").unwrap();
        assert!(AppConfig::load(&path).is_err());

        fs::write(&path, "[discovery]\nport = \"nope\"\n").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
