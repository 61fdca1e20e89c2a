use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// One discoverable chat server.
///
/// Identity is the `address` (host, port) pair; everything else may change
/// between probes for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub users_count: u32,
    #[serde(default)]
    pub max_users: u32,
    #[serde(default)]
    pub password_protected: bool,
    #[serde(default)]
    pub is_online: bool,
    /// UNIX seconds of the last probe response, `None` for entries that were
    /// seeded and never seen since.
    #[serde(default)]
    pub last_seen: Option<u64>,
}

impl ServerDescriptor {
    pub fn host(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// WebSocket endpoint for `user_id` on this server.
    pub fn ws_url(&self, user_id: u64) -> String {
        format!("ws://{}/ws/{}", self.address, user_id)
    }

    /// `true` when the entry was refreshed less than `max_age` seconds
    /// before `now`.
    pub fn is_fresh(&self, now: u64, max_age: u64) -> bool {
        self.last_seen
            .map(|seen| now.saturating_sub(seen) <= max_age)
            .unwrap_or(false)
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_online { '●' } else { '○' };
        write!(f, "{} {} - {}", status, self.name, self.address)?;
        if self.users_count > 0 {
            write!(f, " ({} users)", self.users_count)?;
        }
        if self.password_protected {
            f.write_str(" [locked]")?;
        }
        Ok(())
    }
}
