//! Discovery wire messages.
//!
//! Both messages are JSON objects carried in a single UDP datagram, tagged
//! by a `type` field:
//!
//! ```json
//! {"type":"discovery","client_version":"1.0","client_ip":"192.168.1.7","timestamp":1718000000.5}
//! {"type":"server_response","name":"Lab","port":8000,"users_count":3, ...}
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use serde::{Deserialize, Serialize};

use super::descriptor::ServerDescriptor;
use crate::error::DiscoveryError;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Default UDP port servers listen on for discovery requests.
pub const DEFAULT_DISCOVERY_PORT: u16 = 37020;

/// Largest datagram either side sends or reads.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Protocol version reported by clients and servers.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Advertised capacity when a response omits `max_users`.
pub const DEFAULT_MAX_USERS: u32 = 50;

// ────────────────────────────────────────────────────────────────────────────
// Messages
// ────────────────────────────────────────────────────────────────────────────

/// Top-level envelope; serde writes the variant name into `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Discovery(DiscoveryRequest),
    ServerResponse(DiscoveryResponse),
}

/// Broadcast by a client looking for servers.
///
/// Servers only look at the `type` tag, so every field is optional on the
/// way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default = "default_version")]
    pub client_version: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub timestamp: f64,
}

impl DiscoveryRequest {
    pub fn new(client_ip: impl Into<String>) -> Self {
        Self {
            client_version: PROTOCOL_VERSION.to_string(),
            client_ip: client_ip.into(),
            timestamp: crate::now_unix_f64(),
        }
    }
}

/// Unicast reply from a server. `name` and `port` are required; a datagram
/// missing either one does not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub users_count: u32,
    #[serde(default)]
    pub password_required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_max_users")]
    pub max_users: u32,
    #[serde(default)]
    pub timestamp: f64,
}

impl DiscoveryResponse {
    /// Builds a descriptor for a response that arrived from `sender`.
    ///
    /// The host comes from the UDP source address, never from the payload.
    pub fn into_descriptor(self, sender: IpAddr, now: u64) -> ServerDescriptor {
        ServerDescriptor {
            name: self.name,
            address: SocketAddr::new(sender, self.port),
            description: self.description,
            version: self.version,
            users_count: self.users_count,
            max_users: self.max_users,
            password_protected: self.password_required,
            is_online: true,
            last_seen: Some(now),
        }
    }
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_max_users() -> u32 {
    DEFAULT_MAX_USERS
}

// ────────────────────────────────────────────────────────────────────────────
// Wire helpers
// ────────────────────────────────────────────────────────────────────────────

/// Serialises a message, refusing anything that would not fit in one
/// receive buffer on the other side.
pub fn encode(msg: &DiscoveryMessage) -> Result<Vec<u8>, DiscoveryError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DiscoveryError::DatagramTooLarge {
            len: bytes.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(bytes)
}

/// Parses a datagram. Returns `None` for anything that is not valid JSON or
/// does not match one of the two message shapes.
pub fn decode(data: &[u8]) -> Option<DiscoveryMessage> {
    serde_json::from_slice(data).ok()
}

pub fn decode_request(data: &[u8]) -> Option<DiscoveryRequest> {
    match decode(data)? {
        DiscoveryMessage::Discovery(req) => Some(req),
        DiscoveryMessage::ServerResponse(_) => None,
    }
}

pub fn decode_response(data: &[u8]) -> Option<DiscoveryResponse> {
    match decode(data)? {
        DiscoveryMessage::ServerResponse(resp) => Some(resp),
        DiscoveryMessage::Discovery(_) => None,
    }
}

/// Best guess at the address other hosts on the LAN see us as.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outbound interface.
pub fn local_ip() -> IpAddr {
    let probe = |target: &str| -> Option<IpAddr> {
        let sock = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        sock.connect(target).ok()?;
        sock.local_addr().ok().map(|a| a.ip())
    };
    probe("10.255.255.255:1")
        .or_else(|| probe("8.8.8.8:80"))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = DiscoveryMessage::Discovery(DiscoveryRequest::new("192.168.1.7"));
        let value: serde_json::Value = serde_json::from_slice(&encode(&req).unwrap()).unwrap();
        assert_eq!(value["type"], "discovery");
        assert_eq!(value["client_ip"], "192.168.1.7");
        assert_eq!(value["client_version"], "1.0");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn bare_discovery_request_is_accepted() {
        let req = decode_request(br#"{"type":"discovery"}"#).unwrap();
        assert_eq!(req.client_version, "1.0");
        assert!(req.client_ip.is_empty());
    }

    #[test]
    fn response_defaults_optional_fields() {
        let resp = decode_response(br#"{"type":"server_response","name":"Lab","port":8000}"#)
            .unwrap();
        assert_eq!(resp.users_count, 0);
        assert!(!resp.password_required);
        assert_eq!(resp.version, "1.0");
        assert_eq!(resp.max_users, 50);
    }

    #[test]
    fn response_missing_required_fields_is_dropped() {
        assert!(decode_response(br#"{"type":"server_response","port":8000}"#).is_none());
        assert!(decode_response(br#"{"type":"server_response","name":"Lab"}"#).is_none());
        assert!(decode_response(br#"{"type":"server_response","name":"Lab","port":70000}"#)
            .is_none());
        assert!(decode_response(b"not json").is_none());
        assert!(decode_response(br#"{"type":"discovery"}"#).is_none());
        assert!(decode(br#"{"type":"hello","name":"x","port":1}"#).is_none());
    }

    #[test]
    fn descriptor_uses_sender_ip() {
        let resp = decode_response(
            br#"{"type":"server_response","name":"Lab","port":8000,"host":"10.9.9.9","users_count":4,"password_required":true}"#,
        )
        .unwrap();
        let sender: IpAddr = "192.168.1.20".parse().unwrap();
        let desc = resp.into_descriptor(sender, 1_000);
        assert_eq!(desc.address, "192.168.1.20:8000".parse().unwrap());
        assert_eq!(desc.users_count, 4);
        assert!(desc.password_protected);
        assert!(desc.is_online);
        assert_eq!(desc.last_seen, Some(1_000));
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let resp = DiscoveryMessage::ServerResponse(DiscoveryResponse {
            name: "Lab".into(),
            port: 8000,
            users_count: 0,
            password_required: false,
            description: "x".repeat(MAX_DATAGRAM_SIZE),
            version: PROTOCOL_VERSION.into(),
            max_users: 50,
            timestamp: 0.0,
        });
        assert!(matches!(
            encode(&resp),
            Err(DiscoveryError::DatagramTooLarge { .. })
        ));
    }
}
