//! One-shot discovery round: broadcast a request, collect whatever answers
//! before the window closes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};

use super::descriptor::ServerDescriptor;
use super::protocol::{
    self, DiscoveryMessage, DiscoveryRequest, DEFAULT_DISCOVERY_PORT, MAX_DATAGRAM_SIZE,
};
use crate::error::DiscoveryError;

/// Default window a probe listens for responses.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Default window for [`Prober::quick_probe`].
pub const QUICK_PROBE_TIMEOUT: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone)]
pub struct Prober {
    /// Where the request goes. Defaults to the IPv4 limited broadcast
    /// address on the discovery port.
    target: SocketAddr,
    timeout: Duration,
    quick_timeout: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                DEFAULT_DISCOVERY_PORT,
            )),
            DEFAULT_PROBE_TIMEOUT,
        )
    }
}

impl Prober {
    pub fn new(target: SocketAddr, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            quick_timeout: QUICK_PROBE_TIMEOUT,
        }
    }

    pub fn with_quick_timeout(mut self, quick_timeout: Duration) -> Self {
        self.quick_timeout = quick_timeout;
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs one round with the configured window.
    pub async fn probe(&self) -> Result<Vec<ServerDescriptor>, DiscoveryError> {
        self.probe_with_timeout(self.timeout).await
    }

    /// Runs one round with the short window.
    pub async fn quick_probe(&self) -> Result<Vec<ServerDescriptor>, DiscoveryError> {
        self.probe_with_timeout(self.quick_timeout).await
    }

    /// Sends exactly one request and keeps reading until `window` has
    /// elapsed, whatever the number of replies.
    ///
    /// Silence is an empty list, not an error. Only failing to set up or
    /// use the socket is reported.
    pub async fn probe_with_timeout(
        &self,
        window: Duration,
    ) -> Result<Vec<ServerDescriptor>, DiscoveryError> {
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;

        let request = DiscoveryMessage::Discovery(DiscoveryRequest::new(
            protocol::local_ip().to_string(),
        ));
        let packet = protocol::encode(&request)?;
        socket.send_to(&packet, self.target).await?;
        debug!("Discovery request sent to {}", self.target);

        let deadline = Instant::now() + window;
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut servers = Vec::new();

        loop {
            match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                // Window closed: the normal way out.
                Err(_) => break,
                Ok(Ok((len, src))) => match protocol::decode_response(&buf[..len]) {
                    Some(resp) => {
                        let desc = resp.into_descriptor(src.ip(), crate::now_unix_secs());
                        info!("Found server {} ({})", desc.name, desc.address);
                        servers.push(desc);
                    }
                    None => debug!("Ignoring malformed discovery datagram from {}", src),
                },
                Ok(Err(e)) => warn!("Discovery receive error: {}", e),
            }
        }

        debug!("Probe finished with {} response(s)", servers.len());
        Ok(servers)
    }
}

/// TCP reachability check for a single server.
pub async fn check_server_availability(addr: SocketAddr, wait: Duration) -> bool {
    matches!(timeout(wait, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::protocol::DiscoveryResponse;
    use std::net::Ipv4Addr;

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
    }

    fn response(name: &str, port: u16) -> Vec<u8> {
        protocol::encode(&DiscoveryMessage::ServerResponse(DiscoveryResponse {
            name: name.into(),
            port,
            users_count: 1,
            password_required: false,
            description: String::new(),
            version: "1.0".into(),
            max_users: 50,
            timestamp: 0.0,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn silence_yields_empty_list() {
        let sink = loopback_socket().await;
        let prober = Prober::new(sink.local_addr().unwrap(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let servers = prober.probe().await.unwrap();
        assert!(servers.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn malformed_replies_are_skipped() {
        let server = loopback_socket().await;
        let prober = Prober::new(server.local_addr().unwrap(), Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert!(protocol::decode_request(&buf[..len]).is_some());
            server.send_to(b"{broken", from).await.unwrap();
            server
                .send_to(br#"{"type":"server_response","port":1}"#, from)
                .await
                .unwrap();
            server.send_to(&response("Good", 8000), from).await.unwrap();
        });

        let servers = prober.probe().await.unwrap();
        responder.await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "Good");
        assert_eq!(servers[0].address, "127.0.0.1:8000".parse().unwrap());
        assert!(servers[0].is_online);
        assert!(servers[0].last_seen.is_some());
    }

    #[tokio::test]
    async fn availability_check() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let open = listener.local_addr().unwrap();
        assert!(check_server_availability(open, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!check_server_availability(open, Duration::from_millis(500)).await);
    }
}
