//! Server-side answer to discovery requests.
//!
//! The responder binds the well-known discovery port with `SO_REUSEADDR`
//! (and `SO_REUSEPORT` off Windows) so several servers on one machine can
//! share it, then answers every `discovery` datagram with a unicast
//! `server_response` carrying live metadata. Each request is handled on its
//! own task so a slow user-count lookup never stalls the receive loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    self, DiscoveryMessage, DiscoveryResponse, DEFAULT_DISCOVERY_PORT, DEFAULT_MAX_USERS,
    MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use crate::error::DiscoveryError;
use crate::presence::UserDirectory;

/// How long [`Responder::stop`] waits for the listen loop to exit.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Constructor parameters, normally fed from the server's command line.
#[derive(Debug, Clone, Serialize)]
pub struct ResponderConfig {
    pub name: String,
    /// Port of the chat server being advertised (not the discovery port).
    pub server_port: u16,
    /// Interface to bind the discovery socket on.
    pub bind_host: IpAddr,
    pub broadcast_port: u16,
    pub description: String,
    pub max_users: u32,
    pub password_required: bool,
    pub version: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            name: "Local Messenger Server".to_string(),
            server_port: 8000,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_port: DEFAULT_DISCOVERY_PORT,
            description: String::new(),
            max_users: DEFAULT_MAX_USERS,
            password_required: false,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Point-in-time view returned by [`Responder::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ResponderStatus {
    pub is_running: bool,
    pub local_addr: SocketAddr,
    pub config: ResponderConfig,
    /// UNIX seconds of the last datagram received, if any.
    pub last_activity: Option<u64>,
}

pub struct Responder {
    local_addr: SocketAddr,
    info: Arc<RwLock<ResponderConfig>>,
    last_activity: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    /// Binds the discovery socket and spawns the listen loop.
    ///
    /// A bind failure, or metadata too large for one datagram, is returned
    /// to the caller; nothing is spawned in that case.
    pub async fn start(
        config: ResponderConfig,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, DiscoveryError> {
        check_fits(&config)?;
        let bind_addr = SocketAddr::new(config.bind_host, config.broadcast_port);
        let socket = Arc::new(bind_reusable_udp(bind_addr)?);
        let local_addr = socket.local_addr()?;

        info!(
            "Discovery responder for \"{}\" (port {}) listening on {}",
            config.name, config.server_port, local_addr
        );

        let info = Arc::new(RwLock::new(config));
        let last_activity = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(listen_loop(
            socket,
            info.clone(),
            directory,
            last_activity.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            info,
            last_activity,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Changes what future responses advertise. `None` leaves a field alone.
    ///
    /// Rejects the whole update, keeping the current metadata, when the
    /// response would no longer fit in one datagram.
    pub fn update_info(
        &self,
        name: Option<String>,
        description: Option<String>,
        password_required: Option<bool>,
    ) -> Result<(), DiscoveryError> {
        let mut info = self.info.write();
        let mut next = info.clone();
        if let Some(name) = name {
            next.name = name;
        }
        if let Some(description) = description {
            next.description = description;
        }
        if let Some(password_required) = password_required {
            next.password_required = password_required;
        }
        check_fits(&next)?;
        *info = next;
        info!("Discovery responder now advertising \"{}\"", info.name);
        Ok(())
    }

    pub fn status(&self) -> ResponderStatus {
        let last = self.last_activity.load(Ordering::Relaxed);
        ResponderStatus {
            is_running: self.is_running(),
            local_addr: self.local_addr,
            config: self.info.read().clone(),
            last_activity: (last != 0).then_some(last),
        }
    }

    /// Signals the loop to stop and waits a bounded time for it. Safe to call
    /// more than once.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Discovery responder did not stop within {:?}", STOP_GRACE);
            }
            info!("Discovery responder stopped");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    info: Arc<RwLock<ResponderConfig>>,
    directory: Arc<dyn UserDirectory>,
    last_activity: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    last_activity.store(crate::now_unix_secs(), Ordering::Relaxed);
                    let data = buf[..len].to_vec();
                    tokio::spawn(handle_request(
                        socket.clone(),
                        data,
                        src,
                        info.clone(),
                        directory.clone(),
                    ));
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!("Discovery responder receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    debug!("Discovery responder loop exited");
}

async fn handle_request(
    socket: Arc<UdpSocket>,
    data: Vec<u8>,
    src: SocketAddr,
    info: Arc<RwLock<ResponderConfig>>,
    directory: Arc<dyn UserDirectory>,
) {
    if protocol::decode_request(&data).is_none() {
        debug!("Ignoring non-discovery datagram from {}", src);
        return;
    }

    let users_count = directory.online_users();
    let response = build_response(&info.read(), users_count, crate::now_unix_f64());
    let packet = match protocol::encode(&DiscoveryMessage::ServerResponse(response)) {
        Ok(p) => p,
        Err(e) => {
            error!("Cannot encode discovery response: {}", e);
            return;
        }
    };

    match socket.send_to(&packet, src).await {
        Ok(_) => debug!("Answered discovery request from {}", src),
        Err(e) => warn!("Failed to answer discovery request from {}: {}", src, e),
    }
}

fn build_response(info: &ResponderConfig, users_count: u32, timestamp: f64) -> DiscoveryResponse {
    DiscoveryResponse {
        name: info.name.clone(),
        port: info.server_port,
        users_count,
        password_required: info.password_required,
        description: info.description.clone(),
        version: info.version.clone(),
        max_users: info.max_users,
        timestamp,
    }
}

/// Encodes the largest response `info` can produce.
fn check_fits(info: &ResponderConfig) -> Result<(), DiscoveryError> {
    let widest = build_response(info, u32::MAX, f64::MAX);
    protocol::encode(&DiscoveryMessage::ServerResponse(widest)).map(|_| ())
}

/// Binds a broadcast-capable UDP socket with address reuse enabled, using
/// [`socket2`] so the options are set before the bind.
fn bind_reusable_udp(addr: SocketAddr) -> Result<UdpSocket, DiscoveryError> {
    let bind_err = |source| DiscoveryError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("SO_REUSEADDR failed (non-fatal): {}", e);
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Err(e) = socket.set_reuse_port(true) {
            warn!("SO_REUSEPORT failed (non-fatal): {}", e);
        }
    }
    socket.set_broadcast(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}
