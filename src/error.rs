use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("discovery socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("failed to encode discovery datagram: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("discovery datagram of {len} bytes exceeds the {max} byte limit")]
    DatagramTooLarge { len: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The session is not in the `Active` state; nothing was queued.
    #[error("not connected")]
    NotConnected,
    /// The session task has exited for good.
    #[error("session closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
