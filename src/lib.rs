//! LAN chat core.
//!
//! Two independent subsystems live here:
//!
//! * [`discovery`]: UDP broadcast request/response used to find chat servers
//!   on the local segment, a client-side registry that ages entries offline,
//!   and a background loop that keeps the registry fresh.
//! * [`session`]: one user's long-lived WebSocket connection with an explicit
//!   connect → authenticate → active ⇄ reconnect state machine.
//!
//! [`hub`] is the small server-side counterpart of the session protocol, and
//! [`presence`] holds the collaborator traits both sides consume.

pub mod config;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod presence;
pub mod session;
pub mod store;

pub use config::AppConfig;
pub use discovery::{
    prober::{check_server_availability, Prober},
    protocol::{DiscoveryRequest, DiscoveryResponse},
    registry::ServerRegistry,
    responder::{Responder, ResponderConfig, ResponderStatus},
    service::{DiscoveryOptions, DiscoveryService, SubscriberId},
    ServerDescriptor,
};
pub use error::{DiscoveryError, SessionError};
pub use hub::Hub;
pub use presence::{HttpPresence, NoopPresence, OnlineCounter, PresenceUpdater, UserDirectory};
pub use session::{
    CloseReason, Session, SessionConfig, SessionHandle, SessionObservers, SessionSnapshot,
    SessionState, SessionStatus,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current UNIX timestamp in seconds.
pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current UNIX time as fractional seconds, used for wire timestamps.
pub(crate) fn now_unix_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
