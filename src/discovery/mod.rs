//! UDP broadcast server discovery.
//!
//! ```text
//!   Prober ──request──▶ (255.255.255.255:37020) ──▶ Responder
//!     ▲                                                │
//!     └──────────── unicast server_response ◀──────────┘
//!     │
//!     ▼
//!  ServerRegistry (merge / sweep_offline) ◀── DiscoveryService (periodic)
//!                                                   │
//!                                          subscriber callbacks
//! ```
//!
//! The protocol is best effort: no retransmission, no acknowledgement beyond
//! the response itself. Malformed datagrams are dropped where they are parsed.

pub mod descriptor;
pub mod prober;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod service;

pub use descriptor::ServerDescriptor;
