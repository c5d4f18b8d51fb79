//! Multi-transport message routing and anonymity core.
//!
//! Orchestrates how encrypted message envelopes travel between devices over
//! three interchangeable transports — direct WebRTC, an external onion
//! overlay (Tor/Lokinet via a local controller), and a built-in
//! source-routed onion circuit over peer relays — together with a
//! pairing/rendezvous subsystem and a per-conversation transport manager.
//!
//! Envelope contents are opaque to this crate; encryption, storage, and UI
//! are external collaborators (see each module's doc comment for its
//! specific seam).

pub mod circuit;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod onion_client;
pub mod outbox;
pub mod outbox_sqlite;
pub mod packet;
pub mod pairing;
pub mod relay;
pub mod rendezvous;
pub mod route_controller;
pub mod router;
pub mod signing;
pub mod transport;

pub use config::{CoreConfig, NetConfig, NetworkMode};
pub use context::CoreContext;
pub use error::CoreError;
pub use packet::TransportPacket;
