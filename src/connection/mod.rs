//! Duplex sync connections
//!
//! Turns a raw transport channel into a pair of sync sessions with a
//! contact:
//!
//! - **Handshake**: [`HandshakeManager`] agrees on rotation keys the first
//!   time two contacts connect
//! - **Connections**: [`OutgoingDuplexSyncConnection`] and
//!   [`IncomingDuplexSyncConnection`], created by [`SyncConnectionFactory`]
//! - **Registry**: [`ConnectionRegistry`] tracks live connections and keeps
//!   one per contact and transport when both peers dial at once
//!
//! ```text
//! dialler                                     listener
//!   | -- tag (handshake) -------------------->  |
//!   | <------------------- tag (handshake) --   |
//!   | <======== Noise IK, stream ends ========> |
//!   | -- tag (rotation) | priority | msgs ---> |
//!   | <------- tag (rotation) | msgs -------   |
//! ```

mod config;
mod duplex;
mod handshake;
mod incoming;
mod outgoing;
mod registry;

pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use duplex::SyncConnectionFactory;
pub use handshake::{HandshakeManager, HandshakeResult, HandshakeRole, NoiseHandshakeManager};
pub use incoming::IncomingDuplexSyncConnection;
pub use outgoing::OutgoingDuplexSyncConnection;
pub use registry::{ConnectionEvent, ConnectionId, ConnectionRegistry, InterruptibleConnection};
