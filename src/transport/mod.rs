//! Transport layer
//!
//! Binds raw duplex channels from transport plugins to contacts:
//!
//! - **Key management**: [`KeyManager`] owns per-contact, per-transport key
//!   sets and allocates a [`StreamContext`] for every outgoing stream
//! - **Tag recognition**: [`TagRecognizer`] resolves the tag at the start of
//!   an inbound stream to a context
//! - **Encrypted streams**: [`StreamWriter`] and [`StreamReader`]
//! - **Plugin boundary**: [`TransportConnection`] and [`ConnectionControl`]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Sync sessions / connections      │
//! ├─────────────────────────────────────────┤
//! │  tagged, encrypted streams              │  ← This module
//! │  key rotation, tag recognition          │
//! ├─────────────────────────────────────────┤
//! │  transport plugin (duplex byte channel) │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod context;
mod keys;
mod properties;
mod stream;
mod tag;

pub use connection::*;
pub use context::StreamContext;
pub use keys::{KeyManager, KeyManagerBuilder, KeyManagerConfig, KeyOwner, KeySetId, TransportKeys};
pub use properties::TransportProperties;
pub use stream::{StreamReader, StreamWriter};
pub use tag::{RecognitionError, ReorderingWindow, TagRecognition, TagRecognizer};

#[cfg(test)]
pub(crate) use keys::tests as test_support;
