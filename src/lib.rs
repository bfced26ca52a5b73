//! # Thicket
//!
//! Secure duplex synchronization between contacts over heterogeneous
//! transports.
//!
//! A transport plugin supplies a connected byte channel. Thicket binds it to
//! a contact with tagged, encrypted streams, bootstraps rotation keys with a
//! Noise handshake the first time two contacts meet, and then runs a pair of
//! sync sessions over it:
//!
//! - **Keys**: per-contact, per-transport key sets rotated by period
//! - **Streams**: every stream starts with a pseudo-random tag and carries
//!   authenticated frames
//! - **Connections**: outgoing and incoming duplex connections with
//!   priority negotiation when both peers dial at once
//! - **Reliability**: sliding-window ARQ for transports that deliver
//!   unreliable frames
//! - **Messages**: content-addressed, signed messages with canonical
//!   encodings
//!
//! ## Feature Flags
//!
//! - `crypto`: Keys, key derivation, AEAD, Noise IK and signatures
//! - `transport`: Key management, tag recognition, encrypted streams and the
//!   storage interface
//! - `reliability`: Sliding-window ARQ
//! - `message`: Canonical encoding, message and author ids, signed posts
//! - `sync`: Sync records and sessions
//! - `connection`: Handshake, duplex connections and the registry
//!
//! All are enabled by default.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use thicket::prelude::*;
//!
//! # async fn run(db: MemoryDatabase, connection: TransportConnection) -> Result<(), ConnectionError> {
//! let identity = StaticKeypair::generate();
//! let config = KeyManagerBuilder::new().transport("tor").build();
//! let keys = Arc::new(KeyManager::open(config, identity, Arc::new(db.clone()), Arc::new(SystemClock))?);
//! keys.add_contact(ContactId(1))?;
//!
//! let outbox = Arc::new(Outbox::new());
//! let sink = Arc::new(MemorySink::default());
//! let sessions = Arc::new(OutboxSessionFactory::new(outbox, sink));
//! let factory = Arc::new(SyncConnectionFactory::new(keys, Arc::new(db), sessions, ConnectionConfig::default()));
//!
//! factory
//!     .create_outgoing_connection(ContactId(1), TransportId::new("tor"), connection)
//!     .run()
//!     .await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Transport layer and its storage interface (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod db;

// Reliability layer (feature-gated)
#[cfg(feature = "reliability")]
#[cfg_attr(docsrs, doc(cfg(feature = "reliability")))]
pub mod reliability;

// Message encoding (feature-gated)
#[cfg(feature = "message")]
#[cfg_attr(docsrs, doc(cfg(feature = "message")))]
pub mod message;

// Sync layer (feature-gated)
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;

// Duplex connections (feature-gated)
#[cfg(feature = "connection")]
#[cfg_attr(docsrs, doc(cfg(feature = "connection")))]
pub mod connection;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{is_alice, KeyMode, SecretKey, SigningKeypair, StaticKeypair, Tag};

    #[cfg(feature = "transport")]
    pub use crate::db::{Contact, Database, MemoryDatabase};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        BoxedRead, BoxedWrite, ConnectionControl, KeyManager, KeyManagerBuilder, KeyManagerConfig,
        StreamContext, StreamReader, StreamWriter, TagRecognition, TagRecognizer, TransportConnection,
        TransportProperties,
    };

    #[cfg(feature = "reliability")]
    pub use crate::reliability::{ReliabilityConfig, ReliabilityConfigBuilder, ReliabilityLayer, WriteHandler};

    #[cfg(feature = "message")]
    pub use crate::message::{
        Author, AuthorFactory, LocalAuthor, Message, MessageEncoder, MessageFactory, MessageValidator,
    };

    #[cfg(feature = "sync")]
    pub use crate::sync::{
        Interrupter, MemorySink, MessageSink, Outbox, OutboxSessionFactory, Priority, SyncSession,
        SyncSessionFactory,
    };

    #[cfg(feature = "connection")]
    pub use crate::connection::{
        ConnectionConfig, ConnectionConfigBuilder, ConnectionEvent, ConnectionRegistry, HandshakeManager,
        IncomingDuplexSyncConnection, OutgoingDuplexSyncConnection, SyncConnectionFactory,
    };
}

// Re-export commonly used items at crate root
pub use core::{ConnectionError, ContactId, TransportId};

#[cfg(feature = "connection")]
pub use connection::SyncConnectionFactory;
