//! Persistence interface.
//!
//! The core never talks to a concrete store. Everything it needs from
//! persistence goes through the [`Database`] trait: contact lookup, storage of
//! transport keys and storage of transport properties learned from
//! connections.

mod memory;

pub use memory::MemoryDatabase;

use crate::core::{ContactId, DbError, TransportId, PUBLIC_KEY_SIZE};
use crate::transport::{TransportKeys, TransportProperties};

/// A contact as seen by the transport core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Local id.
    pub id: ContactId,
    /// Display name.
    pub name: String,
    /// The contact's static X25519 public key, used for handshakes.
    pub handshake_public_key: [u8; PUBLIC_KEY_SIZE],
}

/// Storage used by the key manager and connections.
///
/// Every call is a transaction of its own and may fail with [`DbError`].
pub trait Database: Send + Sync + 'static {
    /// Look up a contact.
    fn get_contact(&self, id: ContactId) -> Result<Contact, DbError>;

    /// Insert or replace a key set. Key sets are identified by owner,
    /// transport and mode.
    fn store_transport_keys(&self, keys: &TransportKeys) -> Result<(), DbError>;

    /// Store several key sets in one transaction. Either all of them are
    /// stored or none are.
    fn store_transport_keys_batch(&self, keys: &[TransportKeys]) -> Result<(), DbError>;

    /// Load every stored key set.
    fn load_transport_keys(&self) -> Result<Vec<TransportKeys>, DbError>;

    /// Merge properties observed on a live connection into the contact's
    /// remote properties for a transport. Existing keys are overwritten.
    fn merge_remote_properties(
        &self,
        contact: ContactId,
        transport: &TransportId,
        properties: &TransportProperties,
    ) -> Result<(), DbError>;

    /// The contact's remote properties for a transport.
    fn get_remote_properties(
        &self,
        contact: ContactId,
        transport: &TransportId,
    ) -> Result<TransportProperties, DbError>;
}
