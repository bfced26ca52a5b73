//! Stream contexts.

use crate::core::{ContactId, PendingContactId, TransportId};
use crate::crypto::{KeyMode, SecretKey, Tag};

/// Key material bound to one direction of one connection.
///
/// Issued by the [`KeyManager`](super::KeyManager) either when allocating an
/// outgoing stream or when recognising an incoming tag. A context is not
/// `Clone`: it is moved into exactly one [`StreamWriter`](super::StreamWriter)
/// or [`StreamReader`](super::StreamReader).
#[derive(Debug)]
pub struct StreamContext {
    contact_id: Option<ContactId>,
    pending_contact_id: Option<PendingContactId>,
    transport_id: TransportId,
    tag: Tag,
    header_key: SecretKey,
    period: u64,
    stream_number: u64,
    mode: KeyMode,
}

impl StreamContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        contact_id: Option<ContactId>,
        pending_contact_id: Option<PendingContactId>,
        transport_id: TransportId,
        tag: Tag,
        header_key: SecretKey,
        period: u64,
        stream_number: u64,
        mode: KeyMode,
    ) -> Self {
        Self {
            contact_id,
            pending_contact_id,
            transport_id,
            tag,
            header_key,
            period,
            stream_number,
            mode,
        }
    }

    /// The contact, or `None` for a rendezvous stream.
    pub fn contact_id(&self) -> Option<ContactId> {
        self.contact_id
    }

    /// The pending contact of a rendezvous stream.
    pub fn pending_contact_id(&self) -> Option<PendingContactId> {
        self.pending_contact_id
    }

    /// The transport.
    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    /// The stream's tag.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// The header key of the stream's rotation period.
    pub fn header_key(&self) -> &SecretKey {
        &self.header_key
    }

    /// Rotation period the keys belong to.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Stream number within the period.
    pub fn stream_number(&self) -> u64 {
        self.stream_number
    }

    /// Key mode.
    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// Whether this context may only be used to run a handshake.
    pub fn is_handshake_mode(&self) -> bool {
        self.mode == KeyMode::Handshake
    }
}
