//! Error types for every layer.

use std::io;

use thiserror::Error;

use super::ids::{ContactId, TransportId};

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Malformed public or private key.
    #[error("invalid key material")]
    InvalidKey,

    /// Signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Errors raised by the persistence layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// No contact with this id.
    #[error("unknown contact {0}")]
    UnknownContact(ContactId),

    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Stored key material could not be ratcheted or expanded.
    #[error("key derivation failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors while reading or writing an encrypted stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying channel failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Frame failed authentication.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Frame header announced an impossible length.
    #[error("invalid frame length {0}")]
    InvalidLength(usize),

    /// Data arrived after the final frame, or a write after `finish`.
    #[error("stream already finished")]
    Finished,
}

/// Errors surfaced at the reliability layer boundary.
///
/// Frame-level corruption never shows up here; corrupt frames are dropped
/// and recovered by retransmission.
#[derive(Debug, Error)]
pub enum ReliabilityError {
    /// The peer did not make progress in time; the connection may still be
    /// alive.
    #[error("timed out")]
    Timeout,

    /// The layer was invalidated.
    #[error("connection closed")]
    Closed,

    /// Writing a frame to the transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ReliabilityError {
    /// Whether this is a timeout rather than a closed connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReliabilityError::Timeout)
    }
}

/// Protocol violations detected while binding a stream to a contact.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The inbound tag matched no known key material.
    #[error("unrecognised tag")]
    UnrecognisedTag,

    /// Expected a contact tag, got a rendezvous tag.
    #[error("expected contact tag, got rendezvous tag")]
    RendezvousTag,

    /// The stream belongs to another contact.
    #[error("wrong contact: expected {expected}, got {actual}")]
    WrongContact {
        /// Contact we expected.
        expected: ContactId,
        /// Contact the tag resolved to.
        actual: ContactId,
    },

    /// A handshake-mode stream where a rotation-mode stream was required.
    #[error("received handshake tag, expected rotation mode")]
    UnexpectedHandshakeMode,

    /// A rotation-mode stream where a handshake-mode stream was required.
    #[error("received rotation tag, expected handshake mode")]
    UnexpectedRotationMode,

    /// Key allocation still returned handshake mode after a successful
    /// handshake.
    #[error("got handshake mode context after handshaking")]
    HandshakeModeAfterHandshake,

    /// The peer authenticated with a key that does not belong to the
    /// contact.
    #[error("remote static key does not match contact")]
    WrongPeerKey,
}

/// Errors from the handshake protocol.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Key agreement failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The handshake stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Contact lookup or key storage failed.
    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// A handshake message exceeded the size limit.
    #[error("handshake message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The peer ended its stream before the handshake completed.
    #[error("handshake stream ended early")]
    UnexpectedEof,

    /// The handshake did not complete in time.
    #[error("handshake timed out")]
    Timeout,
}

/// Errors from message encoding and validation.
///
/// Size checks run before any signing, so an `EncodeError` for oversized
/// content means no cryptographic work was done.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A field exceeded its byte-length ceiling.
    #[error("{field} too long: {len} bytes (max {max})")]
    TooLong {
        /// Which field.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Ceiling.
        max: usize,
    },

    /// A field that must not be empty was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// Canonical encoding was malformed.
    #[error("format error: {0}")]
    Format(String),

    /// Signing or verification failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors from sync sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The encrypted stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// A record was malformed.
    #[error("record format error: {0}")]
    Format(String),

    /// Storing received data failed.
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

/// Errors that end a duplex connection attempt.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No key material for the contact/transport pair.
    #[error("could not allocate stream context for {contact} on {transport}")]
    Allocation {
        /// Contact.
        contact: ContactId,
        /// Transport.
        transport: TransportId,
    },

    /// The peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Persistence failed.
    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// The encrypted stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// A sync session failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}
