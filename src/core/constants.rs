//! Protocol constants.
//!
//! Values marked as wire-visible are fixed by the protocol and MUST NOT be
//! changed without bumping the relevant version.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC SIZES
// =============================================================================

/// Symmetric key size (tag keys, header keys, master keys).
pub const SECRET_KEY_SIZE: usize = 32;

/// X25519 / Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// BLAKE2s-256 output size, also the size of every content-addressed id.
pub const HASH_SIZE: usize = 32;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

// =============================================================================
// STREAMS & TAGS (wire-visible)
// =============================================================================

/// Version mixed into every tag so that tags from other versions never match.
pub const PROTOCOL_VERSION: u16 = 4;

/// Length of the pseudo-random tag that starts every stream.
pub const TAG_LENGTH: usize = 16;

/// Stream frame header: flags (1) + payload length (2, BE).
pub const STREAM_FRAME_HEADER_LENGTH: usize = 3;

/// Maximum plaintext payload carried by one stream frame.
pub const MAX_STREAM_FRAME_PAYLOAD: usize = 1024;

/// Stream frame flag marking the last frame of a stream.
pub const STREAM_FLAG_FINAL: u8 = 0x01;

/// Number of stream numbers per rotation period that are recognised ahead
/// of the lowest unseen one.
pub const REORDERING_WINDOW_SIZE: u64 = 32;

/// Default length of a key rotation period.
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Reference timestamp (1 April 2021 00:00 UTC, in milliseconds) stamped on
/// rotation keys produced by a handshake.
///
/// The handshake does not exchange a timestamp yet, so both peers use this
/// fixed value.
pub const HANDSHAKE_KEY_TIMESTAMP: u64 = 1_617_235_200_000;

/// Upper bound for a single handshake message.
pub const MAX_HANDSHAKE_MESSAGE_LENGTH: usize = 1024;

/// Default bound on the whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// SYNC RECORDS (wire-visible)
// =============================================================================

/// Length of the random nonce carried by a priority record.
pub const PRIORITY_NONCE_BYTES: usize = 16;

/// Record protocol version.
pub const RECORD_PROTOCOL_VERSION: u8 = 0;

/// Record header: version (1) + type (1) + payload length (2, BE).
pub const RECORD_HEADER_LENGTH: usize = 4;

/// Maximum record payload length.
pub const MAX_RECORD_PAYLOAD_LENGTH: usize = 48 * 1024;

// =============================================================================
// RELIABILITY LAYER (wire-visible)
// =============================================================================

/// Frame type byte: plain data segment.
pub const FRAME_FLAG_DATA: u8 = 0x00;

/// Frame type byte: final data segment.
pub const FRAME_FLAG_FIN: u8 = 0x40;

/// Frame type byte: acknowledgement.
pub const FRAME_FLAG_ACK: u8 = 0x80;

/// Frame header: type (1) + sequence number (8, BE).
pub const FRAME_HEADER_LENGTH: usize = 9;

/// Frame footer: checksum (4, BE).
pub const FRAME_FOOTER_LENGTH: usize = 4;

/// Maximum payload carried by one data frame.
pub const MAX_PAYLOAD_LENGTH: usize = 1024;

/// Smallest valid data frame (empty payload).
pub const DATA_MIN_LENGTH: usize = FRAME_HEADER_LENGTH + FRAME_FOOTER_LENGTH;

/// Largest valid data frame.
pub const DATA_MAX_LENGTH: usize = DATA_MIN_LENGTH + MAX_PAYLOAD_LENGTH;

/// Ack frame: header + window size (4, BE) + footer.
pub const ACK_LENGTH: usize = FRAME_HEADER_LENGTH + 4 + FRAME_FOOTER_LENGTH;

/// Receive window budget a fresh receiver starts with.
pub const MAX_WINDOW_SIZE: usize = 8 * MAX_PAYLOAD_LENGTH;

/// How long `read()` waits for the next in-order frame.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long `write()` waits for window space.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Retransmission timer granularity.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(1000);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Initial RTT variance before any sample is taken.
pub const INITIAL_RTT_VAR: Duration = Duration::from_millis(3000);

// =============================================================================
// MESSAGES
// =============================================================================

/// Format version of author identities.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum message body length.
pub const MAX_MESSAGE_BODY_LENGTH: usize = 32 * 1024;

/// Maximum author name length in UTF-8 bytes.
pub const MAX_AUTHOR_NAME_LENGTH: usize = 50;

/// Maximum post text length in UTF-8 bytes.
pub const MAX_POST_TEXT_LENGTH: usize = 30 * 1024;

/// Maximum comment text length in UTF-8 bytes.
pub const MAX_COMMENT_TEXT_LENGTH: usize = 2000;
