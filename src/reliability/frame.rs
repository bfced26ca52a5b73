//! Frame encoding and decoding for the ARQ layer.
//!
//! Data frame (13 to 1037 bytes):
//! ```text
//! +-------+------------------+-------------------+---------------+
//! | flags | sequence (8, BE) | payload (0..1024) | checksum (4)  |
//! +-------+------------------+-------------------+---------------+
//! ```
//!
//! Ack frame (17 bytes):
//! ```text
//! +------+------------------+--------------------+---------------+
//! | 0x80 | sequence (8, BE) | window (4, BE)     | checksum (4)  |
//! +------+------------------+--------------------+---------------+
//! ```
//!
//! The checksum is the first four bytes of BLAKE2s-256 over everything
//! before it, read big-endian.

use blake2::{Blake2s256, Digest};

use crate::core::{
    ACK_LENGTH, DATA_MAX_LENGTH, DATA_MIN_LENGTH, FRAME_FLAG_ACK, FRAME_FLAG_DATA, FRAME_FLAG_FIN,
    FRAME_FOOTER_LENGTH, FRAME_HEADER_LENGTH, MAX_PAYLOAD_LENGTH,
};

/// Compute the frame checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u32 {
    let digest = Blake2s256::digest(bytes);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Frame type, from the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Data.
    Data = FRAME_FLAG_DATA,
    /// Data, last segment of the stream.
    Fin = FRAME_FLAG_FIN,
    /// Acknowledgement.
    Ack = FRAME_FLAG_ACK,
}

impl FrameType {
    /// Parse a frame type from a byte. Unknown types return `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FRAME_FLAG_DATA => Some(Self::Data),
            FRAME_FLAG_FIN => Some(Self::Fin),
            FRAME_FLAG_ACK => Some(Self::Ack),
            _ => None,
        }
    }
}

/// A data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    bytes: Vec<u8>,
}

impl DataFrame {
    /// Build a data frame with a valid checksum.
    ///
    /// # Panics
    /// Debug builds assert that the payload fits in one frame.
    pub fn new(sequence_number: u64, payload: &[u8], last: bool) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LENGTH);
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LENGTH + payload.len() + FRAME_FOOTER_LENGTH);
        bytes.push(if last { FRAME_FLAG_FIN } else { FRAME_FLAG_DATA });
        bytes.extend_from_slice(&sequence_number.to_be_bytes());
        bytes.extend_from_slice(payload);
        let sum = checksum(&bytes);
        bytes.extend_from_slice(&sum.to_be_bytes());
        Self { bytes }
    }

    /// Wrap received bytes. Returns `None` if the length is outside
    /// [`DATA_MIN_LENGTH`, `DATA_MAX_LENGTH`].
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < DATA_MIN_LENGTH || bytes.len() > DATA_MAX_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Whether this is the last segment.
    pub fn is_last(&self) -> bool {
        self.bytes[0] == FRAME_FLAG_FIN
    }

    /// Sequence number.
    pub fn sequence_number(&self) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&self.bytes[1..FRAME_HEADER_LENGTH]);
        u64::from_be_bytes(seq)
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[FRAME_HEADER_LENGTH..self.bytes.len() - FRAME_FOOTER_LENGTH]
    }

    /// Payload length.
    pub fn payload_len(&self) -> usize {
        self.bytes.len() - FRAME_HEADER_LENGTH - FRAME_FOOTER_LENGTH
    }

    /// The checksum carried by the frame.
    pub fn checksum(&self) -> u32 {
        let n = self.bytes.len();
        u32::from_be_bytes([self.bytes[n - 4], self.bytes[n - 3], self.bytes[n - 2], self.bytes[n - 1]])
    }

    /// Whether the carried checksum matches the contents.
    pub fn is_checksum_valid(&self) -> bool {
        self.checksum() == checksum(&self.bytes[..self.bytes.len() - FRAME_FOOTER_LENGTH])
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// An acknowledgement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    bytes: [u8; ACK_LENGTH],
}

impl AckFrame {
    /// Build an ack for `sequence_number` advertising `window_size` bytes
    /// of free receive window.
    pub fn new(sequence_number: u64, window_size: u32) -> Self {
        let mut bytes = [0u8; ACK_LENGTH];
        bytes[0] = FRAME_FLAG_ACK;
        bytes[1..9].copy_from_slice(&sequence_number.to_be_bytes());
        bytes[9..13].copy_from_slice(&window_size.to_be_bytes());
        let sum = checksum(&bytes[..13]);
        bytes[13..].copy_from_slice(&sum.to_be_bytes());
        Self { bytes }
    }

    /// Parse an ack. Returns `None` for a wrong length, type or checksum.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; ACK_LENGTH] = bytes.try_into().ok()?;
        if bytes[0] != FRAME_FLAG_ACK {
            return None;
        }
        let frame = Self { bytes };
        let carried = u32::from_be_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
        (carried == checksum(&bytes[..13])).then_some(frame)
    }

    /// Acknowledged sequence number (0 for a pure window update).
    pub fn sequence_number(&self) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&self.bytes[1..9]);
        u64::from_be_bytes(seq)
    }

    /// Advertised receive window.
    pub fn window_size(&self) -> u32 {
        u32::from_be_bytes([self.bytes[9], self.bytes[10], self.bytes[11], self.bytes[12]])
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_layout() {
        let frame = DataFrame::new(0x0102, b"abc", false);
        let bytes = frame.as_bytes();
        assert_eq!(bytes.len(), DATA_MIN_LENGTH + 3);
        assert_eq!(bytes[0], FRAME_FLAG_DATA);
        assert_eq!(&bytes[1..9], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(frame.payload(), b"abc");
        assert_eq!(frame.sequence_number(), 0x0102);
        assert!(frame.is_checksum_valid());
        assert!(!frame.is_last());
    }

    #[test]
    fn test_fin_flag() {
        let frame = DataFrame::new(7, b"", true);
        assert!(frame.is_last());
        assert_eq!(FrameType::from_byte(frame.as_bytes()[0]), Some(FrameType::Fin));
        assert_eq!(frame.payload_len(), 0);
    }

    #[test]
    fn test_corrupted_checksum_detected() {
        let mut bytes = DataFrame::new(1, b"hello", false).as_bytes().to_vec();
        bytes[10] ^= 0x01;
        let frame = DataFrame::from_bytes(bytes).unwrap();
        assert!(!frame.is_checksum_valid());
    }

    #[test]
    fn test_data_length_bounds() {
        assert!(DataFrame::from_bytes(vec![0; DATA_MIN_LENGTH - 1]).is_none());
        assert!(DataFrame::from_bytes(vec![0; DATA_MAX_LENGTH + 1]).is_none());
        assert!(DataFrame::from_bytes(vec![0; DATA_MAX_LENGTH]).is_some());
    }

    #[test]
    fn test_ack_frame() {
        let ack = AckFrame::new(42, 8192);
        let parsed = AckFrame::parse(ack.as_bytes()).unwrap();
        assert_eq!(parsed.sequence_number(), 42);
        assert_eq!(parsed.window_size(), 8192);

        let mut bad = ack.as_bytes().to_vec();
        bad[12] ^= 0xFF;
        assert!(AckFrame::parse(&bad).is_none());
        assert!(AckFrame::parse(&bad[..16]).is_none());
    }

    #[test]
    fn test_unknown_frame_type() {
        assert_eq!(FrameType::from_byte(0x01), None);
        assert_eq!(FrameType::from_byte(FRAME_FLAG_ACK), Some(FrameType::Ack));
    }
}
