//! Sync records
//!
//! Everything a sync session sends travels as records inside an encrypted
//! stream.
//!
//! Wire format:
//! ```text
//! +0   Protocol Version (1 byte)
//! +1   Record Type (1 byte)
//! +2   Payload Length (2 bytes BE16)
//! +4   Payload (variable, at most 48 KiB)
//! ```

use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::{
    SessionError, MAX_RECORD_PAYLOAD_LENGTH, PRIORITY_NONCE_BYTES, RECORD_HEADER_LENGTH,
    RECORD_PROTOCOL_VERSION,
};
use crate::transport::{StreamReader, StreamWriter};

use super::Priority;

/// Known record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A raw message.
    Message = 1,
    /// A connection priority nonce.
    Priority = 5,
}

impl RecordType {
    /// Parse a type byte. Unknown types are `None` and are skipped by
    /// readers.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordType::Message),
            5 => Some(RecordType::Priority),
            _ => None,
        }
    }
}

/// One record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Type byte, possibly unknown to this version.
    pub record_type: u8,
    /// Payload.
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a record of a known type.
    pub fn new(record_type: RecordType, payload: Vec<u8>) -> Self {
        Self {
            record_type: record_type as u8,
            payload,
        }
    }

    /// A priority record.
    pub fn priority(priority: &Priority) -> Self {
        Self::new(RecordType::Priority, priority.nonce().to_vec())
    }

    /// The known type, if any.
    pub fn known_type(&self) -> Option<RecordType> {
        RecordType::from_byte(self.record_type)
    }

    /// Parse the payload of a priority record.
    pub fn to_priority(&self) -> Result<Priority, SessionError> {
        let nonce: [u8; PRIORITY_NONCE_BYTES] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::Format(format!("priority of {} bytes", self.payload.len())))?;
        Ok(Priority::from_nonce(nonce))
    }

    /// Encode header and payload.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        if self.payload.len() > MAX_RECORD_PAYLOAD_LENGTH {
            return Err(SessionError::Format(format!(
                "record payload too long: {} bytes",
                self.payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(RECORD_HEADER_LENGTH + self.payload.len());
        buf.push(RECORD_PROTOCOL_VERSION);
        buf.push(self.record_type);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Writes records to an encrypted stream.
pub struct RecordWriter<W> {
    stream: StreamWriter<W>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    /// Wrap a stream writer.
    pub fn new(stream: StreamWriter<W>) -> Self {
        Self { stream }
    }

    /// Buffer one record.
    pub async fn write_record(&mut self, record: &Record) -> Result<(), SessionError> {
        self.stream.write_all(&record.encode()?).await?;
        Ok(())
    }

    /// Push buffered records to the peer.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// End the stream.
    pub async fn finish(&mut self) -> Result<(), SessionError> {
        self.stream.finish().await?;
        Ok(())
    }
}

/// Reads records from an encrypted stream.
pub struct RecordReader<R> {
    stream: StreamReader<R>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Wrap a stream reader.
    pub fn new(stream: StreamReader<R>) -> Self {
        Self { stream }
    }

    /// Read the next record. Returns `None` at the end of the stream.
    pub async fn read_record(&mut self) -> Result<Option<Record>, SessionError> {
        let mut header = [0u8; RECORD_HEADER_LENGTH];
        if self.stream.read(&mut header[..1]).await? == 0 {
            return Ok(None);
        }
        self.stream.read_exact(&mut header[1..]).await?;
        if header[0] != RECORD_PROTOCOL_VERSION {
            return Err(SessionError::Format(format!("unsupported record version {}", header[0])));
        }
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if len > MAX_RECORD_PAYLOAD_LENGTH {
            return Err(SessionError::Format(format!("record payload too long: {len} bytes")));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(Some(Record {
            record_type: header[1],
            payload,
        }))
    }
}
