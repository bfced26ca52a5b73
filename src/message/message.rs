//! Content-addressed messages.

use crate::core::{EncodeError, GroupId, MessageId, HASH_SIZE, MAX_MESSAGE_BODY_LENGTH};
use crate::crypto::labelled_hash;

const ID_LABEL: &str = "thicket/message_id";

/// Raw header: group id (32) + timestamp (8, BE).
pub const MESSAGE_HEADER_LENGTH: usize = HASH_SIZE + 8;

/// A message in a group.
///
/// The id is never assigned: it is always the hash of the group id,
/// timestamp and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    group_id: GroupId,
    timestamp: u64,
    body: Vec<u8>,
}

impl Message {
    /// Content-addressed id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Group the message belongs to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Timestamp in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Encoded body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Wire form: header followed by the body.
    pub fn raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(MESSAGE_HEADER_LENGTH + self.body.len());
        raw.extend_from_slice(self.group_id.as_bytes());
        raw.extend_from_slice(&self.timestamp.to_be_bytes());
        raw.extend_from_slice(&self.body);
        raw
    }

    /// Parse the wire form, recomputing the id.
    pub fn from_raw(raw: &[u8]) -> Result<Self, EncodeError> {
        if raw.len() < MESSAGE_HEADER_LENGTH {
            return Err(EncodeError::Format(format!("message too short: {} bytes", raw.len())));
        }
        let (header, body) = raw.split_at(MESSAGE_HEADER_LENGTH);
        let mut group = [0u8; HASH_SIZE];
        group.copy_from_slice(&header[..HASH_SIZE]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&header[HASH_SIZE..]);
        MessageFactory.create_message(GroupId::from_bytes(group), u64::from_be_bytes(ts), body.to_vec())
    }
}

/// Compute the id a message with these fields has.
pub fn message_id(group_id: &GroupId, timestamp: u64, body: &[u8]) -> MessageId {
    MessageId::from_bytes(labelled_hash(
        ID_LABEL,
        &[group_id.as_bytes(), &timestamp.to_be_bytes(), body],
    ))
}

/// Builds [`Message`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageFactory;

impl MessageFactory {
    /// Stamp `body` with the group and timestamp and derive its id.
    pub fn create_message(
        &self,
        group_id: GroupId,
        timestamp: u64,
        body: Vec<u8>,
    ) -> Result<Message, EncodeError> {
        if body.len() > MAX_MESSAGE_BODY_LENGTH {
            return Err(EncodeError::TooLong {
                field: "message body",
                len: body.len(),
                max: MAX_MESSAGE_BODY_LENGTH,
            });
        }
        Ok(Message {
            id: message_id(&group_id, timestamp, &body),
            group_id,
            timestamp,
            body,
        })
    }
}
