//! Identifiers shared across layers.

use std::fmt;
use std::sync::Arc;

use super::constants::HASH_SIZE;

/// Local identifier of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContactId(pub u32);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact#{}", self.0)
    }
}

/// Local identifier of a contact we are still trying to add by rendezvous.
///
/// Streams belonging to a pending contact carry no [`ContactId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingContactId(pub u32);

impl fmt::Display for PendingContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending#{}", self.0)
    }
}

/// Identifier of a transport plugin (e.g. `"bluetooth"`, `"tor"`, `"lan"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(Arc<str>);

impl TransportId {
    /// Create a transport id.
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransportId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; HASH_SIZE]);

        impl $name {
            /// Create from raw bytes.
            pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
                Self(bytes)
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:02x}{:02x}{:02x}{:02x}..)", stringify!($name),
                    self.0[0], self.0[1], self.0[2], self.0[3])
            }
        }
    };
}

hash_id!(
    /// Identifier of a group (forum, blog, private conversation).
    GroupId
);

hash_id!(
    /// Content-addressed identifier of a message: the hash of its complete
    /// signed encoding.
    MessageId
);

hash_id!(
    /// Identifier of an author, derived from name and public key.
    AuthorId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_id_display_is_hex() {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let id = MessageId::from_bytes(bytes);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab00"));
        assert!(s.ends_with("01"));
    }

    #[test]
    fn test_transport_id_equality() {
        assert_eq!(TransportId::new("tor"), TransportId::from("tor"));
        assert_ne!(TransportId::new("tor"), TransportId::new("lan"));
        assert_eq!(TransportId::new("bt").as_str(), "bt");
    }
}
