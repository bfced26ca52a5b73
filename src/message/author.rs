//! Author identities.

use crate::bdf_list;
use crate::core::{AuthorId, EncodeError, FORMAT_VERSION, MAX_AUTHOR_NAME_LENGTH, PUBLIC_KEY_SIZE};
use crate::crypto::{labelled_hash, SigningKeypair};

const ID_LABEL: &str = "thicket/author_id";

/// A pseudonymous author as seen by others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    id: AuthorId,
    format_version: u8,
    name: String,
    public_key: [u8; PUBLIC_KEY_SIZE],
}

impl Author {
    /// Id derived from format version, name and public key.
    pub fn id(&self) -> AuthorId {
        self.id
    }

    /// Identity format version.
    pub fn format_version(&self) -> u8 {
        self.format_version
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ed25519 public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public_key
    }
}

/// An author whose signing key we hold.
#[derive(Debug, Clone)]
pub struct LocalAuthor {
    author: Author,
    keypair: SigningKeypair,
}

impl LocalAuthor {
    /// Public identity.
    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Signing keypair.
    pub fn keypair(&self) -> &SigningKeypair {
        &self.keypair
    }
}

/// Compute an author id.
pub fn author_id(format_version: u8, name: &str, public_key: &[u8]) -> AuthorId {
    let encoded = bdf_list![i64::from(format_version), name, public_key].to_bytes();
    AuthorId::from_bytes(labelled_hash(ID_LABEL, &[&encoded]))
}

/// Builds [`Author`]s and [`LocalAuthor`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorFactory;

impl AuthorFactory {
    /// Describe a remote author.
    pub fn create_author(
        &self,
        name: &str,
        public_key: [u8; PUBLIC_KEY_SIZE],
    ) -> Result<Author, EncodeError> {
        check_name(name)?;
        Ok(Author {
            id: author_id(FORMAT_VERSION, name, &public_key),
            format_version: FORMAT_VERSION,
            name: name.to_owned(),
            public_key,
        })
    }

    /// Create a new local author with a fresh signing keypair.
    pub fn create_local_author(&self, name: &str) -> Result<LocalAuthor, EncodeError> {
        self.local_author_from_keypair(name, SigningKeypair::generate())
    }

    /// Rebuild a local author around an existing keypair.
    pub fn local_author_from_keypair(
        &self,
        name: &str,
        keypair: SigningKeypair,
    ) -> Result<LocalAuthor, EncodeError> {
        let author = self.create_author(name, keypair.public_key())?;
        Ok(LocalAuthor { author, keypair })
    }
}

fn check_name(name: &str) -> Result<(), EncodeError> {
    if name.is_empty() {
        return Err(EncodeError::Empty("author name"));
    }
    if name.len() > MAX_AUTHOR_NAME_LENGTH {
        return Err(EncodeError::TooLong {
            field: "author name",
            len: name.len(),
            max: MAX_AUTHOR_NAME_LENGTH,
        });
    }
    Ok(())
}
