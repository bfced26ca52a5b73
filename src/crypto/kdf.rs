//! Key derivation and rotation.
//!
//! Transport keys form a hash ratchet per direction:
//!
//! ```text
//! root ──(mode, direction, transport)──> secret[p0]
//! secret[p+1] = HKDF-Expand(secret[p], "thicket v4 rotate" || BE64(p))
//! tag_key[p]    = HKDF-Expand(secret[p], "thicket v4 tag")
//! header_key[p] = HKDF-Expand(secret[p], "thicket v4 header")
//! ```
//!
//! Old secrets are dropped (and zeroized) as periods advance, so a
//! compromise of current keys does not expose past streams.

use blake2::digest::Mac;
use blake2::Blake2sMac256;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::{CryptoError, TransportId, HASH_SIZE, PROTOCOL_VERSION, SECRET_KEY_SIZE, TAG_LENGTH};

use super::SecretKey;

/// A stream tag.
pub type Tag = [u8; TAG_LENGTH];

/// Which key set a secret belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMode {
    /// Keys derived from the static–static agreement, used only to run a
    /// handshake.
    Handshake,
    /// Keys derived from a handshake master key.
    Rotation,
}

impl KeyMode {
    fn label(self) -> &'static [u8] {
        match self {
            KeyMode::Handshake => b"thicket v4 handshake",
            KeyMode::Rotation => b"thicket v4 rotation",
        }
    }
}

fn expand(prk: &[u8], info: &[&[u8]]) -> Result<SecretKey, CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| CryptoError::KeyDerivationFailed)?;
    let mut okm = [0u8; SECRET_KEY_SIZE];
    hk.expand_multi_info(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive the master key from a completed Noise handshake hash.
pub fn derive_master_key(handshake_hash: &[u8; HASH_SIZE]) -> Result<SecretKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(b"thicket v4 master key"), handshake_hash);
    let mut okm = [0u8; SECRET_KEY_SIZE];
    hk.expand(b"thicket v4 master key", &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive the root of the handshake-mode keys from a static DH secret.
pub fn derive_handshake_root(static_dh: &[u8; 32]) -> Result<SecretKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(b"thicket v4 handshake root"), static_dh);
    let mut okm = [0u8; SECRET_KEY_SIZE];
    hk.expand(b"thicket v4 handshake root", &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive the secret for one direction of one transport at `period`.
///
/// `from_alice` selects the direction: Alice's outgoing secret equals Bob's
/// incoming secret.
pub fn derive_direction_secret(
    root: &SecretKey,
    mode: KeyMode,
    from_alice: bool,
    transport: &TransportId,
    period: u64,
) -> Result<SecretKey, CryptoError> {
    let direction: &[u8] = if from_alice { b"A" } else { b"B" };
    expand(
        root.as_bytes(),
        &[mode.label(), direction, transport.as_str().as_bytes(), &period.to_be_bytes()],
    )
}

/// Ratchet a period secret forward by one period.
pub fn rotate_secret(secret: &SecretKey, period: u64) -> Result<SecretKey, CryptoError> {
    expand(secret.as_bytes(), &[b"thicket v4 rotate", &period.to_be_bytes()])
}

/// Derive the tag key for a period secret.
pub fn derive_tag_key(secret: &SecretKey) -> Result<SecretKey, CryptoError> {
    expand(secret.as_bytes(), &[b"thicket v4 tag"])
}

/// Derive the header key for a period secret.
pub fn derive_header_key(secret: &SecretKey) -> Result<SecretKey, CryptoError> {
    expand(secret.as_bytes(), &[b"thicket v4 header"])
}

/// Derive the key that encrypts the frames of one stream.
pub fn derive_stream_key(header_key: &SecretKey, stream_number: u64) -> Result<SecretKey, CryptoError> {
    expand(header_key.as_bytes(), &[b"thicket v4 stream", &stream_number.to_be_bytes()])
}

/// Compute the tag for a stream number.
pub fn compute_tag(tag_key: &SecretKey, stream_number: u64) -> Result<Tag, CryptoError> {
    let mut mac = <Blake2sMac256 as Mac>::new_from_slice(tag_key.as_bytes())
        .map_err(|_| CryptoError::InvalidKey)?;
    mac.update(&PROTOCOL_VERSION.to_be_bytes());
    mac.update(&stream_number.to_be_bytes());
    let out = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LENGTH];
    tag.copy_from_slice(&out[..TAG_LENGTH]);
    Ok(tag)
}
