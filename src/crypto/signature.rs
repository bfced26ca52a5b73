//! Ed25519 signatures with label-based domain separation.
//!
//! The signed preimage is `BE32(len(label)) || label || message`, so a
//! signature made for one purpose can never verify under another label.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::core::{CryptoError, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

fn preimage(label: &str, message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + label.len() + message.len());
    buf.extend_from_slice(&(label.len() as u32).to_be_bytes());
    buf.extend_from_slice(label.as_bytes());
    buf.extend_from_slice(message);
    buf
}

/// An author's signing keypair.
#[derive(Clone)]
pub struct SigningKeypair {
    key: SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its private key.
    pub fn from_private(private: &[u8; PRIVATE_KEY_SIZE]) -> Self {
        Self {
            key: SigningKey::from_bytes(private),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.key.verifying_key().to_bytes()
    }

    /// Sign `message` under `label`.
    pub fn sign(&self, label: &str, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.key.sign(&preimage(label, message)).to_bytes()
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &format_args!("{:02x?}", &self.public_key()[..4]))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Verify a signature made by [`SigningKeypair::sign`].
pub fn verify(
    public_key: &[u8],
    label: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let public: &[u8; PUBLIC_KEY_SIZE] = public_key.try_into().map_err(|_| CryptoError::InvalidKey)?;
    let signature: &[u8; SIGNATURE_SIZE] =
        signature.try_into().map_err(|_| CryptoError::InvalidSignature)?;

    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::InvalidKey)?;
    key.verify_strict(&preimage(label, message), &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign("test/label", b"payload");
        assert!(verify(&kp.public_key(), "test/label", b"payload", &sig).is_ok());
    }

    #[test]
    fn test_label_separates_domains() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign("a", b"bc");
        // Same concatenation, different split between label and message
        assert_eq!(
            verify(&kp.public_key(), "ab", b"c", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let sig = kp.sign("l", b"m");
        assert!(verify(&other.public_key(), "l", b"m", &sig).is_err());
    }

    #[test]
    fn test_malformed_inputs() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign("l", b"m");
        assert_eq!(verify(&[0u8; 5], "l", b"m", &sig), Err(CryptoError::InvalidKey));
        assert_eq!(
            verify(&kp.public_key(), "l", b"m", &sig[..10]),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_from_private_roundtrip() {
        let kp = SigningKeypair::generate();
        let bytes = kp.key.to_bytes();
        assert_eq!(SigningKeypair::from_private(&bytes).public_key(), kp.public_key());
    }
}
