//! XChaCha20-Poly1305 AEAD encryption
//!
//! Every frame of an encrypted stream is sealed under the stream key. The
//! nonce is the big-endian frame counter, left-padded to 24 bytes, so a
//! stream key must never encrypt two frames with the same counter.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};

use crate::core::{CryptoError, AEAD_NONCE_SIZE, AEAD_TAG_SIZE};

use super::SecretKey;

/// Construct the nonce for frame `counter`.
pub fn frame_nonce(counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[AEAD_NONCE_SIZE - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// # Returns
/// Ciphertext with appended 16-byte Poly1305 tag
pub fn encrypt(
    key: &SecretKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(xnonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
///
/// Returns the plaintext, or an error if authentication fails.
pub fn decrypt(
    key: &SecretKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(xnonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SECRET_KEY_SIZE;

    fn key() -> SecretKey {
        SecretKey::from_bytes([0x11; SECRET_KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let nonce = frame_nonce(3);
        let ct = encrypt(&key(), &nonce, b"hdr", b"hello").unwrap();
        assert_eq!(ct.len(), 5 + AEAD_TAG_SIZE);
        assert_eq!(decrypt(&key(), &nonce, b"hdr", &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let nonce = frame_nonce(0);
        let ct = encrypt(&key(), &nonce, b"hdr", b"hello").unwrap();
        assert_eq!(
            decrypt(&key(), &nonce, b"other", &ct),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrong_counter_fails() {
        let ct = encrypt(&key(), &frame_nonce(1), b"", b"hello").unwrap();
        assert!(decrypt(&key(), &frame_nonce(2), b"", &ct).is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        assert_eq!(
            decrypt(&key(), &frame_nonce(0), b"", &[0u8; 4]),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_frame_nonce_layout() {
        let nonce = frame_nonce(0x0102);
        assert_eq!(&nonce[..16], &[0u8; 16]);
        assert_eq!(&nonce[22..], &[0x01, 0x02]);
    }
}
