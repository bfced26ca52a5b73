//! Cryptographic primitives.
//!
//! - X25519 static keys and Noise_IK handshakes
//! - HKDF-SHA256 key derivation and rotation
//! - Keyed BLAKE2s stream tags
//! - XChaCha20-Poly1305 frame encryption
//! - Ed25519 signatures and labelled BLAKE2s hashes

pub mod aead;
mod hash;
pub mod kdf;
mod keys;
pub mod noise;
pub mod signature;

pub use hash::labelled_hash;
pub use kdf::{KeyMode, Tag};
pub use keys::{is_alice, SecretKey, StaticKeypair};
pub use noise::{InitiatorHandshake, NoiseOutcome, ResponderHandshake};
pub use signature::SigningKeypair;
