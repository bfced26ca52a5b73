//! Noise_IK key agreement.
//!
//! Contacts already know each other's static public keys, so the handshake
//! completes in one round trip:
//!
//! ```text
//! Noise_IK(s, rs):
//!   <- s                    # Bob's static key known to Alice
//!   ...
//!   -> e, es, s, ss         # Alice sends ephemeral + encrypted static
//!   <- e, ee, se            # Bob sends ephemeral, completes DH
//! ```
//!
//! Alice (the side whose static public key sorts lower) is always the Noise
//! initiator. The master key is derived from the final handshake hash.

use snow::{params::NoiseParams, Builder, HandshakeState};

use crate::core::{CryptoError, HASH_SIZE, MAX_HANDSHAKE_MESSAGE_LENGTH, PUBLIC_KEY_SIZE};

use super::{kdf, SecretKey, StaticKeypair};

/// Noise protocol pattern.
const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

fn params() -> Result<NoiseParams, CryptoError> {
    NOISE_PATTERN
        .parse()
        .map_err(|e: snow::Error| CryptoError::HandshakeFailed(e.to_string()))
}

fn handshake_hash(state: &HandshakeState) -> [u8; HASH_SIZE] {
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&state.get_handshake_hash()[..HASH_SIZE]);
    hash
}

/// Output of a completed Noise exchange.
pub struct NoiseOutcome {
    /// The handshake hash, identical on both sides.
    pub handshake_hash: [u8; HASH_SIZE],
}

impl NoiseOutcome {
    /// Derive the master key and consume the outcome.
    pub fn into_master_key(self) -> Result<SecretKey, CryptoError> {
        kdf::derive_master_key(&self.handshake_hash)
    }
}

/// Handshake state machine for Alice.
pub struct InitiatorHandshake {
    state: HandshakeState,
}

impl InitiatorHandshake {
    /// Create a new initiator handshake.
    ///
    /// # Arguments
    /// * `local_keypair` - Our static keypair
    /// * `remote_public` - The contact's static public key
    pub fn new(
        local_keypair: &StaticKeypair,
        remote_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Self, CryptoError> {
        let state = Builder::new(params()?)
            .local_private_key(local_keypair.private_key())
            .remote_public_key(remote_public)
            .build_initiator()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state })
    }

    /// Generate the first handshake message (-> e, es, s, ss).
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MESSAGE_LENGTH];
        let len = self
            .state
            .write_message(payload, &mut buf)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Process the response (<- e, ee, se) and finish.
    pub fn read_message(mut self, message: &[u8]) -> Result<(Vec<u8>, NoiseOutcome), CryptoError> {
        let mut payload = vec![0u8; MAX_HANDSHAKE_MESSAGE_LENGTH];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        payload.truncate(len);

        if !self.state.is_handshake_finished() {
            return Err(CryptoError::HandshakeFailed("handshake incomplete".into()));
        }
        let handshake_hash = handshake_hash(&self.state);

        Ok((payload, NoiseOutcome { handshake_hash }))
    }
}

/// Handshake state machine for Bob.
pub struct ResponderHandshake {
    state: HandshakeState,
}

impl ResponderHandshake {
    /// Create a new responder handshake.
    pub fn new(local_keypair: &StaticKeypair) -> Result<Self, CryptoError> {
        let state = Builder::new(params()?)
            .local_private_key(local_keypair.private_key())
            .build_responder()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state })
    }

    /// Process Alice's message (-> e, es, s, ss).
    ///
    /// Returns the payload and Alice's static public key, which the caller
    /// must compare against the expected contact.
    pub fn read_message(
        &mut self,
        message: &[u8],
    ) -> Result<(Vec<u8>, [u8; PUBLIC_KEY_SIZE]), CryptoError> {
        let mut payload = vec![0u8; MAX_HANDSHAKE_MESSAGE_LENGTH];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        payload.truncate(len);

        let remote_static = self
            .state
            .get_remote_static()
            .ok_or_else(|| CryptoError::HandshakeFailed("no remote static key".into()))?;
        if remote_static.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKey);
        }

        let mut remote_public = [0u8; PUBLIC_KEY_SIZE];
        remote_public.copy_from_slice(remote_static);

        Ok((payload, remote_public))
    }

    /// Generate the response (<- e, ee, se) and finish.
    pub fn write_message(mut self, payload: &[u8]) -> Result<(Vec<u8>, NoiseOutcome), CryptoError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MESSAGE_LENGTH];
        let len = self
            .state
            .write_message(payload, &mut buf)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);

        if !self.state.is_handshake_finished() {
            return Err(CryptoError::HandshakeFailed("handshake incomplete".into()));
        }
        let handshake_hash = handshake_hash(&self.state);

        Ok((buf, NoiseOutcome { handshake_hash }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let mut initiator = InitiatorHandshake::new(&alice, bob.public_key()).unwrap();
        let mut responder = ResponderHandshake::new(&bob).unwrap();

        let init_message = initiator.write_message(b"").unwrap();
        let (_, remote_public) = responder.read_message(&init_message).unwrap();
        assert_eq!(&remote_public, alice.public_key());

        let (resp_message, bob_outcome) = responder.write_message(b"").unwrap();
        let (_, alice_outcome) = initiator.read_message(&resp_message).unwrap();

        assert_eq!(alice_outcome.handshake_hash, bob_outcome.handshake_hash);

        let k1 = alice_outcome.into_master_key().unwrap();
        let k2 = bob_outcome.into_master_key().unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_handshake_wrong_key_fails() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();
        let wrong = StaticKeypair::generate();

        let mut initiator = InitiatorHandshake::new(&alice, wrong.public_key()).unwrap();
        let mut responder = ResponderHandshake::new(&bob).unwrap();

        let init_message = initiator.write_message(b"").unwrap();
        assert!(responder.read_message(&init_message).is_err());
    }

    #[test]
    fn test_fresh_handshakes_give_fresh_keys() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let run = || {
            let mut initiator = InitiatorHandshake::new(&alice, bob.public_key()).unwrap();
            let mut responder = ResponderHandshake::new(&bob).unwrap();
            let m1 = initiator.write_message(b"").unwrap();
            responder.read_message(&m1).unwrap();
            let (m2, _) = responder.write_message(b"").unwrap();
            let (_, outcome) = initiator.read_message(&m2).unwrap();
            outcome.handshake_hash
        };

        assert_ne!(run(), run());
    }
}
