//! Handshake over paired handshake-mode streams.
//!
//! Both peers have written a handshake-mode tag and recognised the other's,
//! so each holds a [`StreamWriter`] and a [`StreamReader`]. Inside those
//! streams they run Noise IK:
//!
//! ```text
//! Alice (initiator)                          Bob (responder)
//!   | ---- len(2) | e, es, s, ss ----------------> |
//!   | <--- len(2) | e, ee, se -------------------- |
//!   | ---- final frame --------------------------> |
//!   | <--- final frame --------------------------- |
//! ```
//!
//! Alice is the peer whose static public key sorts lower. Each side ends its
//! stream and reads the peer's stream to its end, which leaves the raw
//! channel ready for the next stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::core::{ContactId, HandshakeError, ProtocolViolation, MAX_HANDSHAKE_MESSAGE_LENGTH};
use crate::crypto::{is_alice, InitiatorHandshake, ResponderHandshake, SecretKey, StaticKeypair};
use crate::db::Database;
use crate::transport::{BoxedRead, BoxedWrite, StreamReader, StreamWriter};

/// Which side of the key agreement we played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sent the first message; Alice for key derivation.
    Initiator,
    /// Answered it; Bob for key derivation.
    Responder,
}

/// Output of one handshake. Consume it once to commit rotation keys.
#[derive(Debug)]
pub struct HandshakeResult {
    /// Shared master key.
    pub master_key: SecretKey,
    /// Our role.
    pub role: HandshakeRole,
}

impl HandshakeResult {
    /// Whether we derive keys as Alice.
    pub fn is_alice(&self) -> bool {
        self.role == HandshakeRole::Initiator
    }
}

/// Runs the key agreement for a contact over established streams.
#[async_trait]
pub trait HandshakeManager: Send + Sync + 'static {
    /// Agree on a master key with `contact`, then end both streams.
    async fn handshake(
        &self,
        contact: ContactId,
        reader: &mut StreamReader<BoxedRead>,
        writer: &mut StreamWriter<BoxedWrite>,
    ) -> Result<HandshakeResult, HandshakeError>;
}

async fn write_message(writer: &mut StreamWriter<BoxedWrite>, message: &[u8]) -> Result<(), HandshakeError> {
    if message.len() > MAX_HANDSHAKE_MESSAGE_LENGTH {
        return Err(HandshakeError::MessageTooLarge(message.len()));
    }
    writer.write_all(&(message.len() as u16).to_be_bytes()).await?;
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message(reader: &mut StreamReader<BoxedRead>) -> Result<Vec<u8>, HandshakeError> {
    let mut len = [0u8; 2];
    if reader.read(&mut len[..1]).await? == 0 {
        return Err(HandshakeError::UnexpectedEof);
    }
    reader.read_exact(&mut len[1..]).await?;
    let len = u16::from_be_bytes(len) as usize;
    if len > MAX_HANDSHAKE_MESSAGE_LENGTH {
        return Err(HandshakeError::MessageTooLarge(len));
    }
    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await?;
    Ok(message)
}

/// [`HandshakeManager`] running Noise IK with our static identity against
/// the contact's stored handshake public key.
pub struct NoiseHandshakeManager {
    identity: StaticKeypair,
    db: Arc<dyn Database>,
    timeout: Duration,
}

impl NoiseHandshakeManager {
    /// Create a manager. The whole exchange, final frames included, must
    /// finish within `timeout`.
    pub fn new(identity: StaticKeypair, db: Arc<dyn Database>, timeout: Duration) -> Self {
        Self { identity, db, timeout }
    }

    async fn run(
        &self,
        contact: ContactId,
        reader: &mut StreamReader<BoxedRead>,
        writer: &mut StreamWriter<BoxedWrite>,
    ) -> Result<HandshakeResult, HandshakeError> {
        let remote = self.db.get_contact(contact)?.handshake_public_key;
        let role = if is_alice(self.identity.public_key(), &remote) {
            HandshakeRole::Initiator
        } else {
            HandshakeRole::Responder
        };
        debug!(contact = %contact, ?role, "starting handshake");

        let master_key = match role {
            HandshakeRole::Initiator => {
                let mut noise = InitiatorHandshake::new(&self.identity, &remote)?;
                write_message(writer, &noise.write_message(&[])?).await?;
                let reply = read_message(reader).await?;
                let (_, outcome) = noise.read_message(&reply)?;
                outcome.into_master_key()?
            }
            HandshakeRole::Responder => {
                let mut noise = ResponderHandshake::new(&self.identity)?;
                let first = read_message(reader).await?;
                let (_, remote_static) = noise.read_message(&first)?;
                if remote_static != remote {
                    return Err(ProtocolViolation::WrongPeerKey.into());
                }
                let (reply, outcome) = noise.write_message(&[])?;
                write_message(writer, &reply).await?;
                outcome.into_master_key()?
            }
        };

        writer.finish().await?;
        reader.drain().await?;
        info!(contact = %contact, ?role, "handshake complete");
        Ok(HandshakeResult { master_key, role })
    }
}

#[async_trait]
impl HandshakeManager for NoiseHandshakeManager {
    async fn handshake(
        &self,
        contact: ContactId,
        reader: &mut StreamReader<BoxedRead>,
        writer: &mut StreamWriter<BoxedWrite>,
    ) -> Result<HandshakeResult, HandshakeError> {
        tokio::time::timeout(self.timeout, self.run(contact, reader, writer))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, TransportId};
    use crate::db::{Contact, MemoryDatabase};
    use crate::transport::{memory_pair, KeyManager, KeyManagerBuilder, StreamContext, TagRecognizer};

    struct Peer {
        keys: Arc<KeyManager>,
        manager: NoiseHandshakeManager,
    }

    fn peer(identity: StaticKeypair, contact_public: [u8; 32], clock: Arc<ManualClock>) -> Peer {
        let db = MemoryDatabase::new();
        db.add_contact(Contact {
            id: ContactId(1),
            name: "peer".into(),
            handshake_public_key: contact_public,
        });
        let db: Arc<dyn Database> = Arc::new(db);
        let config = KeyManagerBuilder::new().transport("tor").build();
        let keys = Arc::new(KeyManager::open(config, identity.clone(), db.clone(), clock).unwrap());
        keys.add_contact(ContactId(1)).unwrap();
        Peer {
            keys,
            manager: NoiseHandshakeManager::new(identity, db, Duration::from_secs(10)),
        }
    }

    async fn open(
        keys: &Arc<KeyManager>,
        mut reader: BoxedRead,
        writer: BoxedWrite,
    ) -> (StreamReader<BoxedRead>, StreamWriter<BoxedWrite>) {
        let tor = TransportId::new("tor");
        let ctx = keys.allocate_stream_context(ContactId(1), &tor).unwrap().unwrap();
        let mut writer = StreamWriter::new(writer, ctx).unwrap();
        writer.flush().await.unwrap();
        let peer_ctx: StreamContext = TagRecognizer::new(keys.clone())
            .recognise_stream(&tor, &mut reader)
            .await
            .unwrap()
            .into_context()
            .unwrap();
        (StreamReader::new(reader, peer_ctx).unwrap(), writer)
    }

    #[tokio::test]
    async fn test_handshake_agrees_on_master_key() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let pa = peer(a.clone(), *b.public_key(), clock.clone());
        let pb = peer(b.clone(), *a.public_key(), clock);

        let (ca, cb) = memory_pair(64 * 1024);
        let (ra, wa) = (ca.connection.reader, ca.connection.writer);
        let (rb, wb) = (cb.connection.reader, cb.connection.writer);

        let side_a = async {
            let (mut r, mut w) = open(&pa.keys, ra, wa).await;
            let result = pa.manager.handshake(ContactId(1), &mut r, &mut w).await.unwrap();
            assert!(r.is_finished() && w.is_finished());
            result
        };
        let side_b = async {
            let (mut r, mut w) = open(&pb.keys, rb, wb).await;
            pb.manager.handshake(ContactId(1), &mut r, &mut w).await.unwrap()
        };
        let (res_a, res_b) = tokio::join!(side_a, side_b);

        assert_eq!(res_a.master_key.as_bytes(), res_b.master_key.as_bytes());
        assert_ne!(res_a.role, res_b.role);
        assert_eq!(res_a.is_alice(), is_alice(a.public_key(), b.public_key()));
    }

    #[tokio::test]
    async fn test_impostor_rejected_by_responder() {
        let mut a = StaticKeypair::generate();
        let mut b = StaticKeypair::generate();
        if !is_alice(a.public_key(), b.public_key()) {
            std::mem::swap(&mut a, &mut b);
        }
        let mallory = StaticKeypair::generate();

        // Bob expects Alice's key but Mallory dials, knowing Bob's key
        let bob_db = MemoryDatabase::new();
        bob_db.add_contact(Contact {
            id: ContactId(1),
            name: "alice".into(),
            handshake_public_key: *a.public_key(),
        });
        let bob = NoiseHandshakeManager::new(b.clone(), Arc::new(bob_db), Duration::from_secs(5));

        let ctx = |seed: u8| {
            StreamContext::new(
                Some(ContactId(1)),
                None,
                TransportId::new("tor"),
                [seed; 16],
                SecretKey::from_bytes([seed; 32]),
                0,
                0,
                crate::crypto::KeyMode::Handshake,
            )
        };
        let (cm, cb) = memory_pair(64 * 1024);
        let mut w = StreamWriter::new(cm.connection.writer, ctx(1)).unwrap();
        let mut noise = InitiatorHandshake::new(&mallory, b.public_key()).unwrap();
        write_message(&mut w, &noise.write_message(&[]).unwrap()).await.unwrap();

        let mut rb = cb.connection.reader;
        TagRecognizer::read_tag(&mut rb).await.unwrap();
        let mut reader = StreamReader::new(rb, ctx(1)).unwrap();
        let mut writer = StreamWriter::new(cb.connection.writer, ctx(2)).unwrap();

        assert!(matches!(
            bob.handshake(ContactId(1), &mut reader, &mut writer).await,
            Err(HandshakeError::Protocol(ProtocolViolation::WrongPeerKey))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let pa = peer(a, *b.public_key(), clock);

        let (ca, _cb) = memory_pair(64 * 1024);
        let ctx = pa.keys.allocate_stream_context(ContactId(1), &TransportId::new("tor")).unwrap().unwrap();
        let ctx2 = pa.keys.allocate_stream_context(ContactId(1), &TransportId::new("tor")).unwrap().unwrap();
        let mut w = StreamWriter::new(ca.connection.writer, ctx).unwrap();
        let mut r = StreamReader::new(ca.connection.reader, ctx2).unwrap();

        let manager = NoiseHandshakeManager::new(
            pa.manager.identity.clone(),
            pa.manager.db.clone(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            manager.handshake(ContactId(1), &mut r, &mut w).await,
            Err(HandshakeError::Timeout)
        ));
    }
}
