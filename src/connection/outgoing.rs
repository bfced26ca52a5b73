//! Connections we dialled.
//!
//! The dialler writes first. With only handshake keys for the contact it
//! writes a handshake-mode tag, expects one back, runs the handshake and
//! then allocates a rotation-mode context. The outgoing sync session runs on
//! the caller's task; the returning stream is read on a spawned task.

use std::sync::Arc;

use tracing::{debug, info};

use super::duplex::{check_contact, require_rotation_after_handshake, DuplexBase, SyncConnectionFactory};
use super::registry::InterruptibleConnection;
use crate::core::{ConnectionError, ContactId, ProtocolViolation, TransportId};
use crate::sync::{Priority, PriorityHandler};
use crate::transport::{
    BoxedRead, BoxedWrite, StreamContext, StreamReader, StreamWriter, TagRecognition, TransportConnection,
};

/// A duplex sync connection to a contact we chose to dial.
pub struct OutgoingDuplexSyncConnection {
    base: Arc<DuplexBase>,
    contact: ContactId,
    reader: BoxedRead,
    writer: BoxedWrite,
}

impl OutgoingDuplexSyncConnection {
    pub(crate) fn new(
        factory: Arc<SyncConnectionFactory>,
        contact: ContactId,
        transport: TransportId,
        connection: TransportConnection,
    ) -> Self {
        let TransportConnection {
            reader,
            writer,
            remote,
            control,
        } = connection;
        Self {
            base: Arc::new(DuplexBase::new(factory, transport, remote, control)),
            contact,
            reader,
            writer,
        }
    }

    /// The contact being dialled.
    pub fn contact(&self) -> ContactId {
        self.contact
    }

    /// Drive the connection until the outgoing session ends.
    ///
    /// Returns the outcome of the outbound half. Failures on the returning
    /// stream are reported through the transport's [`ConnectionControl`]
    /// and the registry.
    ///
    /// [`ConnectionControl`]: crate::transport::ConnectionControl
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Self {
            base,
            contact,
            mut reader,
            mut writer,
        } = self;
        info!(contact = %contact, transport = %base.transport, "opening outgoing connection");

        let mut ctx = base.allocate(contact).map_err(|e| base.write_failed(e))?;
        if ctx.is_handshake_mode() {
            (reader, writer) = perform_handshake(&base, contact, ctx, reader, writer).await?;
            ctx = base.allocate(contact).map_err(|e| base.write_failed(e))?;
            ctx = require_rotation_after_handshake(ctx).map_err(|e| base.write_failed(e))?;
        }

        let priority = Priority::generate();
        tokio::spawn(read_returning_stream(base.clone(), contact, priority, reader));
        write_stream(&base, ctx, writer, priority).await
    }
}

/// Write our handshake-mode tag, recognise the peer's, and agree on
/// rotation keys.
async fn perform_handshake(
    base: &DuplexBase,
    contact: ContactId,
    ctx: StreamContext,
    mut reader: BoxedRead,
    writer: BoxedWrite,
) -> Result<(BoxedRead, BoxedWrite), ConnectionError> {
    let mut writer = StreamWriter::new(writer, ctx).map_err(|e| base.write_failed(e))?;
    writer.flush().await.map_err(|e| base.write_failed(e))?;

    let peer = recognise_peer(base, contact, &mut reader).await?;
    if !peer.is_handshake_mode() {
        return Err(base.read_failed(ProtocolViolation::UnexpectedRotationMode, true));
    }
    let reader = StreamReader::new(reader, peer).map_err(|e| base.read_failed(e, true))?;
    base.handshake(contact, reader, writer)
        .await
        .map_err(|e| base.write_failed(e))
}

/// Recognise the tag on a stream the contact sent back to us.
async fn recognise_peer(
    base: &DuplexBase,
    contact: ContactId,
    reader: &mut BoxedRead,
) -> Result<StreamContext, ConnectionError> {
    let ctx = match base.recognise(reader).await {
        Ok(TagRecognition::Recognized(ctx)) => ctx,
        Ok(TagRecognition::Unrecognized) => {
            return Err(base.read_failed(ProtocolViolation::UnrecognisedTag, true));
        }
        Err(e) => return Err(base.read_failed(e, true)),
    };
    check_contact(&ctx, contact).map_err(|e| base.read_failed(e, true))?;
    Ok(ctx)
}

async fn write_stream(
    base: &DuplexBase,
    ctx: StreamContext,
    writer: BoxedWrite,
    priority: Priority,
) -> Result<(), ConnectionError> {
    let mut session = base
        .factory
        .sessions
        .create_duplex_outgoing_session(ctx, writer, Some(priority))
        .map_err(|e| base.write_failed(e))?;
    base.slot.set(session.interrupter());
    match session.run().await {
        Ok(()) => {
            base.control.dispose_writer(false);
            Ok(())
        }
        Err(e) => Err(base.write_failed(e)),
    }
}

async fn read_returning_stream(base: Arc<DuplexBase>, contact: ContactId, priority: Priority, mut reader: BoxedRead) {
    let Ok(ctx) = recognise_peer(&base, contact, &mut reader).await else {
        return;
    };
    if ctx.is_handshake_mode() {
        base.read_failed(ProtocolViolation::UnexpectedHandshakeMode, true);
        return;
    }

    let registry = base.factory.registry.clone();
    let id = registry.register_outgoing(contact, &base.transport, priority, base.slot.clone());

    let result = read_session(&base, contact, ctx, reader).await;
    let errored = result.is_err();
    match result {
        Ok(()) => {
            base.control.dispose_reader(false, true);
            base.slot.interrupt_outgoing_session();
        }
        Err(e) => {
            base.read_failed(e, true);
        }
    }
    registry.unregister(contact, &base.transport, id, errored);
}

async fn read_session(
    base: &DuplexBase,
    contact: ContactId,
    ctx: StreamContext,
    reader: BoxedRead,
) -> Result<(), ConnectionError> {
    base.harvest_properties(contact)?;
    // We dialled, so the peer has no priority to tell us
    let handler: PriorityHandler = Box::new(move |_| {
        debug!(contact = %contact, "ignoring priority on returning stream");
    });
    let mut session = base.factory.sessions.create_incoming_session(ctx, reader, handler)?;
    session.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::broadcast;

    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionEvent, HandshakeManager, HandshakeResult, HandshakeRole};
    use crate::core::{HandshakeError, PendingContactId, HANDSHAKE_KEY_TIMESTAMP};
    use crate::crypto::{SecretKey, StaticKeypair};
    use crate::db::MemoryDatabase;
    use crate::sync::{MemorySink, Outbox, OutboxSessionFactory};
    use crate::transport::test_support::{pair, tor, Pair};
    use crate::transport::{memory_pair, KeyManager, KeyManagerBuilder, ReaderDisposal};

    const CONTACT: ContactId = ContactId(1);

    const FAILED_READER: Option<ReaderDisposal> = Some(ReaderDisposal {
        exception: true,
        recognised: true,
    });

    /// Reports a master key without exchanging anything.
    #[derive(Default)]
    struct SilentHandshake {
        count: AtomicUsize,
    }

    #[async_trait]
    impl HandshakeManager for SilentHandshake {
        async fn handshake(
            &self,
            _contact: ContactId,
            _reader: &mut StreamReader<BoxedRead>,
            _writer: &mut StreamWriter<BoxedWrite>,
        ) -> Result<HandshakeResult, HandshakeError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(HandshakeResult {
                master_key: SecretKey::from_bytes([8; 32]),
                role: HandshakeRole::Initiator,
            })
        }
    }

    fn factory(keys: Arc<KeyManager>, db: MemoryDatabase) -> Arc<SyncConnectionFactory> {
        let sessions = Arc::new(OutboxSessionFactory::new(
            Arc::new(Outbox::new()),
            Arc::new(MemorySink::default()),
        ));
        Arc::new(SyncConnectionFactory::new(
            keys,
            Arc::new(db),
            sessions,
            ConnectionConfig::default(),
        ))
    }

    fn add_rotation_keys(p: &Pair, contact: ContactId, master: [u8; 32]) {
        p.alice
            .add_rotation_keys(contact, SecretKey::from_bytes(master), HANDSHAKE_KEY_TIMESTAMP, true, true)
            .unwrap();
        p.bob
            .add_rotation_keys(contact, SecretKey::from_bytes(master), HANDSHAKE_KEY_TIMESTAMP, false, true)
            .unwrap();
    }

    async fn next_closed(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(event @ ConnectionEvent::Closed { .. }) = events.recv().await {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Dial Bob from Alice with `tag` as the start of the returning stream
    /// and check the connection is torn down without being registered.
    async fn assert_returning_tag_rejected(p: &Pair, tag: &[u8]) {
        let factory = factory(p.alice.clone(), p.alice_db.clone());
        let mut events = factory.registry().subscribe();
        let (ca, mut cb) = memory_pair(64 * 1024);
        let control = ca.control.clone();
        cb.connection.writer.write_all(tag).await.unwrap();

        // The read failure stops the outgoing session, which ends cleanly
        factory
            .create_outgoing_connection(CONTACT, tor(), ca.connection)
            .run()
            .await
            .unwrap();
        assert_eq!(control.reader_disposal(), FAILED_READER);
        assert_eq!(control.writer_disposal(), Some(true));
        assert!(!factory.registry().is_connected(CONTACT));
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_handshake_without_rotation_keys_fails() {
        let p = pair();
        // Reopen Alice with a config that no longer lists the transport, so
        // the handshake commits no keys for it
        let keys = KeyManager::open(
            KeyManagerBuilder::new().transport("lan").build(),
            p.alice.identity().clone(),
            Arc::new(p.alice_db.clone()),
            p.clock.clone(),
        )
        .unwrap();
        let handshake = Arc::new(SilentHandshake::default());
        let sessions = Arc::new(OutboxSessionFactory::new(
            Arc::new(Outbox::new()),
            Arc::new(MemorySink::default()),
        ));
        let factory = Arc::new(
            SyncConnectionFactory::new(
                Arc::new(keys),
                Arc::new(p.alice_db.clone()),
                sessions,
                ConnectionConfig::default(),
            )
            .with_handshake_manager(handshake.clone()),
        );

        let (ca, mut cb) = memory_pair(64 * 1024);
        let control = ca.control.clone();
        let peer = p.bob.allocate_stream_context(CONTACT, &tor()).unwrap().unwrap();
        assert!(peer.is_handshake_mode());
        cb.connection.writer.write_all(peer.tag()).await.unwrap();

        let result = factory
            .create_outgoing_connection(CONTACT, tor(), ca.connection)
            .run()
            .await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ProtocolViolation::HandshakeModeAfterHandshake))
        ));
        assert_eq!(handshake.count.load(Ordering::SeqCst), 1);
        assert_eq!(control.writer_disposal(), Some(true));
        assert_eq!(control.reader_disposal(), FAILED_READER);
        assert!(!factory.registry().is_connected(CONTACT));
    }

    #[tokio::test]
    async fn test_returning_stream_from_wrong_contact() {
        let p = pair();
        add_rotation_keys(&p, CONTACT, [2; 32]);
        add_rotation_keys(&p, ContactId(2), [3; 32]);
        let other = p.bob.allocate_stream_context(ContactId(2), &tor()).unwrap().unwrap();
        assert_returning_tag_rejected(&p, other.tag()).await;
    }

    #[tokio::test]
    async fn test_returning_stream_with_rendezvous_tag() {
        let p = pair();
        add_rotation_keys(&p, CONTACT, [2; 32]);
        let stranger = KeyManager::open(
            KeyManagerBuilder::new().transport("tor").build(),
            StaticKeypair::generate(),
            Arc::new(MemoryDatabase::new()),
            p.clock.clone(),
        )
        .unwrap();
        p.alice
            .add_pending_contact(PendingContactId(7), stranger.local_public_key())
            .unwrap();
        stranger
            .add_pending_contact(PendingContactId(9), p.alice.local_public_key())
            .unwrap();
        let rendezvous = stranger
            .allocate_pending_stream_context(PendingContactId(9), &tor())
            .unwrap()
            .unwrap();
        assert_returning_tag_rejected(&p, rendezvous.tag()).await;
    }

    #[tokio::test]
    async fn test_returning_stream_in_handshake_mode() {
        let p = pair();
        let handshake = p.bob.allocate_stream_context(CONTACT, &tor()).unwrap().unwrap();
        assert!(handshake.is_handshake_mode());
        add_rotation_keys(&p, CONTACT, [2; 32]);
        assert_returning_tag_rejected(&p, handshake.tag()).await;
    }

    #[tokio::test]
    async fn test_returning_stream_harvest_failure_unregisters() {
        let p = pair();
        add_rotation_keys(&p, CONTACT, [2; 32]);
        let failing = MemoryDatabase::new();
        failing.fail_writes(true);
        let factory = factory(p.alice.clone(), failing);
        let mut events = factory.registry().subscribe();

        let (mut ca, mut cb) = memory_pair(64 * 1024);
        ca.connection.remote.insert("onion", "abc");
        let control = ca.control.clone();
        let back = p.bob.allocate_stream_context(CONTACT, &tor()).unwrap().unwrap();
        cb.connection.writer.write_all(back.tag()).await.unwrap();

        factory
            .create_outgoing_connection(CONTACT, tor(), ca.connection)
            .run()
            .await
            .unwrap();
        assert_eq!(
            next_closed(&mut events).await,
            ConnectionEvent::Closed {
                contact: CONTACT,
                transport: tor(),
                incoming: false,
                errored: true,
                replaced: false
            }
        );
        assert_eq!(control.reader_disposal(), FAILED_READER);
        assert_eq!(control.writer_disposal(), Some(true));
        assert!(!factory.registry().is_connected(CONTACT));
    }

    #[tokio::test]
    async fn test_returning_session_failure_unregisters() {
        let p = pair();
        add_rotation_keys(&p, CONTACT, [2; 32]);
        let factory = factory(p.alice.clone(), p.alice_db.clone());
        let mut events = factory.registry().subscribe();

        let (ca, mut cb) = memory_pair(64 * 1024);
        let control = ca.control.clone();
        let back = p.bob.allocate_stream_context(CONTACT, &tor()).unwrap().unwrap();
        cb.connection.writer.write_all(back.tag()).await.unwrap();
        // A frame header announcing an oversized frame
        cb.connection.writer.write_all(&[0xFF; 64]).await.unwrap();

        factory
            .create_outgoing_connection(CONTACT, tor(), ca.connection)
            .run()
            .await
            .unwrap();
        assert!(matches!(
            next_closed(&mut events).await,
            ConnectionEvent::Closed {
                incoming: false,
                errored: true,
                replaced: false,
                ..
            }
        ));
        assert_eq!(control.reader_disposal(), FAILED_READER);
        assert_eq!(control.writer_disposal(), Some(true));
    }
}
