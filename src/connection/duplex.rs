//! Pieces shared by both kinds of duplex connection.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::handshake::{HandshakeManager, NoiseHandshakeManager};
use super::registry::{ConnectionRegistry, InterruptibleConnection};
use super::{ConnectionConfig, IncomingDuplexSyncConnection, OutgoingDuplexSyncConnection};
use crate::core::{
    ConnectionError, ContactId, DbError, ProtocolViolation, TransportId, HANDSHAKE_KEY_TIMESTAMP,
};
use crate::db::Database;
use crate::sync::{Interrupter, SyncSessionFactory};
use crate::transport::{
    BoxedRead, BoxedWrite, ConnectionControl, KeyManager, RecognitionError, StreamContext, StreamReader,
    StreamWriter, TagRecognition, TagRecognizer, TransportConnection, TransportProperties,
};

impl From<RecognitionError> for ConnectionError {
    fn from(e: RecognitionError) -> Self {
        match e {
            RecognitionError::Stream(e) => ConnectionError::Stream(e),
            RecognitionError::Db(e) => ConnectionError::Db(e),
        }
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Services every duplex connection needs, and the entry point for
/// creating connections from transport plugin channels.
pub struct SyncConnectionFactory {
    pub(crate) keys: Arc<KeyManager>,
    pub(crate) recognizer: TagRecognizer,
    pub(crate) handshake: Arc<dyn HandshakeManager>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) sessions: Arc<dyn SyncSessionFactory>,
    pub(crate) db: Arc<dyn Database>,
}

impl SyncConnectionFactory {
    /// Create a factory that handshakes with Noise using the key manager's
    /// identity.
    pub fn new(
        keys: Arc<KeyManager>,
        db: Arc<dyn Database>,
        sessions: Arc<dyn SyncSessionFactory>,
        config: ConnectionConfig,
    ) -> Self {
        let handshake = Arc::new(NoiseHandshakeManager::new(
            keys.identity().clone(),
            db.clone(),
            config.handshake_timeout,
        ));
        Self {
            recognizer: TagRecognizer::new(keys.clone()),
            keys,
            handshake,
            registry: Arc::new(ConnectionRegistry::new(config.event_capacity)),
            sessions,
            db,
        }
    }

    /// Replace the handshake manager.
    pub fn with_handshake_manager(mut self, handshake: Arc<dyn HandshakeManager>) -> Self {
        self.handshake = handshake;
        self
    }

    /// The registry connections from this factory register with.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// A connection we dialled to `contact`.
    pub fn create_outgoing_connection(
        self: &Arc<Self>,
        contact: ContactId,
        transport: TransportId,
        connection: TransportConnection,
    ) -> OutgoingDuplexSyncConnection {
        OutgoingDuplexSyncConnection::new(self.clone(), contact, transport, connection)
    }

    /// A connection the peer dialled.
    pub fn create_incoming_connection(
        self: &Arc<Self>,
        transport: TransportId,
        connection: TransportConnection,
    ) -> IncomingDuplexSyncConnection {
        IncomingDuplexSyncConnection::new(self.clone(), transport, connection)
    }
}

// =============================================================================
// OUTGOING SESSION SLOT
// =============================================================================

#[derive(Default)]
struct SlotState {
    interrupted: bool,
    session: Option<Interrupter>,
}

/// Holds the outgoing session's interrupter once it exists. An interrupt
/// that arrives first is applied when the session is set.
#[derive(Default)]
pub(crate) struct OutgoingSessionSlot {
    state: Mutex<SlotState>,
}

impl OutgoingSessionSlot {
    pub(crate) fn set(&self, session: Interrupter) {
        let mut state = self.state.lock();
        if state.interrupted {
            session.interrupt();
        }
        state.session = Some(session);
    }
}

impl InterruptibleConnection for OutgoingSessionSlot {
    fn interrupt_outgoing_session(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        if let Some(session) = &state.session {
            session.interrupt();
        }
    }
}

// =============================================================================
// SHARED CONNECTION STATE
// =============================================================================

/// State and error reporting common to both directions.
pub(crate) struct DuplexBase {
    pub(crate) factory: Arc<SyncConnectionFactory>,
    pub(crate) transport: TransportId,
    pub(crate) remote: TransportProperties,
    pub(crate) control: Arc<dyn ConnectionControl>,
    pub(crate) slot: Arc<OutgoingSessionSlot>,
}

impl DuplexBase {
    pub(crate) fn new(
        factory: Arc<SyncConnectionFactory>,
        transport: TransportId,
        remote: TransportProperties,
        control: Arc<dyn ConnectionControl>,
    ) -> Self {
        Self {
            factory,
            transport,
            remote,
            control,
            slot: Arc::new(OutgoingSessionSlot::default()),
        }
    }

    /// Report a failure on the inbound half and tear the connection down.
    pub(crate) fn read_failed(&self, error: impl Into<ConnectionError>, recognised: bool) -> ConnectionError {
        let error = error.into();
        warn!(transport = %self.transport, error = %error, "read error");
        self.control.dispose_reader(true, recognised);
        self.control.dispose_writer(true);
        self.slot.interrupt_outgoing_session();
        error
    }

    /// Report a failure on the outbound half and tear the connection down.
    pub(crate) fn write_failed(&self, error: impl Into<ConnectionError>) -> ConnectionError {
        let error = error.into();
        warn!(transport = %self.transport, error = %error, "write error");
        self.control.dispose_reader(true, true);
        self.control.dispose_writer(true);
        error
    }

    /// Allocate an outgoing context, treating missing keys as an error.
    pub(crate) fn allocate(&self, contact: ContactId) -> Result<StreamContext, ConnectionError> {
        self.factory
            .keys
            .allocate_stream_context(contact, &self.transport)?
            .ok_or_else(|| ConnectionError::Allocation {
                contact,
                transport: self.transport.clone(),
            })
    }

    /// Read and resolve the tag at the start of an inbound stream.
    pub(crate) async fn recognise(&self, reader: &mut BoxedRead) -> Result<TagRecognition, RecognitionError> {
        self.factory.recognizer.recognise_stream(&self.transport, reader).await
    }

    /// Store properties the plugin observed about the remote end.
    pub(crate) fn harvest_properties(&self, contact: ContactId) -> Result<(), DbError> {
        if self.remote.is_empty() {
            return Ok(());
        }
        self.factory
            .db
            .merge_remote_properties(contact, &self.transport, &self.remote)
    }

    /// Run the handshake over freshly paired handshake-mode streams and
    /// commit the resulting rotation keys. Returns the raw channels,
    /// positioned after both handshake streams.
    pub(crate) async fn handshake(
        &self,
        contact: ContactId,
        mut reader: StreamReader<BoxedRead>,
        mut writer: StreamWriter<BoxedWrite>,
    ) -> Result<(BoxedRead, BoxedWrite), ConnectionError> {
        info!(contact = %contact, transport = %self.transport, "performing handshake");
        let result = self
            .factory
            .handshake
            .handshake(contact, &mut reader, &mut writer)
            .await?;
        let alice = result.is_alice();
        // The master key is moved into the key manager and never kept here
        self.factory.keys.add_rotation_keys(
            contact,
            result.master_key,
            HANDSHAKE_KEY_TIMESTAMP,
            alice,
            true,
        )?;
        Ok((reader.into_inner(), writer.into_inner()))
    }
}

/// The contact a recognised context belongs to.
pub(crate) fn context_contact(ctx: &StreamContext) -> Result<ContactId, ProtocolViolation> {
    ctx.contact_id().ok_or(ProtocolViolation::RendezvousTag)
}

/// Check a recognised context names the expected contact.
pub(crate) fn check_contact(ctx: &StreamContext, expected: ContactId) -> Result<(), ProtocolViolation> {
    let actual = context_contact(ctx)?;
    if actual != expected {
        return Err(ProtocolViolation::WrongContact { expected, actual });
    }
    Ok(())
}

/// A context allocated after a handshake must be in rotation mode.
pub(crate) fn require_rotation_after_handshake(ctx: StreamContext) -> Result<StreamContext, ProtocolViolation> {
    if ctx.is_handshake_mode() {
        return Err(ProtocolViolation::HandshakeModeAfterHandshake);
    }
    Ok(ctx)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::connection::HandshakeResult;
    use crate::core::{HandshakeError, ManualClock};
    use crate::crypto::{KeyMode, SecretKey};
    use crate::db::MemoryDatabase;
    use crate::sync::{MemorySink, Outbox, OutboxSessionFactory};
    use crate::transport::test_support::{pair, tor, Pair};

    /// Counts handshakes run through the inner manager.
    pub(crate) struct CountingHandshake {
        inner: NoiseHandshakeManager,
        pub count: AtomicUsize,
    }

    #[async_trait]
    impl HandshakeManager for CountingHandshake {
        async fn handshake(
            &self,
            contact: ContactId,
            reader: &mut StreamReader<BoxedRead>,
            writer: &mut StreamWriter<BoxedWrite>,
        ) -> Result<HandshakeResult, HandshakeError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.inner.handshake(contact, reader, writer).await
        }
    }

    /// One peer: keys, storage, outbox, sink and connection factory.
    pub(crate) struct Node {
        pub keys: Arc<KeyManager>,
        pub db: MemoryDatabase,
        pub outbox: Arc<Outbox>,
        pub sink: Arc<MemorySink>,
        pub handshakes: Arc<CountingHandshake>,
        pub factory: Arc<SyncConnectionFactory>,
    }

    impl Node {
        pub(crate) fn handshake_count(&self) -> usize {
            self.handshakes.count.load(Ordering::SeqCst)
        }
    }

    fn node(keys: Arc<KeyManager>, db: MemoryDatabase) -> Node {
        let outbox = Arc::new(Outbox::new());
        let sink = Arc::new(MemorySink::default());
        let sessions = Arc::new(OutboxSessionFactory::new(outbox.clone(), sink.clone()));
        let handshakes = Arc::new(CountingHandshake {
            inner: NoiseHandshakeManager::new(
                keys.identity().clone(),
                Arc::new(db.clone()),
                Duration::from_secs(10),
            ),
            count: AtomicUsize::new(0),
        });
        let factory = SyncConnectionFactory::new(
            keys.clone(),
            Arc::new(db.clone()),
            sessions,
            ConnectionConfig::default(),
        )
        .with_handshake_manager(handshakes.clone());
        Node {
            keys,
            db,
            outbox,
            sink,
            handshakes,
            factory: Arc::new(factory),
        }
    }

    /// Alice and Bob, knowing each other as contact 1 with handshake keys
    /// only.
    pub(crate) fn nodes() -> (Node, Node, Arc<ManualClock>) {
        let Pair {
            alice,
            bob,
            alice_db,
            bob_db,
            clock,
        } = pair();
        (node(alice, alice_db), node(bob, bob_db), clock)
    }

    /// Poll `condition` until it holds.
    pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn ctx(mode: KeyMode, contact: Option<ContactId>) -> StreamContext {
        StreamContext::new(contact, None, tor(), [0; 16], SecretKey::from_bytes([0; 32]), 0, 0, mode)
    }

    #[test]
    fn test_handshake_context_after_handshake_rejected() {
        assert_eq!(
            require_rotation_after_handshake(ctx(KeyMode::Handshake, Some(ContactId(1)))).unwrap_err(),
            ProtocolViolation::HandshakeModeAfterHandshake
        );
        assert!(require_rotation_after_handshake(ctx(KeyMode::Rotation, Some(ContactId(1)))).is_ok());
    }

    #[test]
    fn test_contact_checks() {
        assert_eq!(
            check_contact(&ctx(KeyMode::Rotation, None), ContactId(1)).unwrap_err(),
            ProtocolViolation::RendezvousTag
        );
        assert_eq!(
            check_contact(&ctx(KeyMode::Rotation, Some(ContactId(2))), ContactId(1)).unwrap_err(),
            ProtocolViolation::WrongContact {
                expected: ContactId(1),
                actual: ContactId(2)
            }
        );
        assert!(check_contact(&ctx(KeyMode::Rotation, Some(ContactId(1))), ContactId(1)).is_ok());
    }

    #[test]
    fn test_slot_applies_early_interrupt() {
        let slot = OutgoingSessionSlot::default();
        slot.interrupt_outgoing_session();
        let session = Interrupter::new();
        slot.set(session.clone());
        assert!(session.is_interrupted());

        let slot = OutgoingSessionSlot::default();
        let session = Interrupter::new();
        slot.set(session.clone());
        assert!(!session.is_interrupted());
        slot.interrupt_outgoing_session();
        assert!(session.is_interrupted());
    }
}
