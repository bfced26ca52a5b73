//! Sync sessions over encrypted streams.
//!
//! A duplex connection runs one outgoing session on its writer and one
//! incoming session on its reader. Sessions are produced by a
//! [`SyncSessionFactory`] and stopped early through their [`Interrupter`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::core::{ContactId, DbError, SessionError};
use crate::message::Message;
use crate::transport::{BoxedRead, BoxedWrite, StreamContext, StreamReader, StreamWriter};

use super::{Priority, PriorityHandler, Record, RecordReader, RecordType, RecordWriter};

// =============================================================================
// INTERRUPTER
// =============================================================================

#[derive(Debug, Default)]
struct InterruptState {
    interrupted: AtomicBool,
    notify: Notify,
}

/// Best-effort cancellation signal for a session. Cloneable and idempotent.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    /// Create an untriggered interrupter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop.
    pub fn interrupt(&self) {
        if !self.state.interrupted.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }

    /// Whether [`interrupt`](Self::interrupt) has been called.
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::Acquire)
    }

    /// Wait until interrupted.
    pub async fn interrupted(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// A running sync session.
#[async_trait]
pub trait SyncSession: Send {
    /// Run until the stream ends, the session is interrupted, or an error
    /// occurs.
    async fn run(&mut self) -> Result<(), SessionError>;

    /// A handle that stops [`run`](Self::run).
    fn interrupter(&self) -> Interrupter;
}

/// Creates sessions bound to a stream context and a raw channel.
pub trait SyncSessionFactory: Send + Sync + 'static {
    /// An outgoing session that writes to `writer` until interrupted.
    ///
    /// `priority` is sent first when present.
    fn create_duplex_outgoing_session(
        &self,
        ctx: StreamContext,
        writer: BoxedWrite,
        priority: Option<Priority>,
    ) -> Result<Box<dyn SyncSession>, SessionError>;

    /// An incoming session reading from `reader`, whose tag has already been
    /// consumed.
    fn create_incoming_session(
        &self,
        ctx: StreamContext,
        reader: BoxedRead,
        handler: PriorityHandler,
    ) -> Result<Box<dyn SyncSession>, SessionError>;
}

/// Receives messages read by incoming sessions.
pub trait MessageSink: Send + Sync + 'static {
    /// Store a message received from `contact`.
    fn message_received(&self, contact: ContactId, message: Message) -> Result<(), DbError>;
}

// =============================================================================
// OUTBOX & SINK
// =============================================================================

/// Per-contact queues of messages waiting to be sent.
#[derive(Debug, Default)]
pub struct Outbox {
    queues: Mutex<HashMap<ContactId, VecDeque<Message>>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` for `contact`.
    pub fn push(&self, contact: ContactId, message: Message) {
        self.queues.lock().entry(contact).or_default().push_back(message);
        self.notify.notify_waiters();
    }

    /// Number of messages waiting for `contact`.
    pub fn pending(&self, contact: ContactId) -> usize {
        self.queues.lock().get(&contact).map_or(0, VecDeque::len)
    }

    /// Stop handing out messages. Sessions waiting on the outbox end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Take the next message for `contact`, waiting if there is none.
    /// Once the outbox is closed, queued messages are still handed out and
    /// `None` is returned when the queue is empty.
    pub async fn next(&self, contact: ContactId) -> Option<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(message) = self.queues.lock().get_mut(&contact).and_then(VecDeque::pop_front) {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

/// A [`MessageSink`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    received: Mutex<Vec<(ContactId, Message)>>,
}

impl MemorySink {
    /// Everything received so far.
    pub fn received(&self) -> Vec<(ContactId, Message)> {
        self.received.lock().clone()
    }
}

impl MessageSink for MemorySink {
    fn message_received(&self, contact: ContactId, message: Message) -> Result<(), DbError> {
        self.received.lock().push((contact, message));
        Ok(())
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

fn require_contact(ctx: &StreamContext) -> Result<ContactId, SessionError> {
    ctx.contact_id()
        .ok_or_else(|| SessionError::Format("sync session needs a contact".into()))
}

/// Writes an optional priority, then outbox messages until interrupted.
pub struct DuplexOutgoingSession {
    contact: ContactId,
    writer: RecordWriter<BoxedWrite>,
    outbox: Arc<Outbox>,
    priority: Option<Priority>,
    interrupter: Interrupter,
}

impl DuplexOutgoingSession {
    /// Create a session for `contact` writing to `writer`.
    pub fn new(
        contact: ContactId,
        writer: StreamWriter<BoxedWrite>,
        outbox: Arc<Outbox>,
        priority: Option<Priority>,
    ) -> Self {
        Self {
            contact,
            writer: RecordWriter::new(writer),
            outbox,
            priority,
            interrupter: Interrupter::new(),
        }
    }
}

#[async_trait]
impl SyncSession for DuplexOutgoingSession {
    async fn run(&mut self) -> Result<(), SessionError> {
        if let Some(priority) = self.priority.take() {
            self.writer.write_record(&Record::priority(&priority)).await?;
        }
        // Flush even with nothing to send so the peer sees our tag
        self.writer.flush().await?;

        let mut sent = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.interrupter.interrupted() => None,
                message = self.outbox.next(self.contact) => message,
            };
            let Some(message) = next else { break };
            self.writer
                .write_record(&Record::new(RecordType::Message, message.raw()))
                .await?;
            self.writer.flush().await?;
            sent += 1;
            trace!(contact = %self.contact, id = %message.id(), "sent message");
        }
        self.writer.finish().await?;
        debug!(contact = %self.contact, sent, "outgoing session finished");
        Ok(())
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }
}

/// Reads records until the end of the stream.
pub struct IncomingSession {
    contact: ContactId,
    reader: RecordReader<BoxedRead>,
    sink: Arc<dyn MessageSink>,
    handler: PriorityHandler,
    interrupter: Interrupter,
}

impl IncomingSession {
    /// Create a session for `contact` reading from `reader`.
    pub fn new(
        contact: ContactId,
        reader: StreamReader<BoxedRead>,
        sink: Arc<dyn MessageSink>,
        handler: PriorityHandler,
    ) -> Self {
        Self {
            contact,
            reader: RecordReader::new(reader),
            sink,
            handler,
            interrupter: Interrupter::new(),
        }
    }

    fn handle_record(&self, record: Record) -> Result<(), SessionError> {
        match record.known_type() {
            Some(RecordType::Priority) => (self.handler)(record.to_priority()?),
            Some(RecordType::Message) => {
                let message =
                    Message::from_raw(&record.payload).map_err(|e| SessionError::Format(e.to_string()))?;
                trace!(contact = %self.contact, id = %message.id(), "received message");
                self.sink.message_received(self.contact, message)?;
            }
            None => trace!(record_type = record.record_type, "skipping unknown record"),
        }
        Ok(())
    }
}

#[async_trait]
impl SyncSession for IncomingSession {
    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            let record = tokio::select! {
                biased;
                _ = self.interrupter.interrupted() => break,
                record = self.reader.read_record() => record?,
            };
            match record {
                Some(record) => self.handle_record(record)?,
                None => break,
            }
        }
        debug!(contact = %self.contact, "incoming session finished");
        Ok(())
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }
}

/// Builds [`DuplexOutgoingSession`]s fed by an [`Outbox`] and
/// [`IncomingSession`]s feeding a [`MessageSink`].
pub struct OutboxSessionFactory {
    outbox: Arc<Outbox>,
    sink: Arc<dyn MessageSink>,
}

impl OutboxSessionFactory {
    /// Create a factory.
    pub fn new(outbox: Arc<Outbox>, sink: Arc<dyn MessageSink>) -> Self {
        Self { outbox, sink }
    }
}

impl SyncSessionFactory for OutboxSessionFactory {
    fn create_duplex_outgoing_session(
        &self,
        ctx: StreamContext,
        writer: BoxedWrite,
        priority: Option<Priority>,
    ) -> Result<Box<dyn SyncSession>, SessionError> {
        let contact = require_contact(&ctx)?;
        let writer = StreamWriter::new(writer, ctx)?;
        Ok(Box::new(DuplexOutgoingSession::new(
            contact,
            writer,
            self.outbox.clone(),
            priority,
        )))
    }

    fn create_incoming_session(
        &self,
        ctx: StreamContext,
        reader: BoxedRead,
        handler: PriorityHandler,
    ) -> Result<Box<dyn SyncSession>, SessionError> {
        let contact = require_contact(&ctx)?;
        let reader = StreamReader::new(reader, ctx)?;
        Ok(Box::new(IncomingSession::new(contact, reader, self.sink.clone(), handler)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{GroupId, TransportId, HASH_SIZE};
    use crate::crypto::{KeyMode, SecretKey};
    use crate::message::MessageFactory;

    fn ctx(contact: Option<ContactId>) -> StreamContext {
        StreamContext::new(
            contact,
            None,
            TransportId::new("test"),
            [0x44; 16],
            SecretKey::from_bytes([0x55; 32]),
            3,
            7,
            KeyMode::Rotation,
        )
    }

    fn message(n: u8) -> Message {
        MessageFactory
            .create_message(GroupId::from_bytes([n; HASH_SIZE]), u64::from(n), vec![n; 10])
            .unwrap()
    }

    struct Harness {
        outbox: Arc<Outbox>,
        sink: Arc<MemorySink>,
        factory: OutboxSessionFactory,
    }

    fn harness() -> Harness {
        let outbox = Arc::new(Outbox::new());
        let sink = Arc::new(MemorySink::default());
        let factory = OutboxSessionFactory::new(outbox.clone(), sink.clone());
        Harness { outbox, sink, factory }
    }

    #[tokio::test]
    async fn test_interrupter_wakes_waiter() {
        let interrupter = Interrupter::new();
        let waiter = {
            let i = interrupter.clone();
            tokio::spawn(async move { i.interrupted().await })
        };
        tokio::task::yield_now().await;
        interrupter.interrupt();
        interrupter.interrupt();
        waiter.await.unwrap();
        assert!(interrupter.is_interrupted());
    }

    #[tokio::test]
    async fn test_outbox_close_ends_waiters() {
        let outbox = Arc::new(Outbox::new());
        let waiter = {
            let o = outbox.clone();
            tokio::spawn(async move { o.next(ContactId(1)).await })
        };
        tokio::task::yield_now().await;
        outbox.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outbox_close_drains_queued_messages() {
        let outbox = Outbox::new();
        outbox.push(ContactId(1), message(1));
        outbox.push(ContactId(1), message(2));
        outbox.close();

        assert_eq!(outbox.next(ContactId(1)).await.map(|m| m.id()), Some(message(1).id()));
        assert_eq!(outbox.next(ContactId(1)).await.map(|m| m.id()), Some(message(2).id()));
        assert!(outbox.next(ContactId(1)).await.is_none());
        assert!(outbox.next(ContactId(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_messages_and_priority_delivered() {
        let h = harness();
        let contact = ContactId(1);
        h.outbox.push(contact, message(1));
        h.outbox.push(contact, message(2));
        h.outbox.push(ContactId(2), message(3));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_ar, aw) = tokio::io::split(a);
        let (mut br, _bw) = tokio::io::split(b);

        let priority = Priority::generate();
        let mut outgoing = h
            .factory
            .create_duplex_outgoing_session(ctx(Some(contact)), Box::new(aw), Some(priority))
            .unwrap();
        let stop = outgoing.interrupter();
        let writer = tokio::spawn(async move { outgoing.run().await });

        let mut tag = [0u8; 16];
        tokio::io::AsyncReadExt::read_exact(&mut br, &mut tag).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: PriorityHandler = {
            let seen = seen.clone();
            Box::new(move |p| seen.lock().push(p))
        };
        let mut incoming = h
            .factory
            .create_incoming_session(ctx(Some(contact)), Box::new(br), handler)
            .unwrap();
        let reader = tokio::spawn(async move { incoming.run().await });

        while h.sink.received().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.interrupt();
        writer.await.unwrap().unwrap();
        reader.await.unwrap().unwrap();

        let received = h.sink.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].1.id(), message(1).id());
        assert_eq!(received[1].1.id(), message(2).id());
        assert!(received.iter().all(|(c, _)| *c == contact));
        assert_eq!(*seen.lock(), vec![priority]);
        assert_eq!(h.outbox.pending(ContactId(2)), 1);
    }

    #[test]
    fn test_session_without_contact_rejected() {
        let h = harness();
        let (a, _b) = tokio::io::duplex(16);
        assert!(h
            .factory
            .create_duplex_outgoing_session(ctx(None), Box::new(a), None)
            .is_err());
    }
}
