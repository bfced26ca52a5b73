//! Connections the peer dialled.
//!
//! The tag on the inbound stream tells us who is calling. A handshake-mode
//! tag means the dialler has no rotation keys for us yet: we answer with our
//! own handshake-mode stream, run the handshake, then expect a rotation-mode
//! stream. The incoming sync session runs on the caller's task; our
//! outgoing session runs on a spawned task.

use std::sync::Arc;

use tracing::info;

use super::duplex::{
    check_contact, context_contact, require_rotation_after_handshake, DuplexBase, SyncConnectionFactory,
};
use super::registry::InterruptibleConnection;
use crate::core::{ConnectionError, ContactId, ProtocolViolation, TransportId};
use crate::sync::PriorityHandler;
use crate::transport::{
    BoxedRead, BoxedWrite, StreamContext, StreamReader, StreamWriter, TagRecognition, TransportConnection,
};

/// A duplex sync connection the peer opened.
pub struct IncomingDuplexSyncConnection {
    base: Arc<DuplexBase>,
    reader: BoxedRead,
    writer: BoxedWrite,
}

impl IncomingDuplexSyncConnection {
    pub(crate) fn new(factory: Arc<SyncConnectionFactory>, transport: TransportId, connection: TransportConnection) -> Self {
        let TransportConnection {
            reader,
            writer,
            remote,
            control,
        } = connection;
        Self {
            base: Arc::new(DuplexBase::new(factory, transport, remote, control)),
            reader,
            writer,
        }
    }

    /// Drive the connection until the incoming session ends.
    ///
    /// Returns the outcome of the inbound half. Failures of our outgoing
    /// session are reported through the transport's
    /// [`ConnectionControl`](crate::transport::ConnectionControl).
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Self {
            base,
            mut reader,
            mut writer,
        } = self;

        let mut peer = match base.recognise(&mut reader).await {
            Ok(TagRecognition::Recognized(ctx)) => ctx,
            Ok(TagRecognition::Unrecognized) => {
                return Err(base.read_failed(ProtocolViolation::UnrecognisedTag, false));
            }
            Err(e) => return Err(base.read_failed(e, false)),
        };
        let contact = context_contact(&peer).map_err(|e| base.read_failed(e, true))?;
        info!(contact = %contact, transport = %base.transport, "accepted incoming connection");

        if peer.is_handshake_mode() {
            (peer, reader, writer) = answer_handshake(&base, contact, peer, reader, writer).await?;
        }

        let ctx = base.allocate(contact).map_err(|e| base.write_failed(e))?;
        let ctx = require_rotation_after_handshake(ctx).map_err(|e| base.write_failed(e))?;
        let mut outgoing = base
            .factory
            .sessions
            .create_duplex_outgoing_session(ctx, writer, None)
            .map_err(|e| base.write_failed(e))?;

        let registry = base.factory.registry.clone();
        let id = registry.register_incoming(contact, &base.transport, base.slot.clone());

        base.slot.set(outgoing.interrupter());
        let writer_base = base.clone();
        tokio::spawn(async move {
            match outgoing.run().await {
                Ok(()) => writer_base.control.dispose_writer(false),
                Err(e) => {
                    writer_base.write_failed(e);
                }
            }
        });

        let handler: PriorityHandler = {
            let registry = registry.clone();
            let transport = base.transport.clone();
            Box::new(move |priority| registry.set_priority(contact, &transport, id, priority))
        };
        let result = read_session(&base, peer, reader, handler).await;
        let errored = result.is_err();
        let result = match result {
            Ok(()) => {
                base.control.dispose_reader(false, true);
                base.slot.interrupt_outgoing_session();
                Ok(())
            }
            Err(e) => Err(base.read_failed(e, true)),
        };
        registry.unregister(contact, &base.transport, id, errored);
        result
    }
}

/// Reply to a handshake-mode stream and agree on rotation keys. Returns the
/// context of the rotation-mode stream that follows.
async fn answer_handshake(
    base: &DuplexBase,
    contact: ContactId,
    peer: StreamContext,
    reader: BoxedRead,
    writer: BoxedWrite,
) -> Result<(StreamContext, BoxedRead, BoxedWrite), ConnectionError> {
    let ours = base.allocate(contact).map_err(|e| base.write_failed(e))?;
    if !ours.is_handshake_mode() {
        // We already hold rotation keys the peer should have used
        return Err(base.read_failed(ProtocolViolation::UnexpectedHandshakeMode, true));
    }
    let mut writer = StreamWriter::new(writer, ours).map_err(|e| base.write_failed(e))?;
    writer.flush().await.map_err(|e| base.write_failed(e))?;
    let reader = StreamReader::new(reader, peer).map_err(|e| base.read_failed(e, true))?;

    let (mut reader, writer) = base
        .handshake(contact, reader, writer)
        .await
        .map_err(|e| base.write_failed(e))?;

    let next = match base.recognise(&mut reader).await {
        Ok(TagRecognition::Recognized(ctx)) => ctx,
        Ok(TagRecognition::Unrecognized) => {
            return Err(base.read_failed(ProtocolViolation::UnrecognisedTag, true));
        }
        Err(e) => return Err(base.read_failed(e, true)),
    };
    check_contact(&next, contact).map_err(|e| base.read_failed(e, true))?;
    if next.is_handshake_mode() {
        return Err(base.read_failed(ProtocolViolation::UnexpectedHandshakeMode, true));
    }
    Ok((next, reader, writer))
}

async fn read_session(
    base: &DuplexBase,
    ctx: StreamContext,
    reader: BoxedRead,
    handler: PriorityHandler,
) -> Result<(), ConnectionError> {
    let mut session = base.factory.sessions.create_incoming_session(ctx, reader, handler)?;
    session.run().await?;
    Ok(())
}
