//! The boundary with transport plugins.
//!
//! A plugin hands the core a connected duplex byte channel: a reader, a
//! writer, whatever properties it observed about the remote end, and a
//! control handle the core uses to report how each half ended.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use super::TransportProperties;

/// Boxed inbound half of a transport connection.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound half of a transport connection.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Callbacks into the transport plugin that owns a connection.
///
/// `exception` is true when the half ended because of an error, which tells
/// the plugin to consider reconnecting.
pub trait ConnectionControl: Send + Sync {
    /// The reader is no longer needed. `recognised` is false if the stream's
    /// tag was not recognised.
    fn dispose_reader(&self, exception: bool, recognised: bool);

    /// The writer is no longer needed.
    fn dispose_writer(&self, exception: bool);
}

/// A connected duplex channel supplied by a transport plugin.
pub struct TransportConnection {
    /// Raw inbound bytes.
    pub reader: BoxedRead,
    /// Raw outbound bytes.
    pub writer: BoxedWrite,
    /// Properties of the remote end observed by the plugin.
    pub remote: TransportProperties,
    /// Disposal callbacks.
    pub control: Arc<dyn ConnectionControl>,
}

impl TransportConnection {
    /// Assemble a connection from its parts.
    pub fn new<R, W>(reader: R, writer: W, remote: TransportProperties, control: Arc<dyn ConnectionControl>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote,
            control,
        }
    }
}

/// How a reader was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderDisposal {
    /// Ended by an error.
    pub exception: bool,
    /// Its tag was recognised.
    pub recognised: bool,
}

/// A [`ConnectionControl`] that records what was disposed, for in-memory
/// connections.
#[derive(Debug, Default)]
pub struct RecordingControl {
    reader: Mutex<Option<ReaderDisposal>>,
    writer: Mutex<Option<bool>>,
}

impl RecordingControl {
    /// How the reader was disposed, if it was.
    pub fn reader_disposal(&self) -> Option<ReaderDisposal> {
        *self.reader.lock()
    }

    /// Whether the writer was disposed with an exception, if it was.
    pub fn writer_disposal(&self) -> Option<bool> {
        *self.writer.lock()
    }
}

impl ConnectionControl for RecordingControl {
    fn dispose_reader(&self, exception: bool, recognised: bool) {
        self.reader.lock().get_or_insert(ReaderDisposal { exception, recognised });
    }

    fn dispose_writer(&self, exception: bool) {
        self.writer.lock().get_or_insert(exception);
    }
}

/// Two ends of an in-memory duplex connection.
pub struct MemoryConnection {
    /// The connection.
    pub connection: TransportConnection,
    /// Its disposal record.
    pub control: Arc<RecordingControl>,
}

/// Create a connected pair of in-memory transport connections.
pub fn memory_pair(buffer: usize) -> (MemoryConnection, MemoryConnection) {
    let (a, b) = tokio::io::duplex(buffer);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let make = |r, w| {
        let control = Arc::new(RecordingControl::default());
        MemoryConnection {
            connection: TransportConnection::new(r, w, TransportProperties::new(), control.clone()),
            control,
        }
    };
    (make(a_read, a_write), make(b_read, b_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_pair_is_connected() {
        let (mut a, mut b) = memory_pair(1024);
        a.connection.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.connection.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_first_disposal_wins() {
        let control = RecordingControl::default();
        control.dispose_reader(true, false);
        control.dispose_reader(false, true);
        assert_eq!(
            control.reader_disposal(),
            Some(ReaderDisposal {
                exception: true,
                recognised: false
            })
        );
        assert_eq!(control.writer_disposal(), None);
    }
}
