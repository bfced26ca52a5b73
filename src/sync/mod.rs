//! Sync layer
//!
//! Application sync over encrypted streams:
//!
//! - **Records**: typed, length-prefixed units inside a stream
//! - **Priority**: per-attempt nonces that pick a winner between two
//!   connections opened at the same time
//! - **Sessions**: an outgoing session per writer and an incoming session
//!   per reader, built by a [`SyncSessionFactory`]

mod priority;
mod record;
mod session;

pub use priority::{Priority, PriorityHandler};
pub use record::{Record, RecordReader, RecordType, RecordWriter};
pub use session::{
    DuplexOutgoingSession, IncomingSession, Interrupter, MemorySink, MessageSink, Outbox,
    OutboxSessionFactory, SyncSession, SyncSessionFactory,
};
