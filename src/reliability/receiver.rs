//! Receiver half of the ARQ layer.
//!
//! Buffers data frames by sequence number and hands them to the reader
//! strictly in order. Every data frame that passes the length, window and
//! checksum checks is acknowledged, including duplicates and probes, so the
//! sender always learns the current window. Frames that fail those checks
//! are dropped without an ack; the sender's retransmission timer recovers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::frame::{DataFrame, FrameType};
use super::{ReliabilityConfig, Sender};
use crate::core::ReliabilityError;

#[derive(Debug)]
struct ReceiverState {
    frames: BTreeMap<u64, DataFrame>,
    /// Remaining receive buffer, in payload bytes.
    window_size: usize,
    next_sequence_number: u64,
    /// `u64::MAX` until the last segment has been seen.
    final_sequence_number: u64,
}

/// Receiver half of a reliable connection.
pub struct Receiver {
    sender: Arc<Sender>,
    state: Mutex<ReceiverState>,
    notify: Notify,
    valid: AtomicBool,
    read_timeout: Duration,
}

impl Receiver {
    /// Create a receiver that acknowledges through `sender`.
    pub fn new(sender: Arc<Sender>, config: &ReliabilityConfig) -> Self {
        Self {
            sender,
            state: Mutex::new(ReceiverState {
                frames: BTreeMap::new(),
                window_size: config.initial_window,
                next_sequence_number: 1,
                final_sequence_number: u64::MAX,
            }),
            notify: Notify::new(),
            valid: AtomicBool::new(true),
            read_timeout: config.read_timeout,
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Wait for the next in-order data frame.
    ///
    /// Fails with [`ReliabilityError::Timeout`] if nothing arrives within the
    /// read timeout, or [`ReliabilityError::Closed`] if the receiver is
    /// invalidated first.
    pub async fn read(&self) -> Result<DataFrame, ReliabilityError> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            // Register before checking state so a concurrent wakeup is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_valid() {
                return Err(ReliabilityError::Closed);
            }

            let delivered = {
                let mut state = self.state.lock();
                let next = state.next_sequence_number;
                match state.frames.remove(&next) {
                    Some(frame) => {
                        state.window_size += frame.payload_len();
                        state.next_sequence_number += 1;
                        Some((frame, state.window_size))
                    }
                    None => None,
                }
            };
            if let Some((frame, window_size)) = delivered {
                self.sender.send_ack(0, window_size)?;
                return Ok(frame);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(if self.is_valid() {
                    ReliabilityError::Timeout
                } else {
                    ReliabilityError::Closed
                });
            }
        }
    }

    /// Close the receiver and wake any blocked reader. Idempotent.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Dispatch a frame read from the transport.
    ///
    /// Data frames are buffered, acks are passed to the sender and unknown
    /// frame types are ignored.
    pub fn handle_read(&self, bytes: Vec<u8>) -> Result<(), ReliabilityError> {
        if !self.is_valid() {
            return Err(ReliabilityError::Closed);
        }
        match bytes.first().copied().and_then(FrameType::from_byte) {
            Some(FrameType::Data | FrameType::Fin) => self.handle_data(bytes),
            Some(FrameType::Ack) => {
                self.sender.handle_ack(&bytes);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn handle_data(&self, bytes: Vec<u8>) -> Result<(), ReliabilityError> {
        let Some(frame) = DataFrame::from_bytes(bytes) else {
            trace!("dropping data frame with invalid length");
            return Ok(());
        };

        let (sequence_number, window_size) = {
            let mut state = self.state.lock();
            let payload_len = frame.payload_len();
            if payload_len > state.window_size {
                trace!(payload_len, window = state.window_size, "no room in window");
                return Ok(());
            }
            if !frame.is_checksum_valid() {
                trace!("dropping data frame with invalid checksum");
                return Ok(());
            }

            let sequence_number = frame.sequence_number();
            let mut added = false;
            if sequence_number == 0 {
                // Window probe
            } else if sequence_number < state.next_sequence_number {
                // Duplicate
            } else if frame.is_last() {
                state.final_sequence_number = sequence_number;
                // Nothing can follow the last segment
                let stale = state.frames.split_off(&sequence_number);
                let reclaimed: usize = stale.values().map(DataFrame::payload_len).sum();
                state.window_size += reclaimed;
                state.frames.insert(sequence_number, frame);
                state.window_size -= payload_len;
                added = true;
            } else if sequence_number < state.final_sequence_number
                && !state.frames.contains_key(&sequence_number)
            {
                state.frames.insert(sequence_number, frame);
                state.window_size -= payload_len;
                added = true;
            }
            if added {
                trace!(sequence_number, window = state.window_size, "buffered data frame");
            }
            (sequence_number, state.window_size)
        };

        self.notify.notify_waiters();
        // Ack even duplicates: the sender may have missed our last ack
        self.sender.send_ack(sequence_number, window_size)?;
        Ok(())
    }

    /// Remaining receive window in bytes.
    pub fn window_size(&self) -> usize {
        self.state.lock().window_size
    }

    /// Number of frames waiting in the reorder buffer.
    pub fn buffered(&self) -> usize {
        self.state.lock().frames.len()
    }
}
