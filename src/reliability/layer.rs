//! A reliable byte pipe over a lossy frame transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::frame::DataFrame;
use super::{Receiver, Sender, WriteHandler};
use crate::core::{
    ReliabilityError, INITIAL_RTT_VAR, MAX_PAYLOAD_LENGTH, MAX_RTO, MAX_WINDOW_SIZE, MIN_RTO, READ_TIMEOUT,
    TICK_INTERVAL, WRITE_TIMEOUT,
};

/// ARQ configuration.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// How long `read` waits for the next in-order frame.
    pub read_timeout: Duration,

    /// How long `write` and `flush` wait for window space or acks.
    pub write_timeout: Duration,

    /// Period of the retransmission timer.
    pub tick_interval: Duration,

    /// Receive window advertised before anything is buffered, in bytes.
    pub initial_window: usize,

    /// RTT variance assumed before the first sample.
    pub initial_rtt_var: Duration,

    /// Lower bound on the retransmission timeout.
    pub min_rto: Duration,

    /// Upper bound on the retransmission timeout.
    pub max_rto: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            tick_interval: TICK_INTERVAL,
            initial_window: MAX_WINDOW_SIZE,
            initial_rtt_var: INITIAL_RTT_VAR,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
        }
    }
}

/// Builder for [`ReliabilityConfig`].
#[derive(Debug, Default)]
pub struct ReliabilityConfigBuilder {
    config: ReliabilityConfig,
}

impl ReliabilityConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Set the retransmission timer period.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set the initial receive window, capped at the maximum window size.
    pub fn initial_window(mut self, window: usize) -> Self {
        self.config.initial_window = window.min(MAX_WINDOW_SIZE);
        self
    }

    /// Set the RTT variance assumed before the first sample.
    pub fn initial_rtt_var(mut self, rtt_var: Duration) -> Self {
        self.config.initial_rtt_var = rtt_var;
        self
    }

    /// Set the bounds on the retransmission timeout.
    pub fn rto_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_rto = min.min(max);
        self.config.max_rto = max.max(min);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ReliabilityConfig {
        self.config
    }
}

#[derive(Debug)]
struct WriteState {
    next_sequence_number: u64,
    closed: bool,
}

/// Sender and receiver for one connection, plus the retransmission timer.
///
/// Frames from the transport go in through [`handle_read`](Self::handle_read);
/// frames for the transport come out through the [`WriteHandler`].
pub struct ReliabilityLayer {
    sender: Arc<Sender>,
    receiver: Receiver,
    writer: tokio::sync::Mutex<WriteState>,
    read_finished: AtomicBool,
    valid: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    tick_interval: Duration,
}

impl ReliabilityLayer {
    /// Create a layer writing frames through `handler`.
    pub fn new(handler: Arc<dyn WriteHandler>, config: ReliabilityConfig) -> Arc<Self> {
        let sender = Arc::new(Sender::new(handler, &config));
        let receiver = Receiver::new(sender.clone(), &config);
        Arc::new(Self {
            sender,
            receiver,
            writer: tokio::sync::Mutex::new(WriteState {
                next_sequence_number: 1,
                closed: false,
            }),
            read_finished: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            ticker: Mutex::new(None),
            tick_interval: config.tick_interval,
        })
    }

    /// Start the retransmission timer.
    ///
    /// The timer holds only a weak reference and stops when the layer is
    /// dropped or invalidated.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(layer) = weak.upgrade() else {
                    break;
                };
                if !layer.is_valid() {
                    break;
                }
                if let Err(e) = layer.sender.tick() {
                    warn!(error = %e, "write failed during retransmission");
                    layer.invalidate();
                    break;
                }
            }
        });
        if let Some(old) = self.ticker.lock().replace(handle) {
            old.abort();
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Feed a frame read from the transport.
    pub fn handle_read(&self, frame: Vec<u8>) -> Result<(), ReliabilityError> {
        self.receiver.handle_read(frame)
    }

    /// Send `data`, split into frames of at most
    /// [`MAX_PAYLOAD_LENGTH`] bytes.
    pub async fn write(&self, data: &[u8]) -> Result<(), ReliabilityError> {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(ReliabilityError::Closed);
        }
        for chunk in data.chunks(MAX_PAYLOAD_LENGTH) {
            let frame = DataFrame::new(writer.next_sequence_number, chunk, false);
            self.sender.write(frame).await?;
            writer.next_sequence_number += 1;
        }
        Ok(())
    }

    /// Send the last segment and wait until everything is acknowledged.
    pub async fn close(&self) -> Result<(), ReliabilityError> {
        {
            let mut writer = self.writer.lock().await;
            if !writer.closed {
                let frame = DataFrame::new(writer.next_sequence_number, &[], true);
                self.sender.write(frame).await?;
                writer.next_sequence_number += 1;
                writer.closed = true;
            }
        }
        self.sender.flush().await?;
        debug!("reliable stream closed");
        Ok(())
    }

    /// Read the next payload in order. Returns `None` once the last
    /// segment has been delivered.
    pub async fn read_payload(&self) -> Result<Option<Vec<u8>>, ReliabilityError> {
        loop {
            if self.read_finished.load(Ordering::Acquire) {
                return Ok(None);
            }
            let frame = self.receiver.read().await?;
            if frame.is_last() {
                self.read_finished.store(true, Ordering::Release);
            }
            // Skip empty frames, including the empty last segment
            if frame.payload_len() > 0 {
                return Ok(Some(frame.payload().to_vec()));
            }
        }
    }

    /// Close both halves and wake every waiter. Idempotent.
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            debug!("invalidating reliability layer");
        }
        self.sender.invalidate();
        self.receiver.invalidate();
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ReliabilityLayer {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}
