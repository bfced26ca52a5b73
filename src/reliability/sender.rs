//! Sender half of the ARQ layer.
//!
//! Tracks unacknowledged data frames, respects the window the peer
//! advertises in its acks and retransmits on timeout. RTT estimation
//! follows RFC 6298.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::frame::{AckFrame, DataFrame};
use super::ReliabilityConfig;
use crate::core::ReliabilityError;

/// Hands encoded frames to the underlying transport.
///
/// Implementations must not block: the sender calls this with its own
/// bookkeeping already updated and expects the frame to be queued.
pub trait WriteHandler: Send + Sync + 'static {
    /// Queue one frame for transmission.
    fn handle_write(&self, frame: &[u8]) -> io::Result<()>;
}

/// RFC 6298 retransmission timeout estimator.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RtoEstimator {
    /// Create an estimator with no samples.
    pub fn new(initial_rtt_var: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        let mut estimator = Self {
            srtt: Duration::ZERO,
            rttvar: initial_rtt_var,
            rto: min_rto,
            min_rto,
            max_rto,
        };
        estimator.recompute();
        estimator
    }

    fn recompute(&mut self) {
        // RTO = SRTT + 4 * RTTVAR
        self.rto = (self.srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto);
    }

    /// Feed an RTT sample from a frame that was not retransmitted.
    pub fn update(&mut self, rtt: Duration) {
        let srtt = self.srtt.as_secs_f64();
        let sample = rtt.as_secs_f64();

        // RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - R'|
        let rttvar = 0.75 * self.rttvar.as_secs_f64() + 0.25 * (srtt - sample).abs();
        // SRTT = 7/8 * SRTT + 1/8 * R'
        let srtt = 0.875 * srtt + 0.125 * sample;

        self.srtt = Duration::from_secs_f64(srtt);
        self.rttvar = Duration::from_secs_f64(rttvar);
        self.recompute();
    }

    /// Double the timeout after a retransmission.
    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }
}

#[derive(Debug)]
struct Outstanding {
    frame: DataFrame,
    last_sent: Instant,
    retransmitted: bool,
}

#[derive(Debug)]
struct SenderState {
    outstanding: VecDeque<Outstanding>,
    outstanding_bytes: usize,
    /// Free receive window last advertised by the peer.
    window_size: usize,
    last_window_update: Instant,
    data_waiting: bool,
    rto: RtoEstimator,
}

/// Sender half of a reliable connection.
pub struct Sender {
    handler: Arc<dyn WriteHandler>,
    state: Mutex<SenderState>,
    notify: Notify,
    valid: AtomicBool,
    write_timeout: Duration,
}

impl Sender {
    /// Create a sender writing through `handler`.
    pub fn new(handler: Arc<dyn WriteHandler>, config: &ReliabilityConfig) -> Self {
        Self {
            handler,
            state: Mutex::new(SenderState {
                outstanding: VecDeque::new(),
                outstanding_bytes: 0,
                window_size: config.initial_window,
                last_window_update: Instant::now(),
                data_waiting: false,
                rto: RtoEstimator::new(config.initial_rtt_var, config.min_rto, config.max_rto),
            }),
            notify: Notify::new(),
            valid: AtomicBool::new(true),
            write_timeout: config.write_timeout,
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Send an acknowledgement for `sequence_number` advertising
    /// `window_size` free bytes.
    pub fn send_ack(&self, sequence_number: u64, window_size: usize) -> io::Result<()> {
        trace!(sequence_number, window_size, "sending ack");
        let window = u32::try_from(window_size).unwrap_or(u32::MAX);
        self.handler.handle_write(AckFrame::new(sequence_number, window).as_bytes())
    }

    /// Process an ack frame from the peer. Malformed acks are ignored.
    pub fn handle_ack(&self, bytes: &[u8]) {
        let Some(ack) = AckFrame::parse(bytes) else {
            trace!(len = bytes.len(), "ignoring invalid ack");
            return;
        };
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let sequence_number = ack.sequence_number();
            if sequence_number > 0 {
                let acked = state
                    .outstanding
                    .iter()
                    .position(|o| o.frame.sequence_number() == sequence_number);
                if let Some(pos) = acked {
                    if let Some(o) = state.outstanding.remove(pos) {
                        state.outstanding_bytes -= o.frame.payload_len();
                        // Karn's algorithm: no samples from retransmitted frames
                        if !o.retransmitted {
                            state.rto.update(now - o.last_sent);
                        }
                    }
                }
            }
            state.window_size = ack.window_size() as usize;
            state.last_window_update = now;
        }
        self.notify.notify_waiters();
    }

    /// Retransmit timed-out frames and probe a closed window.
    ///
    /// Called periodically by the reliability layer.
    pub fn tick(&self) -> io::Result<()> {
        let now = Instant::now();
        let (retransmit, probe) = {
            let mut state = self.state.lock();
            let rto = state.rto.rto();
            let mut retransmit = Vec::new();
            for o in state.outstanding.iter_mut() {
                if now - o.last_sent > rto {
                    o.last_sent = now;
                    o.retransmitted = true;
                    retransmit.push(o.frame.clone());
                }
            }
            if !retransmit.is_empty() {
                state.rto.back_off();
            }
            let probe = state.data_waiting && now - state.last_window_update > rto;
            if probe {
                state.last_window_update = now;
            }
            (retransmit, probe)
        };

        for frame in &retransmit {
            debug!(sequence_number = frame.sequence_number(), "retransmitting");
            self.handler.handle_write(frame.as_bytes())?;
        }
        if probe {
            trace!("sending window probe");
            self.handler.handle_write(DataFrame::new(0, &[], false).as_bytes())?;
        }
        Ok(())
    }

    /// Send a data frame, waiting for room in the peer's window.
    pub async fn write(&self, frame: DataFrame) -> Result<(), ReliabilityError> {
        let deadline = Instant::now() + self.write_timeout;
        let payload_len = frame.payload_len();
        let mut frame = Some(frame);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_valid() {
                return Err(ReliabilityError::Closed);
            }
            {
                let mut state = self.state.lock();
                if state.outstanding_bytes + payload_len <= state.window_size {
                    if let Some(frame) = frame.take() {
                        let bytes = frame.as_bytes().to_vec();
                        state.outstanding.push_back(Outstanding {
                            frame,
                            last_sent: Instant::now(),
                            retransmitted: false,
                        });
                        state.outstanding_bytes += payload_len;
                        state.data_waiting = false;
                        drop(state);
                        self.handler.handle_write(&bytes)?;
                    }
                    return Ok(());
                }
                state.data_waiting = true;
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

    /// Wait until every sent frame has been acknowledged.
    pub async fn flush(&self) -> Result<(), ReliabilityError> {
        let deadline = Instant::now() + self.write_timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_valid() {
                return Err(ReliabilityError::Closed);
            }
            if self.state.lock().outstanding.is_empty() {
                return Ok(());
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

    /// Number of unacknowledged frames.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.state.lock().rto.rto()
    }

    /// Close the sender and wake every waiting writer. Idempotent.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{INITIAL_RTT_VAR, MAX_RTO, MIN_RTO};

    /// Records every frame handed to the transport.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingHandler {
        pub(crate) fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.frames.lock())
        }
    }

    impl WriteHandler for RecordingHandler {
        fn handle_write(&self, frame: &[u8]) -> io::Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn sender(config: &ReliabilityConfig) -> (Arc<Sender>, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        (Arc::new(Sender::new(handler.clone(), config)), handler)
    }

    #[test]
    fn test_rto_initial_and_bounds() {
        let rto = RtoEstimator::new(INITIAL_RTT_VAR, MIN_RTO, MAX_RTO);
        // 0 + 4 * 3s
        assert_eq!(rto.rto(), Duration::from_secs(12));

        let mut rto = rto;
        for _ in 0..10 {
            rto.back_off();
        }
        assert_eq!(rto.rto(), MAX_RTO);
    }

    #[test]
    fn test_rto_converges_on_stable_rtt() {
        let mut rto = RtoEstimator::new(INITIAL_RTT_VAR, MIN_RTO, MAX_RTO);
        for _ in 0..50 {
            rto.update(Duration::from_millis(100));
        }
        assert_eq!(rto.rto(), MIN_RTO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_ack() {
        let (s, h) = sender(&ReliabilityConfig::default());
        s.write(DataFrame::new(1, b"abc", false)).await.unwrap();
        assert_eq!(h.take().len(), 1);
        assert_eq!(s.outstanding(), 1);

        s.handle_ack(AckFrame::new(1, 8192).as_bytes());
        assert_eq!(s.outstanding(), 0);
        s.flush().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_after_rto() {
        let (s, h) = sender(&ReliabilityConfig::default());
        s.write(DataFrame::new(1, b"abc", false)).await.unwrap();
        h.take();

        s.tick().unwrap();
        assert!(h.take().is_empty());

        tokio::time::advance(s.rto() + Duration::from_millis(1)).await;
        let before = s.rto();
        s.tick().unwrap();
        let frames = h.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(DataFrame::from_bytes(frames[0].clone()).unwrap().sequence_number(), 1);
        assert!(s.rto() > before || s.rto() == MAX_RTO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_blocks_on_closed_window_then_resumes() {
        let (s, h) = sender(&ReliabilityConfig::default());
        s.handle_ack(AckFrame::new(0, 0).as_bytes());

        let writer = {
            let s = s.clone();
            tokio::spawn(async move { s.write(DataFrame::new(1, b"data", false)).await })
        };
        tokio::task::yield_now().await;
        assert!(h.take().is_empty());

        s.handle_ack(AckFrame::new(0, 1024).as_bytes());
        writer.await.unwrap().unwrap();
        assert_eq!(h.take().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_times_out() {
        let config = ReliabilityConfig {
            write_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (s, _h) = sender(&config);
        s.handle_ack(AckFrame::new(0, 0).as_bytes());
        let err = s.write(DataFrame::new(1, b"x", false)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_probe() {
        let (s, h) = sender(&ReliabilityConfig::default());
        s.handle_ack(AckFrame::new(0, 0).as_bytes());
        let writer = {
            let s = s.clone();
            tokio::spawn(async move { s.write(DataFrame::new(1, b"x", false)).await })
        };
        tokio::task::yield_now().await;

        tokio::time::advance(s.rto() + Duration::from_millis(1)).await;
        s.tick().unwrap();
        let frames = h.take();
        assert_eq!(frames.len(), 1);
        let probe = DataFrame::from_bytes(frames[0].clone()).unwrap();
        assert_eq!(probe.sequence_number(), 0);
        assert_eq!(probe.payload_len(), 0);

        s.invalidate();
        assert!(matches!(writer.await.unwrap(), Err(ReliabilityError::Closed)));
    }
}
