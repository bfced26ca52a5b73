//! Reliability layer
//!
//! Sliding-window ARQ for transports that exchange discrete frames without
//! ordering or integrity guarantees (short-range radio links):
//!
//! - **Frames**: [`DataFrame`] and [`AckFrame`] with a 32-bit checksum
//! - **Sender**: outstanding queue, peer window, RFC 6298 retransmission
//! - **Receiver**: reorder buffer, window budget, acks for every valid frame
//! - **Layer**: [`ReliabilityLayer`] ties both halves to a retransmission timer

mod frame;
mod layer;
mod receiver;
mod sender;

pub use frame::{checksum, AckFrame, DataFrame, FrameType};
pub use layer::{ReliabilityConfig, ReliabilityConfigBuilder, ReliabilityLayer};
pub use receiver::Receiver;
pub use sender::{RtoEstimator, Sender, WriteHandler};
