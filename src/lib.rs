//! # quic-recovery: Loss Detection Core for a QUIC Endpoint
//!
//! This crate implements the loss-recovery subsystem of a QUIC transport:
//! it observes outbound packet sends and inbound acknowledgements, maintains
//! a round-trip-time estimate, decides which unacknowledged packets are
//! lost, and drives a single retransmission alarm through four modes
//! (handshake retransmission, early/time-based loss detection, Tail Loss
//! Probe, and Retransmission Timeout), following the IETF QUIC
//! loss-recovery draft (RTT smoothing per RFC 6298).
//!
//! Everything around the core is an external collaborator consumed through
//! traits:
//!
//! - [`Transmitter`] sends new packets and retransmits previously sent ones;
//! - [`CongestionController`] is told about losses;
//! - [`timer::Clock`] and [`timer::TimerService`] supply monotonic time and
//!   recurring callbacks.
//!
//! Wire encoding, ACK-frame parsing, TLS, flow control, and the event loop
//! are out of scope: the core consumes already-parsed [`frames::AckFrame`]
//! values and opaque [`packet::SentPacket`] handles.
//!
//! ## Module Guide
//!
//! - [`recovery`] - the detector, sent-packet registry, RTT estimator, and
//!   the collaborator traits.
//! - [`frames`] - parsed frame types the detector dispatches on.
//! - [`packet`] - packet-type classification and the sent-packet handle.
//! - [`timer`] - clock/timer abstractions plus thread-backed defaults.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quic_recovery::{LossDetector, RecoveryConfig};
//! use quic_recovery::timer::{MonotonicClock, ThreadTimerService};
//!
//! let detector = LossDetector::new(
//!     connection_id,
//!     RecoveryConfig::default(),
//!     transmitter,          // Arc<dyn Transmitter>
//!     congestion,           // Arc<dyn CongestionController>
//!     Arc::new(MonotonicClock::new()),
//!     Arc::new(ThreadTimerService::new()),
//! );
//!
//! detector.on_packet_sent(packet);      // as frames go on the wire
//! detector.handle_frame(&frame)?;       // inbound ACK frames
//! detector.shutdown();                  // on connection teardown
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod timer;
pub mod types;

pub use error::{Error, Result};
pub use frames::{AckBlock, AckFrame, Frame, FrameType};
pub use packet::{PacketType, SentPacket};
pub use recovery::{
    CongestionController, LossDetector, PacketInfo, RecoveryConfig, RttEstimator, SentRegistry,
    Transmitter,
};
pub use timer::{Clock, MonotonicClock, ThreadTimerService, TimerHandle, TimerService};
pub use types::{ConnectionId, Instant, PacketNumber};
