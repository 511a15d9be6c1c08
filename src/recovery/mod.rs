//! # Loss Detection and Retransmission Timers
//!
//! The recovery subsystem observes outbound packet sends and inbound
//! acknowledgements, estimates the round-trip time, decides which unacked
//! packets are lost, and drives a single alarm through four retransmission
//! modes (handshake retransmission, early/time-based loss detection, Tail
//! Loss Probe, Retransmission Timeout), following the IETF QUIC
//! loss-recovery draft.
//!
//! ## Components
//!
//! 1. **RTT Estimation** ([`rtt::RttEstimator`]): smoothed RTT and variance
//!    per RFC 6298, corrected for peer-reported ACK delay.
//! 2. **Sent-Packet Registry** ([`registry::SentRegistry`]): ordered map of
//!    in-flight packets with retransmittable/handshake counters.
//! 3. **Loss Detector / Alarm Controller** ([`detector::LossDetector`]):
//!    the state machine tying the two together and driving the alarm.
//!
//! ## Collaborators
//!
//! The surrounding transport is consumed through traits: a [`Transmitter`]
//! that sends and retransmits packets, a [`CongestionController`] informed
//! of losses, and the clock/timer traits in [`crate::timer`]. Retransmission
//! actions take the transmitter's lock before the core lock; that ordering
//! is global.

#![forbid(unsafe_code)]

use core::time::Duration;
use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::packet::SentPacket;
use crate::types::PacketNumber;

pub mod detector;
pub mod registry;
pub mod rtt;

pub use detector::LossDetector;
pub use registry::{PacketInfo, SentRegistry};
pub use rtt::RttEstimator;

// ============================================================================
// Constants (loss-recovery draft Section 3.2.1)
// ============================================================================

/// Packet-number reordering threshold before a packet is declared lost.
pub const REORDERING_THRESHOLD: u64 = 3;

/// Fraction of an RTT a packet may be outstanding past a later
/// acknowledgement before time-based loss declares it lost.
pub const TIME_REORDERING_FRACTION: f64 = 1.0 / 8.0;

/// Maximum number of Tail Loss Probes before falling back to RTO.
pub const MAX_TLPS: u32 = 2;

/// Minimum Tail Loss Probe timeout.
pub const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);

/// Minimum Retransmission Timeout.
pub const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);

/// Assumed peer delayed-ACK timer, added to the TLP timeout.
pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(25);

/// RTT assumed before the first sample.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

/// Period of the recurring tick polled against the alarm deadline.
pub const ALARM_GRANULARITY: Duration = Duration::from_millis(25);

/// Recovery configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub reordering_threshold: u64,
    pub time_reordering_fraction: f64,
    pub max_tlps: u32,
    pub min_tlp_timeout: Duration,
    pub min_rto_timeout: Duration,
    pub delayed_ack_timeout: Duration,
    pub default_initial_rtt: Duration,
    pub alarm_granularity: Duration,

    /// Mode selector. When true, packet-count reordering is disabled (the
    /// threshold becomes effectively infinite) and time-based loss detection
    /// runs with `time_reordering_fraction`; when false, the roles swap and
    /// the fraction is infinite.
    pub time_loss_detection: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reordering_threshold: REORDERING_THRESHOLD,
            time_reordering_fraction: TIME_REORDERING_FRACTION,
            max_tlps: MAX_TLPS,
            min_tlp_timeout: MIN_TLP_TIMEOUT,
            min_rto_timeout: MIN_RTO_TIMEOUT,
            delayed_ack_timeout: DELAYED_ACK_TIMEOUT,
            default_initial_rtt: DEFAULT_INITIAL_RTT,
            alarm_granularity: ALARM_GRANULARITY,
            time_loss_detection: false,
        }
    }
}

// ============================================================================
// Consumed Collaborator Traits
// ============================================================================

/// Packet transmitter consumed by the recovery core.
///
/// The transmitter's lock must be acquired before the recovery core's lock;
/// the detector does this for every retransmission action.
pub trait Transmitter: Send + Sync {
    /// Enqueue a new packet for transmission, or signal write-readiness when
    /// no packet is supplied. Returns the number of packets queued.
    fn transmit_packet(&self, packet: Option<SentPacket>) -> u32;

    /// Enqueue a retransmission of the packet's non-ACK, non-PADDING frames
    /// in a new packet. The handle is only borrowed for the call.
    fn retransmit_packet(&self, packet: &SentPacket);

    /// The transmitter's lock handle.
    fn mutex(&self) -> &Mutex<()>;
}

/// Congestion controller consumed by the recovery core.
///
/// Invoked under the core lock; calls are serialized per connection.
pub trait CongestionController: Send + Sync {
    /// Packets were declared lost.
    fn on_packets_lost(&self, lost: &BTreeSet<PacketNumber>);

    /// A packet sent after an RTO was acknowledged, proving the timeout was
    /// not spurious.
    fn on_retransmission_timeout_verified(&self) {}
}
