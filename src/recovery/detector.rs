//! # Loss Detector and Alarm Controller
//!
//! The per-connection state machine: observes sends and ACKs, maintains the
//! RTT estimate, declares losses, and drives a single alarm through four
//! retransmission modes in priority order (handshake retransmission,
//! early/time-based loss detection, Tail Loss Probe, Retransmission
//! Timeout), per the IETF QUIC loss-recovery draft.
//!
//! ## Locking
//!
//! All mutable state sits behind one lock. Entry points (`on_packet_sent`,
//! `handle_frame`, timer ticks) acquire it on entry. Retransmission actions
//! additionally take the transmitter's lock first; the global order is
//! transmitter lock, then core lock.

#![forbid(unsafe_code)]

use core::time::Duration;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frames::{AckFrame, Frame, FrameType};
use crate::packet::SentPacket;
use crate::timer::{Clock, TimerHandle, TimerService};
use crate::types::{ConnectionId, Instant, PacketNumber};

use super::registry::{PacketInfo, SentRegistry};
use super::rtt::RttEstimator;
use super::{CongestionController, RecoveryConfig, Transmitter};

/// Mutable detector state, protected by the core lock.
struct DetectorState {
    largest_sent_packet: Option<PacketNumber>,
    largest_acked_packet: Option<PacketNumber>,
    time_of_last_sent_packet: Option<Instant>,
    rtt: RttEstimator,
    sent_packets: SentRegistry,

    /// Earliest predicted future loss event, arming the time-loss alarm.
    loss_time: Option<Instant>,

    handshake_count: u32,
    tlp_count: u32,
    rto_count: u32,
    largest_sent_before_rto: Option<PacketNumber>,

    alarm_at: Option<Instant>,
    alarm_handle: Option<Box<dyn TimerHandle>>,
}

impl DetectorState {
    fn new() -> Self {
        Self {
            largest_sent_packet: None,
            largest_acked_packet: None,
            time_of_last_sent_packet: None,
            rtt: RttEstimator::new(),
            sent_packets: SentRegistry::new(),
            loss_time: None,
            handshake_count: 0,
            tlp_count: 0,
            rto_count: 0,
            largest_sent_before_rto: None,
            alarm_at: None,
            alarm_handle: None,
        }
    }
}

/// Per-connection loss detector.
///
/// Created once per connection; reentrant from the sender, receiver, and
/// timer threads. [`LossDetector::shutdown`] cancels the alarm and releases
/// the transmitter.
pub struct LossDetector {
    connection_id: ConnectionId,
    config: RecoveryConfig,

    /// Effective packet-count threshold; infinite when time-based loss
    /// detection is selected.
    reordering_threshold: u64,

    /// Effective time-reordering fraction; infinite disables time-based
    /// loss detection.
    time_reordering_fraction: f64,

    clock: Arc<dyn Clock>,
    timer: Arc<dyn TimerService>,
    congestion: Arc<dyn CongestionController>,
    transmitter: RwLock<Option<Arc<dyn Transmitter>>>,
    shut_down: AtomicBool,
    state: Mutex<DetectorState>,
    weak_self: Weak<LossDetector>,
}

impl LossDetector {
    pub fn new(
        connection_id: ConnectionId,
        config: RecoveryConfig,
        transmitter: Arc<dyn Transmitter>,
        congestion: Arc<dyn CongestionController>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn TimerService>,
    ) -> Arc<Self> {
        let (reordering_threshold, time_reordering_fraction) = if config.time_loss_detection {
            (u64::MAX, config.time_reordering_fraction)
        } else {
            (config.reordering_threshold, f64::INFINITY)
        };

        Arc::new_cyclic(|weak_self| Self {
            connection_id,
            config,
            reordering_threshold,
            time_reordering_fraction,
            clock,
            timer,
            congestion,
            transmitter: RwLock::new(Some(transmitter)),
            shut_down: AtomicBool::new(false),
            state: Mutex::new(DetectorState::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Frame types this component consumes.
    pub fn interests(&self) -> &'static [FrameType] {
        &[FrameType::Ack]
    }

    /// Record an outbound packet as it goes on the wire.
    pub fn on_packet_sent(&self, packet: SentPacket) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock();

        let packet_number = packet.packet_number();
        let retransmittable = packet.is_retransmittable();
        debug_assert!(
            state
                .largest_sent_packet
                .map_or(true, |largest| packet_number > largest),
            "sent packet number {packet_number} does not exceed the largest sent"
        );
        state.largest_sent_packet = Some(packet_number);
        state.time_of_last_sent_packet = Some(now);
        state.sent_packets.insert(PacketInfo::new(now, packet));

        if retransmittable {
            self.set_alarm(&mut state, now);
        }
        self.log_outstanding(&state, "packet sent");
    }

    /// Dispatch a parsed frame to the detector.
    ///
    /// Only ACK frames are expected; anything else is an internal dispatch
    /// error, asserted in debug builds and signalled in release.
    pub fn handle_frame(&self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Ack(ack) => {
                self.on_ack_received(ack);
                Ok(())
            }
            other => {
                debug_assert!(
                    false,
                    "unexpected frame type {:?} delivered to loss detection",
                    other.frame_type()
                );
                warn!(
                    cid = self.connection_id,
                    frame_type = ?other.frame_type(),
                    "unexpected frame type delivered to loss detection"
                );
                Err(Error::UnexpectedFrame(other.frame_type()))
            }
        }
    }

    /// Largest packet number the peer has acknowledged, if any.
    pub fn largest_acked_packet_number(&self) -> Option<PacketNumber> {
        self.state.lock().largest_acked_packet
    }

    /// Number of packets currently tracked as in flight.
    pub fn in_flight(&self) -> usize {
        self.state.lock().sent_packets.len()
    }

    /// In-flight packets carrying ACK-eliciting content.
    pub fn retransmittable_outstanding(&self) -> usize {
        self.state.lock().sent_packets.retransmittable_outstanding()
    }

    /// In-flight packets carrying handshake cryptographic content.
    pub fn handshake_outstanding(&self) -> usize {
        self.state.lock().sent_packets.handshake_outstanding()
    }

    /// Current RTT estimate snapshot.
    pub fn rtt(&self) -> RttEstimator {
        self.state.lock().rtt
    }

    /// When the most recent packet went on the wire, if any has.
    pub fn time_of_last_sent_packet(&self) -> Option<Instant> {
        self.state.lock().time_of_last_sent_packet
    }

    /// Deadline the loss-detection alarm is armed for, if armed.
    pub fn alarm_deadline(&self) -> Option<Instant> {
        self.state.lock().alarm_at
    }

    /// Cancel the alarm and release the transmitter. Idempotent; alarm
    /// firings after shutdown are ignored.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(cid = self.connection_id, "loss detection shutdown");
        let handle = {
            let mut state = self.state.lock();
            state.alarm_at = None;
            state.alarm_handle.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        *self.transmitter.write() = None;
    }

    // ------------------------------------------------------------------
    // ACK processing
    // ------------------------------------------------------------------

    fn on_ack_received(&self, ack: &AckFrame) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock();

        state.largest_acked_packet = Some(
            state
                .largest_acked_packet
                .map_or(ack.largest_acknowledged, |largest| {
                    largest.max(ack.largest_acknowledged)
                }),
        );

        // A newly acked largest packet yields an RTT sample, corrected for
        // the peer's reported ACK delay (milliseconds on the wire).
        if let Some(info) = state.sent_packets.get(ack.largest_acknowledged) {
            let mut latest_rtt = now.saturating_duration_since(info.time_sent());
            let ack_delay = Duration::from_millis(ack.ack_delay);
            if latest_rtt > ack_delay {
                latest_rtt -= ack_delay;
            }
            state.rtt.update(latest_rtt);
        }

        self.log_outstanding(&state, "ack received");

        let newly_acked: Vec<PacketNumber> = ack
            .acknowledged()
            .into_iter()
            .filter(|pn| state.sent_packets.contains(*pn))
            .collect();
        for packet_number in newly_acked {
            self.on_packet_acked(&mut state, packet_number);
        }

        self.log_outstanding(&state, "newly acked removed");

        self.detect_lost_packets(&mut state, ack.largest_acknowledged, now);

        self.log_outstanding(&state, "loss detection ran");

        self.set_alarm(&mut state, now);
    }

    fn on_packet_acked(&self, state: &mut DetectorState, packet_number: PacketNumber) {
        debug!(
            cid = self.connection_id,
            packet_number, "packet has been acked"
        );
        if state.rto_count > 0
            && state
                .largest_sent_before_rto
                .map_or(false, |largest| packet_number > largest)
        {
            self.congestion.on_retransmission_timeout_verified();
        }
        state.handshake_count = 0;
        state.tlp_count = 0;
        state.rto_count = 0;
        state.sent_packets.remove(packet_number);
    }

    /// One pass over the registry applying the time rule and the
    /// packet-count rule, recording the earliest future moment the oldest
    /// survivor would cross the time threshold.
    fn detect_lost_packets(
        &self,
        state: &mut DetectorState,
        largest_acked: PacketNumber,
        now: Instant,
    ) {
        state.loss_time = None;

        let delay_until_lost = if self.time_reordering_fraction.is_finite() {
            Some(
                state
                    .rtt
                    .loss_delay_base()
                    .mul_f64(1.0 + self.time_reordering_fraction),
            )
        } else if state.largest_sent_packet == Some(largest_acked) {
            // Early retransmit: nothing in flight beyond the largest acked
            // can raise the packet count, so fall back to a time threshold.
            Some(state.rtt.loss_delay_base().mul_f64(9.0 / 8.0))
        } else {
            None
        };

        let mut lost_packets = BTreeSet::new();
        let mut loss_time = None;
        for (packet_number, info) in state.sent_packets.iter_ascending() {
            if packet_number >= largest_acked {
                break;
            }
            let time_since_sent = now.saturating_duration_since(info.time_sent());
            let packet_delta = largest_acked - packet_number;

            if delay_until_lost.map_or(false, |delay| time_since_sent > delay) {
                lost_packets.insert(packet_number);
            } else if packet_delta > self.reordering_threshold {
                lost_packets.insert(packet_number);
            } else if loss_time.is_none() {
                if let Some(delay) = delay_until_lost {
                    loss_time = Some(now + (delay - time_since_sent));
                }
            }
        }
        state.loss_time = loss_time;

        if !lost_packets.is_empty() {
            debug!(
                cid = self.connection_id,
                count = lost_packets.len(),
                "packets declared lost"
            );
            self.congestion.on_packets_lost(&lost_packets);
            for packet_number in &lost_packets {
                state.sent_packets.remove(*packet_number);
            }
        }
    }

    // ------------------------------------------------------------------
    // Alarm control
    // ------------------------------------------------------------------

    /// Arm the alarm to the earliest relevant deadline, or cancel it when
    /// nothing retransmittable is outstanding.
    fn set_alarm(&self, state: &mut DetectorState, now: Instant) {
        if state.sent_packets.retransmittable_outstanding() == 0 {
            state.alarm_at = None;
            if let Some(handle) = state.alarm_handle.take() {
                handle.cancel();
                debug!(cid = self.connection_id, "loss detection alarm unset");
            }
            return;
        }

        let smoothed_rtt = state.rtt.smoothed_rtt();
        let alarm_duration = if state.sent_packets.handshake_outstanding() > 0 {
            // Handshake retransmission alarm.
            let base = if smoothed_rtt == Duration::ZERO {
                self.config.default_initial_rtt * 2
            } else {
                smoothed_rtt * 2
            };
            debug!(cid = self.connection_id, "handshake retransmission alarm");
            base.max(self.config.min_tlp_timeout) * 2u32.saturating_pow(state.handshake_count)
        } else if let Some(loss_time) = state.loss_time {
            // Early retransmit timer or time loss detection. A deadline in
            // the past fires on the next tick.
            debug!(cid = self.connection_id, "time loss detection alarm");
            loss_time.saturating_duration_since(now)
        } else if state.tlp_count < self.config.max_tlps {
            // Tail Loss Probe.
            let duration = if state.sent_packets.retransmittable_outstanding() > 0 {
                smoothed_rtt.mul_f64(1.5) + self.config.delayed_ack_timeout
            } else {
                self.config.min_tlp_timeout
            };
            debug!(cid = self.connection_id, "TLP alarm");
            duration.max(smoothed_rtt * 2)
        } else {
            // Retransmission Timeout.
            let duration = (smoothed_rtt + state.rtt.rttvar() * 4).max(self.config.min_rto_timeout);
            debug!(cid = self.connection_id, "RTO alarm");
            duration * 2u32.saturating_pow(state.rto_count)
        };

        let deadline = now + alarm_duration;
        state.alarm_at = Some(match state.alarm_at {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        debug!(
            cid = self.connection_id,
            duration_ms = alarm_duration.as_millis() as u64,
            "loss detection alarm set"
        );

        if state.alarm_handle.is_none() {
            let weak = self.weak_self.clone();
            state.alarm_handle = Some(self.timer.schedule_every(
                Box::new(move || {
                    if let Some(detector) = weak.upgrade() {
                        detector.on_timer_tick();
                    }
                }),
                self.config.alarm_granularity,
            ));
        }
    }

    /// Recurring-tick entry point: fire the alarm once the deadline passed.
    fn on_timer_tick(&self) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let due = {
            let state = self.state.lock();
            matches!(state.alarm_at, Some(at) if self.clock.now() >= at)
        };
        if due {
            self.on_alarm_fired();
        }
    }

    fn on_alarm_fired(&self) {
        let transmitter = match self.transmitter.read().clone() {
            Some(transmitter) => transmitter,
            None => return,
        };
        // Transmitter lock strictly before the core lock.
        let _transmitter_guard = transmitter.mutex().lock();
        let mut state = self.state.lock();
        let now = self.clock.now();
        match state.alarm_at {
            Some(at) if now >= at => {}
            _ => return,
        }
        // Clear the fired deadline so the re-arm below starts from `now`.
        state.alarm_at = None;

        if state.sent_packets.handshake_outstanding() > 0 {
            self.retransmit_handshake_packets(&mut state, transmitter.as_ref());
            state.handshake_count += 1;
        } else if state.loss_time.is_some() {
            let largest_acked = state.largest_acked_packet.unwrap_or(0);
            self.detect_lost_packets(&mut state, largest_acked, now);
        } else if state.tlp_count < self.config.max_tlps {
            debug!(cid = self.connection_id, "TLP");
            self.send_one_packet(&state, transmitter.as_ref());
            state.tlp_count += 1;
        } else {
            if state.rto_count == 0 {
                state.largest_sent_before_rto = state.largest_sent_packet;
            }
            debug!(cid = self.connection_id, "RTO");
            self.send_two_packets(&state, transmitter.as_ref());
            state.rto_count += 1;
        }

        self.log_outstanding(&state, "alarm fired");
        self.set_alarm(&mut state, now);
    }

    // ------------------------------------------------------------------
    // Retransmission actions
    // ------------------------------------------------------------------

    /// Retransmit the contiguous prefix of handshake packets and drop them
    /// from the registry.
    fn retransmit_handshake_packets(&self, state: &mut DetectorState, transmitter: &dyn Transmitter) {
        let mut retransmitted = Vec::new();
        for (packet_number, info) in state.sent_packets.iter_ascending() {
            if !info.is_handshake() {
                break;
            }
            transmitter.retransmit_packet(info.packet());
            retransmitted.push(packet_number);
        }
        for packet_number in retransmitted {
            state.sent_packets.remove(packet_number);
        }
    }

    /// TLP: ask for a new packet; when nothing was queued, retransmit the
    /// most recently sent packet instead.
    fn send_one_packet(&self, state: &DetectorState, transmitter: &dyn Transmitter) {
        if transmitter.transmit_packet(None) < 1 {
            if let Some((_, info)) = state.sent_packets.iter_descending().next() {
                transmitter.retransmit_packet(info.packet());
            }
        }
    }

    /// RTO: retransmit the two most recently sent packets, or request a new
    /// packet when the registry is empty.
    fn send_two_packets(&self, state: &DetectorState, transmitter: &dyn Transmitter) {
        let mut newest = state.sent_packets.iter_descending();
        match newest.next() {
            Some((_, info)) => {
                transmitter.retransmit_packet(info.packet());
                if let Some((_, info)) = newest.next() {
                    transmitter.retransmit_packet(info.packet());
                }
            }
            None => {
                transmitter.transmit_packet(None);
            }
        }
    }

    fn log_outstanding(&self, state: &DetectorState, context: &str) {
        debug!(
            cid = self.connection_id,
            unacked = state.sent_packets.len(),
            retransmittable = state.sent_packets.retransmittable_outstanding(),
            handshake = state.sent_packets.handshake_outstanding(),
            "unacked packets: {context}"
        );
    }
}

impl Drop for LossDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.state.lock().alarm_handle.take() {
            handle.cancel();
        }
    }
}
