//! End-to-end tests of the recovery core over its public surface, with mock
//! collaborators and a manually driven clock and timer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use quic_recovery::{
    AckFrame, Clock, CongestionController, Frame, Instant, LossDetector, PacketNumber, PacketType,
    RecoveryConfig, SentPacket, TimerHandle, TimerService, Transmitter,
};

// ============================================================================
// Mock collaborators
// ============================================================================

struct MockTransmitter {
    lock: Mutex<()>,
    queueable: AtomicU32,
    transmit_calls: AtomicUsize,
    retransmitted: Mutex<Vec<PacketNumber>>,
}

impl MockTransmitter {
    fn new(queueable: u32) -> Self {
        Self {
            lock: Mutex::new(()),
            queueable: AtomicU32::new(queueable),
            transmit_calls: AtomicUsize::new(0),
            retransmitted: Mutex::new(Vec::new()),
        }
    }

    fn retransmitted(&self) -> Vec<PacketNumber> {
        self.retransmitted.lock().clone()
    }
}

impl Transmitter for MockTransmitter {
    fn transmit_packet(&self, _packet: Option<SentPacket>) -> u32 {
        self.transmit_calls.fetch_add(1, Ordering::SeqCst);
        self.queueable.load(Ordering::SeqCst)
    }

    fn retransmit_packet(&self, packet: &SentPacket) {
        self.retransmitted.lock().push(packet.packet_number());
    }

    fn mutex(&self) -> &Mutex<()> {
        &self.lock
    }
}

#[derive(Default)]
struct MockCongestion {
    lost: Mutex<Vec<PacketNumber>>,
}

impl CongestionController for MockCongestion {
    fn on_packets_lost(&self, lost: &BTreeSet<PacketNumber>) {
        self.lost.lock().extend(lost.iter().copied());
    }
}

struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
        }
    }

    fn set_ms(&self, ms: u64) {
        self.nanos.store(ms * 1_000_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

struct Scheduled {
    callback: Box<dyn FnMut() + Send>,
    cancelled: Arc<AtomicBool>,
}

/// Timer service that captures callbacks so tests deliver ticks by hand.
#[derive(Default)]
struct ManualTimer {
    scheduled: Mutex<Vec<Scheduled>>,
}

impl ManualTimer {
    /// Deliver one tick to every live schedule.
    ///
    /// Entries are taken out of the list while running so a callback that
    /// schedules or cancels does not deadlock on the list lock.
    fn fire_ticks(&self) {
        let mut active = std::mem::take(&mut *self.scheduled.lock());
        for entry in active.iter_mut() {
            if !entry.cancelled.load(Ordering::SeqCst) {
                (entry.callback)();
            }
        }
        let mut scheduled = self.scheduled.lock();
        let newly_added = std::mem::take(&mut *scheduled);
        *scheduled = active;
        scheduled.extend(newly_added);
    }
}

struct ManualHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl TimerService for ManualTimer {
    fn schedule_every(
        &self,
        callback: Box<dyn FnMut() + Send>,
        _period: Duration,
    ) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.scheduled.lock().push(Scheduled {
            callback,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(ManualHandle { cancelled })
    }
}

struct Harness {
    detector: Arc<LossDetector>,
    transmitter: Arc<MockTransmitter>,
    congestion: Arc<MockCongestion>,
    clock: Arc<ManualClock>,
    timer: Arc<ManualTimer>,
}

fn harness_with(config: RecoveryConfig, queueable: u32) -> Harness {
    let transmitter = Arc::new(MockTransmitter::new(queueable));
    let congestion = Arc::new(MockCongestion::default());
    let clock = Arc::new(ManualClock::new());
    let timer = Arc::new(ManualTimer::default());
    let detector = LossDetector::new(
        0xC0FFEE,
        config,
        Arc::clone(&transmitter) as Arc<dyn Transmitter>,
        Arc::clone(&congestion) as Arc<dyn CongestionController>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&timer) as Arc<dyn TimerService>,
    );
    Harness {
        detector,
        transmitter,
        congestion,
        clock,
        timer,
    }
}

fn harness() -> Harness {
    harness_with(RecoveryConfig::default(), 1)
}

fn data_packet(pn: PacketNumber) -> SentPacket {
    SentPacket::new(pn, PacketType::OneRtt, true, Bytes::from_static(&[0; 100]))
}

fn handshake_packet(pn: PacketNumber) -> SentPacket {
    SentPacket::new(pn, PacketType::Initial, true, Bytes::from_static(&[0; 200]))
}

fn ack(largest: PacketNumber, ack_delay_ms: u64, first_block: u64) -> Frame {
    Frame::Ack(AckFrame {
        largest_acknowledged: largest,
        ack_delay: ack_delay_ms,
        first_ack_block_length: first_block,
        ..AckFrame::default()
    })
}

fn ms(ms: u64) -> Instant {
    Instant::from_nanos(ms * 1_000_000)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn send_then_ack_round_trip() {
    let h = harness();
    h.detector.on_packet_sent(data_packet(1));
    assert_eq!(h.detector.in_flight(), 1);
    assert_eq!(h.detector.retransmittable_outstanding(), 1);
    assert!(h.detector.alarm_deadline().is_some());

    h.clock.set_ms(50);
    h.detector.handle_frame(&ack(1, 0, 0)).unwrap();

    // The registry is drained, counters are back to zero, the alarm is
    // cancelled, and the round trip seeded the RTT estimate.
    assert_eq!(h.detector.in_flight(), 0);
    assert_eq!(h.detector.retransmittable_outstanding(), 0);
    assert_eq!(h.detector.handshake_outstanding(), 0);
    assert_eq!(h.detector.alarm_deadline(), None);
    let rtt = h.detector.rtt();
    assert_eq!(rtt.latest_rtt(), Duration::from_millis(50));
    assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(50));
    assert_eq!(rtt.rttvar(), Duration::from_millis(25));
    assert_eq!(h.detector.largest_acked_packet_number(), Some(1));

    // Delivering the same ACK again changes nothing.
    h.clock.set_ms(80);
    h.detector.handle_frame(&ack(1, 0, 0)).unwrap();
    assert_eq!(h.detector.in_flight(), 0);
    assert_eq!(h.detector.rtt().smoothed_rtt(), Duration::from_millis(50));
}

#[test]
fn packet_count_reordering_declares_old_packets_lost() {
    let h = harness();
    for pn in 1..=5 {
        h.detector.on_packet_sent(data_packet(pn));
    }
    h.clock.set_ms(20);
    h.detector.handle_frame(&ack(5, 0, 0)).unwrap();

    // Only the packet more than three numbers behind the ack is lost.
    assert_eq!(h.congestion.lost.lock().clone(), vec![1]);
    assert_eq!(h.detector.in_flight(), 3);
    assert_eq!(h.detector.retransmittable_outstanding(), 3);
}

#[test]
fn time_based_loss_detection_end_to_end() {
    let config = RecoveryConfig {
        time_loss_detection: true,
        ..RecoveryConfig::default()
    };
    let h = harness_with(config, 1);

    // First exchange establishes smoothed_rtt = 100ms.
    h.detector.on_packet_sent(data_packet(1));
    h.clock.set_ms(100);
    h.detector.handle_frame(&ack(1, 0, 0)).unwrap();
    assert_eq!(h.detector.rtt().smoothed_rtt(), Duration::from_millis(100));

    h.detector.on_packet_sent(data_packet(2));
    h.clock.set_ms(110);
    h.detector.on_packet_sent(data_packet(3));

    // Ack #3 at 300ms; the reported delay keeps the corrected sample at
    // 100ms, so delay_until_lost = 1.125 * 100ms and #2 (200ms out) is lost.
    h.clock.set_ms(300);
    h.detector.handle_frame(&ack(3, 90, 0)).unwrap();

    assert_eq!(h.congestion.lost.lock().clone(), vec![2]);
    assert_eq!(h.detector.in_flight(), 0);
}

// ============================================================================
// Alarm-driven behavior through the timer service
// ============================================================================

#[test]
fn tlp_probe_fires_through_the_timer() {
    // No RTT sample: the TLP alarm is MIN-bounded at 25ms. The transmitter
    // has nothing new to queue, so the probe retransmits the newest packet.
    let h = harness_with(RecoveryConfig::default(), 0);
    h.detector.on_packet_sent(data_packet(1));
    assert_eq!(h.detector.alarm_deadline(), Some(ms(25)));

    // A tick before the deadline does nothing.
    h.clock.set_ms(10);
    h.timer.fire_ticks();
    assert!(h.transmitter.retransmitted().is_empty());

    h.clock.set_ms(25);
    h.timer.fire_ticks();
    assert_eq!(h.transmitter.transmit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transmitter.retransmitted(), vec![1]);
    // Re-armed for the second probe.
    assert!(h.detector.alarm_deadline().is_some());

    // The ACK arriving afterwards clears everything.
    h.clock.set_ms(40);
    h.detector.handle_frame(&ack(1, 0, 0)).unwrap();
    assert_eq!(h.detector.in_flight(), 0);
    assert_eq!(h.detector.alarm_deadline(), None);
}

#[test]
fn handshake_retransmission_backs_off_exponentially() {
    let h = harness();
    h.detector.on_packet_sent(handshake_packet(1));
    assert_eq!(h.detector.alarm_deadline(), Some(ms(200)));

    h.clock.set_ms(200);
    h.timer.fire_ticks();
    assert_eq!(h.transmitter.retransmitted(), vec![1]);
    assert_eq!(h.detector.handshake_outstanding(), 0);

    // The transmitter puts the retransmission back on the wire as a new
    // packet; the next unanswered firing waits twice as long.
    h.detector.on_packet_sent(handshake_packet(2));
    assert_eq!(h.detector.alarm_deadline(), Some(ms(600)));

    h.clock.set_ms(600);
    h.timer.fire_ticks();
    assert_eq!(h.transmitter.retransmitted(), vec![1, 2]);

    h.detector.on_packet_sent(handshake_packet(3));
    assert_eq!(h.detector.alarm_deadline(), Some(ms(1400)));
}

#[test]
fn rto_retransmits_two_newest_packets() {
    let h = harness();

    // Establish smoothed_rtt = 100ms, rttvar = 25ms is not reachable in
    // one sample; one sample gives rttvar = 50ms, so the RTO duration is
    // max(100 + 4*50, 200) = 300ms.
    h.detector.on_packet_sent(data_packet(1));
    h.clock.set_ms(100);
    h.detector.handle_frame(&ack(1, 0, 0)).unwrap();

    h.detector.on_packet_sent(data_packet(2));
    h.detector.on_packet_sent(data_packet(3));

    // Exhaust both TLPs (new data is queueable, so no retransmissions yet).
    h.clock.set_ms(100 + 200);
    h.timer.fire_ticks();
    h.clock.set_ms(300 + 200);
    h.timer.fire_ticks();
    assert!(h.transmitter.retransmitted().is_empty());

    // RTO: the two most recently sent packets go out again, newest first.
    h.clock.set_ms(500 + 300);
    h.timer.fire_ticks();
    assert_eq!(h.transmitter.retransmitted(), vec![3, 2]);

    // Back-off doubles for the next RTO.
    assert_eq!(h.detector.alarm_deadline(), Some(ms(800 + 600)));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_cancels_alarm_and_ignores_ticks() {
    let h = harness();
    h.detector.on_packet_sent(data_packet(1));
    assert!(h.detector.alarm_deadline().is_some());

    h.detector.shutdown();
    h.detector.shutdown();
    assert_eq!(h.detector.alarm_deadline(), None);

    // Ticks delivered after shutdown are ignored.
    h.clock.set_ms(500);
    h.timer.fire_ticks();
    assert!(h.transmitter.retransmitted().is_empty());
    assert_eq!(h.transmitter.transmit_calls.load(Ordering::SeqCst), 0);
}
