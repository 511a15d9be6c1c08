//! # Frame Types Consumed by Loss Recovery
//!
//! The detector registers interest in ACK frames only; everything else is
//! dispatched away before it gets here. Frames arrive already parsed; wire
//! decoding belongs to the packet layer.
//!
//! ## Frame Classification
//! - **ACK-eliciting / retransmittable**: PING and any payload-bearing frame
//! - **Non-ACK-eliciting**: ACK, PADDING, CONNECTION_CLOSE

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use tinyvec::TinyVec;

use crate::types::PacketNumber;

/// Frame type tag, used for interest registration and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Padding,
    Ping,
    Ack,
    ConnectionClose,
}

/// A parsed frame, as handed to the recovery core by the frame dispatcher.
///
/// Dispatch is a tagged-variant match; the detector only acts on
/// [`Frame::Ack`].
#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(AckFrame),
    ConnectionClose,
}

impl Frame {
    /// The type tag for this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack(_) => FrameType::Ack,
            Frame::ConnectionClose => FrameType::ConnectionClose,
        }
    }

    /// Whether this frame elicits an acknowledgement from the peer.
    ///
    /// A packet containing at least one ACK-eliciting frame is
    /// retransmittable and participates in loss detection.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose
        )
    }
}

/// One ACK block beyond the first: a run of unacknowledged packet numbers
/// (`gap`) followed by a run of acknowledged ones (`length`).
///
/// Both counts are one less than the run they describe, matching the wire
/// encoding: a block covers `length + 1` packets after skipping `gap + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBlock {
    pub gap: u64,
    pub length: u64,
}

/// A parsed ACK frame.
///
/// Carries the largest acknowledged packet number, the peer-reported ACK
/// delay, and the acknowledged ranges as a first block plus trailing
/// gap/length blocks descending from `largest_acknowledged`.
#[derive(Debug, Clone, Default)]
pub struct AckFrame {
    /// Largest packet number being acknowledged.
    pub largest_acknowledged: PacketNumber,

    /// Delay between the peer receiving `largest_acknowledged` and sending
    /// this ACK, in milliseconds.
    pub ack_delay: u64,

    /// Number of packets acknowledged contiguously below
    /// `largest_acknowledged` (the first block covers
    /// `first_ack_block_length + 1` packets including the largest).
    pub first_ack_block_length: u64,

    /// Additional acknowledged blocks, in descending packet-number order.
    pub ack_blocks: TinyVec<[AckBlock; 8]>,
}

impl AckFrame {
    /// Expand the blocks into the full set of packet numbers this frame
    /// asserts acknowledged.
    ///
    /// Walks downward from `largest_acknowledged`; blocks that would run
    /// below packet number 0 are truncated. Callers intersect the result
    /// with their own send history; numbers never sent or already removed
    /// are ignored there.
    pub fn acknowledged(&self) -> BTreeSet<PacketNumber> {
        let mut acked = BTreeSet::new();
        let mut next = Some(self.largest_acknowledged);

        for _ in 0..=self.first_ack_block_length {
            let Some(pn) = next else { break };
            acked.insert(pn);
            next = pn.checked_sub(1);
        }
        for block in &self.ack_blocks {
            next = next
                .and_then(|pn| pn.checked_sub(block.gap))
                .and_then(|pn| pn.checked_sub(1));
            for _ in 0..=block.length {
                let Some(pn) = next else { break };
                acked.insert(pn);
                next = pn.checked_sub(1);
            }
        }

        acked
    }
}
