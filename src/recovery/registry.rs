//! # Sent-Packet Registry
//!
//! Ordered map from packet number to in-flight packet metadata, with the two
//! derived counters the alarm controller keys its mode decisions on. The
//! registry exclusively owns each entry; entries leave only by
//! acknowledgement or loss.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::packet::SentPacket;
use crate::types::{Instant, PacketNumber};

/// Metadata for one in-flight packet. Immutable after insertion.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    time_sent: Instant,
    retransmittable: bool,
    handshake: bool,
    bytes: usize,
    packet: SentPacket,
}

impl PacketInfo {
    pub fn new(time_sent: Instant, packet: SentPacket) -> Self {
        Self {
            time_sent,
            retransmittable: packet.is_retransmittable(),
            handshake: packet.is_handshake(),
            bytes: packet.size(),
            packet,
        }
    }

    pub fn packet_number(&self) -> PacketNumber {
        self.packet.packet_number()
    }

    pub fn time_sent(&self) -> Instant {
        self.time_sent
    }

    pub fn is_retransmittable(&self) -> bool {
        self.retransmittable
    }

    pub fn is_handshake(&self) -> bool {
        self.handshake
    }

    /// Size in bytes as sent.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// The payload handle, lent to the transmitter for retransmission.
    pub fn packet(&self) -> &SentPacket {
        &self.packet
    }
}

/// Ordered registry of sent, not-yet-acknowledged packets.
///
/// Counters always equal the cardinality of the matching subsets of the
/// map; they are maintained on every insert and remove.
#[derive(Debug, Default)]
pub struct SentRegistry {
    packets: BTreeMap<PacketNumber, PacketInfo>,
    handshake_outstanding: usize,
    retransmittable_outstanding: usize,
}

impl SentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly sent packet.
    ///
    /// Packet numbers must strictly increase; a duplicate or non-monotonic
    /// key is a caller bug.
    pub fn insert(&mut self, info: PacketInfo) {
        let packet_number = info.packet_number();
        debug_assert!(
            self.packets
                .last_key_value()
                .map_or(true, |(largest, _)| packet_number > *largest),
            "packet number {packet_number} does not exceed the largest registered"
        );

        if info.is_handshake() {
            self.handshake_outstanding += 1;
        }
        if info.is_retransmittable() {
            self.retransmittable_outstanding += 1;
        }
        self.packets.insert(packet_number, info);
    }

    /// Remove a packet by acknowledgement or loss. Absent keys are a no-op.
    pub fn remove(&mut self, packet_number: PacketNumber) -> Option<PacketInfo> {
        let info = self.packets.remove(&packet_number)?;
        if info.is_handshake() {
            self.handshake_outstanding -= 1;
        }
        if info.is_retransmittable() {
            self.retransmittable_outstanding -= 1;
        }
        Some(info)
    }

    pub fn get(&self, packet_number: PacketNumber) -> Option<&PacketInfo> {
        self.packets.get(&packet_number)
    }

    pub fn contains(&self, packet_number: PacketNumber) -> bool {
        self.packets.contains_key(&packet_number)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Entries with handshake cryptographic content.
    pub fn handshake_outstanding(&self) -> usize {
        self.handshake_outstanding
    }

    /// Entries carrying ACK-eliciting content.
    pub fn retransmittable_outstanding(&self) -> usize {
        self.retransmittable_outstanding
    }

    /// Traversal from the lowest packet number.
    pub fn iter_ascending(&self) -> impl Iterator<Item = (PacketNumber, &PacketInfo)> {
        self.packets.iter().map(|(pn, info)| (*pn, info))
    }

    /// Traversal from the highest packet number; used to pick the most
    /// recently sent packets for TLP and RTO retransmission.
    pub fn iter_descending(&self) -> impl Iterator<Item = (PacketNumber, &PacketInfo)> {
        self.packets.iter().rev().map(|(pn, info)| (*pn, info))
    }
}
