//! # Sent-Packet Handles
//!
//! The recovery core does not build or serialize packets. It receives an
//! opaque handle for every packet that went on the wire, keeps exclusive
//! ownership of it while the packet is in flight, and lends it back to the
//! transmitter for the duration of a retransmission call.

#![forbid(unsafe_code)]

use bytes::Bytes;

use crate::types::PacketNumber;

/// QUIC packet type (RFC 9000 Section 17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Initial packet
    Initial,
    /// 0-RTT packet
    ZeroRtt,
    /// Handshake packet
    Handshake,
    /// Retry packet
    Retry,
    /// 1-RTT short-header packet
    OneRtt,
}

impl PacketType {
    /// Whether packets of this type are retransmitted on the handshake
    /// alarm track.
    ///
    /// Only Initial and Handshake count; Retry does not carry a packet
    /// number and is excluded.
    pub fn is_handshake(self) -> bool {
        matches!(self, PacketType::Initial | PacketType::Handshake)
    }
}

/// Handle for a packet that was sent, sufficient for the transmitter to
/// rebuild its retransmittable frames into a new packet.
///
/// The payload is an opaque [`Bytes`] reference; cloning the handle is
/// cheap and does not copy the payload.
#[derive(Debug, Clone)]
pub struct SentPacket {
    packet_number: PacketNumber,
    packet_type: PacketType,
    retransmittable: bool,
    payload: Bytes,
}

impl SentPacket {
    pub fn new(
        packet_number: PacketNumber,
        packet_type: PacketType,
        retransmittable: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            packet_number,
            packet_type,
            retransmittable,
            payload,
        }
    }

    pub fn packet_number(&self) -> PacketNumber {
        self.packet_number
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Whether the packet carries any ACK-eliciting content.
    pub fn is_retransmittable(&self) -> bool {
        self.retransmittable
    }

    /// Whether the packet carries Initial or Handshake cryptographic content.
    pub fn is_handshake(&self) -> bool {
        self.packet_type.is_handshake()
    }

    /// Size of the packet in bytes as sent.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}
