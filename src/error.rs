//! Error types for the recovery subsystem.

use thiserror::Error;

use crate::frames::FrameType;

/// Recovery errors.
///
/// Loss detection absorbs most failures internally: ACKs for unknown packet
/// numbers are ignored, and a transmitter with nothing queued triggers a
/// retransmission fallback. The only condition surfaced to callers is a
/// frame type the detector never registered interest in.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A frame other than ACK was dispatched to the loss detector.
    #[error("unexpected frame type {0:?} delivered to loss detection")]
    UnexpectedFrame(FrameType),
}

pub type Result<T> = core::result::Result<T, Error>;
