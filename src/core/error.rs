//! Error types for the SynthPass protocol.

use thiserror::Error;

use crate::protocol::DeviceUid;
use crate::transport::FrameError;

/// Errors reported by a radio collaborator when asked to transmit.
///
/// Transmit failures are never fatal: the scheduler retries on its next
/// natural cycle instead of busy-retrying.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// The transceiver is mid-operation and cannot accept a frame.
    #[error("radio busy")]
    Busy,

    /// The transceiver is not available (powered down or uninitialized).
    #[error("radio unavailable")]
    Unavailable,
}

/// Top-level SynthPass errors.
#[derive(Debug, Error)]
pub enum SynthPassError {
    /// Frame encode or decode error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Radio transmit failure.
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// Data was queued for a peer the registry does not know.
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceUid),
}
