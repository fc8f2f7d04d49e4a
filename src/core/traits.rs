//! Collaborator interfaces consumed by the protocol core.
//!
//! The core drives the radio transceiver and a time source exclusively
//! through these narrow traits. Everything behind them (PHY control,
//! interrupt plumbing, RSSI measurement, boot-time clock setup) lives outside
//! this crate.

use std::time::Instant;

use super::error::RadioError;

/// Physical-layer mode for transmit and receive.
///
/// SynthPass pins a single mode per deployment; there is no negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhyMode {
    /// 1 Mbit/s uncoded. Every SynthPass device supports this mode.
    #[default]
    OneM,
    /// 2 Mbit/s uncoded.
    TwoM,
    /// Long-range coded, S=2.
    CodedS2,
    /// Long-range coded, S=8.
    CodedS8,
}

/// Radio transceiver as seen by the dispatch loop.
///
/// Reception is edge-triggered: the hardware raises a ready flag and the next
/// [`poll_frame`](Radio::poll_frame) call copies the frame out of the
/// transceiver's receive buffer into a buffer the caller owns. The receive
/// path must be isolated from the transmit path: a frame read back after a
/// transmit must never alias or reflect the bytes most recently sent.
pub trait Radio {
    /// Transmit one encoded frame. Fire-and-forget: either the whole frame is
    /// handed to the air or an error is returned and nothing was sent.
    fn transmit(
        &mut self,
        access_address: u32,
        frame: &[u8],
        channel: u8,
        phy: PhyMode,
    ) -> Result<(), RadioError>;

    /// (Re-)arm reception on the given channel.
    fn start_listen(&mut self, access_address: u32, channel: u8, phy: PhyMode);

    /// Copy the next ready frame into `buf` and return its length, or `None`
    /// when no frame is pending. Must never block.
    fn poll_frame(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Signal strength of the most recently received frame, in dBm.
    fn last_rssi(&self) -> i8;
}

/// Monotonic time source with millisecond resolution.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin. Never goes backwards.
    fn now_ms(&self) -> u64;
}

/// Host-side [`Clock`] backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
