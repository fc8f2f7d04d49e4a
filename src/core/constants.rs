//! Protocol constants shared by every interoperating SynthPass implementation.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// LINK LAYER
// =============================================================================

/// Fixed access address used for all SynthPass traffic.
///
/// This is the well-known advertising-channel access address. SynthPass only
/// ever exchanges advertising frames, so no per-connection address exists.
pub const ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// Advertising channel every device transmits and listens on.
///
/// Fixed to a single advertising channel so devices find each other without
/// channel-hopping coordination.
pub const CHANNEL: u8 = 37;

/// PDU type of a non-connectable undirected advertisement.
pub const PDU_TYPE: u8 = 0x02;

/// Sentinel advertiser address marking a frame as SynthPass.
///
/// Used in place of a real hardware address so receivers recognize protocol
/// frames before parsing the payload.
pub const MAC_SENTINEL: [u8; 6] = *b":3:3:3";

/// Advertising-data type byte: "manufacturer specific data".
pub const AD_TYPE_MANUFACTURER: u8 = 0xFF;

// =============================================================================
// TIMING
// =============================================================================

/// Broadcast interval with no active peers.
pub const BROADCAST_PERIOD: Duration = Duration::from_millis(1000);

/// Broadcast interval with at least one proximate peer.
pub const PROX_PERIOD: Duration = Duration::from_millis(200);

/// Broadcast interval with at least one booped peer.
pub const BOOP_PERIOD: Duration = Duration::from_millis(20);

/// Upper bound (exclusive) on the random jitter added to each broadcast
/// period, to break up repeated collisions between devices in lock-step.
pub const RANDOM_DELAY: Duration = Duration::from_millis(20);

/// Peer silence timeout. A peer with no traffic for this long is dropped and
/// any boop with it implicitly ends.
pub const PEER_TIMEOUT: Duration = Duration::from_millis(3000);

// =============================================================================
// CALIBRATION
// =============================================================================

/// RSSI the reference receiver measures for this hardware variant at 1 m.
///
/// Carried in every header so peers can calibrate out TX-side variance
/// between hardware revisions.
pub const REF_RSSI: i8 = 0;

/// RSSI this hardware variant measures for the reference transmitter at 1 m.
///
/// Subtracted locally to calibrate out RX-side sensitivity variance.
pub const REF_RX_RSSI: i8 = 0;
