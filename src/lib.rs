//! # SynthPass Protocol
//!
//! Connectionless peer discovery and proximity ranging, carried entirely in
//! short-range broadcast advertisements. Every device periodically announces
//! itself, listens for peers, estimates distance from received signal
//! strength, and escalates through interaction phases
//! (normal → proximity → boop) driven purely by message exchange and
//! timeouts. No connection-oriented session ever exists.
//!
//! - **Framing**: fixed-layout advertisement envelope behind a sentinel
//!   advertiser address, recognized before any payload parsing
//! - **Ranging**: RSSI calibrated against per-hardware 1 m references
//! - **Phases**: a per-peer state machine with silence timeouts
//! - **Cadence**: adaptive broadcast period (1 s / 200 ms / 20 ms) with
//!   fresh jitter every cycle
//! - **Reliability**: retry-until-acknowledged data exchange over a lossy,
//!   one-way channel
//!
//! ## Modules
//!
//! - [`core`]: protocol constants, error types, and the collaborator traits
//!   behind which the radio and time source live
//! - [`transport`]: frame codec, message types, broadcast scheduler, and an
//!   in-process loopback radio
//! - [`protocol`]: identity derivation, peer registry, and the protocol
//!   state machine
//! - [`device`]: the cooperative dispatch loop binding it all together
//!
//! ## Example
//!
//! ```rust
//! use synthpass_protocol::prelude::*;
//!
//! let medium = LoopbackMedium::new();
//! let mut device = Device::new(
//!     medium.endpoint(),
//!     MonotonicClock::new(),
//!     0x1122_3344_5566_7788,
//!     DeviceConfig::default(),
//! );
//! assert_eq!(device.uid().as_u32(), 0x4444_9ACC);
//!
//! device.start().unwrap();
//! loop {
//!     for _event in device.poll() {
//!         // react to PeerDiscovered, BoopStarted, UserData, ...
//!     }
//!     # break;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod device;
pub mod protocol;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::device::*;
    pub use crate::protocol::*;
    pub use crate::transport::*;
}

// Re-export commonly used items at crate root
pub use crate::core::{Clock, MonotonicClock, PhyMode, Radio, RadioError, SynthPassError};
pub use crate::device::{Device, DeviceConfig};
pub use crate::protocol::{
    DeviceUid, PeerPhase, PeerRecord, PeerRegistry, ProtocolEngine, ProtocolEvent,
};
pub use crate::transport::{
    BroadcastScheduler, Cadence, FrameError, LoopbackMedium, LoopbackRadio, Message, MessageType,
    Payload, decode_frame, encode_frame, encode_frame_vec,
};
