//! SynthPass Protocol - Transport Layer
//!
//! The wire format and everything that decides when bytes go on the air:
//!
//! - **Frame codec**: advertisement envelope encoding/decoding
//! - **Message types**: the eight protocol messages and their payloads
//! - **Broadcast scheduler**: adaptive cadence with per-cycle jitter
//! - **Loopback radio**: in-process reference transceiver for tests

mod frame;
mod message;
mod radio;
mod scheduler;

pub use frame::*;
pub use message::*;
pub use radio::*;
pub use scheduler::*;
