//! In-process loopback radio.
//!
//! Reference [`Radio`] implementation for tests and simulation harnesses: a
//! shared broadcast medium that copies every transmitted frame into the
//! receive queue of every *other* listening endpoint on the same channel.
//! Frames are copied at transmit time, so a receiver's bytes are distinct
//! from and unaffected by whatever the transmitter does with its buffer
//! afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::core::{PhyMode, Radio, RadioError};

#[derive(Debug)]
struct Endpoint {
    queue: VecDeque<(Vec<u8>, i8)>,
    listening: bool,
    channel: u8,
    last_rssi: i8,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            listening: false,
            channel: 0,
            last_rssi: 0,
        }
    }
}

#[derive(Debug)]
struct MediumInner {
    endpoints: Vec<Endpoint>,
    echo_to_sender: bool,
    drop_next: usize,
    rssi: i8,
}

/// Shared broadcast medium connecting [`LoopbackRadio`] endpoints.
#[derive(Debug, Clone)]
pub struct LoopbackMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl LoopbackMedium {
    /// An empty medium with no endpoints.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MediumInner {
                endpoints: Vec::new(),
                echo_to_sender: false,
                drop_next: 0,
                rssi: -40,
            })),
        }
    }

    /// Attach a new radio endpoint to this medium.
    pub fn endpoint(&self) -> LoopbackRadio {
        let mut inner = self.lock();
        inner.endpoints.push(Endpoint::new());
        LoopbackRadio {
            inner: Arc::clone(&self.inner),
            index: inner.endpoints.len() - 1,
        }
    }

    /// Deliver transmissions back to the sender's own receive queue as well.
    ///
    /// Real transceivers overhear their own advertisements; turning this on
    /// exercises the protocol's self-filter end to end.
    pub fn set_echo_to_sender(&self, on: bool) {
        self.lock().echo_to_sender = on;
    }

    /// Silently swallow the next `count` transmissions (lossy channel).
    pub fn drop_next(&self, count: usize) {
        self.lock().drop_next = count;
    }

    /// RSSI attributed to every subsequently delivered frame, in dBm.
    pub fn set_rssi(&self, rssi: i8) {
        self.lock().rssi = rssi;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MediumInner> {
        // A poisoned medium means a test already panicked; propagate.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for LoopbackMedium {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`LoopbackMedium`].
#[derive(Debug)]
pub struct LoopbackRadio {
    inner: Arc<Mutex<MediumInner>>,
    index: usize,
}

impl LoopbackRadio {
    fn lock(&self) -> std::sync::MutexGuard<'_, MediumInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Radio for LoopbackRadio {
    fn transmit(
        &mut self,
        _access_address: u32,
        frame: &[u8],
        channel: u8,
        _phy: PhyMode,
    ) -> Result<(), RadioError> {
        let mut inner = self.lock();
        if inner.drop_next > 0 {
            // Dropped in flight: the air gives no error back.
            inner.drop_next -= 1;
            return Ok(());
        }

        let rssi = inner.rssi;
        let echo = inner.echo_to_sender;
        let index = self.index;
        for (i, endpoint) in inner.endpoints.iter_mut().enumerate() {
            if i == index && !echo {
                continue;
            }
            if endpoint.listening && endpoint.channel == channel {
                endpoint.queue.push_back((frame.to_vec(), rssi));
            }
        }
        Ok(())
    }

    fn start_listen(&mut self, _access_address: u32, channel: u8, _phy: PhyMode) {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoints[self.index];
        endpoint.listening = true;
        endpoint.channel = channel;
    }

    fn poll_frame(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoints[self.index];
        let (frame, rssi) = endpoint.queue.pop_front()?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        endpoint.last_rssi = rssi;
        Some(len)
    }

    fn last_rssi(&self) -> i8 {
        self.lock().endpoints[self.index].last_rssi
    }
}
