//! Protocol state machine.
//!
//! Interprets decoded messages against the peer registry and decides at most
//! one reply per received frame. The engine owns no peer state: every
//! decision consults and mutates the registry handed in, so all shared state
//! lives in one place (the registry) and the machine itself stays a function
//! of its inputs.
//!
//! Correctness has to hold on a lossy, connectionless channel: frames arrive
//! out of order, get dropped, or are stray noise from devices that never
//! heard of this protocol. Two filters keep the machine sane:
//!
//! - the *self-filter* drops broadcasts carrying our own identity (a device
//!   overhears its own advertisements through its receive path);
//! - the *directed-filter* drops any addressed message naming a different
//!   listener. Foreign traffic is frequent and expected, not an error.

use tracing::{debug, trace, warn};

use crate::core::constants::{REF_RSSI, REF_RX_RSSI};
use crate::transport::{DataAck, DataTransfer, Message, Payload, Ranging};

use super::identity::DeviceUid;
use super::registry::{PeerPhase, PeerRecord, PeerRegistry};

/// Notification crossing the application boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A device not in the registry announced itself.
    PeerDiscovered {
        /// The new peer.
        peer: DeviceUid,
        /// Calibrated RSSI of its announcement, in dBm.
        rx_rssi: i8,
    },
    /// A peer reported how strongly it hears us.
    RangeReport {
        /// The reporting peer.
        peer: DeviceUid,
        /// Calibrated RSSI it measured for our signal, in dBm.
        rx_rssi: i8,
    },
    /// A boop interaction began with this peer.
    BoopStarted {
        /// The booped peer.
        peer: DeviceUid,
    },
    /// The peer asked to end the boop.
    BoopEnded {
        /// The unbooped peer.
        peer: DeviceUid,
    },
    /// A peer delivered a user payload.
    UserData {
        /// The sending peer.
        peer: DeviceUid,
        /// The opaque application bytes.
        data: Vec<u8>,
    },
    /// A peer acknowledged the data queued for it; retransmission stops.
    DataAcknowledged {
        /// The acknowledging peer.
        peer: DeviceUid,
    },
    /// A peer went silent past the timeout and was dropped.
    PeerExpired {
        /// The expired peer.
        peer: DeviceUid,
    },
}

/// Result of one trip through the state machine: at most one reply frame,
/// plus any events for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Reply to transmit, if the machine decided one.
    pub reply: Option<Message>,
    /// Application notifications, in the order they occurred.
    pub events: Vec<ProtocolEvent>,
}

impl Outcome {
    fn none() -> Self {
        Self {
            reply: None,
            events: Vec::new(),
        }
    }
}

/// The per-device protocol state machine.
#[derive(Debug)]
pub struct ProtocolEngine {
    uid: DeviceUid,
    ref_rssi: i8,
    rx_calibration: i8,
    unknown_types: u64,
    self_echoes: u64,
}

impl ProtocolEngine {
    /// Engine with the reference calibration constants.
    pub fn new(uid: DeviceUid) -> Self {
        Self::with_calibration(uid, REF_RSSI, REF_RX_RSSI)
    }

    /// Engine with hardware-variant calibration: `ref_rssi` is advertised in
    /// every header, `rx_calibration` is subtracted from local measurements.
    pub fn with_calibration(uid: DeviceUid, ref_rssi: i8, rx_calibration: i8) -> Self {
        Self {
            uid,
            ref_rssi,
            rx_calibration,
            unknown_types: 0,
            self_echoes: 0,
        }
    }

    /// This device's identity.
    pub fn uid(&self) -> DeviceUid {
        self.uid
    }

    /// Messages dropped because they carried an unrecognized type code.
    pub fn unknown_type_count(&self) -> u64 {
        self.unknown_types
    }

    /// Own broadcasts overheard and dropped by the self-filter.
    pub fn self_echo_count(&self) -> u64 {
        self.self_echoes
    }

    /// The unsolicited presence announcement.
    pub fn broadcast(&self) -> Message {
        Message::new(self.uid, self.ref_rssi, Payload::Broadcast)
    }

    /// Count an unparseable message type. Codec-level report only; no
    /// protocol action follows.
    pub fn on_unknown_type(&mut self, byte: u8) {
        self.unknown_types += 1;
        warn!(msg_type = byte, "unrecognized message type");
    }

    /// Calibrated RSSI: raw measurement minus the sender's 1 m TX reference
    /// minus our 1 m RX reference, saturating at the i8 range.
    fn calibrate(&self, measured: i8, sender_ref: i8) -> i8 {
        (measured as i16 - sender_ref as i16 - self.rx_calibration as i16)
            .clamp(i8::MIN as i16, i8::MAX as i16) as i8
    }

    /// Feed one received message through the machine.
    pub fn handle(
        &mut self,
        msg: &Message,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        match &msg.payload {
            Payload::Broadcast => self.on_broadcast(msg, measured_rssi, registry, now),
            Payload::Prox(ranging) => self.on_prox(msg, *ranging, measured_rssi, registry, now),
            Payload::Boop(ranging) => self.on_boop(msg, *ranging, measured_rssi, registry, now),
            Payload::Unboop(ranging) => {
                self.on_unboop(msg, *ranging, measured_rssi, registry, now)
            }
            Payload::ProxData(transfer) => {
                self.on_data(msg, transfer, false, measured_rssi, registry, now)
            }
            Payload::BoopData(transfer) => {
                self.on_data(msg, transfer, true, measured_rssi, registry, now)
            }
            Payload::ProxDataAck(ack) => self.on_data_ack(msg, *ack, measured_rssi, registry, now),
            Payload::BoopDataAck(ack) => self.on_data_ack(msg, *ack, measured_rssi, registry, now),
        }
    }

    /// Every foreign broadcast gets a ranging reply, known peer or not, so a
    /// receiver that missed earlier exchanges can always resynchronize.
    fn on_broadcast(
        &mut self,
        msg: &Message,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        if msg.sender_uid == self.uid {
            self.self_echoes += 1;
            trace!(uid = %self.uid, "dropped self-echoed broadcast");
            return Outcome::none();
        }

        let rx_rssi = self.calibrate(measured_rssi, msg.ref_rssi);
        let is_new = registry.get(msg.sender_uid).is_none();
        registry.observe(msg.sender_uid, now).last_heard_rssi = rx_rssi;

        let mut events = Vec::new();
        if is_new {
            debug!(peer = %msg.sender_uid, rx_rssi, "peer discovered");
            events.push(ProtocolEvent::PeerDiscovered {
                peer: msg.sender_uid,
                rx_rssi,
            });
        }

        let reply = Message::new(
            self.uid,
            self.ref_rssi,
            Payload::Prox(Ranging {
                peer_uid: msg.sender_uid,
                rx_rssi,
            }),
        );
        Outcome {
            reply: Some(reply),
            events,
        }
    }

    fn on_prox(
        &mut self,
        msg: &Message,
        ranging: Ranging,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        if ranging.peer_uid != self.uid {
            trace!(target_uid = %ranging.peer_uid, "ranging reply for another listener");
            return Outcome::none();
        }

        let heard_rssi = self.calibrate(measured_rssi, msg.ref_rssi);
        let record = registry.observe(msg.sender_uid, now);
        record.last_rx_rssi = ranging.rx_rssi;
        record.last_heard_rssi = heard_rssi;
        if record.phase < PeerPhase::Proximate {
            record.phase = PeerPhase::Proximate;
            debug!(peer = %msg.sender_uid, "peer proximate");
        }

        Outcome {
            reply: None,
            events: vec![ProtocolEvent::RangeReport {
                peer: msg.sender_uid,
                rx_rssi: ranging.rx_rssi,
            }],
        }
    }

    /// Boop is a symmetric handshake: the first request is answered with our
    /// own boop; an already-booped peer is not, or the pair would ping-pong
    /// boops at each other forever.
    fn on_boop(
        &mut self,
        msg: &Message,
        ranging: Ranging,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        if ranging.peer_uid != self.uid {
            trace!(target_uid = %ranging.peer_uid, "boop for another listener");
            return Outcome::none();
        }

        let rx_rssi = self.calibrate(measured_rssi, msg.ref_rssi);
        let record = registry.observe(msg.sender_uid, now);
        record.last_rx_rssi = ranging.rx_rssi;
        record.last_heard_rssi = rx_rssi;

        let already_booped = record.phase == PeerPhase::Booped;
        record.phase = PeerPhase::Booped;

        let mut events = Vec::new();
        if !already_booped {
            debug!(peer = %msg.sender_uid, "boop started");
            events.push(ProtocolEvent::BoopStarted {
                peer: msg.sender_uid,
            });
        }

        let reply = (!already_booped).then(|| {
            Message::new(
                self.uid,
                self.ref_rssi,
                Payload::Boop(Ranging {
                    peer_uid: msg.sender_uid,
                    rx_rssi,
                }),
            )
        });
        Outcome { reply, events }
    }

    fn on_unboop(
        &mut self,
        msg: &Message,
        ranging: Ranging,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        if ranging.peer_uid != self.uid {
            trace!(target_uid = %ranging.peer_uid, "unboop for another listener");
            return Outcome::none();
        }

        let heard_rssi = self.calibrate(measured_rssi, msg.ref_rssi);
        let record = registry.observe(msg.sender_uid, now);
        record.last_rx_rssi = ranging.rx_rssi;
        record.last_heard_rssi = heard_rssi;

        let was_booped = record.phase == PeerPhase::Booped;
        if record.phase > PeerPhase::Heard {
            record.phase = PeerPhase::Heard;
        }

        let mut events = Vec::new();
        if was_booped {
            debug!(peer = %msg.sender_uid, "boop ended");
            events.push(ProtocolEvent::BoopEnded {
                peer: msg.sender_uid,
            });
        }
        Outcome {
            reply: None,
            events,
        }
    }

    fn on_data(
        &mut self,
        msg: &Message,
        transfer: &DataTransfer,
        booped: bool,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        if transfer.peer_uid != self.uid {
            trace!(target_uid = %transfer.peer_uid, "data for another listener");
            return Outcome::none();
        }

        let heard_rssi = self.calibrate(measured_rssi, msg.ref_rssi);
        registry.observe(msg.sender_uid, now).last_heard_rssi = heard_rssi;

        let ack = DataAck {
            peer_uid: msg.sender_uid,
        };
        let payload = if booped {
            Payload::BoopDataAck(ack)
        } else {
            Payload::ProxDataAck(ack)
        };

        Outcome {
            reply: Some(Message::new(self.uid, self.ref_rssi, payload)),
            events: vec![ProtocolEvent::UserData {
                peer: msg.sender_uid,
                data: transfer.user_info.clone(),
            }],
        }
    }

    fn on_data_ack(
        &mut self,
        msg: &Message,
        ack: DataAck,
        measured_rssi: i8,
        registry: &mut PeerRegistry,
        now: u64,
    ) -> Outcome {
        if ack.peer_uid != self.uid {
            trace!(target_uid = %ack.peer_uid, "data ack for another listener");
            return Outcome::none();
        }

        let heard_rssi = self.calibrate(measured_rssi, msg.ref_rssi);
        let record = registry.observe(msg.sender_uid, now);
        record.last_heard_rssi = heard_rssi;
        let mut events = Vec::new();
        if record.pending.take().is_some() {
            debug!(peer = %msg.sender_uid, "pending data acknowledged");
            events.push(ProtocolEvent::DataAcknowledged {
                peer: msg.sender_uid,
            });
        }
        Outcome {
            reply: None,
            events,
        }
    }

    /// Boop escalation request for `peer`, carrying our latest calibrated
    /// measurement of its signal. The application decides when ranging is
    /// close enough to ask.
    pub fn boop_request(&self, peer: DeviceUid, rx_rssi: i8) -> Message {
        Message::new(
            self.uid,
            self.ref_rssi,
            Payload::Boop(Ranging {
                peer_uid: peer,
                rx_rssi,
            }),
        )
    }

    /// Boop termination notice for `peer`.
    pub fn unboop_request(&self, peer: DeviceUid, rx_rssi: i8) -> Message {
        Message::new(
            self.uid,
            self.ref_rssi,
            Payload::Unboop(Ranging {
                peer_uid: peer,
                rx_rssi,
            }),
        )
    }

    /// Retransmission frame for a peer holding unacknowledged data.
    ///
    /// Proximate peers get ProxData, booped peers BoopData. A peer that has
    /// not reached proximity yet is skipped; ranging has to catch up first.
    pub fn data_message_for(&self, record: &PeerRecord) -> Option<Message> {
        let pending = record.pending.as_ref()?;
        let transfer = DataTransfer {
            peer_uid: record.uid(),
            user_info: pending.payload.clone(),
        };
        let payload = match record.phase {
            PeerPhase::Booped => Payload::BoopData(transfer),
            PeerPhase::Proximate => Payload::ProxData(transfer),
            PeerPhase::Unknown | PeerPhase::Heard => return None,
        };
        Some(Message::new(self.uid, self.ref_rssi, payload))
    }
}
