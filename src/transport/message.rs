//! SynthPass message types.
//!
//! A message is the protocol payload carried inside the advertisement
//! envelope: a header naming the sender, a message-type code, and a
//! type-dependent data payload.

use super::frame::{FrameError, sizes};
use crate::protocol::DeviceUid;

/// Message-type codes.
///
/// The low nibble groups the interaction (0x.0 broadcast, 0x.1 prox,
/// 0x.2 boop, 0x.3 unboop); the high nibble marks data (0x1.) and
/// acknowledgment (0x2.) variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Unsolicited presence announcement, no payload.
    Broadcast = 0x00,
    /// Proximity ranging report: peer uid plus calibrated RSSI.
    Prox = 0x01,
    /// Request to enter the boop interaction phase.
    Boop = 0x02,
    /// Request or notice that a boop is ending.
    Unboop = 0x03,
    /// User payload exchanged while proximate.
    ProxData = 0x11,
    /// User payload exchanged while booped.
    BoopData = 0x12,
    /// Acknowledges a ProxData payload.
    ProxDataAck = 0x21,
    /// Acknowledges a BoopData payload.
    BoopDataAck = 0x22,
}

impl MessageType {
    /// Parse a message-type code from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Broadcast),
            0x01 => Some(Self::Prox),
            0x02 => Some(Self::Boop),
            0x03 => Some(Self::Unboop),
            0x11 => Some(Self::ProxData),
            0x12 => Some(Self::BoopData),
            0x21 => Some(Self::ProxDataAck),
            0x22 => Some(Self::BoopDataAck),
            _ => None,
        }
    }

    /// Wire byte for this message type.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Ranging payload carried by Prox, Boop and Unboop messages.
///
/// `rx_rssi` is the calibrated strength at which the *sender* hears the
/// device named by `peer_uid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ranging {
    /// The device this ranging report is addressed to.
    pub peer_uid: DeviceUid,
    /// Calibrated RSSI of that device's signal, in dBm.
    pub rx_rssi: i8,
}

impl Ranging {
    /// Encoded size: uid + rssi.
    pub const SIZE: usize = 5;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let uid = self.peer_uid.as_u32().to_le_bytes();
        [uid[0], uid[1], uid[2], uid[3], self.rx_rssi as u8]
    }

    fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            peer_uid: DeviceUid::new(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            rx_rssi: bytes[4] as i8,
        }
    }
}

/// Addressed user payload carried by ProxData and BoopData messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransfer {
    /// The device this payload is addressed to.
    pub peer_uid: DeviceUid,
    /// Opaque application bytes, at most [`sizes::MAX_USER_INFO`].
    pub user_info: Vec<u8>,
}

impl DataTransfer {
    /// Fixed bytes ahead of the user payload.
    pub const BASE_SIZE: usize = 4;
}

/// Acknowledgment payload carried by ProxDataAck and BoopDataAck messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    /// The device whose data transfer is being acknowledged.
    pub peer_uid: DeviceUid,
}

impl DataAck {
    /// Encoded size: uid only.
    pub const SIZE: usize = 4;
}

/// Type-dependent message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Presence announcement.
    Broadcast,
    /// Ranging reply to a broadcast.
    Prox(Ranging),
    /// Boop escalation request.
    Boop(Ranging),
    /// Boop termination notice.
    Unboop(Ranging),
    /// User data while proximate.
    ProxData(DataTransfer),
    /// User data while booped.
    BoopData(DataTransfer),
    /// Ack for proximate user data.
    ProxDataAck(DataAck),
    /// Ack for booped user data.
    BoopDataAck(DataAck),
}

impl Payload {
    /// The message-type code this payload travels under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Broadcast => MessageType::Broadcast,
            Self::Prox(_) => MessageType::Prox,
            Self::Boop(_) => MessageType::Boop,
            Self::Unboop(_) => MessageType::Unboop,
            Self::ProxData(_) => MessageType::ProxData,
            Self::BoopData(_) => MessageType::BoopData,
            Self::ProxDataAck(_) => MessageType::ProxDataAck,
            Self::BoopDataAck(_) => MessageType::BoopDataAck,
        }
    }

    /// Encoded size of the type-dependent data.
    pub fn wire_size(&self) -> usize {
        match self {
            Self::Broadcast => 0,
            Self::Prox(_) | Self::Boop(_) | Self::Unboop(_) => Ranging::SIZE,
            Self::ProxData(d) | Self::BoopData(d) => DataTransfer::BASE_SIZE + d.user_info.len(),
            Self::ProxDataAck(_) | Self::BoopDataAck(_) => DataAck::SIZE,
        }
    }

    /// Write the data payload into `buf`, which the caller has sized to
    /// exactly [`wire_size`](Self::wire_size) bytes.
    pub(super) fn encode_into(&self, buf: &mut [u8]) {
        match self {
            Self::Broadcast => {}
            Self::Prox(r) | Self::Boop(r) | Self::Unboop(r) => {
                buf.copy_from_slice(&r.to_bytes());
            }
            Self::ProxData(d) | Self::BoopData(d) => {
                buf[..4].copy_from_slice(&d.peer_uid.as_u32().to_le_bytes());
                buf[4..].copy_from_slice(&d.user_info);
            }
            Self::ProxDataAck(a) | Self::BoopDataAck(a) => {
                buf.copy_from_slice(&a.peer_uid.as_u32().to_le_bytes());
            }
        }
    }

    /// Parse the data payload for a known message type. Size rules are
    /// exact for fixed-shape payloads; data payloads take their length from
    /// the envelope, never from a field of their own.
    pub(super) fn decode(msg_type: MessageType, data: &[u8]) -> Result<Self, FrameError> {
        let mismatch = |expected: usize| FrameError::PayloadLength {
            msg_type,
            expected,
            actual: data.len(),
        };

        match msg_type {
            MessageType::Broadcast => {
                if !data.is_empty() {
                    return Err(mismatch(0));
                }
                Ok(Self::Broadcast)
            }
            MessageType::Prox | MessageType::Boop | MessageType::Unboop => {
                if data.len() != Ranging::SIZE {
                    return Err(mismatch(Ranging::SIZE));
                }
                let mut bytes = [0u8; Ranging::SIZE];
                bytes.copy_from_slice(data);
                let ranging = Ranging::from_bytes(bytes);
                Ok(match msg_type {
                    MessageType::Prox => Self::Prox(ranging),
                    MessageType::Boop => Self::Boop(ranging),
                    _ => Self::Unboop(ranging),
                })
            }
            MessageType::ProxData | MessageType::BoopData => {
                if data.len() < DataTransfer::BASE_SIZE {
                    return Err(mismatch(DataTransfer::BASE_SIZE));
                }
                let transfer = DataTransfer {
                    peer_uid: DeviceUid::new(u32::from_le_bytes([
                        data[0], data[1], data[2], data[3],
                    ])),
                    user_info: data[DataTransfer::BASE_SIZE..].to_vec(),
                };
                Ok(if msg_type == MessageType::ProxData {
                    Self::ProxData(transfer)
                } else {
                    Self::BoopData(transfer)
                })
            }
            MessageType::ProxDataAck | MessageType::BoopDataAck => {
                if data.len() != DataAck::SIZE {
                    return Err(mismatch(DataAck::SIZE));
                }
                let ack = DataAck {
                    peer_uid: DeviceUid::new(u32::from_le_bytes([
                        data[0], data[1], data[2], data[3],
                    ])),
                };
                Ok(if msg_type == MessageType::ProxDataAck {
                    Self::ProxDataAck(ack)
                } else {
                    Self::BoopDataAck(ack)
                })
            }
        }
    }
}

/// A complete SynthPass message: sender header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identity of the transmitting device.
    pub sender_uid: DeviceUid,
    /// Sender hardware's 1 m reference RSSI, for cross-hardware calibration.
    pub ref_rssi: i8,
    /// Type-dependent payload.
    pub payload: Payload,
}

impl Message {
    /// Assemble a message.
    pub fn new(sender_uid: DeviceUid, ref_rssi: i8, payload: Payload) -> Self {
        Self {
            sender_uid,
            ref_rssi,
            payload,
        }
    }

    /// The message-type code on the wire.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Total encoded frame size, envelope included.
    pub fn frame_size(&self) -> usize {
        sizes::FRAME_HEADER_SIZE + self.payload.wire_size()
    }
}
