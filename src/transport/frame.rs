//! Frame encoding and decoding.
//!
//! Every SynthPass message travels inside a fixed-layout advertisement
//! envelope:
//!
//! ```text
//! +--------+--------+----------------+--------+---------+------------+----------+----------+---------+
//! | PDU    | Length | MAC sentinel   | AdLen  | AdType  | Sender UID | MsgType  | RefRSSI  | Data    |
//! | 1 byte | 1 byte | 6 bytes        | 1 byte | 1 byte  | 4 (LE32)   | 1 byte   | 1 (i8)   | 0..=241 |
//! +--------+--------+----------------+--------+---------+------------+----------+----------+---------+
//! ```
//!
//! `Length` covers everything after itself; `AdLen` covers everything after
//! itself. Both are always computed from the actual payload, never trusted
//! from a caller. A frame whose PDU or MAC sentinel mismatches is not a
//! SynthPass frame and is rejected before any further parsing.

use thiserror::Error;

use super::message::{Message, MessageType, Payload};
use crate::core::constants;
use crate::protocol::DeviceUid;

/// Wire-layout size constants.
pub mod sizes {
    /// Sentinel advertiser address length.
    pub const MAC_SIZE: usize = 6;
    /// Envelope bytes ahead of the advertising data unit: pdu + length + mac.
    pub const ENVELOPE_SIZE: usize = 2 + MAC_SIZE;
    /// Advertising-data header: ad_len + ad_type + sender_uid + msg_type + ref_rssi.
    pub const AD_HEADER_SIZE: usize = 1 + 1 + 4 + 1 + 1;
    /// Fixed bytes ahead of the type-dependent data payload.
    pub const FRAME_HEADER_SIZE: usize = ENVELOPE_SIZE + AD_HEADER_SIZE;
    /// Ceiling of the length field: the advertisement payload maximum.
    pub const MAX_LENGTH_FIELD: usize = 255;
    /// Largest type-dependent data payload.
    pub const MAX_DATA_SIZE: usize = MAX_LENGTH_FIELD - MAC_SIZE - AD_HEADER_SIZE;
    /// Largest encoded frame: pdu + length byte + everything length covers.
    pub const MAX_FRAME_SIZE: usize = 2 + MAX_LENGTH_FIELD;
    /// Smallest valid frame: a broadcast with no data payload.
    pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE;
    /// Largest user payload in a data message (data minus the peer uid).
    pub const MAX_USER_INFO: usize = MAX_DATA_SIZE - 4;
}

/// Errors from frame encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer ends before the fixed header or advertised payload does.
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// PDU type is not the reserved advertisement type.
    #[error("invalid pdu type 0x{0:02x}")]
    InvalidPdu(u8),

    /// Advertiser address is not the SynthPass sentinel.
    #[error("invalid advertiser sentinel {0:02x?}")]
    InvalidMac([u8; sizes::MAC_SIZE]),

    /// Advertising-data type byte is not the manufacturer-specific marker.
    #[error("invalid ad type 0x{0:02x}")]
    InvalidAdType(u8),

    /// Length field is below the fixed minimum or advertises more bytes than
    /// the buffer holds.
    #[error("invalid length field: advertised {advertised} bytes, {available} available")]
    InvalidLength {
        /// Value of the length field.
        advertised: usize,
        /// Bytes available after the length field.
        available: usize,
    },

    /// Inner ad_len disagrees with the outer length field.
    #[error("ad length mismatch: field says {ad_len}, envelope implies {expected}")]
    AdLengthMismatch {
        /// Value of the ad_len field.
        ad_len: u8,
        /// Value the outer length field implies.
        expected: u8,
    },

    /// Message-type byte is not a known code. Reported for observability;
    /// never a protocol action.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// Data payload length violates the rules of its message type.
    #[error("bad payload length for {msg_type:?}: expected {expected} bytes, got {actual}")]
    PayloadLength {
        /// The message type being parsed.
        msg_type: MessageType,
        /// Required payload size.
        expected: usize,
        /// Payload size actually present.
        actual: usize,
    },

    /// Payload does not fit the advertisement envelope.
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Offending payload size.
        size: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// Supplied scratch buffer cannot hold the encoded frame.
    #[error("buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall {
        /// Bytes the encoded frame needs.
        required: usize,
        /// Bytes the buffer offers.
        available: usize,
    },
}

/// Encode a message into `buf`, returning the encoded length.
///
/// The envelope constants and both length fields are filled in here;
/// callers only provide the message.
pub fn encode_frame(msg: &Message, buf: &mut [u8]) -> Result<usize, FrameError> {
    let data_len = msg.payload.wire_size();
    if data_len > sizes::MAX_DATA_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: data_len,
            max: sizes::MAX_DATA_SIZE,
        });
    }

    let total = sizes::FRAME_HEADER_SIZE + data_len;
    if buf.len() < total {
        return Err(FrameError::BufferTooSmall {
            required: total,
            available: buf.len(),
        });
    }

    buf[0] = constants::PDU_TYPE;
    buf[1] = (sizes::MAC_SIZE + sizes::AD_HEADER_SIZE + data_len) as u8;
    buf[2..8].copy_from_slice(&constants::MAC_SENTINEL);
    buf[8] = (sizes::AD_HEADER_SIZE - 1 + data_len) as u8;
    buf[9] = constants::AD_TYPE_MANUFACTURER;
    buf[10..14].copy_from_slice(&msg.sender_uid.as_u32().to_le_bytes());
    buf[14] = msg.message_type().as_byte();
    buf[15] = msg.ref_rssi as u8;
    msg.payload.encode_into(&mut buf[sizes::FRAME_HEADER_SIZE..total]);

    Ok(total)
}

/// Encode a message into a fresh buffer.
pub fn encode_frame_vec(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; msg.frame_size()];
    let len = encode_frame(msg, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

/// Decode a received frame.
///
/// A failure yields no partial message; callers treat the bytes as
/// not-SynthPass and take no protocol action. The data payload length is
/// always derived from the envelope length field, clamped by construction to
/// [`sizes::MAX_DATA_SIZE`].
pub fn decode_frame(raw: &[u8]) -> Result<Message, FrameError> {
    if raw.len() < sizes::MIN_FRAME_SIZE {
        return Err(FrameError::Truncated {
            expected: sizes::MIN_FRAME_SIZE,
            actual: raw.len(),
        });
    }

    // Cheap not-SynthPass checks come first: stray advertisements from other
    // devices are the common case, not the exception.
    if raw[0] != constants::PDU_TYPE {
        return Err(FrameError::InvalidPdu(raw[0]));
    }
    let mut mac = [0u8; sizes::MAC_SIZE];
    mac.copy_from_slice(&raw[2..8]);
    if mac != constants::MAC_SENTINEL {
        return Err(FrameError::InvalidMac(mac));
    }

    let advertised = raw[1] as usize;
    let available = raw.len() - 2;
    if advertised < sizes::MAC_SIZE + sizes::AD_HEADER_SIZE || advertised > available {
        return Err(FrameError::InvalidLength {
            advertised,
            available,
        });
    }

    let expected_ad_len = (advertised - sizes::MAC_SIZE - 1) as u8;
    if raw[8] != expected_ad_len {
        return Err(FrameError::AdLengthMismatch {
            ad_len: raw[8],
            expected: expected_ad_len,
        });
    }
    if raw[9] != constants::AD_TYPE_MANUFACTURER {
        return Err(FrameError::InvalidAdType(raw[9]));
    }

    let sender_uid = DeviceUid::new(u32::from_le_bytes([raw[10], raw[11], raw[12], raw[13]]));
    let msg_type =
        MessageType::from_byte(raw[14]).ok_or(FrameError::UnknownMessageType(raw[14]))?;
    let ref_rssi = raw[15] as i8;

    let data = &raw[sizes::FRAME_HEADER_SIZE..2 + advertised];
    let payload = Payload::decode(msg_type, data)?;

    Ok(Message {
        sender_uid,
        ref_rssi,
        payload,
    })
}
