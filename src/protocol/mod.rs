//! # WOIS Application Protocol
//!
//! Byte-exact definitions of the application messages exchanged between
//! controller units and sensor concentrators. The radio module's own API
//! framing is handled by the [`crate::transport`] collaborator; everything in
//! here lives inside the payload of a single receive-data frame.
//!
//! ## Layout
//!
//! ```text
//! header    : [version][msgType][crcHigh][crcLow]
//! cmd / ack : header + [msgId][cmd][dataLen][data..=65]
//! transfer  : header + [segHigh][segLow][xferMode][dataLen][data..=64]
//! loopback  : header + [kind][serial x8]
//! ```
//!
//! The CRC covers every byte after the 4-byte header. A message whose CRC does
//! not match is dropped by the dispatcher without side effects.

pub mod checksum;
pub mod message;
pub mod opcodes;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use checksum::{crc16, message_crc, sign, validate};
pub use message::{CommandMessage, LoopbackKind, LoopbackMessage, Message, TransferMessage};
pub use opcodes::{Command, Resource, ScInstruction, XferOp, ACK_FLAG, SC_OP_ACK, SC_OP_REQUEST};

/// Protocol version carried in byte 0 of every message.
pub const PROTOCOL_VERSION: u8 = 0x02;
/// Fixed header: version, message type, CRC (big endian).
pub const HEADER_LEN: usize = 4;
/// First byte covered by the message CRC.
pub const CRC_START: usize = HEADER_LEN;
/// msgId + cmd + dataLen
pub const COMMAND_FIXED_LEN: usize = HEADER_LEN + 3;
/// segment (2) + xferMode + dataLen
pub const TRANSFER_FIXED_LEN: usize = HEADER_LEN + 4;
pub const LOOPBACK_LEN: usize = HEADER_LEN + 1 + 8;
pub const MAX_COMMAND_DATA: usize = 65;
/// Fixed bulk-transfer segment size; only the final segment of a resource is shorter.
pub const SEGMENT_SIZE: usize = 64;
/// 8-byte unit serial number followed by exception flags and status byte.
pub const ACK_PREFIX_LEN: usize = 10;
pub const MAX_ACK_PAYLOAD: usize = MAX_COMMAND_DATA - ACK_PREFIX_LEN;

/// MAC value marking an expansion slot (or sensor concentrator slot) as empty.
pub const MAC_UNCONFIGURED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    Cmd = 0x01,
    Ack = 0x02,
    Xfer = 0x03,
    Loopback = 0x04,
    ScAssoc = 0x05,
    ScStatus = 0x06,
}

impl TryFrom<u8> for MsgType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MsgType::Cmd),
            0x02 => Ok(MsgType::Ack),
            0x03 => Ok(MsgType::Xfer),
            0x04 => Ok(MsgType::Loopback),
            0x05 => Ok(MsgType::ScAssoc),
            0x06 => Ok(MsgType::ScStatus),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Physical controller units on the expansion bus, in baton order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UnitId {
    #[default]
    Master,
    Exp1,
    Exp2,
    Exp3,
}

impl UnitId {
    pub const ALL: [UnitId; 4] = [UnitId::Master, UnitId::Exp1, UnitId::Exp2, UnitId::Exp3];
    pub const EXPANSIONS: [UnitId; 3] = [UnitId::Exp1, UnitId::Exp2, UnitId::Exp3];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<UnitId> {
        Self::ALL.get(index).copied()
    }

    pub fn is_expansion(self) -> bool {
        self != UnitId::Master
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitId::Master => "master",
            UnitId::Exp1 => "exp1",
            UnitId::Exp2 => "exp2",
            UnitId::Exp3 => "exp3",
        };
        f.write_str(name)
    }
}

/// Reasons an inbound payload is not a usable application message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported protocol version {0:#04x}")]
    Version(u8),

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("crc mismatch: header {header:#06x}, computed {computed:#06x}")]
    Crc { header: u16, computed: u16 },

    #[error("data length {len} exceeds maximum {max}")]
    DataTooLong { len: usize, max: usize },

    #[error("unknown transfer mode {0:#04x}")]
    TransferMode(u8),

    #[error("unknown loopback kind {0:#04x}")]
    LoopbackKind(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_rejects_unknown_bytes() {
        assert_eq!(MsgType::try_from(0x03), Ok(MsgType::Xfer));
        assert_eq!(MsgType::try_from(0x00), Err(DecodeError::UnknownType(0)));
        assert_eq!(MsgType::try_from(0x07), Err(DecodeError::UnknownType(7)));
    }

    #[test]
    fn unit_ids_follow_baton_order() {
        assert_eq!(UnitId::from_index(2), Some(UnitId::Exp2));
        assert_eq!(UnitId::from_index(4), None);
        assert!(UnitId::Exp3 > UnitId::Master);
        assert_eq!(UnitId::Exp1.to_string(), "exp1");
    }
}
