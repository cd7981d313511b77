//! Typed application messages and their wire encoding.
//!
//! [`Message::decode`] is the only entry point for inbound payloads: it checks
//! the version, slices the message to its declared length, verifies the CRC and
//! only then parses the body. [`Message::encode`] always returns a signed buffer.

use super::opcodes::{parse_xfer_mode, xfer_mode};
use super::{
    checksum, DecodeError, MsgType, Resource, XferOp, COMMAND_FIXED_LEN, HEADER_LEN, LOOPBACK_LEN,
    MAX_COMMAND_DATA, PROTOCOL_VERSION, SEGMENT_SIZE, TRANSFER_FIXED_LEN,
};

/// Body shared by CMD, ACK, SC_ASSOC and SC_STATUS messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub msg_id: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl CommandMessage {
    /// Data beyond [`MAX_COMMAND_DATA`] is truncated.
    pub fn new(msg_id: u8, cmd: u8, data: &[u8]) -> Self {
        let len = data.len().min(MAX_COMMAND_DATA);
        Self {
            msg_id,
            cmd,
            data: data[..len].to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMessage {
    pub segment: u16,
    pub resource: Resource,
    pub op: XferOp,
    pub data: Vec<u8>,
}

impl TransferMessage {
    /// Data beyond one segment is truncated.
    pub fn new(segment: u16, resource: Resource, op: XferOp, data: &[u8]) -> Self {
        let len = data.len().min(SEGMENT_SIZE);
        Self {
            segment,
            resource,
            op,
            data: data[..len].to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopbackKind {
    Request = 0x00,
    Reply = 0x01,
}

/// Loopback self-test probe carrying the originating unit's serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackMessage {
    pub kind: LoopbackKind,
    pub serial: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(CommandMessage),
    Ack(CommandMessage),
    Transfer(TransferMessage),
    Loopback(LoopbackMessage),
    ScAssoc(CommandMessage),
    ScStatus(CommandMessage),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Command(_) => MsgType::Cmd,
            Message::Ack(_) => MsgType::Ack,
            Message::Transfer(_) => MsgType::Xfer,
            Message::Loopback(_) => MsgType::Loopback,
            Message::ScAssoc(_) => MsgType::ScAssoc,
            Message::ScStatus(_) => MsgType::ScStatus,
        }
    }

    /// Serialize and sign.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![PROTOCOL_VERSION, self.msg_type() as u8, 0, 0];
        match self {
            Message::Command(m) | Message::Ack(m) | Message::ScAssoc(m) | Message::ScStatus(m) => {
                let len = m.data.len().min(MAX_COMMAND_DATA);
                out.push(m.msg_id);
                out.push(m.cmd);
                out.push(len as u8);
                out.extend_from_slice(&m.data[..len]);
            }
            Message::Transfer(t) => {
                let len = t.data.len().min(SEGMENT_SIZE);
                out.extend_from_slice(&t.segment.to_be_bytes());
                out.push(xfer_mode(t.resource, t.op));
                out.push(len as u8);
                out.extend_from_slice(&t.data[..len]);
            }
            Message::Loopback(l) => {
                out.push(l.kind as u8);
                out.extend_from_slice(&l.serial.to_be_bytes());
            }
        }
        checksum::sign(&mut out);
        out
    }

    /// Parse one message from a receive-data payload. Bytes past the declared
    /// message length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(DecodeError::Version(bytes[0]));
        }
        let msg_type = MsgType::try_from(bytes[1])?;
        let len = declared_len(msg_type, bytes)?;
        let msg = &bytes[..len];
        let header = u16::from_be_bytes([msg[2], msg[3]]);
        let computed = checksum::message_crc(msg);
        if header != computed {
            return Err(DecodeError::Crc { header, computed });
        }

        let message = match msg_type {
            MsgType::Cmd => Message::Command(command_body(msg)),
            MsgType::Ack => Message::Ack(command_body(msg)),
            MsgType::ScAssoc => Message::ScAssoc(command_body(msg)),
            MsgType::ScStatus => Message::ScStatus(command_body(msg)),
            MsgType::Xfer => {
                let (resource, op) = parse_xfer_mode(msg[6])?;
                Message::Transfer(TransferMessage {
                    segment: u16::from_be_bytes([msg[4], msg[5]]),
                    resource,
                    op,
                    data: msg[TRANSFER_FIXED_LEN..].to_vec(),
                })
            }
            MsgType::Loopback => {
                let kind = match msg[4] {
                    0x00 => LoopbackKind::Request,
                    0x01 => LoopbackKind::Reply,
                    other => return Err(DecodeError::LoopbackKind(other)),
                };
                let mut serial = [0u8; 8];
                serial.copy_from_slice(&msg[5..LOOPBACK_LEN]);
                Message::Loopback(LoopbackMessage {
                    kind,
                    serial: u64::from_be_bytes(serial),
                })
            }
        };
        Ok(message)
    }
}

fn declared_len(msg_type: MsgType, bytes: &[u8]) -> Result<usize, DecodeError> {
    let (fixed, len_at, max) = match msg_type {
        MsgType::Cmd | MsgType::Ack | MsgType::ScAssoc | MsgType::ScStatus => {
            (COMMAND_FIXED_LEN, COMMAND_FIXED_LEN - 1, MAX_COMMAND_DATA)
        }
        MsgType::Xfer => (TRANSFER_FIXED_LEN, TRANSFER_FIXED_LEN - 1, SEGMENT_SIZE),
        MsgType::Loopback => {
            return if bytes.len() < LOOPBACK_LEN {
                Err(DecodeError::Truncated {
                    needed: LOOPBACK_LEN,
                    got: bytes.len(),
                })
            } else {
                Ok(LOOPBACK_LEN)
            };
        }
    };
    if bytes.len() < fixed {
        return Err(DecodeError::Truncated {
            needed: fixed,
            got: bytes.len(),
        });
    }
    let data_len = bytes[len_at] as usize;
    if data_len > max {
        return Err(DecodeError::DataTooLong { len: data_len, max });
    }
    let total = fixed + data_len;
    if bytes.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            got: bytes.len(),
        });
    }
    Ok(total)
}

fn command_body(msg: &[u8]) -> CommandMessage {
    CommandMessage {
        msg_id: msg[4],
        cmd: msg[5],
        data: msg[COMMAND_FIXED_LEN..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layout_is_byte_exact() {
        let msg = Message::Command(CommandMessage::new(0x42, 0x05, &[3]));
        let bytes = msg.encode();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], MsgType::Cmd as u8);
        assert_eq!(&bytes[4..], &[0x42, 0x05, 1, 3]);
        assert!(checksum::validate(&bytes));
        assert_eq!(Message::decode(&bytes), Ok(msg));
    }

    #[test]
    fn transfer_layout_is_byte_exact() {
        let msg = Message::Transfer(TransferMessage::new(
            0x0102,
            Resource::Config,
            XferOp::GetAck,
            &[9, 8, 7],
        ));
        let bytes = msg.encode();
        assert_eq!(&bytes[4..], &[0x01, 0x02, 0x13, 3, 9, 8, 7]);
        assert_eq!(Message::decode(&bytes), Ok(msg));
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut bytes = Message::Ack(CommandMessage::new(1, 0x80, &[])).encode();
        bytes.extend_from_slice(&[0xEE, 0xEE]);
        assert!(matches!(Message::decode(&bytes), Ok(Message::Ack(_))));
    }

    #[test]
    fn wrong_version_is_rejected_before_crc() {
        let mut bytes = Message::Command(CommandMessage::new(1, 0, &[])).encode();
        bytes[0] = 0x01;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::Version(0x01)));
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut bytes = Message::ScStatus(CommandMessage::new(4, 1, &[1, 2, 3])).encode();
        bytes[8] ^= 0x10;
        assert!(matches!(Message::decode(&bytes), Err(DecodeError::Crc { .. })));
    }

    #[test]
    fn truncated_and_oversized_bodies_are_rejected() {
        let bytes = Message::Command(CommandMessage::new(1, 0, &[1, 2, 3])).encode();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));

        let mut oversized = vec![PROTOCOL_VERSION, MsgType::Xfer as u8, 0, 0, 0, 0, 0x11, 65];
        oversized.extend(std::iter::repeat(0).take(65));
        assert_eq!(
            Message::decode(&oversized),
            Err(DecodeError::DataTooLong { len: 65, max: 64 })
        );
    }

    #[test]
    fn loopback_carries_serial() {
        let msg = Message::Loopback(LoopbackMessage {
            kind: LoopbackKind::Reply,
            serial: 0x0013_A200_4012_3456,
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), LOOPBACK_LEN);
        assert_eq!(Message::decode(&bytes), Ok(msg));
    }
}
