//! Command opcodes, bulk-transfer modes and sensor concentrator sub-operations.

use super::DecodeError;
use serde::{Deserialize, Serialize};

/// Set on the `cmd` byte of an Ack Message: `ACK_<opcode> = opcode | ACK_FLAG`.
pub const ACK_FLAG: u8 = 0x80;

/// `cmd` byte of a hub-originated SC_ASSOC / SC_STATUS message.
pub const SC_OP_REQUEST: u8 = 0x01;
/// `cmd` byte of the controller's reply to a hub.
pub const SC_OP_ACK: u8 = SC_OP_REQUEST | ACK_FLAG;

/// Controller-to-controller application command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Noop = 0x00,
    InhibitOn = 0x01,
    InhibitOff = 0x02,
    ForceOn = 0x03,
    WeatherData = 0x04,
    GetMoisture = 0x05,
    GetExtStatus1 = 0x06,
    GetExtStatus2 = 0x07,
    GetExtStatus3 = 0x08,
    GetMoistureBalance = 0x09,
    SetMoistureBalance = 0x0A,
    InitDateTime = 0x0B,
    IrrStart = 0x0C,
    IrrStop = 0x0D,
    IrrResume = 0x0E,
    IrrSkip = 0x0F,
    IrrAuto = 0x10,
    IrrTest = 0x11,
    GetFirmwareVersion = 0x12,
    DiagEcho = 0x13,
    RemoteControlTest = 0x14,
    IrrComplete = 0x15,
    BatonStart = 0x16,
    CfgPutApply = 0x17,
    FirmwareDownloadStart = 0x18,
    PulseModeOff = 0x19,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn ack_code(self) -> u8 {
        self.opcode() | ACK_FLAG
    }

    /// Exact request `dataLen`, or `None` when the command takes variable data.
    pub fn expected_len(self) -> Option<usize> {
        use Command::*;
        match self {
            Noop | InhibitOn | InhibitOff | GetExtStatus1 | GetExtStatus2 | GetExtStatus3
            | IrrStop | IrrResume | IrrSkip | IrrAuto | GetFirmwareVersion | IrrComplete
            | PulseModeOff => Some(0),
            GetMoisture | GetMoistureBalance | IrrStart | IrrTest | BatonStart => Some(1),
            RemoteControlTest | CfgPutApply => Some(2),
            ForceOn | SetMoistureBalance => Some(3),
            FirmwareDownloadStart => Some(4),
            InitDateTime => Some(7),
            WeatherData => Some(8),
            DiagEcho => None,
        }
    }

    /// Debug commands answered without the serial/status prefix.
    pub fn is_light_ack(self) -> bool {
        matches!(self, Command::DiagEcho | Command::RemoteControlTest)
    }

    /// Commands a master re-broadcasts to its expansion units when they arrive
    /// from any other source, keeping every physical unit in time/mode sync.
    pub fn is_forwarded(self) -> bool {
        use Command::*;
        matches!(
            self,
            InhibitOn | InhibitOff | WeatherData | InitDateTime | IrrStop | IrrAuto | PulseModeOff
        )
    }

    /// Extended-status page number for the GET_EXT_STATUS family.
    pub fn status_page(self) -> Option<u8> {
        match self {
            Command::GetExtStatus1 => Some(1),
            Command::GetExtStatus2 => Some(2),
            Command::GetExtStatus3 => Some(3),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command::*;
        let cmd = match value {
            0x00 => Noop,
            0x01 => InhibitOn,
            0x02 => InhibitOff,
            0x03 => ForceOn,
            0x04 => WeatherData,
            0x05 => GetMoisture,
            0x06 => GetExtStatus1,
            0x07 => GetExtStatus2,
            0x08 => GetExtStatus3,
            0x09 => GetMoistureBalance,
            0x0A => SetMoistureBalance,
            0x0B => InitDateTime,
            0x0C => IrrStart,
            0x0D => IrrStop,
            0x0E => IrrResume,
            0x0F => IrrSkip,
            0x10 => IrrAuto,
            0x11 => IrrTest,
            0x12 => GetFirmwareVersion,
            0x13 => DiagEcho,
            0x14 => RemoteControlTest,
            0x15 => IrrComplete,
            0x16 => BatonStart,
            0x17 => CfgPutApply,
            0x18 => FirmwareDownloadStart,
            0x19 => PulseModeOff,
            other => return Err(other),
        };
        Ok(cmd)
    }
}

/// Resource selected by the high nibble of `xferMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Resource {
    Config = 0x1,
    Firmware = 0x2,
    Flow = 0x3,
    Level = 0x4,
    Eeprom = 0x5,
}

/// Operation selected by the low nibble of `xferMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum XferOp {
    GetReq = 0x1,
    PutReq = 0x2,
    GetAck = 0x3,
    GetNack = 0x4,
    PutAck = 0x5,
    PutNack = 0x6,
}

pub fn xfer_mode(resource: Resource, op: XferOp) -> u8 {
    ((resource as u8) << 4) | op as u8
}

pub fn parse_xfer_mode(mode: u8) -> Result<(Resource, XferOp), DecodeError> {
    let resource = match mode >> 4 {
        0x1 => Resource::Config,
        0x2 => Resource::Firmware,
        0x3 => Resource::Flow,
        0x4 => Resource::Level,
        0x5 => Resource::Eeprom,
        _ => return Err(DecodeError::TransferMode(mode)),
    };
    let op = match mode & 0x0F {
        0x1 => XferOp::GetReq,
        0x2 => XferOp::PutReq,
        0x3 => XferOp::GetAck,
        0x4 => XferOp::GetNack,
        0x5 => XferOp::PutAck,
        0x6 => XferOp::PutNack,
        _ => return Err(DecodeError::TransferMode(mode)),
    };
    Ok((resource, op))
}

/// First data byte of an SC_STATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScInstruction {
    Normal = 0x00,
    Deassociate = 0x01,
}
