//! # Frame Transport Seam
//!
//! The radio module speaks its own API framing (start delimiter, length,
//! escaping, frame checksum). That layer is a collaborator of the protocol
//! engine: it hands the engine whole, already-validated API frames and accepts
//! outbound frames without blocking. This module defines the frame types that
//! cross the seam and the [`FrameTransport`] trait.
//!
//! Interrupt-fed byte queues never reach the engine; implementations are
//! expected to expose them as a message queue (see [`MemoryTransport`]).

pub mod memory;

pub use memory::MemoryTransport;

/// AT-style module commands. The discriminant doubles as the retry-queue ident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AtCommand {
    SerialHigh = 0,
    SerialLow = 1,
    PanId = 2,
    FirmwareVersion = 3,
    AssociationIndication = 4,
    Write = 5,
    ApplyChanges = 6,
    SoftwareReset = 7,
}

impl AtCommand {
    /// Queried every time the module enters initialisation.
    pub const INIT_SEQUENCE: [AtCommand; 5] = [
        AtCommand::SerialHigh,
        AtCommand::SerialLow,
        AtCommand::PanId,
        AtCommand::FirmwareVersion,
        AtCommand::AssociationIndication,
    ];

    pub fn ident(self) -> u8 {
        self as u8
    }

    pub fn from_ident(ident: u8) -> Option<AtCommand> {
        use AtCommand::*;
        [
            SerialHigh,
            SerialLow,
            PanId,
            FirmwareVersion,
            AssociationIndication,
            Write,
            ApplyChanges,
            SoftwareReset,
        ]
        .into_iter()
        .find(|c| c.ident() == ident)
    }

    /// Two-letter mnemonic used on the module API.
    pub fn mnemonic(self) -> &'static str {
        match self {
            AtCommand::SerialHigh => "SH",
            AtCommand::SerialLow => "SL",
            AtCommand::PanId => "ID",
            AtCommand::FirmwareVersion => "VR",
            AtCommand::AssociationIndication => "AI",
            AtCommand::Write => "WR",
            AtCommand::ApplyChanges => "AC",
            AtCommand::SoftwareReset => "FR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtStatus {
    Ok,
    Error,
    InvalidCommand,
    InvalidParameter,
}

impl From<u8> for AtStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => AtStatus::Ok,
            2 => AtStatus::InvalidCommand,
            3 => AtStatus::InvalidParameter,
            _ => AtStatus::Error,
        }
    }
}

/// Unsolicited module status notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemStatus {
    HardwareReset,
    WatchdogReset,
    Joined,
    Disassociated,
    Other(u8),
}

impl From<u8> for ModemStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ModemStatus::HardwareReset,
            1 => ModemStatus::WatchdogReset,
            2 => ModemStatus::Joined,
            3 => ModemStatus::Disassociated,
            other => ModemStatus::Other(other),
        }
    }
}

/// API frames delivered to the engine, already classified by API type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Application payload received from `source`.
    RxData { source: u64, payload: Vec<u8> },
    /// Response to a local AT command.
    AtResponse {
        command: AtCommand,
        status: AtStatus,
        value: Vec<u8>,
    },
    ModemStatus(ModemStatus),
    /// Delivery report for a previously sent data frame.
    TxStatus { frame_id: u8, delivered: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Data { destination: u64, payload: Vec<u8> },
    AtCommand { command: AtCommand, parameter: Vec<u8> },
}

/// Non-blocking access to the radio module.
pub trait FrameTransport {
    /// Queue a frame for transmission. `false` when the outbound queue is full.
    fn send_frame(&mut self, frame: OutboundFrame) -> bool;
    /// Next fully received frame, if one is buffered.
    fn recv_frame(&mut self) -> Option<InboundFrame>;
    /// Carrier-detect / module-present signal.
    fn link_present(&self) -> bool;
    /// Pulse the module's hardware reset line.
    fn hardware_reset(&mut self);
}
