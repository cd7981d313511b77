//! # Collaborator Interfaces
//!
//! The protocol engine never touches the rest of the controller directly. It
//! works through the traits below; a concrete controller implements all of them
//! on one type and hands it to [`crate::radio::RadioEngine`], which then owns it.
//!
//! - [`Clock`] - monotonic tick count and wall-clock update
//! - [`ConfigImage`] - configuration image store with snapshot/validate
//! - [`Irrigation`] - irrigation control, moisture balance, weather, relays
//! - [`SystemStatus`] - fault/error flags and extended status serialisation
//! - [`Moisture`] - per-zone moisture values
//! - [`ZoneSensors`] - per-zone sensor assignment (wired / wireless slot)
//! - [`BulkStore`] - firmware, history and raw EEPROM access
//! - [`Extensions`] - demo/debug command handlers
//!
//! [`Host`] is implemented automatically for any type providing all of them.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::protocol::{Resource, UnitId};

/// Persistent fault flags raised by the radio core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Fault {
    /// Expansion unit stopped answering.
    ExpansionTimeout(UnitId),
    /// Configuration distribution to an expansion unit gave up or was rejected.
    ExpansionConfigSync(UnitId),
    /// Sensor concentrator in the given slot stopped reporting.
    ConcentratorTimeout(usize),
    /// Radio module could not be initialised after repeated resets.
    RadioFailure,
}

/// Sensor configuration of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ZoneSensor {
    #[default]
    None,
    Wired,
    /// Wireless channel of the sensor concentrator in `slot`.
    Wireless { slot: usize, channel: usize },
}

/// Weather feed pushed by a gateway (WEATHER_DATA payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeatherUpdate {
    /// Tenths of a degree Celsius.
    pub max_temp: i16,
    pub min_temp: i16,
    pub humidity_pct: u8,
    pub wind_kph: u8,
    /// Hundredths of an inch.
    pub rain: u16,
}

impl WeatherUpdate {
    pub const WIRE_LEN: usize = 8;

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            max_temp: i16::from_be_bytes([data[0], data[1]]),
            min_temp: i16::from_be_bytes([data[2], data[3]]),
            humidity_pct: data[4],
            wind_kph: data[5],
            rain: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..2].copy_from_slice(&self.max_temp.to_be_bytes());
        out[2..4].copy_from_slice(&self.min_temp.to_be_bytes());
        out[4] = self.humidity_pct;
        out[5] = self.wind_kph;
        out[6..8].copy_from_slice(&self.rain.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Flow,
    Level,
}

pub trait Clock {
    /// Monotonic millisecond tick; wraps.
    fn now_ms(&self) -> u32;
    fn set_clock(&mut self, at: NaiveDateTime);
}

pub trait ConfigImage {
    fn image_len(&self) -> usize;
    fn read_image(&self, offset: usize, buf: &mut [u8]);
    fn write_image(&mut self, offset: usize, data: &[u8]);
    /// Save the current image so a failed transfer can be rolled back.
    fn snapshot_save(&mut self);
    fn snapshot_restore(&mut self);
    fn content_validate(&self) -> bool;
    fn image_checksum(&self) -> u16;
    /// Make a freshly received image live.
    fn apply_image(&mut self);
}

pub trait Irrigation {
    fn test_zones(&mut self, minutes: u8);
    fn manual_start(&mut self, program: u8);
    /// `false` when the zone does not exist.
    fn force_on(&mut self, zone: u8, minutes: u16) -> bool;
    fn skip(&mut self);
    fn stop(&mut self);
    fn resume(&mut self);
    fn set_auto(&mut self);
    fn set_inhibit(&mut self, on: bool);
    fn moisture_balance(&self, zone: u8) -> Option<i16>;
    fn set_moisture_balance(&mut self, zone: u8, balance: i16) -> bool;
    fn weather_update(&mut self, update: WeatherUpdate);
    fn is_irrigating(&self) -> bool;
    fn is_inhibited(&self) -> bool;
    fn is_paused(&self) -> bool;
    /// Run this unit's share of the multi-unit program.
    fn start_baton(&mut self, program: u8);
    fn running_program(&self) -> Option<u8>;
    fn clear_running_program(&mut self);
    fn disable_pulse_mode(&mut self);
    /// Drive the wired solenoid relay of `zone`.
    fn set_relay(&mut self, zone: u8, on: bool);
}

pub trait SystemStatus {
    fn set_fault(&mut self, fault: Fault);
    fn clear_fault(&mut self, fault: Fault);
    fn exception_flags(&self) -> u8;
    fn status_byte(&self) -> u8;
    /// Serialised extended-status page (1..=3).
    fn extended_status(&self, page: u8) -> Vec<u8>;
    /// Controller firmware version as major, minor, build.
    fn firmware_version(&self) -> [u8; 3];
}

pub trait Moisture {
    fn moisture_value(&self, zone: u8) -> Option<u16>;
    fn set_moisture_value(&mut self, zone: u8, value: u16);
}

pub trait ZoneSensors {
    fn zone_count(&self) -> usize;
    fn zone_sensor(&self, zone: usize) -> ZoneSensor;
    fn set_zone_sensor(&mut self, zone: usize, sensor: ZoneSensor);
}

pub trait BulkStore {
    fn read_history(&self, kind: HistoryKind, offset: usize, buf: &mut [u8]);
    /// Firmware image bytes after the header, `offset` relative to the payload start.
    fn write_firmware_payload(&mut self, offset: usize, data: &[u8]);
    /// `offset` relative to the start of the image (header included).
    fn read_firmware(&self, offset: usize, buf: &mut [u8]);
    /// Marks the stored image complete.
    fn commit_firmware_header(&mut self, header: &[u8]);
    fn eeprom_len(&self) -> usize;
    fn read_eeprom(&self, offset: usize, buf: &mut [u8]);
    fn write_eeprom(&mut self, offset: usize, data: &[u8]);
    /// A resource pulled from another unit has been received completely.
    fn transfer_complete(&mut self, from: UnitId, resource: Resource, data: Vec<u8>);
}

pub trait Extensions {
    /// Handle a command opcode the core does not know. `Some(payload)` is sent back as a light ack.
    fn extension_command(&mut self, _source: u64, _cmd: u8, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Handle an ack code the core does not know.
    fn extension_ack(&mut self, _source: u64, _ack: u8, _data: &[u8]) {}
}

pub trait Host:
    Clock + ConfigImage + Irrigation + SystemStatus + Moisture + ZoneSensors + BulkStore + Extensions
{
}

impl<T> Host for T where
    T: Clock
        + ConfigImage
        + Irrigation
        + SystemStatus
        + Moisture
        + ZoneSensors
        + BulkStore
        + Extensions
{
}
