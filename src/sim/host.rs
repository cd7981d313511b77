//! In-memory controller used by the simulator and the test-suite.
use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::host::{
    BulkStore, Clock, ConfigImage, Extensions, Fault, HistoryKind, Irrigation, Moisture,
    SystemStatus, WeatherUpdate, ZoneSensor, ZoneSensors,
};
use crate::protocol::{crc16, Resource, UnitId};
use crate::radio::transfer::{FIRMWARE_HEADER_LEN, HISTORY_LEN};

/// Extension opcode answered with the request data reversed.
pub const DEMO_REVERSE: u8 = 0x70;

const DEFAULT_IMAGE_LEN: usize = 300;
const DEFAULT_EEPROM_LEN: usize = 2048;

/// Irrigation-side effects recorded in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HostEvent {
    Test(u8),
    ManualStart(u8),
    ForceOn { zone: u8, minutes: u16 },
    Skip,
    Stop,
    Resume,
    Auto,
    Weather(WeatherUpdate),
    BatonStart(u8),
    ImageApplied(u16),
    TransferComplete { from: UnitId, resource: Resource, len: usize },
}

#[derive(Debug, Clone)]
pub struct SimHost {
    now_ms: u32,
    clock: Option<NaiveDateTime>,
    image: Vec<u8>,
    snapshot: Option<Vec<u8>>,
    content_valid: bool,
    moisture: Vec<Option<u16>>,
    balance: Vec<i16>,
    sensors: Vec<ZoneSensor>,
    relays: Vec<bool>,
    events: Vec<HostEvent>,
    irrigating: bool,
    inhibited: bool,
    paused: bool,
    pulse_mode: bool,
    running_program: Option<u8>,
    faults: HashSet<Fault>,
    firmware_version: [u8; 3],
    flow: Vec<u8>,
    level: Vec<u8>,
    firmware_payload: Vec<u8>,
    firmware_header: Option<Vec<u8>>,
    eeprom: Vec<u8>,
    received: Vec<(UnitId, Resource, Vec<u8>)>,
    extension_commands: Vec<(u64, u8, Vec<u8>)>,
    extension_acks: Vec<(u64, u8, Vec<u8>)>,
}

impl SimHost {
    pub fn new(zone_count: usize) -> Self {
        Self {
            now_ms: 0,
            clock: None,
            image: (0..DEFAULT_IMAGE_LEN).map(|i| (i as u8) ^ 0x5A).collect(),
            snapshot: None,
            content_valid: true,
            moisture: vec![None; zone_count],
            balance: vec![0; zone_count],
            sensors: vec![ZoneSensor::None; zone_count],
            relays: vec![false; zone_count],
            events: Vec::new(),
            irrigating: false,
            inhibited: false,
            paused: false,
            pulse_mode: true,
            running_program: None,
            faults: HashSet::new(),
            firmware_version: [2, 4, 1],
            flow: (0..HISTORY_LEN).map(|i| (i % 251) as u8).collect(),
            level: (0..HISTORY_LEN).map(|i| (i % 97) as u8).collect(),
            firmware_payload: Vec::new(),
            firmware_header: None,
            eeprom: vec![0; DEFAULT_EEPROM_LEN],
            received: Vec::new(),
            extension_commands: Vec::new(),
            extension_acks: Vec::new(),
        }
    }

    pub fn advance(&mut self, ms: u32) {
        self.now_ms = self.now_ms.wrapping_add(ms);
    }

    pub fn set_now(&mut self, ms: u32) {
        self.now_ms = ms;
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn set_image(&mut self, image: Vec<u8>) {
        self.image = image;
    }

    /// Make [`ConfigImage::content_validate`] fail, as a corrupt image would.
    pub fn set_content_valid(&mut self, valid: bool) {
        self.content_valid = valid;
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn events(&self) -> &[HostEvent] {
        &self.events
    }

    /// FORCE_ON requests accepted so far, as (zone, minutes).
    pub fn forced(&self) -> Vec<(u8, u16)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HostEvent::ForceOn { zone, minutes } => Some((*zone, *minutes)),
                _ => None,
            })
            .collect()
    }

    pub fn batons(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HostEvent::BatonStart(program) => Some(*program),
                _ => None,
            })
            .collect()
    }

    pub fn clock_set(&self) -> Option<NaiveDateTime> {
        self.clock
    }

    pub fn faults(&self) -> &HashSet<Fault> {
        &self.faults
    }

    pub fn has_fault(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    pub fn relay(&self, zone: u8) -> bool {
        self.relays.get(usize::from(zone)).copied().unwrap_or(false)
    }

    pub fn pulse_mode(&self) -> bool {
        self.pulse_mode
    }

    /// Local share of the irrigation program ran to completion.
    pub fn finish_irrigation(&mut self) {
        self.irrigating = false;
    }

    pub fn firmware_header(&self) -> Option<&[u8]> {
        self.firmware_header.as_deref()
    }

    pub fn firmware_payload(&self) -> &[u8] {
        &self.firmware_payload
    }

    pub fn set_firmware(&mut self, header: [u8; FIRMWARE_HEADER_LEN], payload: Vec<u8>) {
        self.firmware_header = Some(header.to_vec());
        self.firmware_payload = payload;
    }

    pub fn received(&self) -> &[(UnitId, Resource, Vec<u8>)] {
        &self.received
    }

    pub fn extension_commands(&self) -> &[(u64, u8, Vec<u8>)] {
        &self.extension_commands
    }

    pub fn extension_acks(&self) -> &[(u64, u8, Vec<u8>)] {
        &self.extension_acks
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new(12)
    }
}

/// Copy `src[offset..]` into `buf`, zero-filling whatever lies past the end.
fn copy_out(src: &[u8], offset: usize, buf: &mut [u8]) {
    buf.fill(0);
    if offset >= src.len() {
        return;
    }
    let n = buf.len().min(src.len() - offset);
    buf[..n].copy_from_slice(&src[offset..offset + n]);
}

fn copy_in(dst: &mut [u8], offset: usize, data: &[u8]) {
    if offset >= dst.len() {
        return;
    }
    let n = data.len().min(dst.len() - offset);
    dst[offset..offset + n].copy_from_slice(&data[..n]);
}

impl Clock for SimHost {
    fn now_ms(&self) -> u32 {
        self.now_ms
    }

    fn set_clock(&mut self, at: NaiveDateTime) {
        self.clock = Some(at);
    }
}

impl ConfigImage for SimHost {
    fn image_len(&self) -> usize {
        self.image.len()
    }

    fn read_image(&self, offset: usize, buf: &mut [u8]) {
        copy_out(&self.image, offset, buf);
    }

    fn write_image(&mut self, offset: usize, data: &[u8]) {
        copy_in(&mut self.image, offset, data);
    }

    fn snapshot_save(&mut self) {
        self.snapshot = Some(self.image.clone());
    }

    fn snapshot_restore(&mut self) {
        if let Some(saved) = self.snapshot.take() {
            self.image = saved;
        }
    }

    fn content_validate(&self) -> bool {
        self.content_valid
    }

    fn image_checksum(&self) -> u16 {
        crc16(&self.image)
    }

    fn apply_image(&mut self) {
        self.snapshot = None;
        let checksum = self.image_checksum();
        self.events.push(HostEvent::ImageApplied(checksum));
    }
}

impl Irrigation for SimHost {
    fn test_zones(&mut self, minutes: u8) {
        self.irrigating = true;
        self.events.push(HostEvent::Test(minutes));
    }

    fn manual_start(&mut self, program: u8) {
        self.irrigating = true;
        self.running_program = Some(program);
        self.events.push(HostEvent::ManualStart(program));
    }

    fn force_on(&mut self, zone: u8, minutes: u16) -> bool {
        if usize::from(zone) >= self.zone_count() {
            return false;
        }
        self.irrigating = true;
        self.events.push(HostEvent::ForceOn { zone, minutes });
        true
    }

    fn skip(&mut self) {
        self.events.push(HostEvent::Skip);
    }

    fn stop(&mut self) {
        self.irrigating = false;
        self.paused = true;
        self.events.push(HostEvent::Stop);
    }

    fn resume(&mut self) {
        self.paused = false;
        self.events.push(HostEvent::Resume);
    }

    fn set_auto(&mut self) {
        self.paused = false;
        self.events.push(HostEvent::Auto);
    }

    fn set_inhibit(&mut self, on: bool) {
        self.inhibited = on;
    }

    fn moisture_balance(&self, zone: u8) -> Option<i16> {
        self.balance.get(usize::from(zone)).copied()
    }

    fn set_moisture_balance(&mut self, zone: u8, balance: i16) -> bool {
        match self.balance.get_mut(usize::from(zone)) {
            Some(slot) => {
                *slot = balance;
                true
            }
            None => false,
        }
    }

    fn weather_update(&mut self, update: WeatherUpdate) {
        self.events.push(HostEvent::Weather(update));
    }

    fn is_irrigating(&self) -> bool {
        self.irrigating
    }

    fn is_inhibited(&self) -> bool {
        self.inhibited
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn start_baton(&mut self, program: u8) {
        self.irrigating = true;
        self.running_program = Some(program);
        self.events.push(HostEvent::BatonStart(program));
    }

    fn running_program(&self) -> Option<u8> {
        self.running_program
    }

    fn clear_running_program(&mut self) {
        self.running_program = None;
        self.irrigating = false;
    }

    fn disable_pulse_mode(&mut self) {
        self.pulse_mode = false;
    }

    fn set_relay(&mut self, zone: u8, on: bool) {
        if let Some(relay) = self.relays.get_mut(usize::from(zone)) {
            *relay = on;
        }
    }
}

impl SystemStatus for SimHost {
    fn set_fault(&mut self, fault: Fault) {
        self.faults.insert(fault);
    }

    fn clear_fault(&mut self, fault: Fault) {
        self.faults.remove(&fault);
    }

    fn exception_flags(&self) -> u8 {
        self.faults.iter().fold(0, |flags, fault| {
            flags
                | match fault {
                    Fault::ExpansionTimeout(_) => 0x01,
                    Fault::ExpansionConfigSync(_) => 0x02,
                    Fault::ConcentratorTimeout(_) => 0x04,
                    Fault::RadioFailure => 0x08,
                }
        })
    }

    fn status_byte(&self) -> u8 {
        u8::from(self.irrigating) | u8::from(self.inhibited) << 1 | u8::from(self.paused) << 2
    }

    fn extended_status(&self, page: u8) -> Vec<u8> {
        match page {
            1 => vec![
                self.status_byte(),
                self.running_program.unwrap_or(0xFF),
                self.exception_flags(),
                self.faults.len() as u8,
                u8::from(self.pulse_mode),
            ],
            2 => self
                .moisture
                .iter()
                .flat_map(|value| value.unwrap_or(0xFFFF).to_be_bytes())
                .collect(),
            3 => {
                let mut out = self.firmware_version.to_vec();
                out.push(self.zone_count() as u8);
                out
            }
            _ => Vec::new(),
        }
    }

    fn firmware_version(&self) -> [u8; 3] {
        self.firmware_version
    }
}

impl Moisture for SimHost {
    fn moisture_value(&self, zone: u8) -> Option<u16> {
        self.moisture.get(usize::from(zone)).copied().flatten()
    }

    fn set_moisture_value(&mut self, zone: u8, value: u16) {
        if let Some(slot) = self.moisture.get_mut(usize::from(zone)) {
            *slot = Some(value);
        }
    }
}

impl ZoneSensors for SimHost {
    fn zone_count(&self) -> usize {
        self.sensors.len()
    }

    fn zone_sensor(&self, zone: usize) -> ZoneSensor {
        self.sensors.get(zone).copied().unwrap_or_default()
    }

    fn set_zone_sensor(&mut self, zone: usize, sensor: ZoneSensor) {
        if let Some(slot) = self.sensors.get_mut(zone) {
            *slot = sensor;
        }
    }
}

impl BulkStore for SimHost {
    fn read_history(&self, kind: HistoryKind, offset: usize, buf: &mut [u8]) {
        match kind {
            HistoryKind::Flow => copy_out(&self.flow, offset, buf),
            HistoryKind::Level => copy_out(&self.level, offset, buf),
        }
    }

    fn write_firmware_payload(&mut self, offset: usize, data: &[u8]) {
        if offset == 0 {
            self.firmware_header = None;
        }
        let end = offset + data.len();
        if self.firmware_payload.len() < end {
            self.firmware_payload.resize(end, 0xFF);
        }
        self.firmware_payload[offset..end].copy_from_slice(data);
    }

    fn read_firmware(&self, offset: usize, buf: &mut [u8]) {
        let mut image = self
            .firmware_header
            .clone()
            .unwrap_or_else(|| vec![0; FIRMWARE_HEADER_LEN]);
        image.extend_from_slice(&self.firmware_payload);
        copy_out(&image, offset, buf);
    }

    fn commit_firmware_header(&mut self, header: &[u8]) {
        self.firmware_header = Some(header.to_vec());
    }

    fn eeprom_len(&self) -> usize {
        self.eeprom.len()
    }

    fn read_eeprom(&self, offset: usize, buf: &mut [u8]) {
        copy_out(&self.eeprom, offset, buf);
    }

    fn write_eeprom(&mut self, offset: usize, data: &[u8]) {
        copy_in(&mut self.eeprom, offset, data);
    }

    fn transfer_complete(&mut self, from: UnitId, resource: Resource, data: Vec<u8>) {
        self.events.push(HostEvent::TransferComplete {
            from,
            resource,
            len: data.len(),
        });
        self.received.push((from, resource, data));
    }
}

impl Extensions for SimHost {
    fn extension_command(&mut self, source: u64, cmd: u8, data: &[u8]) -> Option<Vec<u8>> {
        self.extension_commands.push((source, cmd, data.to_vec()));
        (cmd == DEMO_REVERSE).then(|| data.iter().rev().copied().collect())
    }

    fn extension_ack(&mut self, source: u64, ack: u8, data: &[u8]) {
        self.extension_acks.push((source, ack, data.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_past_the_end_are_zero_filled() {
        let host = SimHost::new(4);
        let mut buf = [0xAA; 8];
        host.read_image(host.image_len() - 2, &mut buf);
        assert_eq!(&buf[2..], &[0; 6]);
        assert_ne!(&buf[..2], &[0, 0]);
    }

    #[test]
    fn snapshot_restore_rolls_back_writes() {
        let mut host = SimHost::new(4);
        let original = host.image().to_vec();
        host.snapshot_save();
        host.write_image(0, &[0; 16]);
        host.snapshot_restore();
        assert_eq!(host.image(), original.as_slice());
        assert!(!host.has_snapshot());
    }

    #[test]
    fn firmware_reads_include_header() {
        let mut host = SimHost::new(4);
        host.write_firmware_payload(0, &[1, 2, 3]);
        host.commit_firmware_header(&[9; FIRMWARE_HEADER_LEN]);
        let mut buf = [0u8; FIRMWARE_HEADER_LEN + 3];
        host.read_firmware(0, &mut buf);
        assert_eq!(&buf[..FIRMWARE_HEADER_LEN], &[9; FIRMWARE_HEADER_LEN]);
        assert_eq!(&buf[FIRMWARE_HEADER_LEN..], &[1, 2, 3]);
    }

    #[test]
    fn exception_flags_reflect_faults() {
        let mut host = SimHost::new(4);
        host.set_fault(Fault::ExpansionTimeout(UnitId::Exp2));
        host.set_fault(Fault::RadioFailure);
        assert_eq!(host.exception_flags(), 0x09);
        host.clear_fault(Fault::RadioFailure);
        assert_eq!(host.exception_flags(), 0x01);
    }
}
