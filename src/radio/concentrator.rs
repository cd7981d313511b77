//! Sensor concentrator association and status exchange.
//!
//! Up to [`MAX_CONCENTRATORS`] wireless hubs, each multiplexing
//! [`CHANNELS`] moisture sensors. Occupied table slots always form the prefix
//! `[0, len)`; removing a hub shifts every higher slot down by one and fixes up
//! every reference to a slot index (zone sensor assignments, the pending
//! delete list and the solenoid override).
//!
//! ```text
//! unknown MAC --SC_ASSOC, association mode--> pending --accept--> associated
//! associated  --SC_ASSOC x reassociation_limit, no SC_STATUS-->  radio reset
//! associated  --marked for deletion, next SC_STATUS--> deassociate + removed
//! ```

use log::{debug, info, warn};
use serde::Serialize;

use super::RadioEngine;
use crate::host::{Fault, Host, ZoneSensor, ZoneSensors};
use crate::logutil::fmt_mac;
use crate::protocol::{
    CommandMessage, Message, ScInstruction, UnitId, MAC_UNCONFIGURED, SC_OP_ACK, SC_OP_REQUEST,
};
use crate::transport::FrameTransport;

pub const MAX_CONCENTRATORS: usize = 12;
pub const CHANNELS: usize = 4;
/// Moisture reading of a channel with no sensor attached.
pub const MOISTURE_NOT_FITTED: u16 = 0xFFFF;

const ASSOC_REQUEST_LEN: usize = 3;
const STATUS_REQUEST_LEN: usize = 3 + 2 * CHANNELS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConcentratorRecord {
    pub mac: u64,
    pub controlling_unit: UnitId,
    pub channel_zone: [Option<u8>; CHANNELS],
}

impl ConcentratorRecord {
    pub fn is_empty(&self) -> bool {
        self.mac == MAC_UNCONFIGURED
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConcentratorRuntime {
    pub firmware: u8,
    pub charge_rate: u8,
    pub batt_mv: u16,
    pub solenoid_mask: u8,
    pub reassociation_count: u8,
    pub associated: bool,
    /// `ConcentratorTimeout` is raised for this slot.
    pub timed_out: bool,
    pub last_status_ms: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ConcentratorTable {
    records: [ConcentratorRecord; MAX_CONCENTRATORS],
    runtime: [ConcentratorRuntime; MAX_CONCENTRATORS],
    /// Slots to deassociate on their next status message.
    delete_list: Vec<usize>,
}

impl ConcentratorTable {
    pub fn len(&self) -> usize {
        self.records.iter().take_while(|r| !r.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.records[0].is_empty()
    }

    /// Occupied slots are exactly `[0, len)`.
    pub fn is_compact(&self) -> bool {
        let len = self.len();
        self.records[len..].iter().all(ConcentratorRecord::is_empty)
    }

    pub fn find(&self, mac: u64) -> Option<usize> {
        if mac == MAC_UNCONFIGURED {
            return None;
        }
        self.records[..self.len()].iter().position(|r| r.mac == mac)
    }

    pub fn record(&self, slot: usize) -> Option<&ConcentratorRecord> {
        self.records[..self.len()].get(slot)
    }

    pub fn runtime(&self, slot: usize) -> Option<&ConcentratorRuntime> {
        self.runtime[..self.len()].get(slot)
    }

    pub fn records(&self) -> &[ConcentratorRecord] {
        &self.records[..self.len()]
    }

    pub fn is_marked_for_deletion(&self, slot: usize) -> bool {
        self.delete_list.contains(&slot)
    }

    /// Append `mac` in the first empty slot.
    pub fn add(&mut self, mac: u64) -> Option<usize> {
        if mac == MAC_UNCONFIGURED || self.find(mac).is_some() {
            return None;
        }
        let slot = self.len();
        if slot == MAX_CONCENTRATORS {
            return None;
        }
        self.records[slot] = ConcentratorRecord {
            mac,
            ..Default::default()
        };
        self.runtime[slot] = ConcentratorRuntime::default();
        Some(slot)
    }

    pub fn mark_for_deletion(&mut self, slot: usize) -> bool {
        if slot >= self.len() {
            return false;
        }
        if !self.delete_list.contains(&slot) {
            self.delete_list.push(slot);
        }
        true
    }

    /// Remove `slot` and compact. Zones served by the removed hub revert to no
    /// sensor; zones served by higher slots follow their hub down.
    pub fn remove<Z: ZoneSensors + ?Sized>(&mut self, slot: usize, zones: &mut Z) -> Option<u64> {
        let len = self.len();
        if slot >= len {
            return None;
        }
        let mac = self.records[slot].mac;

        for zone in 0..zones.zone_count() {
            if let ZoneSensor::Wireless { slot: s, channel } = zones.zone_sensor(zone) {
                if s == slot {
                    zones.set_zone_sensor(zone, ZoneSensor::None);
                } else if s > slot {
                    zones.set_zone_sensor(zone, ZoneSensor::Wireless { slot: s - 1, channel });
                }
            }
        }

        self.delete_list.retain(|&s| s != slot);
        for s in self.delete_list.iter_mut() {
            if *s > slot {
                *s -= 1;
            }
        }

        self.records.copy_within(slot + 1..len, slot);
        self.runtime.copy_within(slot + 1..len, slot);
        self.records[len - 1] = ConcentratorRecord::default();
        self.runtime[len - 1] = ConcentratorRuntime::default();
        Some(mac)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConcentratorManager {
    table: ConcentratorTable,
    association_mode: bool,
    pending: Option<u64>,
    /// The one hub currently driving solenoids, with its channel mask.
    solenoid_override: Option<(usize, u8)>,
}

impl ConcentratorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &ConcentratorTable {
        &self.table
    }

    pub fn association_mode(&self) -> bool {
        self.association_mode
    }

    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    pub fn solenoid_override(&self) -> Option<(usize, u8)> {
        self.solenoid_override
    }

    fn override_mask(&self, slot: usize) -> u8 {
        match self.solenoid_override {
            Some((s, mask)) if s == slot => mask,
            _ => 0,
        }
    }
}

impl<T: FrameTransport, H: Host> RadioEngine<T, H> {
    pub fn concentrators(&self) -> &ConcentratorManager {
        &self.concentrators
    }

    pub fn set_association_mode(&mut self, enabled: bool) {
        info!("sensor concentrator association mode {}", if enabled { "on" } else { "off" });
        self.concentrators.association_mode = enabled;
    }

    /// Admit the pending hub into the first empty slot.
    pub fn accept_pending(&mut self) -> Option<usize> {
        let mac = self.concentrators.pending?;
        let slot = self.concentrators.table.add(mac);
        match slot {
            Some(slot) => {
                info!("sensor concentrator {} accepted into slot {}", fmt_mac(mac), slot);
                self.concentrators.pending = None;
            }
            None => warn!("no free slot for sensor concentrator {}", fmt_mac(mac)),
        }
        slot
    }

    pub fn reject_pending(&mut self) {
        if let Some(mac) = self.concentrators.pending.take() {
            info!("sensor concentrator {} rejected", fmt_mac(mac));
        }
    }

    /// Map hub channel `channel` to `zone`. The hub's controlling unit follows
    /// the unit that owns the zone.
    pub fn assign_channel(&mut self, slot: usize, channel: usize, zone: u8) -> bool {
        let zone_idx = usize::from(zone);
        if slot >= self.concentrators.table.len()
            || channel >= CHANNELS
            || zone_idx >= self.host.zone_count()
        {
            return false;
        }
        let owner = usize::from(zone / self.identity.zones_per_unit.max(1));
        let Some(unit) = UnitId::from_index(owner) else {
            return false;
        };

        // A zone has a single sensor; unhook whatever served it before.
        if let ZoneSensor::Wireless { slot: s, channel: c } = self.host.zone_sensor(zone_idx) {
            if let Some(record) = self.concentrators.table.records.get_mut(s) {
                record.channel_zone[c] = None;
            }
        }
        let record = &mut self.concentrators.table.records[slot];
        if let Some(old) = record.channel_zone[channel].replace(zone) {
            if old != zone {
                self.host.set_zone_sensor(usize::from(old), ZoneSensor::None);
            }
        }
        record.controlling_unit = unit;
        self.host
            .set_zone_sensor(zone_idx, ZoneSensor::Wireless { slot, channel });
        true
    }

    pub fn mark_for_deletion(&mut self, mac: u64) -> bool {
        match self.concentrators.table.find(mac) {
            Some(slot) => self.concentrators.table.mark_for_deletion(slot),
            None => false,
        }
    }

    /// Select the hub that drives solenoids; a zero mask releases the override.
    /// Relays of a replaced override are commanded off.
    pub fn sensor_concentrator_solenoid_override(&mut self, slot: usize, channel_mask: u8) -> bool {
        if slot >= self.concentrators.table.len() {
            return false;
        }
        let mask = channel_mask & 0x0F;
        if let Some((old_slot, old_mask)) = self.concentrators.solenoid_override {
            let keep = if old_slot == slot { mask } else { 0 };
            self.drive_relays(old_slot, old_mask & !keep, false);
        }
        self.concentrators.solenoid_override = (mask != 0).then_some((slot, mask));
        true
    }

    fn drive_relays(&mut self, slot: usize, mask: u8, on: bool) {
        let Some(record) = self.concentrators.table.record(slot).copied() else {
            return;
        };
        for (channel, zone) in record.channel_zone.iter().enumerate() {
            if let Some(zone) = zone {
                if mask & (1 << channel) != 0 {
                    self.host.set_relay(*zone, on);
                }
            }
        }
    }

    fn concentrator_sleep_s(&self) -> u16 {
        if self.host.is_irrigating() {
            self.tuning.irrigating_sleep_s
        } else if self.host.is_inhibited() || self.host.is_paused() {
            self.tuning.inhibit_sleep_s
        } else {
            self.tuning.idle_sleep_s
        }
    }

    fn controlling_mac(&self, unit: UnitId) -> u64 {
        if unit == self.identity.role {
            self.own_mac
        } else {
            self.unit_mac(unit)
        }
    }

    pub(crate) fn handle_sc_assoc(&mut self, source: u64, msg: CommandMessage) {
        if msg.cmd != SC_OP_REQUEST || msg.data.len() != ASSOC_REQUEST_LEN {
            debug!("malformed SC_ASSOC from {}", fmt_mac(source));
            return;
        }

        let Some(slot) = self.concentrators.table.find(source) else {
            let mgr = &mut self.concentrators;
            let pending = mgr.pending;
            match pending {
                _ if !mgr.association_mode => {
                    debug!("SC_ASSOC from unknown {} outside association mode", fmt_mac(source))
                }
                None => {
                    info!("sensor concentrator {} waiting for acceptance", fmt_mac(source));
                    mgr.pending = Some(source);
                }
                Some(pending) if pending == source => {}
                Some(_) => debug!("SC_ASSOC from {} ignored, another hub is pending", fmt_mac(source)),
            }
            return;
        };

        let limit = self.tuning.reassociation_limit;
        let now = self.now;
        let runtime = &mut self.concentrators.table.runtime[slot];
        runtime.firmware = msg.data[0];
        runtime.batt_mv = u16::from_be_bytes([msg.data[1], msg.data[2]]);
        runtime.reassociation_count = runtime.reassociation_count.saturating_add(1);
        if runtime.reassociation_count >= limit {
            warn!(
                "sensor concentrator {} re-associated {} times without status",
                fmt_mac(source),
                runtime.reassociation_count
            );
            runtime.reassociation_count = 0;
            self.radio_reset();
            return;
        }
        runtime.associated = true;
        runtime.last_status_ms = now;

        let record = self.concentrators.table.records[slot];
        let mut data = Vec::with_capacity(15);
        data.extend_from_slice(&self.controlling_mac(record.controlling_unit).to_be_bytes());
        data.extend_from_slice(&self.concentrator_sleep_s().to_be_bytes());
        data.extend_from_slice(&self.tuning.hibernate_threshold_mv.to_be_bytes());
        data.extend_from_slice(&self.tuning.hibernate_sleep_s.to_be_bytes());
        data.push(self.concentrators.override_mask(slot));
        let reply = Message::ScAssoc(CommandMessage::new(msg.msg_id, SC_OP_ACK, &data));
        self.send_message(source, &reply);
    }

    pub(crate) fn handle_sc_status(&mut self, source: u64, msg: CommandMessage) {
        if msg.cmd != SC_OP_REQUEST || msg.data.len() != STATUS_REQUEST_LEN {
            debug!("malformed SC_STATUS from {}", fmt_mac(source));
            return;
        }
        let Some(slot) = self.concentrators.table.find(source) else {
            debug!("SC_STATUS from unknown {}", fmt_mac(source));
            return;
        };

        let now = self.now;
        let runtime = &mut self.concentrators.table.runtime[slot];
        let was_timed_out = runtime.timed_out;
        runtime.timed_out = false;
        runtime.reassociation_count = 0;
        runtime.associated = true;
        runtime.last_status_ms = now;
        runtime.charge_rate = msg.data[0];
        runtime.batt_mv = u16::from_be_bytes([msg.data[1], msg.data[2]]);
        if was_timed_out {
            self.host.clear_fault(Fault::ConcentratorTimeout(slot));
        }

        let sleep = self.concentrator_sleep_s().to_be_bytes();
        if self.concentrators.table.is_marked_for_deletion(slot) {
            let data = [ScInstruction::Deassociate as u8, sleep[0], sleep[1], 0];
            let reply = Message::ScStatus(CommandMessage::new(msg.msg_id, SC_OP_ACK, &data));
            self.send_message(source, &reply);
            info!("sensor concentrator {} deassociated", fmt_mac(source));
            self.remove_slot(slot);
            return;
        }

        let record = self.concentrators.table.records[slot];
        for (channel, zone) in record.channel_zone.iter().enumerate() {
            let at = 3 + 2 * channel;
            let value = u16::from_be_bytes([msg.data[at], msg.data[at + 1]]);
            if let (Some(zone), true) = (zone, value != MOISTURE_NOT_FITTED) {
                self.host.set_moisture_value(*zone, value);
            }
        }

        let mask = self.concentrators.override_mask(slot);
        if mask != 0 {
            // Wired relays duplicate the wireless solenoid command.
            self.drive_relays(slot, mask, true);
        }
        self.concentrators.table.runtime[slot].solenoid_mask = mask;

        let data = [ScInstruction::Normal as u8, sleep[0], sleep[1], mask];
        let reply = Message::ScStatus(CommandMessage::new(msg.msg_id, SC_OP_ACK, &data));
        self.send_message(source, &reply);
    }

    /// Drop a hub from the table right away, without waiting for its next
    /// status message.
    pub fn remove_concentrator(&mut self, mac: u64) -> bool {
        match self.concentrators.table.find(mac) {
            Some(slot) => {
                info!("sensor concentrator {} removed from slot {}", fmt_mac(mac), slot);
                self.remove_slot(slot);
                true
            }
            None => false,
        }
    }

    fn remove_slot(&mut self, slot: usize) {
        if let Some((s, mask)) = self.concentrators.solenoid_override {
            if s == slot {
                self.drive_relays(slot, mask, false);
            }
        }
        // Timeout faults are keyed by slot and move down with their hub.
        let len = self.concentrators.table.len();
        let timed_out: Vec<usize> = (slot..len)
            .filter(|&s| self.concentrators.table.runtime[s].timed_out)
            .collect();
        for &s in &timed_out {
            self.host.clear_fault(Fault::ConcentratorTimeout(s));
        }
        if self.concentrators.table.remove(slot, &mut self.host).is_none() {
            return;
        }
        for s in timed_out.into_iter().filter(|&s| s > slot) {
            self.host.set_fault(Fault::ConcentratorTimeout(s - 1));
        }
        self.concentrators.solenoid_override = match self.concentrators.solenoid_override {
            Some((s, _)) if s == slot => None,
            Some((s, mask)) if s > slot => Some((s - 1, mask)),
            other => other,
        };
    }

    pub(crate) fn service_concentrator_timers(&mut self) {
        for slot in 0..self.concentrators.table.len() {
            let runtime = self.concentrators.table.runtime[slot];
            if !runtime.associated
                || self.elapsed_since(runtime.last_status_ms) <= self.tuning.concentrator_timeout_ms
            {
                continue;
            }
            warn!(
                "sensor concentrator {} silent for {} ms",
                fmt_mac(self.concentrators.table.records[slot].mac),
                self.elapsed_since(runtime.last_status_ms)
            );
            self.concentrators.table.runtime[slot].associated = false;
            self.concentrators.table.runtime[slot].timed_out = true;
            self.host.set_fault(Fault::ConcentratorTimeout(slot));
            if let Some((s, mask)) = self.concentrators.solenoid_override {
                if s == slot {
                    self.drive_relays(slot, mask, false);
                    self.concentrators.solenoid_override = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Zones(Vec<ZoneSensor>);

    impl ZoneSensors for Zones {
        fn zone_count(&self) -> usize {
            self.0.len()
        }
        fn zone_sensor(&self, zone: usize) -> ZoneSensor {
            self.0[zone]
        }
        fn set_zone_sensor(&mut self, zone: usize, sensor: ZoneSensor) {
            self.0[zone] = sensor;
        }
    }

    fn table_with(macs: &[u64]) -> ConcentratorTable {
        let mut table = ConcentratorTable::default();
        for &mac in macs {
            table.add(mac).unwrap();
        }
        table
    }

    #[test]
    fn add_fills_lowest_slot_and_rejects_duplicates() {
        let mut table = table_with(&[10, 11]);
        assert_eq!(table.add(11), None);
        assert_eq!(table.add(12), Some(2));
        assert_eq!(table.add(MAC_UNCONFIGURED), None);
        assert!(table.is_compact());
    }

    #[test]
    fn table_refuses_thirteenth_hub() {
        let macs: Vec<u64> = (1..=MAX_CONCENTRATORS as u64).collect();
        let mut table = table_with(&macs);
        assert_eq!(table.add(99), None);
        assert_eq!(table.len(), MAX_CONCENTRATORS);
    }

    #[test]
    fn removal_shifts_slots_and_fixes_zone_references() {
        let mut table = table_with(&[10, 11, 12]);
        let mut zones = Zones(vec![
            ZoneSensor::Wireless { slot: 0, channel: 1 },
            ZoneSensor::Wireless { slot: 1, channel: 0 },
            ZoneSensor::Wireless { slot: 2, channel: 3 },
            ZoneSensor::Wired,
        ]);
        assert_eq!(table.remove(1, &mut zones), Some(11));
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(12), Some(1));
        assert_eq!(zones.0[0], ZoneSensor::Wireless { slot: 0, channel: 1 });
        assert_eq!(zones.0[1], ZoneSensor::None);
        assert_eq!(zones.0[2], ZoneSensor::Wireless { slot: 1, channel: 3 });
        assert_eq!(zones.0[3], ZoneSensor::Wired);
        assert!(table.is_compact());
    }

    #[test]
    fn delete_list_follows_compaction() {
        let mut table = table_with(&[10, 11, 12, 13]);
        table.mark_for_deletion(1);
        table.mark_for_deletion(3);
        table.remove(1, &mut Zones::default());
        assert!(table.is_marked_for_deletion(2));
        assert!(!table.is_marked_for_deletion(1));
        assert_eq!(table.find(13), Some(2));
    }

    #[test]
    fn compaction_holds_over_mixed_operations() {
        let mut table = ConcentratorTable::default();
        let mut zones = Zones::default();
        let mut next_mac = 1u64;
        for step in 0..200usize {
            if step % 3 == 2 && !table.is_empty() {
                let slot = (step * 7) % table.len();
                table.remove(slot, &mut zones);
            } else {
                table.add(next_mac);
                next_mac += 1;
            }
            assert!(table.is_compact());
            assert!(table.len() <= MAX_CONCENTRATORS);
        }
    }
}
