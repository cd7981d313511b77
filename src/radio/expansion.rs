//! Expansion bus: per-unit liveness, command fan-out and the irrigation baton.
//!
//! Exactly one physical unit is the current irrigator. The master starts a
//! multi-unit program and, when its own share completes, hands the baton to the
//! next configured unit in the order master, EXP1, EXP2, EXP3. Ownership
//! returns to the master after the last configured unit reports IRR_COMPLETE.
//!
//! A unit that does not answer within the response timeout is faulted, loses
//! the baton, and pulse mode is switched off system-wide.

use log::{debug, info, warn};
use serde::Serialize;

use super::RadioEngine;
use super::LinkState;
use crate::host::{Fault, Host};
use crate::logutil::fmt_mac;
use crate::metrics;
use crate::protocol::{Command, CommandMessage, Message, UnitId, MAC_UNCONFIGURED};
use crate::transport::FrameTransport;

/// What this unit knows about one physical unit on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub connected: bool,
    pub last_send_ms: u32,
    pub awaiting_response: bool,
    pub faulted: bool,
    pub last_msg_id: Option<u8>,
    pub sys_state: u8,
    pub irr_state: u8,
    pub current_zone: u8,
    pub error_flags: u8,
    pub fault_flags: u8,
}

#[derive(Debug, Clone)]
pub struct ExpansionBus {
    /// Indexed by [`UnitId::index`]; this unit's own slot stays idle.
    units: [UnitStatus; 4],
    current_irrigator: UnitId,
    last_keepalive_ms: Option<u32>,
}

impl ExpansionBus {
    pub fn new() -> Self {
        Self {
            units: [UnitStatus::default(); 4],
            current_irrigator: UnitId::Master,
            last_keepalive_ms: None,
        }
    }

    pub fn status(&self, unit: UnitId) -> &UnitStatus {
        &self.units[unit.index()]
    }

    fn status_mut(&mut self, unit: UnitId) -> &mut UnitStatus {
        &mut self.units[unit.index()]
    }

    pub fn current_irrigator(&self) -> UnitId {
        self.current_irrigator
    }
}

impl Default for ExpansionBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Next baton holder after `after`, or `None` when the baton should return to the master.
pub fn next_baton_holder(after: UnitId, is_member: impl Fn(UnitId) -> bool) -> Option<UnitId> {
    UnitId::EXPANSIONS
        .into_iter()
        .filter(|&unit| unit > after)
        .find(|&unit| is_member(unit))
}

impl<T: FrameTransport, H: Host> RadioEngine<T, H> {
    pub fn expansion_status(&self, unit: UnitId) -> &UnitStatus {
        self.bus.status(unit)
    }

    pub fn current_irrigator(&self) -> UnitId {
        self.bus.current_irrigator()
    }

    fn baton_member(&self, unit: UnitId) -> bool {
        match unit {
            UnitId::Master => true,
            exp => self.identity.expansion_macs[exp.index() - 1] != MAC_UNCONFIGURED,
        }
    }

    /// Any valid message from a unit proves it is alive.
    pub(crate) fn note_unit_contact(&mut self, unit: UnitId) {
        let status = self.bus.status_mut(unit);
        status.connected = true;
        status.awaiting_response = false;
        if status.faulted {
            status.faulted = false;
            info!("{} is reachable again", unit);
            self.host.clear_fault(Fault::ExpansionTimeout(unit));
        }
    }

    /// Start the response timer for `unit`.
    pub(crate) fn arm_unit(&mut self, unit: UnitId) {
        let now = self.now;
        let status = self.bus.status_mut(unit);
        status.awaiting_response = true;
        status.last_send_ms = now;
    }

    pub(crate) fn record_unit_report(
        &mut self,
        unit: UnitId,
        cmd: Command,
        prefix: Option<&[u8]>,
        payload: &[u8],
    ) {
        let status = self.bus.status_mut(unit);
        if let Some(prefix) = prefix {
            status.error_flags = prefix[8];
            status.sys_state = prefix[9];
        }
        if let (Command::GetExtStatus1, [sys, irr, zone, err, fault, ..]) = (cmd, payload) {
            status.sys_state = *sys;
            status.irr_state = *irr;
            status.current_zone = *zone;
            status.error_flags = *err;
            status.fault_flags = *fault;
        }
    }

    /// Send a command to one peer unit and arm its response timer.
    pub(crate) fn send_to_one(&mut self, unit: UnitId, cmd: u8, data: &[u8]) -> bool {
        let mac = self.unit_mac(unit);
        if unit == self.identity.role || mac == MAC_UNCONFIGURED {
            return false;
        }
        let msg_id = self.alloc_msg_id();
        let msg = Message::Command(CommandMessage::new(msg_id, cmd, data));
        if !self.send_message(mac, &msg) {
            return false;
        }
        self.arm_unit(unit);
        self.bus.status_mut(unit).last_msg_id = Some(msg_id);
        true
    }

    /// Send a command to every configured expansion unit; returns how many were reached.
    pub(crate) fn forward_to_all(&mut self, cmd: u8, data: &[u8]) -> usize {
        let targets: Vec<UnitId> = UnitId::EXPANSIONS
            .into_iter()
            .filter(|&unit| self.unit_configured(unit))
            .collect();
        targets
            .into_iter()
            .filter(|&unit| self.send_to_one(unit, cmd, data))
            .count()
    }

    /// Re-broadcast a command that reached the master from outside the bus.
    pub(crate) fn forward_inbound_command(&mut self, cmd: Command, data: &[u8]) {
        let sent = self.forward_to_all(cmd.opcode(), data);
        debug!("{:?} forwarded to {} expansion unit(s)", cmd, sent);
    }

    /// Queue a command for a peer unit by MAC. [`MAC_UNCONFIGURED`] broadcasts to
    /// every configured expansion unit.
    pub fn enqueue_expansion_command(&mut self, cmd: u8, data: &[u8], target_mac: u64) -> bool {
        self.refresh_now();
        if target_mac == MAC_UNCONFIGURED {
            return self.forward_to_all(cmd, data) > 0;
        }
        match self.unit_for_mac(target_mac) {
            Some(unit) => self.send_to_one(unit, cmd, data),
            None => {
                debug!("no unit with MAC {}", fmt_mac(target_mac));
                false
            }
        }
    }

    /// This unit finished its share of the running program.
    pub fn on_local_irrigation_complete(&mut self) {
        self.refresh_now();
        if self.identity.role == UnitId::Master {
            if self.bus.current_irrigator == UnitId::Master {
                self.advance_baton();
            }
        } else {
            self.bus.current_irrigator = UnitId::Master;
            self.send_to_one(UnitId::Master, Command::IrrComplete.opcode(), &[]);
        }
    }

    pub(crate) fn on_remote_irrigation_complete(&mut self, source: u64) {
        if self.identity.role != UnitId::Master {
            return;
        }
        match self.unit_for_mac(source) {
            Some(unit) if unit == self.bus.current_irrigator => self.advance_baton(),
            Some(unit) => debug!("IRR_COMPLETE from {} which does not hold the baton", unit),
            None => debug!("IRR_COMPLETE from unknown unit {}", fmt_mac(source)),
        }
    }

    fn advance_baton(&mut self) {
        let current = self.bus.current_irrigator;
        match next_baton_holder(current, |unit| self.baton_member(unit)) {
            Some(next) => {
                info!("irrigation baton {} -> {}", current, next);
                self.bus.current_irrigator = next;
                let program = self.host.running_program().unwrap_or(0);
                if !self.send_to_one(next, Command::BatonStart.opcode(), &[program]) {
                    // Arm anyway so the response timeout releases the baton.
                    warn!("BATON_START to {} not sent", next);
                    self.arm_unit(next);
                }
            }
            None => {
                info!("irrigation baton returns to master");
                self.bus.current_irrigator = UnitId::Master;
                self.host.clear_running_program();
            }
        }
    }

    pub(crate) fn on_baton_received(&mut self, program: u8) {
        info!("baton received, running program {}", program);
        self.bus.current_irrigator = self.identity.role;
        self.host.start_baton(program);
    }

    pub(crate) fn service_expansion_timers(&mut self) {
        for unit in UnitId::ALL {
            if !self.unit_configured(unit) {
                continue;
            }
            let status = self.bus.status(unit);
            if status.awaiting_response
                && self.elapsed_since(status.last_send_ms) > self.tuning.expansion_timeout_ms
            {
                self.on_unit_timeout(unit);
            }
        }

        if self.identity.role != UnitId::Master || self.link_state() != LinkState::Online {
            return;
        }
        let due = self
            .bus
            .last_keepalive_ms
            .map_or(true, |t| self.elapsed_since(t) >= self.tuning.keepalive_interval_ms);
        if !due {
            return;
        }
        self.bus.last_keepalive_ms = Some(self.now);
        let targets: Vec<UnitId> = UnitId::ALL
            .into_iter()
            .filter(|&unit| self.unit_configured(unit))
            .filter(|&unit| {
                let status = self.bus.status(unit);
                unit == self.bus.current_irrigator || status.faulted
            })
            .filter(|&unit| !self.bus.status(unit).awaiting_response)
            .collect();
        for unit in targets {
            self.send_to_one(unit, Command::Noop.opcode(), &[]);
        }
    }

    fn on_unit_timeout(&mut self, unit: UnitId) {
        warn!("{} did not respond within {} ms", unit, self.tuning.expansion_timeout_ms);
        metrics::inc_expansion_timeouts();
        let status = self.bus.status_mut(unit);
        status.faulted = true;
        status.connected = false;
        status.awaiting_response = false;
        self.host.set_fault(Fault::ExpansionTimeout(unit));

        if self.bus.current_irrigator == unit {
            warn!("baton released from {} to master", unit);
            self.bus.current_irrigator = UnitId::Master;
        }
        self.host.disable_pulse_mode();
        self.abort_transfer_with(unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baton_skips_unconfigured_units() {
        let members = |unit: UnitId| matches!(unit, UnitId::Master | UnitId::Exp1 | UnitId::Exp3);
        assert_eq!(next_baton_holder(UnitId::Master, members), Some(UnitId::Exp1));
        assert_eq!(next_baton_holder(UnitId::Exp1, members), Some(UnitId::Exp3));
        assert_eq!(next_baton_holder(UnitId::Exp3, members), None);
    }

    #[test]
    fn lone_master_keeps_the_baton() {
        assert_eq!(next_baton_holder(UnitId::Master, |u| u == UnitId::Master), None);
    }

    #[test]
    fn new_bus_starts_with_master() {
        let bus = ExpansionBus::new();
        assert_eq!(bus.current_irrigator(), UnitId::Master);
        assert!(!bus.status(UnitId::Exp2).connected);
    }
}
