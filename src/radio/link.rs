//! Link and loopback state machines, and radio module initialisation.
//!
//! ```text
//! NOT_POPULATED --carrier--> INIT --readback complete--> SCANNING --loopback ok--> ONLINE
//!                             |                            |   ^                     |
//!                       init timeout                  loopback fails / cancel        |
//!                             v                            v   |                     |
//!                          FAILURE --reset--> NOT_POPULATED   OFFLINE <--------------+
//! ```
//!
//! Valid application traffic moves SCANNING and OFFLINE straight to ONLINE.
//! NOT_POPULATED and INIT ignore it until the module readback has supplied the
//! own MAC and PAN.
//!
//! Transition functions are pure ([`LinkState::on`], [`LoopbackState::on`]);
//! entry actions run in [`RadioEngine::apply_link_event`].
use log::{debug, info, warn};
use serde::Serialize;

use super::RadioEngine;
use crate::host::{Fault, Host};
use crate::logutil::fmt_mac;
use crate::metrics;
use crate::protocol::{LoopbackKind, LoopbackMessage, Message};
use crate::transport::{AtCommand, AtStatus, FrameTransport, ModemStatus, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    NotPopulated,
    Init,
    Scanning,
    Online,
    Offline,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    CarrierDetected,
    CarrierLost,
    InitComplete,
    InitTimeout,
    ResetComplete,
    LoopbackSucceeded,
    LoopbackFailedRepeatedly,
    Cancelled,
    Disassociated,
    ModuleRestarted,
    ApplicationTraffic,
    RadioReset,
}

impl LinkState {
    pub fn on(self, event: LinkEvent) -> LinkState {
        use LinkEvent::*;
        use LinkState::*;
        match (self, event) {
            (_, RadioReset) => NotPopulated,
            (Init, InitTimeout) => Failure,
            (Failure, ResetComplete) => NotPopulated,
            (Failure, _) => Failure,
            (_, CarrierLost) => NotPopulated,
            (NotPopulated, CarrierDetected) => Init,
            (Init, InitComplete) => Scanning,
            (Scanning | Offline, LoopbackSucceeded) => Online,
            // Not from NotPopulated or Init; see the module docs.
            (Scanning | Online | Offline, ApplicationTraffic) => Online,
            (Scanning | Online, LoopbackFailedRepeatedly | Cancelled) => Offline,
            (Online, Disassociated) => Scanning,
            (Scanning | Online | Offline, ModuleRestarted) => Init,
            (state, _) => state,
        }
    }

    /// States in which the loopback self-test runs.
    pub fn runs_loopback(self) -> bool {
        matches!(self, LinkState::Scanning | LinkState::Online | LinkState::Offline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopbackState {
    Idle,
    Start,
    Testing,
    Success,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackEvent {
    Requested,
    Sent,
    SendFailed,
    ReplyMatched,
    WindowExpired,
    Consumed,
    Aborted,
}

impl LoopbackState {
    pub fn on(self, event: LoopbackEvent) -> LoopbackState {
        use LoopbackEvent::*;
        use LoopbackState::*;
        match (self, event) {
            (_, Aborted) => Idle,
            (Idle, Requested) => Start,
            (Start, Sent) => Testing,
            (Start, SendFailed) => Fail,
            (Testing, ReplyMatched) => Success,
            (Testing, WindowExpired) => Fail,
            (Success | Fail, Consumed) => Idle,
            (state, _) => state,
        }
    }
}

/// Values read back from the module during INIT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReadback {
    pub serial_high: Option<u32>,
    pub serial_low: Option<u32>,
    pub pan_id: Option<u16>,
    pub module_firmware: Option<u16>,
    pub association: Option<u8>,
}

impl InitReadback {
    fn complete(&self) -> bool {
        matches!(
            (self.serial_high, self.serial_low, self.pan_id),
            (Some(h), Some(l), Some(p)) if h != 0 && l != 0 && p != 0
        )
    }
}

#[derive(Debug, Clone)]
pub struct LinkMachine {
    state: LinkState,
    loopback: LoopbackState,
    readback: InitReadback,
    last_progress_ms: u32,
    loopback_sent_ms: u32,
    last_loopback_ms: Option<u32>,
    loopback_failures: u8,
    radio_failures: u8,
    pan_write_pending: bool,
}

impl LinkMachine {
    pub fn new(now: u32) -> Self {
        Self {
            state: LinkState::NotPopulated,
            loopback: LoopbackState::Idle,
            readback: InitReadback::default(),
            last_progress_ms: now,
            loopback_sent_ms: now,
            last_loopback_ms: None,
            loopback_failures: 0,
            radio_failures: 0,
            pan_write_pending: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn loopback(&self) -> LoopbackState {
        self.loopback
    }

    pub fn readback(&self) -> &InitReadback {
        &self.readback
    }

    pub fn radio_failures(&self) -> u8 {
        self.radio_failures
    }
}

impl<T: FrameTransport, H: Host> RadioEngine<T, H> {
    pub fn link_state(&self) -> LinkState {
        self.link.state
    }

    pub fn loopback_state(&self) -> LoopbackState {
        self.link.loopback
    }

    pub fn link(&self) -> &LinkMachine {
        &self.link
    }

    /// Operator-requested loopback test; ignored while one is in progress.
    pub fn start_loopback_test(&mut self) {
        self.refresh_now();
        if self.link.state.runs_loopback() {
            self.apply_loopback_event(LoopbackEvent::Requested);
        }
    }

    pub fn cancel_link(&mut self) {
        self.refresh_now();
        self.apply_loopback_event(LoopbackEvent::Aborted);
        self.apply_link_event(LinkEvent::Cancelled);
    }

    /// Hub storms and similar protocol failures escalate to a full module reset.
    pub(crate) fn radio_reset(&mut self) {
        warn!("resetting radio module");
        metrics::inc_radio_resets();
        self.transport.hardware_reset();
        self.apply_link_event(LinkEvent::RadioReset);
    }

    pub(crate) fn apply_link_event(&mut self, event: LinkEvent) {
        let old = self.link.state;
        let new = old.on(event);
        if new == old {
            return;
        }
        info!("radio link {:?} -> {:?} ({:?})", old, new, event);
        self.link.state = new;
        self.enter_link_state(new);
    }

    fn apply_loopback_event(&mut self, event: LoopbackEvent) {
        let old = self.link.loopback;
        let new = old.on(event);
        if new != old {
            debug!("loopback {:?} -> {:?}", old, new);
            self.link.loopback = new;
        }
    }

    fn enter_link_state(&mut self, state: LinkState) {
        match state {
            LinkState::NotPopulated => {
                self.retry.clear();
                self.link.loopback = LoopbackState::Idle;
            }
            LinkState::Init => {
                self.link.readback = InitReadback::default();
                self.link.pan_write_pending = false;
                self.link.last_progress_ms = self.now;
                self.retry.clear();
                for cmd in AtCommand::INIT_SEQUENCE {
                    self.queue_at(cmd, true);
                }
            }
            LinkState::Scanning => {
                self.link.loopback = LoopbackState::Idle;
                self.link.last_loopback_ms = None;
                self.link.loopback_failures = 0;
            }
            LinkState::Online => {
                self.link.loopback_failures = 0;
                if self.link.radio_failures > 0 {
                    self.link.radio_failures = 0;
                    self.host.clear_fault(Fault::RadioFailure);
                }
            }
            LinkState::Offline => {
                self.link.loopback_failures = 0;
            }
            LinkState::Failure => {
                metrics::inc_radio_resets();
                self.link.radio_failures = self.link.radio_failures.saturating_add(1);
                self.retry.clear();
                self.transport.hardware_reset();
                if self.link.radio_failures >= self.tuning.max_radio_resets {
                    warn!(
                        "radio failed to initialise after {} resets; staying in FAILURE",
                        self.link.radio_failures
                    );
                    self.host.set_fault(Fault::RadioFailure);
                } else {
                    self.apply_link_event(LinkEvent::ResetComplete);
                }
            }
        }
    }

    pub(crate) fn service_presence(&mut self) {
        let present = self.transport.link_present();
        match self.link.state {
            LinkState::NotPopulated if present => self.apply_link_event(LinkEvent::CarrierDetected),
            LinkState::NotPopulated | LinkState::Failure => {}
            _ if !present => self.apply_link_event(LinkEvent::CarrierLost),
            _ => {}
        }
    }

    pub(crate) fn note_application_traffic(&mut self) {
        self.apply_link_event(LinkEvent::ApplicationTraffic);
    }

    pub(crate) fn service_link_timers(&mut self) {
        if self.link.state == LinkState::Init
            && self.elapsed_since(self.link.last_progress_ms) > self.tuning.init_timeout_ms
        {
            warn!("radio init timed out");
            self.apply_link_event(LinkEvent::InitTimeout);
            return;
        }
        if self.link.state.runs_loopback() {
            self.service_loopback();
        }
    }

    fn service_loopback(&mut self) {
        if self.link.loopback == LoopbackState::Idle {
            let interval = if self.link.state == LinkState::Online {
                self.tuning.online_check_interval_ms
            } else {
                self.tuning.loopback_interval_ms
            };
            let due = self
                .link
                .last_loopback_ms
                .map_or(true, |t| self.elapsed_since(t) >= interval);
            if due {
                self.apply_loopback_event(LoopbackEvent::Requested);
            }
        }

        if self.link.loopback == LoopbackState::Start {
            let probe = Message::Loopback(LoopbackMessage {
                kind: LoopbackKind::Request,
                serial: self.own_mac,
            });
            let destination = self.tuning.loopback_destination;
            self.link.last_loopback_ms = Some(self.now);
            if self.send_message(destination, &probe) {
                self.link.loopback_sent_ms = self.now;
                self.apply_loopback_event(LoopbackEvent::Sent);
            } else {
                self.apply_loopback_event(LoopbackEvent::SendFailed);
            }
        }

        if self.link.loopback == LoopbackState::Testing
            && self.elapsed_since(self.link.loopback_sent_ms) > self.tuning.loopback_window_ms
        {
            self.apply_loopback_event(LoopbackEvent::WindowExpired);
        }

        match self.link.loopback {
            LoopbackState::Success => {
                self.apply_loopback_event(LoopbackEvent::Consumed);
                self.link.loopback_failures = 0;
                self.apply_link_event(LinkEvent::LoopbackSucceeded);
            }
            LoopbackState::Fail => {
                self.apply_loopback_event(LoopbackEvent::Consumed);
                self.link.loopback_failures = self.link.loopback_failures.saturating_add(1);
                debug!(
                    "loopback failed ({}/{})",
                    self.link.loopback_failures, self.tuning.loopback_fail_limit
                );
                if self.link.loopback_failures >= self.tuning.loopback_fail_limit {
                    self.link.loopback_failures = 0;
                    self.apply_link_event(LinkEvent::LoopbackFailedRepeatedly);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn handle_loopback(&mut self, source: u64, msg: LoopbackMessage) {
        match msg.kind {
            LoopbackKind::Request => {
                let reply = Message::Loopback(LoopbackMessage {
                    kind: LoopbackKind::Reply,
                    serial: msg.serial,
                });
                self.send_message(source, &reply);
            }
            LoopbackKind::Reply => {
                if msg.serial == self.own_mac && self.link.loopback == LoopbackState::Testing {
                    self.apply_loopback_event(LoopbackEvent::ReplyMatched);
                } else {
                    debug!("stale loopback reply from {}", fmt_mac(source));
                }
            }
        }
    }

    pub(crate) fn handle_modem_status(&mut self, status: ModemStatus) {
        debug!("modem status {:?}", status);
        match status {
            ModemStatus::Joined => {
                self.link.last_loopback_ms = None;
            }
            ModemStatus::Disassociated => self.apply_link_event(LinkEvent::Disassociated),
            ModemStatus::HardwareReset | ModemStatus::WatchdogReset => {
                self.apply_link_event(LinkEvent::ModuleRestarted)
            }
            ModemStatus::Other(_) => {}
        }
    }

    pub(crate) fn handle_at_response(&mut self, command: AtCommand, status: AtStatus, value: &[u8]) {
        self.link.last_progress_ms = self.now;
        if status != AtStatus::Ok {
            // Left queued; the retry threshold resends it.
            debug!("AT {} returned {:?}", command.mnemonic(), status);
            return;
        }
        self.retry.remove(command.ident());

        match command {
            AtCommand::SerialHigh => self.link.readback.serial_high = Some(be_u32(value)),
            AtCommand::SerialLow => self.link.readback.serial_low = Some(be_u32(value)),
            AtCommand::PanId if self.link.pan_write_pending && value.is_empty() => {
                self.queue_at(AtCommand::Write, true);
            }
            AtCommand::PanId => {
                let pan = be_u32(value) as u16;
                if pan == self.identity.pan_id {
                    self.link.readback.pan_id = Some(pan);
                } else {
                    info!(
                        "module PAN {:#06x} differs from configured {:#06x}; rewriting",
                        pan, self.identity.pan_id
                    );
                    self.link.pan_write_pending = true;
                    self.queue_at(AtCommand::PanId, true);
                }
            }
            AtCommand::FirmwareVersion => {
                self.link.readback.module_firmware = Some(be_u32(value) as u16)
            }
            AtCommand::AssociationIndication => {
                self.link.readback.association = value.first().copied()
            }
            AtCommand::Write => self.queue_at(AtCommand::ApplyChanges, true),
            AtCommand::ApplyChanges => {
                self.link.pan_write_pending = false;
                self.queue_at(AtCommand::PanId, true);
            }
            AtCommand::SoftwareReset => {}
        }

        if let (Some(high), Some(low)) = (self.link.readback.serial_high, self.link.readback.serial_low) {
            self.own_mac = (u64::from(high) << 32) | u64::from(low);
        }
        if self.link.state == LinkState::Init && self.link.readback.complete() {
            info!("radio module ready, address {}", fmt_mac(self.own_mac));
            self.apply_link_event(LinkEvent::InitComplete);
        }
    }

    fn queue_at(&mut self, command: AtCommand, send_now: bool) {
        if let Err(err) = self.retry.enqueue(command.ident(), send_now, self.now) {
            warn!("AT {} not queued: {}", command.mnemonic(), err);
        }
    }

    pub(crate) fn service_retry_queue(&mut self) {
        let Some(ident) = self.retry.service_one(self.now) else {
            return;
        };
        let Some(command) = AtCommand::from_ident(ident) else {
            debug!("dropping unknown retry ident {}", ident);
            return;
        };
        let parameter = if command == AtCommand::PanId && self.link.pan_write_pending {
            self.identity.pan_id.to_be_bytes().to_vec()
        } else {
            Vec::new()
        };
        metrics::inc_at_commands_sent();
        if self
            .transport
            .send_frame(OutboundFrame::AtCommand { command, parameter })
        {
            // Sent: watch for the response, resend after the retry threshold.
            self.queue_at(command, false);
        } else {
            self.queue_at(command, true);
        }
    }
}

fn be_u32(value: &[u8]) -> u32 {
    value
        .iter()
        .rev()
        .take(4)
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}
