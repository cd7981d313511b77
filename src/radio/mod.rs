//! # Radio Protocol Engine
//!
//! [`RadioEngine`] turns the lossy, half-duplex radio link into reliable
//! request/response exchanges between controller units and sensor
//! concentrators. It owns all protocol state and its two collaborators (the
//! frame transport and the host controller) and is driven by repeated calls
//! to [`RadioEngine::poll`].
//!
//! ## Poll cycle
//!
//! 1. Read the tick count once.
//! 2. Check module presence (carrier detect).
//! 3. Drain buffered inbound frames, each fully handled before the next, until
//!    a handler requests a yield.
//! 4. Service timers: link/loopback, expansion liveness and keepalives,
//!    sensor concentrator status timeouts.
//! 5. Service the AT command retry queue once.
//!
//! Nothing in here blocks. All timing is tick based.
//!
//! ## Submodules
//!
//! - [`retry`] - bounded AT command queue with auto-send and timeout retry
//! - [`link`] - link and loopback state machines, module initialisation
//! - [`command`] - controller command/ack exchange
//! - [`transfer`] - segmented bulk transfer (responder and initiator)
//! - [`expansion`] - expansion bus liveness, forwarding and irrigation baton
//! - [`concentrator`] - sensor concentrator association and status exchange

pub mod command;
pub mod concentrator;
pub mod expansion;
pub mod link;
pub mod retry;
pub mod transfer;

use log::{debug, trace};

use crate::config::Config;
use crate::host::Host;
use crate::logutil::{fmt_mac, hex_snippet};
use crate::metrics;
use crate::protocol::{DecodeError, Message, UnitId, MAC_UNCONFIGURED};
use crate::transport::{FrameTransport, InboundFrame, OutboundFrame};

use concentrator::ConcentratorManager;
use expansion::ExpansionBus;
use link::LinkMachine;
use retry::RetryQueue;
use transfer::TransferState;

pub use concentrator::{ConcentratorRecord, ConcentratorRuntime, ConcentratorTable};
pub use expansion::UnitStatus;
pub use link::{LinkEvent, LinkState, LoopbackEvent, LoopbackState};
pub use retry::{RetryQueueFull, RETRY_QUEUE_CAPACITY};
pub use transfer::{segment_count, segment_len};

/// Timing and policy constants, derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioTuning {
    pub retry_threshold_ms: u32,
    pub init_timeout_ms: u32,
    pub max_radio_resets: u8,
    pub loopback_interval_ms: u32,
    pub online_check_interval_ms: u32,
    pub loopback_window_ms: u32,
    pub loopback_fail_limit: u8,
    pub loopback_destination: u64,
    pub expansion_timeout_ms: u32,
    pub keepalive_interval_ms: u32,
    pub put_restart_limit: u8,
    pub reassociation_limit: u8,
    pub irrigating_sleep_s: u16,
    pub idle_sleep_s: u16,
    pub inhibit_sleep_s: u16,
    pub hibernate_threshold_mv: u16,
    pub hibernate_sleep_s: u16,
    pub concentrator_timeout_ms: u32,
    pub eeprom_access: bool,
}

impl Default for RadioTuning {
    fn default() -> Self {
        Self {
            retry_threshold_ms: 5_000,
            init_timeout_ms: 15_000,
            max_radio_resets: 3,
            loopback_interval_ms: 10_000,
            online_check_interval_ms: 60_000,
            loopback_window_ms: 3_000,
            loopback_fail_limit: 3,
            loopback_destination: 0,
            expansion_timeout_ms: 15_000,
            keepalive_interval_ms: 45_000,
            put_restart_limit: 3,
            reassociation_limit: 6,
            irrigating_sleep_s: 10,
            idle_sleep_s: 300,
            inhibit_sleep_s: 900,
            hibernate_threshold_mv: 3_300,
            hibernate_sleep_s: 3_600,
            concentrator_timeout_ms: 1_800_000,
            eeprom_access: false,
        }
    }
}

impl From<&Config> for RadioTuning {
    fn from(cfg: &Config) -> Self {
        Self {
            retry_threshold_ms: cfg.radio.retry_threshold_ms,
            init_timeout_ms: cfg.radio.init_timeout_ms,
            max_radio_resets: cfg.radio.max_radio_resets,
            loopback_interval_ms: cfg.radio.loopback_interval_ms,
            online_check_interval_ms: cfg.radio.online_check_interval_ms,
            loopback_window_ms: cfg.radio.loopback_window_ms,
            loopback_fail_limit: cfg.radio.loopback_fail_limit,
            loopback_destination: cfg.radio.loopback_destination,
            expansion_timeout_ms: cfg.expansion.response_timeout_ms,
            keepalive_interval_ms: cfg.expansion.keepalive_interval_ms,
            put_restart_limit: cfg.expansion.put_restart_limit,
            reassociation_limit: cfg.concentrator.reassociation_limit,
            irrigating_sleep_s: cfg.concentrator.irrigating_sleep_s,
            idle_sleep_s: cfg.concentrator.idle_sleep_s,
            inhibit_sleep_s: cfg.concentrator.inhibit_sleep_s,
            hibernate_threshold_mv: cfg.concentrator.hibernate_threshold_mv,
            hibernate_sleep_s: cfg.concentrator.hibernate_sleep_s,
            concentrator_timeout_ms: cfg.concentrator.status_timeout_s.saturating_mul(1000),
            eeprom_access: cfg.transfer.eeprom_access,
        }
    }
}

/// Who this unit is and who its peers are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitIdentity {
    pub role: UnitId,
    pub pan_id: u16,
    /// Master's MAC; only consulted when this unit is an expansion.
    pub master_mac: u64,
    /// EXP1..EXP3; [`MAC_UNCONFIGURED`] marks an absent unit.
    pub expansion_macs: [u64; 3],
    /// Zones owned by each physical unit (master first).
    pub zones_per_unit: u8,
}

impl Default for UnitIdentity {
    fn default() -> Self {
        Self {
            role: UnitId::Master,
            pan_id: 0x2001,
            master_mac: MAC_UNCONFIGURED,
            expansion_macs: [MAC_UNCONFIGURED; 3],
            zones_per_unit: 12,
        }
    }
}

impl From<&Config> for UnitIdentity {
    fn from(cfg: &Config) -> Self {
        Self {
            role: cfg.unit.role,
            pan_id: cfg.unit.pan_id,
            master_mac: cfg.unit.master_mac,
            expansion_macs: cfg.unit.expansion_macs,
            zones_per_unit: cfg.unit.zones_per_unit,
        }
    }
}

pub struct RadioEngine<T: FrameTransport, H: Host> {
    tuning: RadioTuning,
    identity: UnitIdentity,
    transport: T,
    host: H,
    link: LinkMachine,
    retry: RetryQueue,
    bus: ExpansionBus,
    concentrators: ConcentratorManager,
    transfers: TransferState,
    /// Learned from the module during initialisation; doubles as the unit serial number.
    own_mac: u64,
    next_msg_id: u8,
    yield_requested: bool,
    /// Tick read at the start of the current poll or API call.
    now: u32,
}

impl<T: FrameTransport, H: Host> RadioEngine<T, H> {
    pub fn new(transport: T, host: H, tuning: RadioTuning, identity: UnitIdentity) -> Self {
        let now = host.now_ms();
        Self {
            retry: RetryQueue::new(tuning.retry_threshold_ms),
            link: LinkMachine::new(now),
            bus: ExpansionBus::new(),
            concentrators: ConcentratorManager::new(),
            transfers: TransferState::default(),
            tuning,
            identity,
            transport,
            host,
            own_mac: MAC_UNCONFIGURED,
            next_msg_id: 0,
            yield_requested: false,
            now,
        }
    }

    pub fn from_config(transport: T, host: H, config: &Config) -> Self {
        Self::new(
            transport,
            host,
            RadioTuning::from(config),
            UnitIdentity::from(config),
        )
    }

    /// Drop all protocol state; the next poll starts again from NOT_POPULATED.
    pub fn reset(&mut self) {
        self.now = self.host.now_ms();
        self.link = LinkMachine::new(self.now);
        self.retry.clear();
        self.bus = ExpansionBus::new();
        self.concentrators = ConcentratorManager::new();
        self.transfers = TransferState::default();
        self.own_mac = MAC_UNCONFIGURED;
        self.yield_requested = false;
    }

    /// Tear the engine down and hand back its collaborators.
    pub fn into_parts(self) -> (T, H) {
        (self.transport, self.host)
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    pub fn tuning(&self) -> &RadioTuning {
        &self.tuning
    }

    pub fn own_mac(&self) -> u64 {
        self.own_mac
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    /// One cooperative scheduling slot.
    pub fn poll(&mut self) {
        self.now = self.host.now_ms();
        self.yield_requested = false;

        self.service_presence();

        while let Some(frame) = self.transport.recv_frame() {
            self.on_frame_received(frame);
            if self.yield_requested {
                debug!("handler requested yield; deferring remaining frames");
                break;
            }
        }

        self.service_link_timers();
        self.service_expansion_timers();
        self.service_concentrator_timers();
        self.service_retry_queue();
    }

    /// Classify one transport frame by API type and route it.
    pub fn on_frame_received(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::RxData { source, payload } => self.on_application_data(source, &payload),
            InboundFrame::AtResponse {
                command,
                status,
                value,
            } => self.handle_at_response(command, status, &value),
            InboundFrame::ModemStatus(status) => self.handle_modem_status(status),
            InboundFrame::TxStatus {
                frame_id,
                delivered,
            } => {
                if !delivered {
                    metrics::inc_tx_failed();
                    debug!("tx status: frame {} not delivered", frame_id);
                }
            }
        }
    }

    fn on_application_data(&mut self, source: u64, payload: &[u8]) {
        metrics::inc_frames_received();
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                match err {
                    DecodeError::Crc { .. } => metrics::inc_crc_dropped(),
                    DecodeError::Version(_) => metrics::inc_version_dropped(),
                    _ => metrics::inc_malformed_dropped(),
                }
                trace!(
                    "dropping frame from {}: {} [{}]",
                    fmt_mac(source),
                    err,
                    hex_snippet(payload, 16)
                );
                return;
            }
        };

        self.note_application_traffic();
        if let Some(unit) = self.unit_for_mac(source) {
            self.note_unit_contact(unit);
        }

        match message {
            Message::Command(msg) => self.handle_command(source, msg),
            Message::Ack(msg) => self.handle_ack(source, msg),
            Message::Transfer(msg) => self.handle_transfer(source, msg),
            Message::Loopback(msg) => self.handle_loopback(source, msg),
            Message::ScAssoc(msg) => self.handle_sc_assoc(source, msg),
            Message::ScStatus(msg) => self.handle_sc_status(source, msg),
        }
    }

    /// Stop draining inbound frames for the rest of this poll.
    pub(crate) fn request_yield(&mut self) {
        self.yield_requested = true;
    }

    /// Configured MAC of a physical unit. For the master this is the unit
    /// itself when we are the master.
    pub fn unit_mac(&self, unit: UnitId) -> u64 {
        match unit {
            UnitId::Master if self.identity.role == UnitId::Master => self.own_mac,
            UnitId::Master => self.identity.master_mac,
            exp => self.identity.expansion_macs[exp.index() - 1],
        }
    }

    /// A peer unit we can address.
    pub fn unit_configured(&self, unit: UnitId) -> bool {
        unit != self.identity.role && self.unit_mac(unit) != MAC_UNCONFIGURED
    }

    pub fn unit_for_mac(&self, mac: u64) -> Option<UnitId> {
        if mac == MAC_UNCONFIGURED {
            return None;
        }
        UnitId::ALL
            .into_iter()
            .find(|&unit| unit != self.identity.role && self.unit_mac(unit) == mac)
    }

    pub(crate) fn send_message(&mut self, destination: u64, message: &Message) -> bool {
        let payload = message.encode();
        trace!(
            "tx {:?} to {} [{}]",
            message.msg_type(),
            fmt_mac(destination),
            hex_snippet(&payload, 16)
        );
        let sent = self.transport.send_frame(OutboundFrame::Data {
            destination,
            payload,
        });
        if !sent {
            debug!("transport refused frame for {}", fmt_mac(destination));
        }
        sent
    }

    pub(crate) fn alloc_msg_id(&mut self) -> u8 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Serial number in the form used by ack prefixes and loopback probes.
    pub(crate) fn serial_bytes(&self) -> [u8; 8] {
        self.own_mac.to_be_bytes()
    }

    /// Public entry points may run between polls; refresh the tick first.
    pub(crate) fn refresh_now(&mut self) {
        self.now = self.host.now_ms();
    }

    pub(crate) fn elapsed_since(&self, tick: u32) -> u32 {
        self.now.wrapping_sub(tick)
    }
}
