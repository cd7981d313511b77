//! Lossy in-memory mesh of controller units and sensor concentrators.
//!
//! Each [`SimNode`] wraps an engine on a [`MemoryTransport`] and a small
//! emulation of its radio module: AT commands are answered on the next
//! [`SimNetwork::step`], data frames are routed by destination address and
//! dropped with the configured probability. Destination 0 is the mesh
//! coordinator, which echoes loopback probes.
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::SimHost;
use crate::config::Config;
use crate::logutil::fmt_mac;
use crate::protocol::{
    CommandMessage, LoopbackKind, LoopbackMessage, Message, ScInstruction, SC_OP_ACK,
    SC_OP_REQUEST,
};
use crate::radio::RadioEngine;
use crate::transport::{AtCommand, AtStatus, InboundFrame, MemoryTransport, OutboundFrame};

pub const COORDINATOR: u64 = 0;

/// Radio module state behind one node.
#[derive(Debug, Clone)]
pub struct SimModule {
    pub mac: u64,
    pub pan_id: u16,
    pub firmware: u16,
    staged_pan: Option<u16>,
}

impl SimModule {
    pub fn new(mac: u64, pan_id: u16) -> Self {
        Self {
            mac,
            pan_id,
            firmware: 0x10EF,
            staged_pan: None,
        }
    }

    pub fn answer(&mut self, command: AtCommand, parameter: &[u8]) -> InboundFrame {
        let ok = |value: Vec<u8>| InboundFrame::AtResponse {
            command,
            status: AtStatus::Ok,
            value,
        };
        match command {
            AtCommand::SerialHigh => ok(((self.mac >> 32) as u32).to_be_bytes().to_vec()),
            AtCommand::SerialLow => ok((self.mac as u32).to_be_bytes().to_vec()),
            AtCommand::PanId if parameter.len() == 2 => {
                self.staged_pan = Some(u16::from_be_bytes([parameter[0], parameter[1]]));
                ok(Vec::new())
            }
            AtCommand::PanId if parameter.is_empty() => ok(self.pan_id.to_be_bytes().to_vec()),
            AtCommand::PanId => InboundFrame::AtResponse {
                command,
                status: AtStatus::InvalidParameter,
                value: Vec::new(),
            },
            AtCommand::FirmwareVersion => ok(self.firmware.to_be_bytes().to_vec()),
            AtCommand::AssociationIndication => ok(vec![0]),
            AtCommand::Write | AtCommand::SoftwareReset => ok(Vec::new()),
            AtCommand::ApplyChanges => {
                if let Some(pan) = self.staged_pan.take() {
                    self.pan_id = pan;
                }
                ok(Vec::new())
            }
        }
    }
}

pub struct SimNode {
    pub name: String,
    pub module: SimModule,
    pub engine: RadioEngine<MemoryTransport, SimHost>,
}

/// Battery-powered sensor concentrator that associates with one controller
/// and then reports moisture readings.
#[derive(Debug, Clone, Serialize)]
pub struct SimHub {
    pub mac: u64,
    pub controller: u64,
    pub readings: [u16; 4],
    pub batt_mv: u16,
    pub associated: bool,
    pub sleep_s: u16,
    pub solenoid_mask: u8,
    pub deassociated: bool,
    pub report_interval_ms: u32,
    next_msg_id: u8,
    next_send_ms: u32,
}

impl SimHub {
    pub fn new(mac: u64, controller: u64) -> Self {
        Self {
            mac,
            controller,
            readings: [410, 520, 0xFFFF, 0xFFFF],
            batt_mv: 3_900,
            associated: false,
            sleep_s: 0,
            solenoid_mask: 0,
            deassociated: false,
            report_interval_ms: 2_000,
            next_msg_id: 0,
            next_send_ms: 0,
        }
    }

    fn due(&mut self, now: u32) -> Option<(u64, Vec<u8>)> {
        if self.deassociated || now.wrapping_sub(self.next_send_ms) > u32::MAX / 2 {
            return None;
        }
        self.next_send_ms = now.wrapping_add(self.report_interval_ms);
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        let [bh, bl] = self.batt_mv.to_be_bytes();
        let message = if self.associated {
            let mut data = vec![50, bh, bl];
            for value in self.readings {
                data.extend_from_slice(&value.to_be_bytes());
            }
            Message::ScStatus(CommandMessage::new(msg_id, SC_OP_REQUEST, &data))
        } else {
            Message::ScAssoc(CommandMessage::new(msg_id, SC_OP_REQUEST, &[3, bh, bl]))
        };
        Some((self.controller, message.encode()))
    }

    fn receive(&mut self, payload: &[u8]) {
        match Message::decode(payload) {
            Ok(Message::ScAssoc(ack)) if ack.cmd == SC_OP_ACK && ack.data.len() >= 15 => {
                let mut mac = [0u8; 8];
                mac.copy_from_slice(&ack.data[..8]);
                self.controller = u64::from_be_bytes(mac);
                self.sleep_s = u16::from_be_bytes([ack.data[8], ack.data[9]]);
                self.solenoid_mask = ack.data[14];
                self.associated = true;
            }
            Ok(Message::ScStatus(ack)) if ack.cmd == SC_OP_ACK && ack.data.len() >= 4 => {
                if ack.data[0] == ScInstruction::Deassociate as u8 {
                    self.associated = false;
                    self.deassociated = true;
                }
                self.sleep_s = u16::from_be_bytes([ack.data[1], ack.data[2]]);
                self.solenoid_mask = ack.data[3];
            }
            other => trace!("hub {} ignored {:?}", fmt_mac(self.mac), other.map(|m| m.msg_type())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub loopbacks_echoed: u64,
}

pub struct SimNetwork {
    nodes: Vec<SimNode>,
    hubs: Vec<SimHub>,
    loss: f64,
    rng: StdRng,
    now_ms: u32,
    stats: NetworkStats,
}

impl SimNetwork {
    /// `loss` is the probability in `[0, 1]` that a data frame is dropped.
    pub fn new(loss: f64, seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            hubs: Vec::new(),
            loss: loss.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            now_ms: 0,
            stats: NetworkStats::default(),
        }
    }

    pub fn add_node(&mut self, name: &str, mac: u64, config: &Config) -> usize {
        let mut host = SimHost::new(usize::from(config.unit.zones_per_unit));
        host.set_now(self.now_ms);
        let engine = RadioEngine::from_config(MemoryTransport::new(true), host, config);
        self.nodes.push(SimNode {
            name: name.to_string(),
            module: SimModule::new(mac, config.unit.pan_id),
            engine,
        });
        self.nodes.len() - 1
    }

    pub fn add_hub(&mut self, hub: SimHub) -> usize {
        self.hubs.push(hub);
        self.hubs.len() - 1
    }

    pub fn node(&self, index: usize) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut SimNode> {
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn hubs(&self) -> &[SimHub] {
        &self.hubs
    }

    pub fn now_ms(&self) -> u32 {
        self.now_ms
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Advance time by `dt_ms`, poll every engine once and deliver what they sent.
    pub fn step(&mut self, dt_ms: u32) {
        self.now_ms = self.now_ms.wrapping_add(dt_ms);
        let now = self.now_ms;

        let mut traffic = Vec::new();
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            node.engine.host_mut().set_now(now);
            node.engine.poll();
            let source = node.module.mac;
            for frame in node.engine.transport_mut().take_sent() {
                match frame {
                    OutboundFrame::AtCommand { command, parameter } => {
                        let response = node.module.answer(command, &parameter);
                        node.engine.transport_mut().push_inbound(response);
                    }
                    OutboundFrame::Data {
                        destination,
                        payload,
                    } => traffic.push((source, destination, payload)),
                }
            }
        }
        for hub in &mut self.hubs {
            if let Some((destination, payload)) = hub.due(now) {
                traffic.push((hub.mac, destination, payload));
            }
        }

        for (source, destination, payload) in traffic {
            self.deliver(source, destination, payload);
        }
    }

    fn deliver(&mut self, source: u64, destination: u64, payload: Vec<u8>) {
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.stats.dropped += 1;
            trace!("dropped frame {} -> {}", fmt_mac(source), fmt_mac(destination));
            return;
        }

        if destination == COORDINATOR {
            if let Ok(Message::Loopback(LoopbackMessage {
                kind: LoopbackKind::Request,
                serial,
            })) = Message::decode(&payload)
            {
                let reply = Message::Loopback(LoopbackMessage {
                    kind: LoopbackKind::Reply,
                    serial,
                });
                self.stats.loopbacks_echoed += 1;
                self.deliver(COORDINATOR, source, reply.encode());
            }
            return;
        }

        if let Some(hub) = self.hubs.iter_mut().find(|hub| hub.mac == destination) {
            self.stats.delivered += 1;
            hub.receive(&payload);
            return;
        }

        match self.nodes.iter_mut().find(|node| node.module.mac == destination) {
            Some(node) => {
                self.stats.delivered += 1;
                node.engine.transport_mut().push_rx(source, payload);
            }
            None => debug!("no node at {}, frame from {} lost", fmt_mac(destination), fmt_mac(source)),
        }
    }
}
