//! Test utilities & fixtures.
//! Builds engines on [`MemoryTransport`] + [`SimHost`] and feeds them frames.
#![allow(dead_code)]

use woisradio::protocol::{CommandMessage, Message, UnitId, ACK_PREFIX_LEN, MAC_UNCONFIGURED};
use woisradio::radio::{RadioEngine, RadioTuning, UnitIdentity};
use woisradio::sim::{SimHost, SimModule};
use woisradio::transport::{InboundFrame, MemoryTransport, OutboundFrame};

pub type Engine = RadioEngine<MemoryTransport, SimHost>;

pub const MASTER_MAC: u64 = 0x0013_A200_4000_0001;
pub const EXP1_MAC: u64 = 0x0013_A200_4000_0011;
pub const EXP2_MAC: u64 = 0x0013_A200_4000_0012;
pub const EXP3_MAC: u64 = 0x0013_A200_4000_0013;
pub const GATEWAY_MAC: u64 = 0x0013_A200_4000_00F0;
pub const HUB_MAC: u64 = 0x0013_A200_4100_00C1;

pub fn identity(role: UnitId, expansions: usize) -> UnitIdentity {
    let mut macs = [MAC_UNCONFIGURED; 3];
    for (slot, mac) in macs.iter_mut().zip([EXP1_MAC, EXP2_MAC, EXP3_MAC]).take(expansions) {
        *slot = mac;
    }
    UnitIdentity {
        role,
        master_mac: if role == UnitId::Master {
            MAC_UNCONFIGURED
        } else {
            MASTER_MAC
        },
        expansion_macs: macs,
        ..UnitIdentity::default()
    }
}

/// Master with `expansions` configured units and no radio module fitted.
pub fn master(expansions: usize) -> Engine {
    RadioEngine::new(
        MemoryTransport::new(false),
        SimHost::new(24),
        RadioTuning::default(),
        identity(UnitId::Master, expansions),
    )
}

pub fn expansion(role: UnitId) -> Engine {
    RadioEngine::new(
        MemoryTransport::new(false),
        SimHost::new(12),
        RadioTuning::default(),
        identity(role, 3),
    )
}

/// Drive the engine through module initialisation and the first loopback.
pub fn bring_online(engine: &mut Engine, mac: u64) {
    let mut module = SimModule::new(mac, engine.identity().pan_id);
    engine.transport_mut().set_present(true);
    for _ in 0..50 {
        engine.host_mut().advance(10);
        engine.poll();
        for frame in engine.transport_mut().take_sent() {
            let reply = match frame {
                OutboundFrame::AtCommand { command, parameter } => module.answer(command, &parameter),
                OutboundFrame::Data { payload, .. } => match Message::decode(&payload) {
                    Ok(Message::Loopback(mut probe)) => {
                        probe.kind = woisradio::protocol::LoopbackKind::Reply;
                        InboundFrame::RxData {
                            source: 0,
                            payload: Message::Loopback(probe).encode(),
                        }
                    }
                    _ => continue,
                },
            };
            engine.transport_mut().push_inbound(reply);
        }
        if engine.link_state() == woisradio::radio::LinkState::Online {
            return;
        }
    }
    panic!("engine did not come online: {:?}", engine.link_state());
}

pub fn deliver(engine: &mut Engine, source: u64, message: &Message) {
    engine.on_frame_received(InboundFrame::RxData {
        source,
        payload: message.encode(),
    });
}

pub fn command(msg_id: u8, cmd: u8, data: &[u8]) -> Message {
    Message::Command(CommandMessage::new(msg_id, cmd, data))
}

/// Standard ack as an expansion unit would send it.
pub fn unit_ack(msg_id: u8, ack_code: u8, payload: &[u8]) -> Message {
    let mut data = vec![0u8; ACK_PREFIX_LEN];
    data.extend_from_slice(payload);
    Message::Ack(CommandMessage::new(msg_id, ack_code, &data))
}

/// Drain everything the engine sent as decoded data messages.
pub fn sent(engine: &mut Engine) -> Vec<(u64, Message)> {
    engine
        .transport_mut()
        .take_sent()
        .into_iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Data {
                destination,
                payload,
            } => Message::decode(&payload).ok().map(|m| (destination, m)),
            OutboundFrame::AtCommand { .. } => None,
        })
        .collect()
}

/// Commands (not acks) the engine sent to `mac`.
pub fn commands_to(messages: &[(u64, Message)], mac: u64) -> Vec<CommandMessage> {
    messages
        .iter()
        .filter_map(|(dest, msg)| match msg {
            Message::Command(cmd) if *dest == mac => Some(cmd.clone()),
            _ => None,
        })
        .collect()
}
