//! Controller command/ack exchange.
//!
//! Every accepted command produces exactly one ack echoing the request's
//! `msgId`. Standard acks carry a 10-byte prefix (unit serial, exception flags,
//! status byte) ahead of the command payload; the debug commands answer with
//! a light ack that has no prefix. A command whose data length or value is
//! wrong is ignored and not acked.

use chrono::NaiveDate;
use log::{debug, info, trace};

use super::RadioEngine;
use crate::host::{Host, WeatherUpdate};
use crate::logutil::fmt_mac;
use crate::metrics;
use crate::protocol::{
    Command, CommandMessage, Message, UnitId, ACK_FLAG, ACK_PREFIX_LEN, MAX_ACK_PAYLOAD,
    MAX_COMMAND_DATA,
};
use crate::transport::FrameTransport;

/// Payload produced by a command handler.
enum Reply {
    Standard(Vec<u8>),
    Light(Vec<u8>),
}

impl<T: FrameTransport, H: Host> RadioEngine<T, H> {
    pub(crate) fn handle_command(&mut self, source: u64, msg: CommandMessage) {
        if msg.cmd & ACK_FLAG != 0 {
            debug!("command {:#04x} from {} carries the ack flag", msg.cmd, fmt_mac(source));
            return;
        }
        let Ok(cmd) = Command::try_from(msg.cmd) else {
            match self.host.extension_command(source, msg.cmd, &msg.data) {
                Some(payload) => self.send_ack(source, msg.msg_id, msg.cmd | ACK_FLAG, Reply::Light(payload)),
                None => trace!("unhandled command {:#04x} from {}", msg.cmd, fmt_mac(source)),
            }
            return;
        };

        if let Some(expected) = cmd.expected_len() {
            if msg.data.len() != expected {
                debug!(
                    "{:?} from {}: data length {} (expected {}), ignored",
                    cmd,
                    fmt_mac(source),
                    msg.data.len(),
                    expected
                );
                return;
            }
        }

        let Some(reply) = self.execute_command(source, cmd, &msg.data) else {
            debug!("{:?} from {} rejected", cmd, fmt_mac(source));
            return;
        };
        self.send_ack(source, msg.msg_id, cmd.ack_code(), reply);

        if cmd.is_forwarded()
            && self.identity.role == UnitId::Master
            && self.unit_for_mac(source).is_none()
        {
            self.forward_inbound_command(cmd, &msg.data);
        }
    }

    /// `None` rejects the command.
    fn execute_command(&mut self, source: u64, cmd: Command, data: &[u8]) -> Option<Reply> {
        let empty = || Some(Reply::Standard(Vec::new()));
        match cmd {
            Command::Noop => empty(),
            Command::InhibitOn => {
                self.host.set_inhibit(true);
                empty()
            }
            Command::InhibitOff => {
                self.host.set_inhibit(false);
                empty()
            }
            Command::ForceOn => {
                let zone = data[0];
                let minutes = u16::from_be_bytes([data[1], data[2]]);
                self.host
                    .force_on(zone, minutes)
                    .then(|| Reply::Standard(vec![zone]))
            }
            Command::WeatherData => {
                let update = WeatherUpdate::from_bytes(data)?;
                self.host.weather_update(update);
                empty()
            }
            Command::GetMoisture => {
                let zone = data[0];
                let value = self.host.moisture_value(zone)?;
                let [hi, lo] = value.to_be_bytes();
                Some(Reply::Standard(vec![zone, hi, lo]))
            }
            Command::GetExtStatus1 | Command::GetExtStatus2 | Command::GetExtStatus3 => {
                let page = cmd.status_page()?;
                let mut payload = self.host.extended_status(page);
                payload.truncate(MAX_ACK_PAYLOAD);
                Some(Reply::Standard(payload))
            }
            Command::GetMoistureBalance => {
                let zone = data[0];
                let balance = self.host.moisture_balance(zone)?;
                let [hi, lo] = balance.to_be_bytes();
                Some(Reply::Standard(vec![zone, hi, lo]))
            }
            Command::SetMoistureBalance => {
                let zone = data[0];
                let balance = i16::from_be_bytes([data[1], data[2]]);
                self.host
                    .set_moisture_balance(zone, balance)
                    .then(|| Reply::Standard(vec![zone]))
            }
            Command::InitDateTime => {
                let year = u16::from_be_bytes([data[0], data[1]]);
                let at = NaiveDate::from_ymd_opt(i32::from(year), u32::from(data[2]), u32::from(data[3]))?
                    .and_hms_opt(u32::from(data[4]), u32::from(data[5]), u32::from(data[6]))?;
                info!("clock set to {} by {}", at, fmt_mac(source));
                self.host.set_clock(at);
                self.request_yield();
                empty()
            }
            Command::IrrStart => {
                self.host.manual_start(data[0]);
                empty()
            }
            Command::IrrStop => {
                self.host.stop();
                empty()
            }
            Command::IrrResume => {
                self.host.resume();
                empty()
            }
            Command::IrrSkip => {
                self.host.skip();
                empty()
            }
            Command::IrrAuto => {
                self.host.set_auto();
                empty()
            }
            Command::IrrTest => {
                self.host.test_zones(data[0]);
                empty()
            }
            Command::GetFirmwareVersion => {
                Some(Reply::Standard(self.host.firmware_version().to_vec()))
            }
            Command::DiagEcho => Some(Reply::Light(data.to_vec())),
            Command::RemoteControlTest => {
                let (zone, on) = (data[0], data[1]);
                if usize::from(zone) >= self.host.zone_count() {
                    return None;
                }
                self.host.set_relay(zone, on != 0);
                Some(Reply::Light(vec![zone, on]))
            }
            Command::IrrComplete => {
                self.on_remote_irrigation_complete(source);
                empty()
            }
            Command::BatonStart => {
                self.on_baton_received(data[0]);
                empty()
            }
            Command::CfgPutApply => {
                let checksum = u16::from_be_bytes([data[0], data[1]]);
                let accepted = self.apply_config(checksum);
                self.request_yield();
                Some(Reply::Standard(vec![u8::from(accepted)]))
            }
            Command::FirmwareDownloadStart => {
                let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                self.begin_firmware(size).then(|| Reply::Standard(Vec::new()))
            }
            Command::PulseModeOff => {
                self.host.disable_pulse_mode();
                empty()
            }
        }
    }

    fn send_ack(&mut self, destination: u64, msg_id: u8, ack_code: u8, reply: Reply) {
        let data = match reply {
            Reply::Standard(payload) => {
                let mut data = Vec::with_capacity(ACK_PREFIX_LEN + payload.len());
                data.extend_from_slice(&self.serial_bytes());
                data.push(self.host.exception_flags());
                data.push(self.host.status_byte());
                data.extend_from_slice(&payload);
                data
            }
            Reply::Light(payload) => payload,
        };
        if data.len() > MAX_COMMAND_DATA {
            debug!("ack {:#04x} payload truncated from {} bytes", ack_code, data.len());
        }
        let ack = Message::Ack(CommandMessage::new(msg_id, ack_code, &data));
        if self.send_message(destination, &ack) {
            metrics::inc_acks_sent();
        }
    }

    pub(crate) fn handle_ack(&mut self, source: u64, msg: CommandMessage) {
        if msg.cmd & ACK_FLAG == 0 {
            debug!("ack without ack flag ({:#04x}) from {}", msg.cmd, fmt_mac(source));
            return;
        }
        let Ok(cmd) = Command::try_from(msg.cmd & !ACK_FLAG) else {
            self.host.extension_ack(source, msg.cmd, &msg.data);
            return;
        };
        let Some(unit) = self.unit_for_mac(source) else {
            trace!("{:?} ack from unknown unit {}", cmd, fmt_mac(source));
            return;
        };

        let (prefix, payload) = if cmd.is_light_ack() {
            (None, msg.data.as_slice())
        } else if msg.data.len() >= ACK_PREFIX_LEN {
            let (prefix, payload) = msg.data.split_at(ACK_PREFIX_LEN);
            (Some(prefix), payload)
        } else {
            debug!("{:?} ack from {} too short for prefix", cmd, unit);
            return;
        };

        self.record_unit_report(unit, cmd, prefix, payload);
        if cmd == Command::CfgPutApply {
            let accepted = payload.first().copied() == Some(1);
            self.on_config_apply_ack(unit, accepted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Moisture;
    use crate::radio::{RadioTuning, UnitIdentity};
    use crate::sim::SimHost;
    use crate::transport::{MemoryTransport, OutboundFrame};

    const GATEWAY: u64 = 0x0013_A200_0000_0001;

    fn engine() -> RadioEngine<MemoryTransport, SimHost> {
        RadioEngine::new(
            MemoryTransport::new(false),
            SimHost::new(24),
            RadioTuning::default(),
            UnitIdentity::default(),
        )
    }

    fn acks(engine: &mut RadioEngine<MemoryTransport, SimHost>) -> Vec<CommandMessage> {
        engine
            .transport_mut()
            .take_sent()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Data { payload, .. } => match Message::decode(&payload) {
                    Ok(Message::Ack(ack)) => Some(ack),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn standard_ack_echoes_msg_id_with_prefix() {
        let mut e = engine();
        e.host_mut().set_moisture_value(3, 0x0123);
        e.handle_command(GATEWAY, CommandMessage::new(0x42, Command::GetMoisture.opcode(), &[3]));
        let acks = acks(&mut e);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].msg_id, 0x42);
        assert_eq!(acks[0].cmd, Command::GetMoisture.ack_code());
        assert_eq!(acks[0].data.len(), ACK_PREFIX_LEN + 3);
        assert_eq!(&acks[0].data[ACK_PREFIX_LEN..], &[3, 0x01, 0x23]);
    }

    #[test]
    fn wrong_length_is_ignored() {
        let mut e = engine();
        e.handle_command(GATEWAY, CommandMessage::new(1, Command::ForceOn.opcode(), &[1, 0]));
        assert!(acks(&mut e).is_empty());
        assert!(e.host().forced().is_empty());
    }

    #[test]
    fn diag_echo_uses_light_ack() {
        let mut e = engine();
        e.handle_command(GATEWAY, CommandMessage::new(9, Command::DiagEcho.opcode(), b"ping"));
        let acks = acks(&mut e);
        assert_eq!(acks[0].data, b"ping".to_vec());
    }

    #[test]
    fn impossible_date_is_not_acked() {
        let mut e = engine();
        let data = [0x07, 0xEA, 2, 30, 12, 0, 0];
        e.handle_command(GATEWAY, CommandMessage::new(1, Command::InitDateTime.opcode(), &data));
        assert!(acks(&mut e).is_empty());
        assert_eq!(e.host().clock_set(), None);
    }

    #[test]
    fn unknown_opcode_goes_to_extensions() {
        let mut e = engine();
        e.handle_command(GATEWAY, CommandMessage::new(5, 0x70, &[1, 2]));
        let acks = acks(&mut e);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].cmd, 0x70 | ACK_FLAG);
        assert_eq!(acks[0].data, vec![2, 1]);
    }
}
