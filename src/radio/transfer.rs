//! Segmented bulk transfer.
//!
//! Resources are moved in fixed 64-byte segments, only the last being
//! shorter. As responder the engine serves GET and accepts PUT for any peer;
//! as initiator it drives one outbound transfer at a time (configuration
//! distribution to an expansion unit, or pulling a resource from one).
//!
//! PUT is self-clocking: each PUT_ACK triggers the next segment and the final
//! ack is followed by a CFG_PUT_APPLY command instead of another segment. A
//! PUT_NACK means the initiator starts over from segment 0.

use log::{debug, info, warn};
use thiserror::Error;

use super::RadioEngine;
use crate::host::{Fault, HistoryKind, Host};
use crate::logutil::fmt_mac;
use crate::metrics;
use crate::protocol::{Command, Message, Resource, TransferMessage, UnitId, XferOp, SEGMENT_SIZE};
use crate::transport::FrameTransport;

/// Fixed header in front of a firmware image.
pub const FIRMWARE_HEADER_LEN: usize = 16;
/// 24 hours of per-minute flow or level samples.
pub const HISTORY_LEN: usize = 1440;
pub const MAX_FIRMWARE_PAYLOAD: u32 = 512 * 1024;

pub fn segment_count(size: usize) -> usize {
    size.div_ceil(SEGMENT_SIZE)
}

/// Length of segment `index` of a resource of `size` bytes, `None` past the end.
pub fn segment_len(size: usize, index: usize) -> Option<usize> {
    (index < segment_count(size)).then(|| SEGMENT_SIZE.min(size - index * SEGMENT_SIZE))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("another transfer with {0} is in progress")]
    Busy(UnitId),
    #[error("unit {0} is not configured")]
    UnitNotConfigured(UnitId),
    #[error("only the master distributes configuration")]
    NotMaster,
    #[error("{0:?} cannot be requested")]
    Unsupported(Resource),
}

/// PUT being received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InboundPut {
    source: u64,
    resource: Resource,
    last_segment: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outbound {
    Put {
        unit: UnitId,
        segment: u16,
        restarts: u8,
    },
    /// All segments acked; waiting for the CFG_PUT_APPLY ack.
    Applying { unit: UnitId },
    Get {
        unit: UnitId,
        resource: Resource,
        segment: u16,
        data: Vec<u8>,
    },
}

impl Outbound {
    fn unit(&self) -> UnitId {
        match self {
            Outbound::Put { unit, .. } | Outbound::Applying { unit } | Outbound::Get { unit, .. } => *unit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferState {
    inbound: Option<InboundPut>,
    /// Payload size announced by FW_DOWNLOAD_START.
    firmware_size: Option<usize>,
    firmware_header: [u8; FIRMWARE_HEADER_LEN],
    outbound: Option<Outbound>,
}

impl TransferState {
    pub fn outbound_unit(&self) -> Option<UnitId> {
        self.outbound.as_ref().map(Outbound::unit)
    }

    pub fn receiving(&self) -> Option<Resource> {
        self.inbound.map(|p| p.resource)
    }
}

impl<T: FrameTransport, H: Host> RadioEngine<T, H> {
    pub fn transfers(&self) -> &TransferState {
        &self.transfers
    }

    pub(crate) fn handle_transfer(&mut self, source: u64, msg: TransferMessage) {
        match msg.op {
            XferOp::GetReq => self.serve_get(source, msg.resource, msg.segment),
            XferOp::PutReq => self.accept_put(source, msg.resource, msg.segment, &msg.data),
            XferOp::GetAck => self.on_get_ack(source, msg.resource, msg.segment, msg.data),
            XferOp::GetNack => self.on_get_nack(source, msg.resource),
            XferOp::PutAck => self.on_put_ack(source, msg.resource, msg.segment),
            XferOp::PutNack => self.on_put_nack(source, msg.resource),
        }
    }

    fn resource_size(&self, resource: Resource) -> Option<usize> {
        match resource {
            Resource::Config => Some(self.host.image_len()),
            Resource::Firmware => self.transfers.firmware_size.map(|s| s + FIRMWARE_HEADER_LEN),
            Resource::Flow | Resource::Level => Some(HISTORY_LEN),
            Resource::Eeprom => self.tuning.eeprom_access.then(|| self.host.eeprom_len()),
        }
    }

    fn reply_transfer(&mut self, destination: u64, segment: u16, resource: Resource, op: XferOp, data: &[u8]) {
        let msg = Message::Transfer(TransferMessage::new(segment, resource, op, data));
        self.send_message(destination, &msg);
    }

    fn serve_get(&mut self, source: u64, resource: Resource, segment: u16) {
        let Some(size) = self.resource_size(resource) else {
            debug!("GET {:?} from {}: resource unavailable", resource, fmt_mac(source));
            self.reply_transfer(source, segment, resource, XferOp::GetNack, &[]);
            return;
        };
        // Past the end is answered with an empty GET_ACK.
        let Some(len) = segment_len(size, usize::from(segment)) else {
            self.reply_transfer(source, segment, resource, XferOp::GetAck, &[]);
            return;
        };
        let offset = usize::from(segment) * SEGMENT_SIZE;
        let mut buf = vec![0u8; len];
        match resource {
            Resource::Config => self.host.read_image(offset, &mut buf),
            Resource::Firmware => self.host.read_firmware(offset, &mut buf),
            Resource::Flow => self.host.read_history(HistoryKind::Flow, offset, &mut buf),
            Resource::Level => self.host.read_history(HistoryKind::Level, offset, &mut buf),
            Resource::Eeprom => self.host.read_eeprom(offset, &mut buf),
        }
        metrics::inc_segments_served();
        self.reply_transfer(source, segment, resource, XferOp::GetAck, &buf);
    }

    fn accept_put(&mut self, source: u64, resource: Resource, segment: u16, data: &[u8]) {
        let expected = match resource {
            Resource::Flow | Resource::Level => None,
            _ => self
                .resource_size(resource)
                .and_then(|size| segment_len(size, usize::from(segment))),
        };
        if expected != Some(data.len()) {
            debug!(
                "PUT {:?} segment {} from {}: {} bytes, expected {:?}",
                resource,
                segment,
                fmt_mac(source),
                data.len(),
                expected
            );
            self.nack_put(source, resource, segment);
            return;
        }

        if segment == 0 {
            self.discard_inbound();
            if resource == Resource::Config {
                self.host.snapshot_save();
            }
            self.transfers.firmware_header = [0; FIRMWARE_HEADER_LEN];
        } else {
            match self.transfers.inbound {
                Some(p) if p.source == source && p.resource == resource && p.last_segment == segment => {
                    // Our ack was lost; the data is already written.
                    self.reply_transfer(source, segment, resource, XferOp::PutAck, &[]);
                    return;
                }
                Some(p)
                    if p.source == source
                        && p.resource == resource
                        && p.last_segment.checked_add(1) == Some(segment) => {}
                _ => {
                    debug!("PUT {:?} segment {} out of sequence", resource, segment);
                    self.nack_put(source, resource, segment);
                    return;
                }
            }
        }

        let offset = usize::from(segment) * SEGMENT_SIZE;
        match resource {
            Resource::Config => self.host.write_image(offset, data),
            Resource::Eeprom => self.host.write_eeprom(offset, data),
            Resource::Firmware => self.write_firmware_segment(offset, data),
            Resource::Flow | Resource::Level => {}
        }
        self.transfers.inbound = Some(InboundPut {
            source,
            resource,
            last_segment: segment,
        });

        let size = self.resource_size(resource).unwrap_or(0);
        if usize::from(segment) + 1 == segment_count(size) {
            info!("{:?} received from {} ({} bytes)", resource, fmt_mac(source), size);
            if resource == Resource::Firmware {
                let header = self.transfers.firmware_header;
                self.host.commit_firmware_header(&header);
            }
        }
        self.reply_transfer(source, segment, resource, XferOp::PutAck, &[]);
    }

    fn write_firmware_segment(&mut self, offset: usize, data: &[u8]) {
        let header_part = FIRMWARE_HEADER_LEN.saturating_sub(offset).min(data.len());
        if header_part > 0 {
            self.transfers.firmware_header[offset..offset + header_part]
                .copy_from_slice(&data[..header_part]);
        }
        if header_part < data.len() {
            let payload_offset = offset + header_part - FIRMWARE_HEADER_LEN;
            self.host
                .write_firmware_payload(payload_offset, &data[header_part..]);
        }
    }

    fn nack_put(&mut self, source: u64, resource: Resource, segment: u16) {
        self.discard_inbound();
        self.reply_transfer(source, segment, resource, XferOp::PutNack, &[]);
    }

    /// Drop a partially received PUT; the initiator restarts from segment 0.
    fn discard_inbound(&mut self) {
        if let Some(p) = self.transfers.inbound.take() {
            if p.resource == Resource::Config {
                self.host.snapshot_restore();
            }
            self.transfers.firmware_header = [0; FIRMWARE_HEADER_LEN];
        }
    }

    /// CFG_PUT_APPLY: make a received image live if its checksum and content check out.
    pub(crate) fn apply_config(&mut self, checksum: u16) -> bool {
        let received = self.transfers.receiving() == Some(Resource::Config);
        let incomplete = match self.transfers.inbound {
            Some(p) if p.resource == Resource::Config => {
                usize::from(p.last_segment) + 1 != segment_count(self.host.image_len())
            }
            _ => false,
        };
        if incomplete {
            warn!("CFG_PUT_APPLY before the last configuration segment");
        }
        let valid = !incomplete
            && self.host.image_checksum() == checksum
            && self.host.content_validate();
        if valid {
            info!("configuration image applied");
            self.host.apply_image();
            self.transfers.inbound = None;
        } else {
            warn!("configuration image rejected (checksum {:#06x})", checksum);
            if received {
                self.discard_inbound();
            }
        }
        valid
    }

    pub(crate) fn begin_firmware(&mut self, size: u32) -> bool {
        if size == 0 || size > MAX_FIRMWARE_PAYLOAD {
            debug!("firmware download of {} bytes refused", size);
            return false;
        }
        if self.transfers.receiving() == Some(Resource::Firmware) {
            self.discard_inbound();
        }
        info!("firmware download started, {} byte payload", size);
        self.transfers.firmware_size = Some(size as usize);
        self.transfers.firmware_header = [0; FIRMWARE_HEADER_LEN];
        true
    }

    /// Push this unit's configuration image to an expansion unit.
    pub fn start_config_distribution(&mut self, unit: UnitId) -> Result<(), TransferError> {
        self.refresh_now();
        if self.identity.role != UnitId::Master {
            return Err(TransferError::NotMaster);
        }
        self.check_outbound_target(unit)?;
        info!("distributing configuration to {}", unit);
        self.transfers.outbound = Some(Outbound::Put {
            unit,
            segment: 0,
            restarts: 0,
        });
        self.send_config_segment(unit, 0);
        Ok(())
    }

    /// Pull a resource from another unit; the data is handed to
    /// [`crate::host::BulkStore::transfer_complete`] once the peer signals the end.
    pub fn request_resource(&mut self, unit: UnitId, resource: Resource) -> Result<(), TransferError> {
        self.refresh_now();
        if resource == Resource::Firmware {
            return Err(TransferError::Unsupported(resource));
        }
        self.check_outbound_target(unit)?;
        info!("requesting {:?} from {}", resource, unit);
        self.transfers.outbound = Some(Outbound::Get {
            unit,
            resource,
            segment: 0,
            data: Vec::new(),
        });
        self.send_get_request(unit, resource, 0);
        Ok(())
    }

    fn check_outbound_target(&self, unit: UnitId) -> Result<(), TransferError> {
        if let Some(busy) = self.transfers.outbound_unit() {
            return Err(TransferError::Busy(busy));
        }
        if !self.unit_configured(unit) {
            return Err(TransferError::UnitNotConfigured(unit));
        }
        Ok(())
    }

    /// Sends segment `segment` of the config image, or CFG_PUT_APPLY once past the end.
    fn send_config_segment(&mut self, unit: UnitId, segment: u16) {
        let size = self.host.image_len();
        match segment_len(size, usize::from(segment)) {
            Some(len) => {
                let mut buf = vec![0u8; len];
                self.host.read_image(usize::from(segment) * SEGMENT_SIZE, &mut buf);
                let msg = Message::Transfer(TransferMessage::new(
                    segment,
                    Resource::Config,
                    XferOp::PutReq,
                    &buf,
                ));
                let mac = self.unit_mac(unit);
                self.send_message(mac, &msg);
                self.arm_unit(unit);
            }
            None => {
                let checksum = self.host.image_checksum().to_be_bytes();
                self.transfers.outbound = Some(Outbound::Applying { unit });
                self.send_to_one(unit, Command::CfgPutApply.opcode(), &checksum);
            }
        }
    }

    fn send_get_request(&mut self, unit: UnitId, resource: Resource, segment: u16) {
        let msg = Message::Transfer(TransferMessage::new(segment, resource, XferOp::GetReq, &[]));
        let mac = self.unit_mac(unit);
        self.send_message(mac, &msg);
        self.arm_unit(unit);
    }

    fn on_put_ack(&mut self, source: u64, resource: Resource, acked: u16) {
        let Some(Outbound::Put { unit, segment, restarts }) = self.transfers.outbound.clone() else {
            return;
        };
        if resource != Resource::Config || self.unit_mac(unit) != source || acked != segment {
            debug!("stray PUT_ACK {} from {}", acked, fmt_mac(source));
            return;
        }
        let next = segment.wrapping_add(1);
        self.transfers.outbound = Some(Outbound::Put {
            unit,
            segment: next,
            restarts,
        });
        self.send_config_segment(unit, next);
    }

    fn on_put_nack(&mut self, source: u64, resource: Resource) {
        let Some(Outbound::Put { unit, restarts, .. }) = self.transfers.outbound.clone() else {
            return;
        };
        if resource != Resource::Config || self.unit_mac(unit) != source {
            return;
        }
        if restarts >= self.tuning.put_restart_limit {
            warn!("configuration distribution to {} abandoned after {} restarts", unit, restarts);
            self.transfers.outbound = None;
            self.host.set_fault(Fault::ExpansionConfigSync(unit));
            return;
        }
        debug!("PUT_NACK from {}; restarting from segment 0", unit);
        self.transfers.outbound = Some(Outbound::Put {
            unit,
            segment: 0,
            restarts: restarts + 1,
        });
        self.send_config_segment(unit, 0);
    }

    pub(crate) fn on_config_apply_ack(&mut self, unit: UnitId, accepted: bool) {
        if self.transfers.outbound != Some(Outbound::Applying { unit }) {
            return;
        }
        self.transfers.outbound = None;
        if accepted {
            info!("configuration accepted by {}", unit);
            self.host.clear_fault(Fault::ExpansionConfigSync(unit));
        } else {
            warn!("configuration rejected by {}", unit);
            self.host.set_fault(Fault::ExpansionConfigSync(unit));
        }
    }

    fn on_get_ack(&mut self, source: u64, resource: Resource, segment: u16, chunk: Vec<u8>) {
        let Some(Outbound::Get {
            unit,
            resource: wanted,
            segment: expected,
            mut data,
        }) = self.transfers.outbound.take()
        else {
            return;
        };
        if resource != wanted || self.unit_mac(unit) != source || segment != expected {
            debug!("stray GET_ACK {} from {}", segment, fmt_mac(source));
            self.transfers.outbound = Some(Outbound::Get {
                unit,
                resource: wanted,
                segment: expected,
                data,
            });
            return;
        }
        if chunk.is_empty() {
            info!("{:?} from {} complete ({} bytes)", resource, unit, data.len());
            self.host.transfer_complete(unit, resource, data);
            return;
        }
        data.extend_from_slice(&chunk);
        let next = expected.wrapping_add(1);
        self.transfers.outbound = Some(Outbound::Get {
            unit,
            resource,
            segment: next,
            data,
        });
        self.send_get_request(unit, resource, next);
    }

    fn on_get_nack(&mut self, source: u64, resource: Resource) {
        if let Some(Outbound::Get { unit, resource: wanted, .. }) = &self.transfers.outbound {
            if *wanted == resource && self.unit_mac(*unit) == source {
                warn!("{} refused {:?}", unit, resource);
                self.transfers.outbound = None;
            }
        }
    }

    /// Drop an outbound transfer whose peer stopped answering.
    pub(crate) fn abort_transfer_with(&mut self, unit: UnitId) {
        if self.transfers.outbound_unit() == Some(unit) {
            warn!("aborting transfer with {}", unit);
            self.transfers.outbound = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_count_rounds_up() {
        assert_eq!(segment_count(0), 0);
        assert_eq!(segment_count(1), 1);
        assert_eq!(segment_count(64), 1);
        assert_eq!(segment_count(65), 2);
        assert_eq!(segment_count(HISTORY_LEN), 23);
    }

    #[test]
    fn only_the_last_segment_is_short() {
        for size in [1usize, 63, 64, 65, 200, 1440, 4097] {
            let count = segment_count(size);
            for k in 0..count - 1 {
                assert_eq!(segment_len(size, k), Some(SEGMENT_SIZE));
            }
            assert_eq!(segment_len(size, count - 1), Some(size - SEGMENT_SIZE * (count - 1)));
            assert_eq!(segment_len(size, count), None);
        }
    }

    #[test]
    fn firmware_size_includes_header() {
        let state = TransferState {
            firmware_size: Some(1000),
            ..Default::default()
        };
        assert_eq!(
            state.firmware_size.map(|s| segment_count(s + FIRMWARE_HEADER_LEN)),
            Some(16)
        );
    }
}
