//! Queue-backed transport used by the simulator and the test-suite.
use std::collections::VecDeque;

use super::{FrameTransport, InboundFrame, OutboundFrame};

#[derive(Debug, Default)]
pub struct MemoryTransport {
    inbound: VecDeque<InboundFrame>,
    sent: Vec<OutboundFrame>,
    present: bool,
    resets: u32,
    /// Maximum number of unread outbound frames before `send_frame` refuses.
    outbound_limit: Option<usize>,
}

impl MemoryTransport {
    pub fn new(present: bool) -> Self {
        Self {
            present,
            ..Self::default()
        }
    }

    pub fn with_outbound_limit(mut self, limit: usize) -> Self {
        self.outbound_limit = Some(limit);
        self
    }

    pub fn push_inbound(&mut self, frame: InboundFrame) {
        self.inbound.push_back(frame);
    }

    pub fn push_rx(&mut self, source: u64, payload: Vec<u8>) {
        self.inbound.push_back(InboundFrame::RxData { source, payload });
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Drain everything sent since the last call.
    pub fn take_sent(&mut self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent(&self) -> &[OutboundFrame] {
        &self.sent
    }

    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    pub fn reset_count(&self) -> u32 {
        self.resets
    }
}

impl FrameTransport for MemoryTransport {
    fn send_frame(&mut self, frame: OutboundFrame) -> bool {
        if let Some(limit) = self.outbound_limit {
            if self.sent.len() >= limit {
                return false;
            }
        }
        self.sent.push(frame);
        true
    }

    fn recv_frame(&mut self) -> Option<InboundFrame> {
        self.inbound.pop_front()
    }

    fn link_present(&self) -> bool {
        self.present
    }

    fn hardware_reset(&mut self) {
        self.resets += 1;
        // Frames buffered before the reset never make it out of the module.
        self.inbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_out_in_arrival_order() {
        let mut t = MemoryTransport::new(true);
        t.push_rx(1, vec![1]);
        t.push_rx(2, vec![2]);
        assert_eq!(
            t.recv_frame(),
            Some(InboundFrame::RxData {
                source: 1,
                payload: vec![1]
            })
        );
        assert_eq!(t.pending_inbound(), 1);
    }

    #[test]
    fn outbound_limit_refuses_frames() {
        let mut t = MemoryTransport::new(true).with_outbound_limit(1);
        let frame = OutboundFrame::Data {
            destination: 9,
            payload: vec![],
        };
        assert!(t.send_frame(frame.clone()));
        assert!(!t.send_frame(frame));
        assert_eq!(t.take_sent().len(), 1);
        assert!(t.sent().is_empty());
    }

    #[test]
    fn reset_drops_buffered_input() {
        let mut t = MemoryTransport::new(true);
        t.push_rx(1, vec![]);
        t.hardware_reset();
        assert_eq!(t.reset_count(), 1);
        assert_eq!(t.recv_frame(), None);
    }
}
