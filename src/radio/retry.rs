//! Command retry queue for AT-style module commands.
//!
//! Entries are kept in insertion order (oldest first) with at most one entry
//! per ident. [`RetryQueue::service_one`] is called once per poll and picks the
//! first auto-send entry, or failing that the longest-waiting entry past the
//! retry threshold.
use std::collections::VecDeque;

use thiserror::Error;

pub const RETRY_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Not yet sent; eligible on the next service call.
    AutoSend,
    /// Sent at the given tick; eligible again once the retry threshold passes.
    SentAt(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub ident: u8,
    pub state: SendState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retry queue full ({capacity} entries), ident {ident} not queued")]
pub struct RetryQueueFull {
    pub ident: u8,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct RetryQueue {
    entries: VecDeque<PendingEntry>,
    retry_threshold_ms: u32,
}

impl RetryQueue {
    pub fn new(retry_threshold_ms: u32) -> Self {
        Self {
            entries: VecDeque::with_capacity(RETRY_QUEUE_CAPACITY),
            retry_threshold_ms,
        }
    }

    /// Insert-or-refresh: any existing entry for `ident` is dropped first and
    /// the new entry goes to the tail.
    pub fn enqueue(&mut self, ident: u8, send_now: bool, now: u32) -> Result<(), RetryQueueFull> {
        self.remove(ident);
        if self.entries.len() >= RETRY_QUEUE_CAPACITY {
            return Err(RetryQueueFull {
                ident,
                capacity: RETRY_QUEUE_CAPACITY,
            });
        }
        let state = if send_now {
            SendState::AutoSend
        } else {
            SendState::SentAt(now)
        };
        self.entries.push_back(PendingEntry { ident, state });
        Ok(())
    }

    pub fn remove(&mut self, ident: u8) {
        self.entries.retain(|e| e.ident != ident);
    }

    pub fn service_one(&mut self, now: u32) -> Option<u8> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.state == SendState::AutoSend)
        {
            return self.entries.remove(pos).map(|e| e.ident);
        }

        let threshold = self.retry_threshold_ms;
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e.state {
                SendState::SentAt(t) => {
                    let age = now.wrapping_sub(t);
                    (age > threshold).then_some((i, age))
                }
                SendState::AutoSend => None,
            })
            // max_by_key keeps the last maximum; compare (age, Reverse(i)) so ties go to the front.
            .max_by_key(|&(i, age)| (age, std::cmp::Reverse(i)))
            .map(|(i, _)| i)?;
        self.entries.remove(oldest).map(|e| e.ident)
    }

    pub fn contains(&self, ident: u8) -> bool {
        self.entries.iter().any(|e| e.ident == ident)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ident_moves_to_tail() {
        for ident in 0u8..=255 {
            let mut q = RetryQueue::new(5000);
            let other = ident.wrapping_add(1);
            q.enqueue(ident, true, 0).unwrap();
            q.enqueue(other, true, 0).unwrap();
            q.enqueue(ident, false, 10).unwrap();
            let order: Vec<u8> = q.entries().map(|e| e.ident).collect();
            assert_eq!(order, vec![other, ident]);
            assert_eq!(q.entries().filter(|e| e.ident == ident).count(), 1);
        }
    }

    #[test]
    fn autosend_beats_timed_out_entries() {
        let mut q = RetryQueue::new(5000);
        q.enqueue(1, false, 0).unwrap();
        q.enqueue(2, true, 0).unwrap();
        assert_eq!(q.service_one(60_000), Some(2));
        assert_eq!(q.service_one(60_000), Some(1));
        assert_eq!(q.service_one(60_000), None);
    }

    #[test]
    fn sent_entries_wait_for_threshold() {
        let mut q = RetryQueue::new(5000);
        q.enqueue(3, false, 1000).unwrap();
        assert_eq!(q.service_one(6000), None);
        assert_eq!(q.service_one(6001), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn oldest_timed_out_entry_goes_first() {
        let mut q = RetryQueue::new(100);
        q.enqueue(7, false, 500).unwrap();
        q.enqueue(8, false, 100).unwrap();
        assert_eq!(q.service_one(1000), Some(8));
        assert_eq!(q.service_one(1000), Some(7));
    }

    #[test]
    fn age_survives_tick_wraparound() {
        let mut q = RetryQueue::new(100);
        q.enqueue(9, false, u32::MAX - 50).unwrap();
        assert_eq!(q.service_one(20), None);
        assert_eq!(q.service_one(60), Some(9));
    }

    #[test]
    fn full_queue_rejects_new_idents_but_refreshes_existing() {
        let mut q = RetryQueue::new(5000);
        for ident in 0..RETRY_QUEUE_CAPACITY as u8 {
            q.enqueue(ident, true, 0).unwrap();
        }
        assert_eq!(
            q.enqueue(200, true, 0),
            Err(RetryQueueFull {
                ident: 200,
                capacity: RETRY_QUEUE_CAPACITY
            })
        );
        assert!(q.enqueue(4, false, 1).is_ok());
        assert_eq!(q.len(), RETRY_QUEUE_CAPACITY);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut q = RetryQueue::new(5000);
        q.enqueue(5, true, 0).unwrap();
        q.remove(5);
        q.remove(5);
        assert!(!q.contains(5));
        assert_eq!(q.service_one(0), None);
    }
}
