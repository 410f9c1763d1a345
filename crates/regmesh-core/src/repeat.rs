//! Reliability caches.
//!
//! The link is half duplex and collision prone, so the engine leans on
//! three small caches instead of acknowledgments:
//!
//! - [`FloodCache`]: frames from other nodes queued for relay, re-emitted
//!   verbatim apart from the hop count
//! - [`ResponseCache`]: descriptors of responses this node produced,
//!   re-sent a few times in case the first copy was lost
//! - [`HandledCache`]: requests already serviced, so re-flooded copies of
//!   a request do not trigger duplicate work
//!
//! All three are fixed size and drop work rather than grow. The protocol
//! treats every loss as recoverable by the requester's own retries.

use crate::packet::Packet;
use crate::register::Register;
use std::collections::VecDeque;

/// Frames held for flood relay.
#[derive(Debug)]
pub struct FloodCache {
    frames: VecDeque<Packet>,
    capacity: usize,
}

impl FloodCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue a frame for relay. Returns false, dropping the frame, when
    /// the cache is full.
    pub fn push(&mut self, pkt: Packet) -> bool {
        if self.frames.len() >= self.capacity {
            return false;
        }
        self.frames.push_back(pkt);
        true
    }

    /// Next frame to relay, oldest first.
    pub fn pop(&mut self) -> Option<Packet> {
        self.frames.pop_front()
    }

    /// Whether a copy of `pkt` (hop count aside) is already queued.
    pub fn contains_ignoring_hop(&self, pkt: &Packet) -> bool {
        self.frames.iter().any(|queued| queued.same_ignoring_hop(pkt))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// What a cached response was, so it can be rebuilt at emission time.
///
/// Register values are looked up live from the register table when the
/// repeat is built; only the set-ack error text is copied out, because
/// the register's error flag is cleared as soon as the first ack goes
/// out.
#[derive(Debug)]
pub enum ResponseKind {
    Pong,
    NumRegisters,
    RegisterName { index: u8 },
    RegisterValue { index: usize, target: u8 },
    Broadcast { register: Register },
    SetRegisterAck { target: u8, error: Option<Vec<u8>> },
}

/// One response awaiting re-emission.
#[derive(Debug)]
pub struct ResponseEntry {
    pub kind: ResponseKind,
    /// Sequence number of the original response; repeats reuse it so
    /// receivers can deduplicate.
    pub seq: u8,
    /// Times this response has been re-sent.
    pub repeats: u8,
}

/// Descriptors of recent responses, re-emitted fewest-repeats-first.
#[derive(Debug)]
pub struct ResponseCache {
    entries: Vec<ResponseEntry>,
    capacity: usize,
    max_repeats: u8,
}

impl ResponseCache {
    pub fn new(capacity: usize, max_repeats: u8) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            max_repeats,
        }
    }

    /// Remember a response for re-emission. A full cache evicts the
    /// entry with the most repeats already sent.
    pub fn push(&mut self, kind: ResponseKind, seq: u8) {
        if self.entries.len() >= self.capacity {
            if let Some(most_repeated) = self
                .entries
                .iter()
                .enumerate()
                .max_by_key(|(_, e)| e.repeats)
                .map(|(i, _)| i)
            {
                self.entries.remove(most_repeated);
            }
        }
        self.entries.push(ResponseEntry {
            kind,
            seq,
            repeats: 0,
        });
    }

    /// Index of the entry to re-send next: the one repeated the least.
    pub fn next_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.repeats)
            .map(|(i, _)| i)
    }

    pub fn get(&self, index: usize) -> Option<&ResponseEntry> {
        self.entries.get(index)
    }

    /// Count one re-emission; entries that hit the repeat ceiling are
    /// dropped.
    pub fn note_repeat(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.repeats += 1;
            if entry.repeats >= self.max_repeats {
                self.entries.remove(index);
            }
        }
    }

    /// Drop an entry that can no longer be rebuilt.
    pub fn remove(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries.remove(index);
        }
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HandledEntry {
    op: u8,
    seq: u8,
    unique_id: u16,
}

/// Requests already serviced, keyed by (operation, sequence, unique id).
///
/// A re-flooded copy of a request matches an entry here and is answered
/// with silence; the original response is still being re-emitted by the
/// [`ResponseCache`]. Entries age out in two ways: the oldest is evicted
/// when the cache is full, and entries from a sender are dropped just
/// before that sender's 4-bit sequence counter wraps back onto them.
#[derive(Debug)]
pub struct HandledCache {
    entries: VecDeque<HandledEntry>,
    capacity: usize,
    expiry_window: u8,
}

impl HandledCache {
    pub fn new(capacity: usize, expiry_window: u8) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            expiry_window,
        }
    }

    pub fn contains(&self, op: u8, seq: u8, unique_id: u16) -> bool {
        self.entries
            .iter()
            .any(|e| e.op == op && e.seq == seq && e.unique_id == unique_id)
    }

    /// Remember a serviced request, evicting the oldest entry if full.
    pub fn record(&mut self, op: u8, seq: u8, unique_id: u16) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HandledEntry {
            op,
            seq,
            unique_id,
        });
    }

    /// Age out entries the sender's wrapping sequence counter is about
    /// to land on again. `incoming_seq` is the newest sequence number
    /// heard from `unique_id`; entries within `expiry_window` steps
    /// ahead of it are stale.
    pub fn expire(&mut self, incoming_seq: u8, unique_id: u16) {
        let window = self.expiry_window;
        self.entries.retain(|e| {
            if e.unique_id != unique_id {
                return true;
            }
            let distance = e.seq.wrapping_sub(incoming_seq) & 0x0F;
            !(1..=window).contains(&distance)
        });
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
    use crate::packet::PacketType;

    fn frame(seq: u8, sender: u8) -> Packet {
        Packet::with_header(PacketType::Ping, seq, sender, 0x1111)
    }

    #[test]
    fn test_flood_cache_fifo_and_overflow() {
        let mut cache = FloodCache::new(2);
        assert!(cache.push(frame(1, 10)));
        assert!(cache.push(frame(2, 10)));
        assert!(!cache.push(frame(3, 10)), "full cache must drop");

        assert_eq!(cache.pop().map(|p| p.seq()), Some(1));
        assert_eq!(cache.pop().map(|p| p.seq()), Some(2));
        assert!(cache.pop().is_none());
    }

    #[test]
    fn test_flood_cache_duplicate_check_masks_hop() {
        let mut cache = FloodCache::new(3);
        let original = frame(4, 9);
        cache.push(original);

        let mut relayed = original;
        relayed.set_hop(3);
        assert!(cache.contains_ignoring_hop(&relayed));

        let mut different = original;
        different.set_seq(5);
        assert!(!cache.contains_ignoring_hop(&different));
    }

    #[test]
    fn test_response_cache_emits_fewest_repeats_first() {
        let mut cache = ResponseCache::new(4, 3);
        cache.push(ResponseKind::Pong, 1);
        cache.push(ResponseKind::NumRegisters, 2);

        let first = cache.next_index().unwrap();
        assert_eq!(cache.get(first).unwrap().seq, 1);
        cache.note_repeat(first);

        // the other entry now has fewer repeats
        let second = cache.next_index().unwrap();
        assert_eq!(cache.get(second).unwrap().seq, 2);
    }

    #[test]
    fn test_response_cache_evicts_at_repeat_ceiling() {
        let mut cache = ResponseCache::new(4, 2);
        cache.push(ResponseKind::Pong, 7);

        let idx = cache.next_index().unwrap();
        cache.note_repeat(idx);
        assert_eq!(cache.len(), 1);

        let idx = cache.next_index().unwrap();
        cache.note_repeat(idx);
        assert!(cache.is_empty(), "second repeat reaches the ceiling of 2");
    }

    #[test]
    fn test_response_cache_full_evicts_most_repeated() {
        let mut cache = ResponseCache::new(2, 5);
        cache.push(ResponseKind::Pong, 1);
        cache.push(ResponseKind::Pong, 2);

        // repeat seq 1 once so it is the most-repeated entry
        assert_eq!(cache.get(0).unwrap().seq, 1);
        cache.note_repeat(0);

        cache.push(ResponseKind::Pong, 3);
        assert_eq!(cache.len(), 2);
        let seqs: Vec<u8> = (0..2).filter_map(|i| cache.get(i)).map(|e| e.seq).collect();
        assert!(seqs.contains(&2) && seqs.contains(&3));
    }

    #[test]
    fn test_handled_cache_dedup_and_eviction() {
        let mut cache = HandledCache::new(2, 2);
        cache.record(0x04, 1, 0xAAAA);
        assert!(cache.contains(0x04, 1, 0xAAAA));
        assert!(!cache.contains(0x04, 2, 0xAAAA));
        assert!(!cache.contains(0x04, 1, 0xBBBB));
        assert!(!cache.contains(0x05, 1, 0xAAAA));

        cache.record(0x04, 2, 0xAAAA);
        cache.record(0x04, 3, 0xAAAA);
        assert!(!cache.contains(0x04, 1, 0xAAAA), "oldest evicted when full");
        assert!(cache.contains(0x04, 3, 0xAAAA));
    }

    #[test]
    fn test_handled_cache_expires_before_seq_wrap() {
        let mut cache = HandledCache::new(8, 2);
        cache.record(0x04, 5, 0xAAAA);

        // newest seq 3: entry at 5 is two steps ahead, inside the window
        cache.expire(3, 0xAAAA);
        assert!(!cache.contains(0x04, 5, 0xAAAA));

        // same distance but a different sender is untouched
        cache.record(0x04, 5, 0xAAAA);
        cache.expire(3, 0xBBBB);
        assert!(cache.contains(0x04, 5, 0xAAAA));

        // distance outside the window is kept
        cache.expire(1, 0xAAAA);
        assert!(cache.contains(0x04, 5, 0xAAAA));
    }

    #[test]
    fn test_handled_cache_expiry_wraps_the_counter() {
        let mut cache = HandledCache::new(8, 2);
        cache.record(0x06, 0, 0xCCCC);
        // entry seq 0 is one step ahead of incoming seq 15 on a 4-bit counter
        cache.expire(15, 0xCCCC);
        assert!(!cache.contains(0x06, 0, 0xCCCC));
    }
}
