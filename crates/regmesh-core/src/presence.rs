//! Presence tracking for mesh discovery.
//!
//! A ping sweep records every node that answers in a fixed 256-bit bitmap,
//! one bit per logical node id. The bitmap is cleared when a new ping
//! starts and read back by the application once the collection window
//! closes.

/// Bitmap of node ids heard from during the most recent ping sweep.
///
/// Node id 0 is reserved by the protocol and its bit is never set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceTable {
    bits: [u8; 32],
}

impl PresenceTable {
    pub fn new() -> Self {
        Self { bits: [0; 32] }
    }

    /// Clear every bit, ready for a new sweep.
    pub fn clear(&mut self) {
        self.bits = [0; 32];
    }

    /// Record that `node_id` answered. Id 0 is ignored.
    pub fn mark(&mut self, node_id: u8) {
        if node_id == 0 {
            return;
        }
        self.bits[(node_id / 8) as usize] |= 1 << (node_id % 8);
    }

    /// Whether `node_id` answered the most recent sweep.
    pub fn contains(&self, node_id: u8) -> bool {
        self.bits[(node_id / 8) as usize] & (1 << (node_id % 8)) != 0
    }

    /// Number of nodes that answered.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Ids of every node that answered, in ascending order.
    pub fn ids(&self) -> Vec<u8> {
        (1..=u8::MAX).filter(|&id| self.contains(id)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}
