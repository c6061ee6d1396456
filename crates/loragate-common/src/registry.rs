//! Node registry
//!
//! Fixed-capacity table of adopted nodes plus a small table of
//! recently-heard, not-yet-adopted nodes. Capacities are configured at
//! startup and lookups stay linear; the tables are owned by the single
//! event loop. The registry enforces the replay and duplicate rules for
//! the per-node receive counters.

use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{COUNTER_SENTINEL, SESSION_KEY_SIZE};

/// An adopted node and its link state.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: Uuid,
    pub session_key: [u8; SESSION_KEY_SIZE],
    /// Counter for commands sent to the node (hub → node).
    pub tx_counter: u32,
    /// Next expected counter for data from the node (node → hub).
    pub rx_counter: u32,
    /// Last accepted counter, for duplicate detection. The sentinel
    /// value means "freshly synchronized".
    pub last_rx_counter: u32,
    pub last_seen_ms: u64,
    pub active: bool,
}

impl NodeRecord {
    fn empty() -> Self {
        Self {
            node_id: Uuid::nil(),
            session_key: [0u8; SESSION_KEY_SIZE],
            tx_counter: 0,
            rx_counter: 0,
            last_rx_counter: COUNTER_SENTINEL,
            last_seen_ms: 0,
            active: false,
        }
    }
}

/// A node heard via DISCOVERY but not yet adopted.
#[derive(Debug, Clone)]
pub struct DiscoveredNode {
    pub node_id: Uuid,
    pub last_seen_ms: u64,
    pub rssi: i16,
    pub snr: f32,
}

/// Adopted-node table plus discovered-node table.
pub struct NodeRegistry {
    nodes: Vec<NodeRecord>,
    discovered: Vec<DiscoveredNode>,
    max_discovered: usize,
}

impl NodeRegistry {
    /// Create a registry with the given slot capacities.
    pub fn new(max_nodes: usize, max_discovered: usize) -> Self {
        Self {
            nodes: vec![NodeRecord::empty(); max_nodes],
            discovered: Vec::with_capacity(max_discovered),
            max_discovered,
        }
    }

    /// Find the slot index of an adopted node.
    pub fn find(&self, node_id: &Uuid) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.active && n.node_id == *node_id)
    }

    /// Adopt a node: reuse the node's existing slot (overwriting the
    /// session key and resetting counters) or claim a free one. Fails
    /// only when the table is full.
    pub fn add(
        &mut self,
        node_id: &Uuid,
        session_key: [u8; SESSION_KEY_SIZE],
        now_ms: u64,
    ) -> bool {
        let idx = match self
            .find(node_id)
            .or_else(|| self.nodes.iter().position(|n| !n.active))
        {
            Some(idx) => idx,
            None => {
                warn!("no free node slots available");
                return false;
            }
        };

        self.nodes[idx] = NodeRecord {
            node_id: *node_id,
            session_key,
            tx_counter: 0,
            rx_counter: 0,
            last_rx_counter: COUNTER_SENTINEL,
            last_seen_ms: now_ms,
            active: true,
        };

        // The node is paired now; it has no business in the discovered
        // table anymore.
        self.discovered.retain(|d| d.node_id != *node_id);

        info!(index = idx, node = %node_id, "node added");
        true
    }

    /// Clear a slot.
    pub fn remove(&mut self, index: usize) {
        if let Some(slot) = self.nodes.get_mut(index) {
            info!(index, node = %slot.node_id, "node removed");
            *slot = NodeRecord::empty();
        }
    }

    /// Read a record; `None` for out-of-range or inactive slots.
    pub fn get(&self, index: usize) -> Option<&NodeRecord> {
        self.nodes.get(index).filter(|n| n.active)
    }

    /// Number of adopted nodes.
    pub fn active_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.active).count()
    }

    /// Iterate over adopted nodes.
    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter().filter(|n| n.active)
    }

    /// Post-increment the tx counter after a command emission attempt.
    pub fn increment_tx(&mut self, index: usize) {
        if let Some(slot) = self.nodes.get_mut(index).filter(|n| n.active) {
            slot.tx_counter = slot.tx_counter.wrapping_add(1);
        }
    }

    /// Record an accepted receive counter: `c` becomes the duplicate
    /// candidate and `c + 1` the next expected value.
    pub fn update_rx(&mut self, index: usize, counter: u32) {
        if let Some(slot) = self.nodes.get_mut(index).filter(|n| n.active) {
            slot.last_rx_counter = counter;
            slot.rx_counter = counter.wrapping_add(1);
        }
    }

    /// Counter resynchronization: the node's current transmit counter
    /// becomes our next expected receive counter and duplicate detection
    /// is reset.
    pub fn sync(&mut self, index: usize, node_tx: u32, node_rx: u32) {
        if let Some(slot) = self.nodes.get_mut(index).filter(|n| n.active) {
            slot.rx_counter = node_tx;
            slot.last_rx_counter = COUNTER_SENTINEL;
            info!(
                hub_rx = slot.rx_counter,
                hub_tx = slot.tx_counter,
                node_rx,
                "counter sync"
            );
        }
    }

    /// Validate a received counter. Acceptance does NOT advance any
    /// state; the caller advances via [`update_rx`](Self::update_rx)
    /// after the packet fully checks out.
    pub fn validate(&self, index: usize, received: u32) -> bool {
        let Some(record) = self.get(index) else {
            return false;
        };

        if received < record.rx_counter {
            warn!(
                received,
                expected = record.rx_counter,
                "replay detected, dropping"
            );
            return false;
        }
        if received == record.last_rx_counter {
            warn!(received, "duplicate message, dropping");
            return false;
        }
        true
    }

    /// Refresh a node's last-seen timestamp.
    pub fn update_last_seen(&mut self, index: usize, now_ms: u64) {
        if let Some(slot) = self.nodes.get_mut(index).filter(|n| n.active) {
            slot.last_seen_ms = now_ms;
        }
    }

    /// Drop every adopted node (session restoration repopulates from the
    /// server's list).
    pub fn clear(&mut self) {
        for slot in &mut self.nodes {
            *slot = NodeRecord::empty();
        }
        info!("all nodes cleared, ready for restoration");
    }

    /// Upsert a discovered node. Ids that are already adopted are
    /// ignored; when the table is full the oldest entry is overwritten.
    pub fn add_discovered(&mut self, node_id: &Uuid, rssi: i16, snr: f32, now_ms: u64) {
        if self.find(node_id).is_some() {
            return;
        }

        let entry = DiscoveredNode {
            node_id: *node_id,
            last_seen_ms: now_ms,
            rssi,
            snr,
        };

        if let Some(existing) = self.discovered.iter_mut().find(|d| d.node_id == *node_id) {
            *existing = entry;
        } else if self.discovered.len() < self.max_discovered {
            self.discovered.push(entry);
        } else if let Some(oldest) = self
            .discovered
            .iter_mut()
            .min_by_key(|d| d.last_seen_ms)
        {
            *oldest = entry;
        }
    }

    /// Age out discovered entries not heard from within `max_age_ms`.
    pub fn purge_discovered_older_than(&mut self, max_age_ms: u64, now_ms: u64) {
        self.discovered
            .retain(|d| now_ms.saturating_sub(d.last_seen_ms) <= max_age_ms);
    }

    /// Iterate over the discovered table.
    pub fn discovered_nodes(&self) -> impl Iterator<Item = &DiscoveredNode> {
        self.discovered.iter()
    }
}
