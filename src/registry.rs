//! Node registry: an arena of [`Node`] records addressed by generation-counted
//! handles.
//!
//! Slot 0 is reserved for the local coordinator. Erasing a node bumps its
//! slot generation, so handles kept by the queue, the router or other nodes'
//! neighbor tables stop resolving instead of pointing at a recycled slot.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::error::RegistryError;
use crate::node::{FetchIntervals, Node};
use crate::storage::DeviceStore;
use crate::types::{Address, AddressMode, DeviceType, MacCapabilities, COORDINATOR_NWK};

/// Stable reference to a registry slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn is_coordinator_slot(&self) -> bool {
        self.index == 0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug)]
pub struct NodeRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live handles in creation order, used for round-robin scans.
    order: Vec<NodeHandle>,
    next_id: u32,
    permit_join: bool,
    intervals: FetchIntervals,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(FetchIntervals::default())
    }
}

impl NodeRegistry {
    pub fn new(intervals: FetchIntervals) -> Self {
        Self {
            // slot 0 stays empty until the coordinator is known
            slots: vec![Slot {
                generation: 0,
                node: None,
            }],
            free: Vec::new(),
            order: Vec::new(),
            next_id: 1,
            permit_join: false,
            intervals,
        }
    }

    pub fn set_permit_join(&mut self, permit: bool) {
        self.permit_join = permit;
    }

    pub fn permit_join(&self) -> bool {
        self.permit_join
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live handles in creation order (coordinator first when present).
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.order
            .iter()
            .filter_map(move |h| self.get(*h).map(|n| (*h, n)))
    }

    pub fn get(&self, h: NodeHandle) -> Option<&Node> {
        self.slots
            .get(h.index as usize)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub fn get_mut(&mut self, h: NodeHandle) -> Option<&mut Node> {
        self.slots
            .get_mut(h.index as usize)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.node.as_mut())
    }

    pub fn contains(&self, h: NodeHandle) -> bool {
        self.get(h).is_some()
    }

    pub fn coordinator(&self) -> Option<NodeHandle> {
        let slot = &self.slots[0];
        slot.node.as_ref().map(|_| NodeHandle {
            index: 0,
            generation: slot.generation,
        })
    }

    /// Install (or readdress) the local coordinator in slot 0.
    pub fn create_coordinator(&mut self, ext: u64, now: Instant) -> NodeHandle {
        let address = Address::new(ext, COORDINATOR_NWK);
        if let Some(h) = self.coordinator() {
            if let Some(node) = self.get_mut(h) {
                node.address_mut().set_ext(ext);
            }
            return h;
        }
        let caps = MacCapabilities::DEVICE_TYPE_FFD
            | MacCapabilities::MAINS_POWERED
            | MacCapabilities::RX_ON_WHEN_IDLE
            | MacCapabilities::ALLOCATE_ADDRESS;
        let node = Node::new(0, address, caps, true, &self.intervals, now);
        let slot = &mut self.slots[0];
        slot.node = Some(node);
        let h = NodeHandle {
            index: 0,
            generation: slot.generation,
        };
        self.order.insert(0, h);
        h
    }

    /// Create a node or return the existing one.
    ///
    /// Idempotent on either address half. While joining is closed, devices
    /// unknown to the store are refused. Returns the handle and whether a new
    /// node was created.
    pub fn create_node(
        &mut self,
        addr: &Address,
        caps: MacCapabilities,
        store: &dyn DeviceStore,
        now: Instant,
    ) -> Result<(NodeHandle, bool), RegistryError> {
        if !addr.has_ext() && !addr.has_nwk() {
            return Err(RegistryError::NoAddress);
        }
        if let Some(h) = self.get_node(addr, AddressMode::NwkAndExt) {
            return Ok((h, false));
        }

        if !self.permit_join {
            match (addr.ext(), addr.nwk()) {
                (Some(ext), _) if !store.exists_device(ext) => {
                    debug!("refuse unknown device 0x{:016X}, joining closed", ext);
                    return Err(RegistryError::UnknownDevice(ext));
                }
                (None, Some(nwk)) => return Err(RegistryError::UnresolvedAddress(nwk)),
                _ => {}
            }
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let node = Node::new(id, *addr, caps, false, &self.intervals, now);

        let h = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.order.push(h);
        debug!("node {} created {} id={}", h, addr, id);
        Ok((h, true))
    }

    /// Look a node up by address. `NwkAndExt` matches on whichever half is
    /// present, extended address first.
    pub fn get_node(&self, addr: &Address, mode: AddressMode) -> Option<NodeHandle> {
        let by_ext = |ext: u64| {
            self.iter()
                .find(|(_, n)| n.address().ext() == Some(ext))
                .map(|(h, _)| h)
        };
        let by_nwk = |nwk: u16| {
            self.iter()
                .find(|(_, n)| n.address().nwk() == Some(nwk))
                .map(|(h, _)| h)
        };
        match mode {
            AddressMode::Ext => addr.ext().and_then(by_ext),
            AddressMode::Nwk => addr.nwk().and_then(by_nwk),
            AddressMode::NwkAndExt => addr
                .ext()
                .and_then(by_ext)
                .or_else(|| addr.nwk().and_then(by_nwk)),
            AddressMode::Group => None,
        }
    }

    /// Set a node's network address, clearing the cache of any other node that
    /// still claims it. Returns the previous address when something changed.
    pub fn update_nwk(&mut self, h: NodeHandle, nwk: u16) -> Result<Option<Address>, RegistryError> {
        let old = *self.get(h).ok_or(RegistryError::StaleHandle)?.address();
        if old.nwk() == Some(nwk) {
            return Ok(None);
        }
        let stale: Vec<NodeHandle> = self
            .iter()
            .filter(|(other, n)| *other != h && n.address().nwk() == Some(nwk))
            .map(|(other, _)| other)
            .collect();
        for other in stale {
            if let Some(n) = self.get_mut(other) {
                warn!(
                    "nwk 0x{:04X} moved from {} to {}, clearing stale cache",
                    nwk,
                    n.address(),
                    h
                );
                n.address_mut().clear_nwk();
            }
        }
        if let Some(n) = self.get_mut(h) {
            n.address_mut().set_nwk(nwk);
        }
        Ok(Some(old))
    }

    /// Set a node's extended address. Two live nodes never share one.
    pub fn set_ext(&mut self, h: NodeHandle, ext: u64) -> Result<Option<Address>, RegistryError> {
        let old = *self.get(h).ok_or(RegistryError::StaleHandle)?.address();
        if old.ext() == Some(ext) {
            return Ok(None);
        }
        if let Some(owner) = self.get_node(&Address::from_ext(ext), AddressMode::Ext) {
            if owner != h {
                return Err(RegistryError::DuplicateExtAddress(ext));
            }
        }
        if let Some(n) = self.get_mut(h) {
            n.address_mut().set_ext(ext);
        }
        Ok(Some(old))
    }

    /// Erase a node and every neighbor-table reference to it.
    pub fn remove(&mut self, h: NodeHandle) -> Result<Node, RegistryError> {
        if !self.contains(h) {
            return Err(RegistryError::StaleHandle);
        }
        let slot = &mut self.slots[h.index as usize];
        let node = slot.node.take().ok_or(RegistryError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        if h.index != 0 {
            self.free.push(h.index);
        }
        self.order.retain(|o| *o != h);

        let addr = *node.address();
        for other in self.order.clone() {
            if let Some(n) = self.get_mut(other) {
                n.remove_neighbor(h);
                n.lqi_pages.retain(|e| e.node != h);
                if n.parent_address.map(|p| p.same_device(&addr)).unwrap_or(false) {
                    n.parent_address = None;
                }
            }
        }
        Ok(node)
    }

    /// A node other than slot 0 that looks like a coordinator.
    pub fn is_ghost_coordinator(&self, h: NodeHandle) -> bool {
        if h.index == 0 {
            return false;
        }
        self.get(h)
            .map(|n| {
                n.address().nwk() == Some(COORDINATOR_NWK)
                    || n.node_descriptor
                        .as_ref()
                        .map(|nd| nd.device_type == DeviceType::Coordinator)
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Handle following `cursor` in creation order, wrapping. Used by the
    /// round-robin scans.
    pub fn next_after(&self, cursor: usize) -> Option<(usize, NodeHandle)> {
        if self.order.is_empty() {
            return None;
        }
        let idx = cursor % self.order.len();
        Some((idx + 1, self.order[idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn caps() -> MacCapabilities {
        MacCapabilities::DEVICE_TYPE_FFD | MacCapabilities::MAINS_POWERED
    }

    #[test]
    fn handles_go_stale_after_remove() {
        let now = Instant::now();
        let mut reg = NodeRegistry::default();
        reg.set_permit_join(true);
        let store = MemoryStore::default();
        let (a, _) = reg
            .create_node(&Address::new(1, 0x0101), caps(), &store, now)
            .unwrap();
        reg.remove(a).unwrap();
        assert!(reg.get(a).is_none());
        let (b, created) = reg
            .create_node(&Address::new(2, 0x0202), caps(), &store, now)
            .unwrap();
        assert!(created);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(reg.remove(a).unwrap_err(), RegistryError::StaleHandle);
    }

    #[test]
    fn closed_join_needs_known_device() {
        let now = Instant::now();
        let mut reg = NodeRegistry::default();
        let mut store = MemoryStore::default();
        let addr = Address::new(0x00212E00000000AA, 0x3333);
        assert_eq!(
            reg.create_node(&addr, caps(), &store, now).unwrap_err(),
            RegistryError::UnknownDevice(0x00212E00000000AA)
        );
        assert!(matches!(
            reg.create_node(&Address::from_nwk(0x4444), caps(), &store, now),
            Err(RegistryError::UnresolvedAddress(0x4444))
        ));
        store.remember(0x00212E00000000AA);
        assert!(reg.create_node(&addr, caps(), &store, now).is_ok());
    }

    #[test]
    fn nwk_conflict_clears_other_node() {
        let now = Instant::now();
        let mut reg = NodeRegistry::default();
        reg.set_permit_join(true);
        let store = MemoryStore::default();
        let (a, _) = reg
            .create_node(&Address::new(1, 0x0101), caps(), &store, now)
            .unwrap();
        let (b, _) = reg
            .create_node(&Address::new(2, 0x0202), caps(), &store, now)
            .unwrap();
        let old = reg.update_nwk(b, 0x0101).unwrap();
        assert_eq!(old.and_then(|o| o.nwk()), Some(0x0202));
        assert_eq!(reg.get(a).unwrap().address().nwk(), None);
        assert_eq!(
            reg.get_node(&Address::from_nwk(0x0101), AddressMode::Nwk),
            Some(b)
        );
        assert_eq!(
            reg.set_ext(b, 1).unwrap_err(),
            RegistryError::DuplicateExtAddress(1)
        );
    }

    #[test]
    fn coordinator_lives_in_slot_zero() {
        let now = Instant::now();
        let mut reg = NodeRegistry::default();
        reg.set_permit_join(true);
        let store = MemoryStore::default();
        let (n, _) = reg
            .create_node(&Address::new(7, 0x0707), caps(), &store, now)
            .unwrap();
        let c = reg.create_coordinator(0x00212EFFFF000001, now);
        assert!(c.is_coordinator_slot());
        assert_eq!(reg.handles()[0], c);
        assert_eq!(reg.handles()[1], n);
        assert!(!reg.is_ghost_coordinator(c));
    }
}
