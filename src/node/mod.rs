//! Mesh participant records.
//!
//! A [`Node`] is owned by the [`crate::registry::NodeRegistry`]; everything
//! else refers to it through a [`NodeHandle`].

pub mod fetch;

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::registry::NodeHandle;
use crate::types::{Address, DeviceType, MacCapabilities};
use crate::zdp::{BindingRecord, NodeDescriptor, PowerDescriptor, Relationship, SimpleDescriptor};
pub use fetch::{FetchIntervals, FetchItem, FetchState, FetchTable};

/// Activity state of a node as seen by the fetch scheduler and router.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Idle,
    /// A ZDP request to the node is outstanding.
    Busy,
    /// Backing off until `state_until`.
    Wait,
    /// A fetch item ran out of retries.
    Failure,
    /// MAC transaction expired; the device sleeps until it polls again.
    Sleep,
}

/// Firmware identity captured from OTA image queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
}

/// One entry of a node's neighbor table, learnt from Mgmt_Lqi_rsp or from
/// direct reception (coordinator only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborEntry {
    pub node: NodeHandle,
    pub address: Address,
    pub device_type: DeviceType,
    pub relationship: Relationship,
    pub rx_on_when_idle: u8,
    pub depth: u8,
    pub lqi: u8,
    pub last_seen: Instant,
}

/// A mesh participant (`NodeInfo`).
#[derive(Debug, Clone)]
pub struct Node {
    id: u32,
    address: Address,
    coordinator: bool,
    pub mac_capabilities: MacCapabilities,
    pub node_descriptor: Option<NodeDescriptor>,
    pub power_descriptor: Option<PowerDescriptor>,
    pub user_descriptor: Option<String>,
    pub endpoints: Vec<u8>,
    pub simple_descriptors: Vec<SimpleDescriptor>,
    pub last_seen: Instant,
    pub last_seen_by_neighbor: Option<Instant>,
    pub recv_errors: u32,
    zombie: bool,
    state: NodeState,
    state_until: Option<Instant>,
    pub parent_address: Option<Address>,
    pub neighbors: Vec<NeighborEntry>,
    /// `uuid_hash` of the source routes attached to this node as destination.
    pub source_routes: Vec<u32>,
    pub bindings: Vec<BindingRecord>,
    pub firmware: Option<FirmwareVersion>,
    pub hidden: bool,
    pub fetch: FetchTable,
    pub(crate) lqi_pages: Vec<NeighborEntry>,
    pub(crate) mgmt_lqi_start: u8,
    pub(crate) bind_pages: Vec<BindingRecord>,
    pub(crate) mgmt_bind_start: u8,
}

impl Node {
    pub(crate) fn new(
        id: u32,
        address: Address,
        caps: MacCapabilities,
        coordinator: bool,
        intervals: &FetchIntervals,
        now: Instant,
    ) -> Self {
        Self {
            id,
            address,
            coordinator,
            mac_capabilities: caps,
            node_descriptor: None,
            power_descriptor: None,
            user_descriptor: None,
            endpoints: Vec::new(),
            simple_descriptors: Vec::new(),
            last_seen: now,
            last_seen_by_neighbor: None,
            recv_errors: 0,
            zombie: false,
            state: NodeState::Idle,
            state_until: None,
            parent_address: None,
            neighbors: Vec::new(),
            source_routes: Vec::new(),
            bindings: Vec::new(),
            firmware: None,
            hidden: false,
            fetch: FetchTable::new(intervals),
            lqi_pages: Vec::new(),
            mgmt_lqi_start: 0,
            bind_pages: Vec::new(),
            mgmt_bind_start: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn address_mut(&mut self) -> &mut Address {
        &mut self.address
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie
    }

    pub fn device_type(&self) -> DeviceType {
        match &self.node_descriptor {
            Some(nd) => nd.device_type,
            None if self.coordinator => DeviceType::Coordinator,
            None if self.mac_capabilities.is_ffd() => DeviceType::Router,
            None => DeviceType::EndDevice,
        }
    }

    pub fn is_router(&self) -> bool {
        self.device_type().is_router()
    }

    pub fn is_end_device(&self) -> bool {
        self.device_type() == DeviceType::EndDevice
    }

    pub fn rx_on_when_idle(&self) -> bool {
        self.mac_capabilities.rx_on_when_idle()
            || self
                .node_descriptor
                .as_ref()
                .map(|nd| nd.mac_capabilities.rx_on_when_idle())
                .unwrap_or(false)
    }

    /// Manufacturer code from the firmware query or the node descriptor.
    pub fn manufacturer_code(&self) -> Option<u16> {
        self.firmware
            .map(|f| f.manufacturer_code)
            .or_else(|| self.node_descriptor.as_ref().map(|nd| nd.manufacturer_code))
    }

    /// Effective state; an expired Wait reads as Idle.
    pub fn state(&self, now: Instant) -> NodeState {
        match (self.state, self.state_until) {
            (NodeState::Wait, Some(until)) if now >= until => NodeState::Idle,
            (s, _) => s,
        }
    }

    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
        self.state_until = None;
    }

    pub fn set_wait(&mut self, now: Instant, dur: Duration) {
        self.state = NodeState::Wait;
        self.state_until = Some(now + dur);
    }

    pub fn is_asleep(&self) -> bool {
        self.state == NodeState::Sleep
    }

    /// Direct contact with the device.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        if self.state == NodeState::Sleep || self.state == NodeState::Failure {
            self.set_state(NodeState::Idle);
        }
    }

    /// Flip the zombie flag. Returns false when the flag already had that value.
    ///
    /// Becoming a zombie stops Mgmt_Lqi polling; waking resets the error
    /// streak and re-enables it.
    pub fn set_zombie(&mut self, zombie: bool) -> bool {
        if self.zombie == zombie {
            return false;
        }
        self.zombie = zombie;
        if zombie {
            self.fetch.set_enabled(FetchItem::MgmtLqi, false);
        } else {
            self.recv_errors = 0;
            self.fetch.set_enabled(FetchItem::MgmtLqi, true);
            if self.state != NodeState::Sleep {
                self.set_state(NodeState::Idle);
            }
        }
        true
    }

    pub fn simple_descriptor(&self, endpoint: u8) -> Option<&SimpleDescriptor> {
        self.simple_descriptors.iter().find(|sd| sd.endpoint == endpoint)
    }

    /// First active endpoint without a simple descriptor.
    pub fn missing_simple_descriptor(&self) -> Option<u8> {
        self.endpoints
            .iter()
            .copied()
            .find(|ep| self.simple_descriptor(*ep).is_none())
    }

    pub fn set_simple_descriptor(&mut self, sd: SimpleDescriptor) {
        match self
            .simple_descriptors
            .iter_mut()
            .find(|s| s.endpoint == sd.endpoint)
        {
            Some(existing) => *existing = sd,
            None => self.simple_descriptors.push(sd),
        }
    }

    pub fn neighbor(&self, node: NodeHandle) -> Option<&NeighborEntry> {
        self.neighbors.iter().find(|n| n.node == node)
    }

    pub fn update_neighbor(&mut self, entry: NeighborEntry) {
        match self.neighbors.iter_mut().find(|n| n.node == entry.node) {
            Some(existing) => *existing = entry,
            None => self.neighbors.push(entry),
        }
    }

    pub fn remove_neighbor(&mut self, node: NodeHandle) -> bool {
        let before = self.neighbors.len();
        self.neighbors.retain(|n| n.node != node);
        before != self.neighbors.len()
    }

    /// Drop neighbor entries older than `max_age`. Returns how many went.
    pub fn drop_stale_neighbors(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.neighbors.len();
        self.neighbors
            .retain(|n| now.saturating_duration_since(n.last_seen) < max_age);
        before - self.neighbors.len()
    }

    /// Item specific fetch rules on top of [`FetchTable::gate`].
    pub fn need_fetch(&mut self, item: FetchItem, now: Instant) -> bool {
        if !self.fetch.gate(item, now) {
            return false;
        }
        let st = self.fetch.get(item);
        let has_nwk = self.address.has_nwk();
        match item {
            FetchItem::NodeDescriptor => has_nwk && self.node_descriptor.is_none(),
            FetchItem::ActiveEndpoints => {
                has_nwk
                    && (!st.fetched
                        || (!self.is_end_device() && self.endpoints.is_empty())
                        || st.interval_elapsed(now))
            }
            FetchItem::SimpleDescriptor => has_nwk && self.missing_simple_descriptor().is_some(),
            FetchItem::PowerDescriptor => has_nwk && (!st.fetched || st.interval_elapsed(now)),
            FetchItem::UserDescriptor => {
                has_nwk
                    && !st.fetched
                    && self
                        .node_descriptor
                        .as_ref()
                        .map(|nd| nd.user_descriptor_available)
                        .unwrap_or(false)
            }
            FetchItem::MgmtLqi => {
                has_nwk && self.is_router() && (!st.fetched || st.interval_elapsed(now))
            }
            FetchItem::MgmtBind => has_nwk && self.is_router() && !st.fetched,
            FetchItem::IeeeAddr => has_nwk && !self.address.has_ext(),
            FetchItem::NwkAddr => self.address.has_ext() && !has_nwk,
        }
    }

    /// Scan forward from the cursor for an item that needs fetching, wrapping
    /// once. The cursor stays on the returned item.
    pub fn next_fetch_item(&mut self, now: Instant) -> Option<FetchItem> {
        let start = self.fetch.cursor();
        let mut item = start;
        loop {
            if self.need_fetch(item, now) {
                self.fetch.set_cursor(item);
                return Some(item);
            }
            item = self.fetch.advance();
            if item == start {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    fn router(now: Instant) -> Node {
        Node::new(
            1,
            Address::new(0x00212E0000000001, 0x1234),
            MacCapabilities::DEVICE_TYPE_FFD
                | MacCapabilities::MAINS_POWERED
                | MacCapabilities::RX_ON_WHEN_IDLE,
            false,
            &FetchIntervals::default(),
            now,
        )
    }

    #[test]
    fn simple_descriptor_waits_for_endpoints() {
        let now = Instant::now();
        let mut n = router(now);
        n.endpoints = vec![1];
        assert!(!n.need_fetch(FetchItem::SimpleDescriptor, now));
        n.fetch.set_fetched(FetchItem::ActiveEndpoints, now);
        assert!(n.need_fetch(FetchItem::SimpleDescriptor, now));
    }

    #[test]
    fn first_item_is_node_descriptor() {
        let now = Instant::now();
        let mut n = router(now);
        assert_eq!(n.next_fetch_item(now), Some(FetchItem::NodeDescriptor));
        n.node_descriptor = Some(NodeDescriptor::for_role(
            DeviceType::Router,
            n.mac_capabilities,
            0x1135,
        ));
        n.fetch.set_fetched(FetchItem::NodeDescriptor, now);
        assert_eq!(n.next_fetch_item(now), Some(FetchItem::ActiveEndpoints));
    }

    #[test]
    fn zombie_toggle_is_idempotent() {
        let now = Instant::now();
        let mut n = router(now);
        n.recv_errors = 12;
        assert!(n.set_zombie(true));
        assert!(!n.set_zombie(true));
        assert!(!n.fetch.get(FetchItem::MgmtLqi).enabled);
        assert!(n.set_zombie(false));
        assert!(!n.set_zombie(false));
        assert_eq!(n.recv_errors, 0);
        assert!(n.fetch.get(FetchItem::MgmtLqi).enabled);
    }

    #[test]
    fn wait_expires() {
        let now = Instant::now();
        let mut n = router(now);
        n.set_wait(now, Duration::from_secs(2));
        assert_eq!(n.state(now), NodeState::Wait);
        assert_eq!(n.state(now + Duration::from_secs(2)), NodeState::Idle);
    }
}
