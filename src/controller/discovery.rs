//! ZDP discovery: the per-tick fetch scan, the fast path for new devices,
//! the address-resolution queue and application of ZDP responses.

use log::{debug, info, trace, warn};
use std::time::{Duration, Instant};

use super::Controller;
use crate::aps::{ApsDataRequest, ZdpTag};
use crate::error::{ApsError, RegistryError};
use crate::events::Event;
use crate::logutil::{escape_log, fmt_ext};
use crate::node::{FetchItem, NeighborEntry, NodeState};
use crate::registry::NodeHandle;
use crate::transport::RadioTransport;
use crate::types::{
    Address, AddressMode, DeviceType, MacCapabilities, BROADCAST_RX_ON_WHEN_IDLE,
};
use crate::zdp::{cluster, status, status_name, NeighborRecord, Relationship, ZdpRequest, ZdpResponse};

/// ZDP requests allowed in flight across the whole mesh.
pub const MAX_ZDP_OUTSTANDING: usize = 2;
pub const MAX_FAST_PROBES: usize = 8;
/// A fast probe with no activity for this long is dropped.
pub const FAST_PROBE_LIFETIME: Duration = Duration::from_secs(180);
/// Sleepy end devices are only queried this soon after they were heard.
const SLEEPY_FETCH_WINDOW: Duration = Duration::from_secs(10);
const MAX_DISCOVERY_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub(crate) struct FastProbe {
    pub node: NodeHandle,
    pub last_activity: Instant,
}

/// An address seen without its other half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTarget {
    /// Resolve with IEEE_addr_req.
    Nwk(u16),
    /// Resolve with NWK_addr_req.
    Ext(u64),
}

impl DiscoveryTarget {
    pub fn matches(&self, addr: &Address) -> bool {
        match self {
            DiscoveryTarget::Nwk(nwk) => addr.nwk() == Some(*nwk),
            DiscoveryTarget::Ext(ext) => addr.ext() == Some(*ext),
        }
    }
}

fn invalid_ext(ext: u64) -> bool {
    ext == 0 || ext == u64::MAX
}

impl<T: RadioTransport> Controller<T> {
    /// Queue a ZDP request on behalf of a node.
    pub(crate) fn send_zdp(
        &mut self,
        node: NodeHandle,
        item: Option<FetchItem>,
        req: ZdpRequest,
        dst: Address,
        mode: AddressMode,
        now: Instant,
    ) -> Result<u8, ApsError> {
        let seq = self.next_zdp_seq();
        let mut aps = ApsDataRequest::zdp(dst, mode, &req, seq);
        aps.set_zdp_tag(ZdpTag {
            node,
            item,
            seq,
            cluster: req.cluster_id(),
            expects_response: true,
        });
        let id = self.apsde_data_request(aps, now)?;
        self.metrics.inc_zdp_request();
        trace!("zdp 0x{:04X} seq {} to {} (request {})", req.cluster_id(), seq, dst, id);
        Ok(seq)
    }

    /// Build the request for one fetch item of a node.
    fn fetch_request(&self, h: NodeHandle, item: FetchItem) -> Option<(ZdpRequest, Address, AddressMode)> {
        let node = self.registry.get(h)?;
        let addr = *node.address();
        let unicast = |req: ZdpRequest| addr.nwk().map(|nwk| (req, Address::from_nwk(nwk), AddressMode::Nwk));
        let nwk = addr.nwk();
        match item {
            FetchItem::NodeDescriptor => unicast(ZdpRequest::NodeDescriptor { nwk: nwk? }),
            FetchItem::ActiveEndpoints => unicast(ZdpRequest::ActiveEndpoints { nwk: nwk? }),
            FetchItem::SimpleDescriptor => unicast(ZdpRequest::SimpleDescriptor {
                nwk: nwk?,
                endpoint: node.missing_simple_descriptor()?,
            }),
            FetchItem::PowerDescriptor => unicast(ZdpRequest::PowerDescriptor { nwk: nwk? }),
            FetchItem::UserDescriptor => unicast(ZdpRequest::UserDescriptor { nwk: nwk? }),
            FetchItem::MgmtLqi => unicast(ZdpRequest::MgmtLqi {
                start_index: node.mgmt_lqi_start,
            }),
            FetchItem::MgmtBind => unicast(ZdpRequest::MgmtBind {
                start_index: node.mgmt_bind_start,
            }),
            FetchItem::IeeeAddr => unicast(ZdpRequest::IeeeAddr {
                nwk: nwk?,
                extended: false,
                start_index: 0,
            }),
            FetchItem::NwkAddr => Some((
                ZdpRequest::NwkAddr {
                    ext: addr.ext()?,
                    extended: false,
                    start_index: 0,
                },
                Address::from_nwk(BROADCAST_RX_ON_WHEN_IDLE),
                AddressMode::Nwk,
            )),
        }
    }

    /// Issue the request for `item` now, regardless of the fetch schedule.
    pub fn request_fetch(&mut self, h: NodeHandle, item: FetchItem, now: Instant) -> Result<u8, ApsError> {
        let (req, dst, mode) = self
            .fetch_request(h, item)
            .ok_or(ApsError::InvalidParameter("node cannot be queried for this item"))?;
        let seq = self.send_zdp(h, Some(item), req, dst, mode, now)?;
        if let Some(n) = self.registry.get_mut(h) {
            n.fetch.mark_requested(item, now);
            n.set_state(NodeState::Busy);
        }
        Ok(seq)
    }

    /// Whether a node may be queried at all on this tick.
    fn fetch_eligible(&self, h: NodeHandle, now: Instant) -> bool {
        let Some(n) = self.registry.get(h) else {
            return false;
        };
        if n.is_coordinator() || n.is_zombie() || n.fetch.any_in_flight() {
            return false;
        }
        if !matches!(n.state(now), NodeState::Idle | NodeState::Failure) {
            return false;
        }
        if n.is_end_device() && !n.rx_on_when_idle() {
            return now.saturating_duration_since(n.last_seen) < SLEEPY_FETCH_WINDOW;
        }
        true
    }

    /// Pick one node and send its next due ZDP request.
    pub(crate) fn fetch_zdp_tick(&mut self, now: Instant) {
        self.fast_probes
            .retain(|p| now.saturating_duration_since(p.last_activity) < FAST_PROBE_LIFETIME);
        if !self.connected {
            return;
        }
        if self.queue.zdp_outstanding() >= MAX_ZDP_OUTSTANDING
            || self.queue.count_state(crate::aps::RequestState::Busy) >= self.queue.limits().max_busy
        {
            return;
        }

        if self.config.discovery.fast_discovery && self.fast_probe_step(now) {
            return;
        }

        let Some((cursor, h)) = self.registry.next_after(self.fetch_cursor) else {
            return;
        };
        self.fetch_cursor = cursor;
        if !self.fetch_eligible(h, now) {
            return;
        }
        let auto = {
            let Some(n) = self.registry.get(h) else {
                return;
            };
            if n.mac_capabilities.is_ffd() || n.is_router() {
                self.config.discovery.auto_fetch_ffd
            } else {
                self.config.discovery.auto_fetch_rfd
            }
        };
        if !auto {
            return;
        }
        let Some(item) = self.registry.get_mut(h).and_then(|n| n.next_fetch_item(now)) else {
            return;
        };
        self.issue_fetch(h, item, now);
    }

    /// Chase the descriptors of a newly announced device. Returns true when a
    /// request went out.
    fn fast_probe_step(&mut self, now: Instant) -> bool {
        for i in 0..self.fast_probes.len() {
            let h = self.fast_probes[i].node;
            if !self.fetch_eligible(h, now) {
                continue;
            }
            let item = self.registry.get_mut(h).and_then(|n| {
                FetchItem::ALL
                    .iter()
                    .copied()
                    .filter(|i| i.is_fast_discovery())
                    .find(|i| n.need_fetch(*i, now))
            });
            match item {
                Some(item) => {
                    if self.issue_fetch(h, item, now) {
                        self.fast_probes[i].last_activity = now;
                        return true;
                    }
                }
                None => {
                    let done = self
                        .registry
                        .get(h)
                        .map(|n| {
                            FetchItem::ALL
                                .iter()
                                .filter(|i| i.is_fast_discovery())
                                .all(|i| n.fetch.get(*i).fetched)
                        })
                        .unwrap_or(true);
                    if done {
                        debug!("fast discovery of {} complete", h);
                        self.fast_probes.remove(i);
                        return false;
                    }
                }
            }
        }
        false
    }

    fn issue_fetch(&mut self, h: NodeHandle, item: FetchItem, now: Instant) -> bool {
        match self.request_fetch(h, item, now) {
            Ok(_) => true,
            Err(e) => {
                debug!("fetch {:?} for {} not queued: {}", item, h, e);
                if let Some(n) = self.registry.get_mut(h) {
                    n.fetch.cancel(item);
                    n.set_wait(now, Duration::from_millis(self.config.discovery.zdp_wait_ms));
                }
                false
            }
        }
    }

    /// Nodes on the fast discovery path.
    pub fn fast_probe_nodes(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.fast_probes.iter().map(|p| p.node)
    }

    pub(crate) fn add_fast_probe(&mut self, h: NodeHandle, now: Instant) {
        if !self.config.discovery.fast_discovery || self.fast_probes.iter().any(|p| p.node == h) {
            return;
        }
        if self.fast_probes.len() >= MAX_FAST_PROBES {
            self.fast_probes.remove(0);
        }
        self.fast_probes.push(FastProbe {
            node: h,
            last_activity: now,
        });
    }

    pub(crate) fn queue_discovery(&mut self, target: DiscoveryTarget) {
        if self.discovery.contains(&target) {
            return;
        }
        if self.discovery.len() >= MAX_DISCOVERY_QUEUE {
            self.discovery.pop_front();
        }
        trace!("discovery queued {:?}", target);
        self.discovery.push_back(target);
    }

    /// Resolve one half-known address.
    pub(crate) fn discovery_step(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        let Some(target) = self.discovery.pop_front() else {
            return;
        };
        let Some(coordinator) = self.registry.coordinator() else {
            return;
        };
        let (req, dst) = match target {
            DiscoveryTarget::Nwk(nwk) => {
                let known = self
                    .registry
                    .get_node(&Address::from_nwk(nwk), AddressMode::Nwk)
                    .and_then(|h| self.registry.get(h))
                    .map(|n| n.address().has_ext())
                    .unwrap_or(false);
                if known {
                    return;
                }
                (
                    ZdpRequest::IeeeAddr {
                        nwk,
                        extended: false,
                        start_index: 0,
                    },
                    Address::from_nwk(nwk),
                )
            }
            DiscoveryTarget::Ext(ext) => {
                let known = self
                    .registry
                    .get_node(&Address::from_ext(ext), AddressMode::Ext)
                    .and_then(|h| self.registry.get(h))
                    .map(|n| n.address().has_nwk())
                    .unwrap_or(false);
                if known {
                    return;
                }
                (
                    ZdpRequest::NwkAddr {
                        ext,
                        extended: false,
                        start_index: 0,
                    },
                    Address::from_nwk(BROADCAST_RX_ON_WHEN_IDLE),
                )
            }
        };
        if let Err(e) = self.send_zdp(coordinator, None, req, dst, AddressMode::Nwk, now) {
            debug!("discovery of {:?} deferred: {}", target, e);
            self.discovery.push_back(target);
        }
    }

    /// A ZDP exchange ended without a usable answer.
    pub(crate) fn zdp_failed(&mut self, tag: ZdpTag, now: Instant) {
        if tag.cluster == cluster::BIND_REQ || tag.cluster == cluster::UNBIND_REQ {
            self.bind_failed(tag.seq);
        }
        let Some(item) = tag.item else {
            return;
        };
        let Some(n) = self.registry.get_mut(tag.node) else {
            return;
        };
        if n.fetch.record_failure(item, now) {
            warn!(
                "node {} gave up on {:?} after {} retries",
                n.address(),
                item,
                n.fetch.get(item).retries
            );
            if n.state(now) != NodeState::Wait {
                n.set_state(NodeState::Failure);
            }
        } else if n.state(now) == NodeState::Busy {
            n.set_state(NodeState::Idle);
        }
    }

    /// Decode and apply a ZDP indication.
    pub(crate) fn on_zdp_indication(
        &mut self,
        src: &Address,
        cluster_id: u16,
        asdu: &[u8],
        now: Instant,
        events: &mut Vec<Event>,
    ) {
        let (seq, resp) = match ZdpResponse::decode(cluster_id, asdu) {
            Ok(r) => r,
            Err(e) => {
                debug!(
                    "zdp 0x{:04X} from {} not decoded: {} [{}]",
                    cluster_id,
                    src,
                    e,
                    crate::logutil::hex_snippet(asdu)
                );
                return;
            }
        };
        if let ZdpResponse::DeviceAnnounce {
            nwk,
            ext,
            capabilities,
        } = resp
        {
            self.on_device_announce(nwk, ext, capabilities, now, events);
            return;
        }
        if !cluster::is_response(cluster_id) {
            return;
        }
        self.metrics.inc_zdp_response();

        let tag = self.queue.match_zdp_response(src, cluster_id, seq);
        if let Some(t) = tag {
            if t.cluster == cluster::BIND_REQ || t.cluster == cluster::UNBIND_REQ {
                self.bind_response(t.seq, resp.status(), now);
                return;
            }
        }
        let fetch_tag = tag.filter(|t| t.item.is_some());

        // address responses are applied by content; discovery requests are
        // tagged with the coordinator, not the device they resolve
        if matches!(resp, ZdpResponse::IeeeAddr { .. } | ZdpResponse::NwkAddr { .. }) {
            if resp.status() == status::SUCCESS {
                self.apply_address_response(&resp, now, events);
            } else if let Some(t) = fetch_tag {
                self.zdp_failed(t, now);
            }
            return;
        }

        let Some(h) = fetch_tag
            .map(|t| t.node)
            .or_else(|| self.registry.get_node(src, AddressMode::NwkAndExt))
        else {
            trace!("zdp 0x{:04X} from unknown {}", cluster_id, src);
            return;
        };

        if resp.status() != status::SUCCESS {
            debug!(
                "zdp 0x{:04X} from {} failed: {}",
                cluster_id,
                src,
                status_name(resp.status())
            );
            if let Some(t) = fetch_tag {
                self.zdp_failed(t, now);
            }
            return;
        }

        self.apply_zdp_response(h, resp, now, events);
        if let Some(n) = self.registry.get_mut(h) {
            if n.state(now) == NodeState::Busy && !n.fetch.any_in_flight() {
                n.set_state(NodeState::Idle);
            }
        }
        if let Some(p) = self.fast_probes.iter_mut().find(|p| p.node == h) {
            p.last_activity = now;
        }
    }

    fn apply_zdp_response(&mut self, h: NodeHandle, resp: ZdpResponse, now: Instant, events: &mut Vec<Event>) {
        match resp {
            ZdpResponse::NodeDescriptor {
                descriptor: Some(nd),
                ..
            } => {
                let Some(n) = self.registry.get_mut(h) else {
                    return;
                };
                debug!(
                    "node {} descriptor: {:?} mfc 0x{:04X}",
                    n.address(),
                    nd.device_type,
                    nd.manufacturer_code
                );
                n.mac_capabilities = nd.mac_capabilities;
                n.node_descriptor = Some(nd);
                n.fetch.set_fetched(FetchItem::NodeDescriptor, now);
                events.extend(self.node_ref(h).map(Event::UpdatedNodeDescriptor));
            }
            ZdpResponse::PowerDescriptor {
                descriptor: Some(pd),
                ..
            } => {
                let Some(n) = self.registry.get_mut(h) else {
                    return;
                };
                n.power_descriptor = Some(pd);
                n.fetch.set_fetched(FetchItem::PowerDescriptor, now);
                events.extend(self.node_ref(h).map(Event::UpdatedPowerDescriptor));
            }
            ZdpResponse::ActiveEndpoints { endpoints, .. } => {
                let Some(n) = self.registry.get_mut(h) else {
                    return;
                };
                n.simple_descriptors.retain(|sd| endpoints.contains(&sd.endpoint));
                n.endpoints = endpoints;
                n.fetch.set_fetched(FetchItem::ActiveEndpoints, now);
                if n.missing_simple_descriptor().is_some() {
                    n.fetch.set_unfetched(FetchItem::SimpleDescriptor);
                } else {
                    n.fetch.set_fetched(FetchItem::SimpleDescriptor, now);
                }
            }
            ZdpResponse::SimpleDescriptor {
                descriptor: Some(sd),
                ..
            } => {
                let Some(n) = self.registry.get_mut(h) else {
                    return;
                };
                let endpoint = sd.endpoint;
                n.set_simple_descriptor(sd);
                if n.missing_simple_descriptor().is_none() {
                    n.fetch.set_fetched(FetchItem::SimpleDescriptor, now);
                } else {
                    n.fetch.set_unfetched(FetchItem::SimpleDescriptor);
                }
                if let Some(node) = self.node_ref(h) {
                    events.push(Event::UpdatedSimpleDescriptor { node, endpoint });
                }
            }
            ZdpResponse::UserDescriptor { text, .. } => {
                let Some(n) = self.registry.get_mut(h) else {
                    return;
                };
                if let Some(t) = &text {
                    debug!("node {} user descriptor '{}'", n.address(), escape_log(t));
                }
                n.user_descriptor = text;
                n.fetch.set_fetched(FetchItem::UserDescriptor, now);
                events.extend(self.node_ref(h).map(Event::UpdatedUserDescriptor));
            }
            ZdpResponse::MgmtLqi {
                total,
                start_index,
                neighbors,
                ..
            } => self.apply_mgmt_lqi(h, total, start_index, neighbors, now, events),
            ZdpResponse::MgmtBind {
                total,
                start_index,
                bindings,
                ..
            } => {
                let Some(n) = self.registry.get_mut(h) else {
                    return;
                };
                let count = bindings.len();
                n.bind_pages.extend(bindings);
                let next = usize::from(start_index) + count;
                if count > 0 && next < usize::from(total) {
                    n.mgmt_bind_start = next as u8;
                    n.fetch.set_unfetched(FetchItem::MgmtBind);
                } else {
                    n.bindings = std::mem::take(&mut n.bind_pages);
                    n.mgmt_bind_start = 0;
                    n.fetch.set_fetched(FetchItem::MgmtBind, now);
                    debug!("node {} has {} bindings", n.address(), n.bindings.len());
                }
            }
            ZdpResponse::MgmtLeave { .. } => {
                info!("node {} acknowledged leave", h);
            }
            other => trace!("zdp response ignored: {:?}", other.cluster_id()),
        }
    }

    /// IEEE_addr_rsp / NWK_addr_rsp: both halves of one device.
    fn apply_address_response(&mut self, resp: &ZdpResponse, now: Instant, events: &mut Vec<Event>) {
        let (ext, nwk, item) = match resp {
            ZdpResponse::IeeeAddr { ext, nwk, .. } => (*ext, *nwk, FetchItem::IeeeAddr),
            ZdpResponse::NwkAddr { ext, nwk, .. } => (*ext, *nwk, FetchItem::NwkAddr),
            _ => return,
        };
        if invalid_ext(ext) {
            return;
        }
        let full = Address::new(ext, nwk);
        let by_ext = self.registry.get_node(&Address::from_ext(ext), AddressMode::Ext);
        // an entry known only by this network address is the same device
        let nwk_only = self
            .registry
            .get_node(&Address::from_nwk(nwk), AddressMode::Nwk)
            .filter(|h| !h.is_coordinator_slot())
            .filter(|h| self.registry.get(*h).map(|n| !n.address().has_ext()).unwrap_or(false));

        let h = match (by_ext, nwk_only) {
            (Some(owner), Some(orphan)) => {
                info!("{} resolved to existing node {}, merging", full, owner);
                if let Err(e) = self.delete_duplicate(orphan, events) {
                    debug!("duplicate {} not removed: {}", orphan, e);
                }
                owner
            }
            (Some(owner), None) => owner,
            (None, Some(orphan)) => match self.registry.set_ext(orphan, ext) {
                Ok(_) => {
                    debug!("node {} resolved to {}", orphan, fmt_ext(ext));
                    orphan
                }
                Err(e) => {
                    warn!("cannot set ext {} on {}: {}", fmt_ext(ext), orphan, e);
                    return;
                }
            },
            (None, None) => {
                match self.registry.create_node(&full, MacCapabilities::empty(), self.store.as_ref(), now) {
                    Ok((h, created)) => {
                        if created {
                            events.extend(self.node_ref(h).map(Event::NodeAdded));
                            self.add_fast_probe(h, now);
                        }
                        h
                    }
                    Err(e) => {
                        debug!("discovered {} not added: {}", full, e);
                        return;
                    }
                }
            }
        };
        if h.is_coordinator_slot() {
            return;
        }
        self.update_node_nwk(h, nwk, events);
        if let Some(n) = self.registry.get_mut(h) {
            n.fetch.set_fetched(item, now);
            if n.state(now) == NodeState::Busy && !n.fetch.any_in_flight() {
                n.set_state(NodeState::Idle);
            }
        }
    }

    /// Erase a registry entry that turned out to duplicate another node.
    fn delete_duplicate(&mut self, h: NodeHandle, events: &mut Vec<Event>) -> Result<(), RegistryError> {
        if h.is_coordinator_slot() {
            return Err(RegistryError::Coordinator);
        }
        let node_ref = self.node_ref(h).ok_or(RegistryError::StaleHandle)?;
        self.queue.cancel_for_node(h, &node_ref.address);
        events.extend(self.routing.purge_node(h, &mut self.registry));
        self.fast_probes.retain(|p| p.node != h);
        self.registry.remove(h)?;
        events.push(Event::NodeRemoved(node_ref));
        Ok(())
    }

    /// Apply a network address learnt for a node, emitting the change.
    pub(crate) fn update_node_nwk(&mut self, h: NodeHandle, nwk: u16, events: &mut Vec<Event>) {
        match self.registry.update_nwk(h, nwk) {
            Ok(Some(previous)) => {
                if previous.has_nwk() {
                    info!("node {} changed address {} -> 0x{:04X}", h, previous, nwk);
                }
                if let Some(node) = self.node_ref(h) {
                    events.push(Event::UpdatedNodeAddress { node, previous });
                }
            }
            Ok(None) => {}
            Err(e) => debug!("address update for {} failed: {}", h, e),
        }
    }

    fn on_device_announce(
        &mut self,
        nwk: u16,
        ext: u64,
        caps: MacCapabilities,
        now: Instant,
        events: &mut Vec<Event>,
    ) {
        let addr = Address::new(ext, nwk);
        info!("device announce {} caps {:?}", addr, caps);
        if let Some(h) = self.registry.get_node(&Address::from_ext(ext), AddressMode::Ext) {
            self.update_node_nwk(h, nwk, events);
            if let Some(n) = self.registry.get_mut(h) {
                n.mac_capabilities = caps;
                n.recv_errors = 0;
                n.touch(now);
            }
            self.set_zombie(h, false, events);
            self.add_fast_probe(h, now);
            return;
        }
        match self
            .registry
            .create_node(&addr, caps, self.store.as_ref(), now)
        {
            Ok((h, created)) => {
                if created {
                    events.extend(self.node_ref(h).map(Event::NodeAdded));
                }
                self.add_fast_probe(h, now);
            }
            Err(e) => debug!("announce from {} ignored: {}", addr, e),
        }
    }

    /// Mgmt_Lqi_rsp page: corroborate, collect, and swap in the table once
    /// the last page is in.
    fn apply_mgmt_lqi(
        &mut self,
        reporter: NodeHandle,
        total: u8,
        start_index: u8,
        records: Vec<NeighborRecord>,
        now: Instant,
        events: &mut Vec<Event>,
    ) {
        let Some(reporter_addr) = self.registry.get(reporter).map(|n| *n.address()) else {
            return;
        };
        let count = records.len();
        let mut page = Vec::with_capacity(count);
        for rec in records {
            if let Some(entry) = self.corroborate_neighbor(reporter, &reporter_addr, &rec, now, events) {
                page.push(entry);
            }
        }

        let Some(n) = self.registry.get_mut(reporter) else {
            return;
        };
        if start_index == 0 {
            n.lqi_pages.clear();
        }
        n.lqi_pages.extend(page);
        let next = usize::from(start_index) + count;
        if count > 0 && next < usize::from(total) {
            n.mgmt_lqi_start = next as u8;
            n.fetch.set_unfetched(FetchItem::MgmtLqi);
        } else {
            n.neighbors = std::mem::take(&mut n.lqi_pages);
            n.mgmt_lqi_start = 0;
            n.fetch.set_fetched(FetchItem::MgmtLqi, now);
            trace!("node {} neighbor table: {} entries", reporter_addr, n.neighbors.len());
        }
    }

    /// Resolve one neighbor record to a node, creating it when allowed.
    fn corroborate_neighbor(
        &mut self,
        reporter: NodeHandle,
        reporter_addr: &Address,
        rec: &NeighborRecord,
        now: Instant,
        events: &mut Vec<Event>,
    ) -> Option<NeighborEntry> {
        let addr = if invalid_ext(rec.ext) {
            Address::from_nwk(rec.nwk)
        } else {
            Address::new(rec.ext, rec.nwk)
        };
        let h = match self.registry.get_node(&addr, AddressMode::NwkAndExt) {
            Some(h) => {
                if addr.has_ext() {
                    self.update_node_nwk(h, rec.nwk, events);
                }
                h
            }
            None if !addr.has_ext() => {
                self.queue_discovery(DiscoveryTarget::Nwk(rec.nwk));
                return None;
            }
            None => {
                let mut caps = MacCapabilities::empty();
                if rec.device_type == DeviceType::Router {
                    caps |= MacCapabilities::DEVICE_TYPE_FFD | MacCapabilities::MAINS_POWERED;
                }
                if rec.rx_on_when_idle == 1 {
                    caps |= MacCapabilities::RX_ON_WHEN_IDLE;
                }
                match self.registry.create_node(&addr, caps, self.store.as_ref(), now) {
                    Ok((h, created)) => {
                        if created {
                            info!("node {} learnt from neighbor table of {}", addr, reporter_addr);
                            events.extend(self.node_ref(h).map(Event::NodeAdded));
                        }
                        h
                    }
                    Err(e) => {
                        trace!("neighbor {} not added: {}", addr, e);
                        return None;
                    }
                }
            }
        };
        if h == reporter {
            return None;
        }

        let child_seen = rec.relationship == Relationship::Child && rec.lqi > 0;
        let (address, device_type, wake) = {
            let n = self.registry.get_mut(h)?;
            n.last_seen_by_neighbor = Some(now);
            if child_seen {
                n.parent_address = Some(*reporter_addr);
            }
            let wake = child_seen && n.is_zombie() && n.is_end_device();
            (*n.address(), n.device_type(), wake)
        };
        if wake {
            self.set_zombie(h, false, events);
        }
        if rec.relationship == Relationship::Parent {
            if let Some(r) = self.registry.get_mut(reporter) {
                r.parent_address = Some(address);
            }
        }

        Some(NeighborEntry {
            node: h,
            address,
            device_type: if rec.device_type == DeviceType::Unknown {
                device_type
            } else {
                rec.device_type
            },
            relationship: rec.relationship,
            rx_on_when_idle: rec.rx_on_when_idle,
            depth: rec.depth,
            lqi: rec.lqi,
            last_seen: now,
        })
    }
}
