//! Incremental source route discovery and ranking.
//!
//! [`SourceRoutingEngine::calculate_step`] looks at exactly one
//! (candidate route, candidate next hop) pair per call so a controller tick
//! stays cheap regardless of mesh size. Cheap disqualifiers run before the
//! neighbor table lookups.
//!
//! [`SourceRoutingEngine::select_best_step`] re-ranks the routes to one
//! destination per call and attaches the winner to the node.

use log::{debug, info};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{
    RouteHop, RouteOrigin, SourceRoute, COORDINATOR_HOP_LQI, MAX_ROUTE_ERRORS,
    OPERATIONAL_MAX_ERRORS,
};
use crate::aps::SourceRouteTag;
use crate::error::RouteError;
use crate::events::Event;
use crate::node::Node;
use crate::registry::{NodeHandle, NodeRegistry};

/// Vendor whose early router images drop source routed frames they relay.
pub const LEGACY_RELAY_MANUFACTURER: u16 = 0x115F;
/// First image of that vendor that relays source routed frames correctly.
pub const LEGACY_RELAY_FIXED_VERSION: u32 = 0x0000_0100;

/// Firmware known to mishandle source routed frames as a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedFirmware {
    pub manufacturer_code: u16,
    /// Only versions below this are blocked; `None` blocks every version.
    /// A node that has not reported its version yet is not blocked by a
    /// bounded entry.
    pub below_version: Option<u32>,
}

impl BlockedFirmware {
    pub fn legacy_relay() -> Self {
        Self {
            manufacturer_code: LEGACY_RELAY_MANUFACTURER,
            below_version: Some(LEGACY_RELAY_FIXED_VERSION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    pub enabled: bool,
    pub min_lqi: u8,
    /// Upper bound on hops including the coordinator.
    pub max_hops: usize,
    pub blocked_firmware: Vec<BlockedFirmware>,
    /// A failing route is kept at least this long after creation.
    pub min_route_age: Duration,
    pub trash_size: usize,
    /// Calculation steps a trashed hop sequence stays suppressed.
    pub trash_ttl: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_lqi: 130,
            max_hops: 5,
            blocked_firmware: vec![BlockedFirmware::legacy_relay()],
            min_route_age: Duration::from_secs(60 * 60),
            trash_size: 16,
            trash_ttl: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct TrashedRoute {
    path: Vec<NodeHandle>,
    ttl: u32,
}

#[derive(Debug)]
pub struct SourceRoutingEngine {
    cfg: RoutingConfig,
    routes: Vec<SourceRoute>,
    trash: VecDeque<TrashedRoute>,
    route_cursor: usize,
    node_cursor: usize,
    select_cursor: usize,
}

impl SourceRoutingEngine {
    pub fn new(cfg: RoutingConfig) -> Self {
        Self {
            cfg,
            routes: Vec::new(),
            trash: VecDeque::new(),
            route_cursor: 0,
            node_cursor: 0,
            select_cursor: 0,
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.cfg
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn routes(&self) -> &[SourceRoute] {
        &self.routes
    }

    pub fn route(&self, uuid_hash: u32) -> Option<&SourceRoute> {
        self.routes.iter().find(|r| r.uuid_hash == uuid_hash)
    }

    /// Routes that lead to `node`.
    pub fn routes_to(&self, node: NodeHandle) -> impl Iterator<Item = &SourceRoute> {
        self.routes
            .iter()
            .filter(move |r| r.destination() == Some(node))
    }

    pub fn is_trashed(&self, path: &[NodeHandle]) -> bool {
        self.trash.iter().any(|t| t.path == path)
    }

    pub fn trash_len(&self) -> usize {
        self.trash.len()
    }

    /// Count a delivery result against a route.
    pub fn record_tx(&mut self, uuid_hash: u32, ok: bool) {
        if let Some(r) = self.routes.iter_mut().find(|r| r.uuid_hash == uuid_hash) {
            if ok {
                r.tx_ok = r.tx_ok.saturating_add(1);
            } else {
                r.errors = r.errors.saturating_add(1);
            }
        }
    }

    fn ensure_seed(&mut self, registry: &NodeRegistry, now: Instant) -> bool {
        if self.routes.iter().any(|r| r.hops.len() == 1) {
            return true;
        }
        let Some(c) = registry.coordinator() else {
            return false;
        };
        let Some(node) = registry.get(c) else {
            return false;
        };
        self.routes.insert(
            0,
            SourceRoute::new(
                RouteOrigin::Auto,
                vec![RouteHop {
                    node: c,
                    address: *node.address(),
                    lqi: COORDINATOR_HOP_LQI,
                }],
                now,
            ),
        );
        true
    }

    fn is_blocked(&self, node: &Node) -> bool {
        let Some(mfc) = node.manufacturer_code() else {
            return false;
        };
        self.cfg.blocked_firmware.iter().any(|b| {
            b.manufacturer_code == mfc
                && match (b.below_version, node.firmware) {
                    (None, _) => true,
                    (Some(limit), Some(fw)) => fw.file_version < limit,
                    (Some(_), None) => false,
                }
        })
    }

    fn trash_tick(&mut self) {
        for t in self.trash.iter_mut() {
            t.ttl = t.ttl.saturating_sub(1);
        }
        self.trash.retain(|t| t.ttl > 0);
    }

    fn push_trash(&mut self, path: Vec<NodeHandle>) {
        if self.cfg.trash_size == 0 {
            return;
        }
        while self.trash.len() >= self.cfg.trash_size {
            self.trash.pop_front();
        }
        self.trash.push_back(TrashedRoute {
            path,
            ttl: self.cfg.trash_ttl,
        });
    }

    /// Examine one (route, candidate) pair.
    pub fn calculate_step(&mut self, registry: &mut NodeRegistry, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        if !self.cfg.enabled || !self.ensure_seed(registry, now) {
            return events;
        }
        self.trash_tick();

        let handles = registry.handles();
        if handles.is_empty() || self.routes.is_empty() {
            return events;
        }
        let route_idx = self.route_cursor % self.routes.len();
        let cand = handles[self.node_cursor % handles.len()];
        self.node_cursor += 1;
        if self.node_cursor >= handles.len() {
            self.node_cursor = 0;
            self.route_cursor = (route_idx + 1) % self.routes.len();
        }

        let Some(cand_node) = registry.get(cand) else {
            return events;
        };
        if cand_node.is_coordinator() || !cand_node.is_router() {
            return events;
        }
        let Some(cand_nwk) = cand_node.address().nwk() else {
            return events;
        };

        let route = &self.routes[route_idx];
        if route.last_hop().map(|h| h.node) == Some(cand) {
            return self.refresh_route(route_idx, registry, now);
        }
        if route.contains(cand) || cand_node.is_asleep() || route.hops.len() >= self.cfg.max_hops {
            return events;
        }

        // extension checks
        let Some(last) = route.last_hop().map(|h| h.node) else {
            return events;
        };
        let Some(last_node) = registry.get(last) else {
            return events;
        };
        if !last_node.is_coordinator() {
            let healthy = last_node.recv_errors <= 1
                && last_node.node_descriptor.is_some()
                && last_node.is_router()
                && !last_node.is_zombie();
            if !healthy || self.is_blocked(last_node) {
                return events;
            }
        }
        let lqi = match last_node.neighbor(cand) {
            Some(n) if n.lqi >= self.cfg.min_lqi => n.lqi,
            _ => return events,
        };

        let new_len = route.hops.len() + 1;
        let alternatives = self
            .routes_to(cand)
            .filter(|r| r.hops.len() <= new_len && r.errors <= OPERATIONAL_MAX_ERRORS)
            .count();
        if alternatives >= 2 {
            return events;
        }

        let mut path = route.hop_handles();
        path.push(cand);
        if self.is_trashed(&path) || self.routes.iter().any(|r| r.same_path(&path)) {
            return events;
        }

        let mut hops = route.hops.clone();
        hops.push(RouteHop {
            node: cand,
            address: *cand_node.address(),
            lqi,
        });
        let created = SourceRoute::new(RouteOrigin::Auto, hops, now);
        debug!(
            "source route {} created to 0x{:04X} via {} hops",
            created.uuid(),
            cand_nwk,
            created.hops.len() - 1
        );
        events.push(Event::SourceRouteCreated(created.to_ref()));
        let hash = created.uuid_hash;
        let route_ref = created.to_ref();
        self.routes.push(created);

        if let Some(dest) = registry.get_mut(cand) {
            if dest.source_routes.is_empty() {
                dest.source_routes.push(hash);
                events.push(Event::SourceRouteChanged(route_ref));
            }
        }
        events
    }

    /// Re-sample LQIs of a route and drop it when it keeps failing.
    fn refresh_route(&mut self, idx: usize, registry: &mut NodeRegistry, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        let route = &mut self.routes[idx];
        if route.hops.len() < 2 {
            return events;
        }

        let mut degraded = false;
        for i in 0..route.hops.len() {
            let lqi = if i == 0 {
                COORDINATOR_HOP_LQI
            } else {
                registry
                    .get(route.hops[i - 1].node)
                    .and_then(|prev| prev.neighbor(route.hops[i].node))
                    .map(|n| n.lqi)
                    .unwrap_or(0)
            };
            route.hops[i].lqi = lqi;
            match registry.get(route.hops[i].node) {
                Some(n) => {
                    route.hops[i].address = *n.address();
                    let relay = i > 0 && i + 1 < route.hops.len();
                    if relay && (n.is_zombie() || n.recv_errors > 1) {
                        degraded = true;
                    }
                }
                None => degraded = true,
            }
        }
        if degraded {
            route.errors = route.errors.saturating_add(1);
        }

        let age = now.saturating_duration_since(route.created_at);
        if route.errors >= MAX_ROUTE_ERRORS
            && route.tx_ok < route.errors
            && age >= self.cfg.min_route_age
        {
            let route = self.routes.remove(idx);
            info!(
                "source route {} removed: {} errors, {} ok",
                route.uuid(),
                route.errors,
                route.tx_ok
            );
            if let Some(dest) = route.destination().and_then(|d| registry.get_mut(d)) {
                dest.source_routes.retain(|h| *h != route.uuid_hash);
            }
            self.push_trash(route.hop_handles());
            events.push(Event::SourceRouteDeleted {
                uuid: route.uuid,
                uuid_hash: route.uuid_hash,
            });
        }
        events
    }

    /// Rank the routes to one destination and attach the best.
    pub fn select_best_step(&mut self, registry: &mut NodeRegistry) -> Vec<Event> {
        let mut events = Vec::new();
        if !self.cfg.enabled {
            return events;
        }
        let handles = registry.handles();
        if handles.is_empty() {
            return events;
        }
        let node = handles[self.select_cursor % handles.len()];
        self.select_cursor = (self.select_cursor + 1) % handles.len();
        events.extend(self.select_best_for(node, registry));
        events
    }

    /// Rank by tx_ok, then operational, then fewer hops. Earlier routes win ties.
    pub fn select_best_for(&mut self, node: NodeHandle, registry: &mut NodeRegistry) -> Vec<Event> {
        let mut events = Vec::new();
        let key = |r: &SourceRoute| (r.tx_ok, r.is_operational(), std::cmp::Reverse(r.hops.len()));
        let mut best: Option<&SourceRoute> = None;
        for r in self.routes_to(node) {
            if best.map(|b| key(r) > key(b)).unwrap_or(true) {
                best = Some(r);
            }
        }
        let Some(best) = best else {
            return events;
        };
        let Some(dest) = registry.get_mut(node) else {
            return events;
        };
        if dest.source_routes.len() == 1 && dest.source_routes[0] == best.uuid_hash {
            return events;
        }

        let retired: Vec<u32> = dest
            .source_routes
            .iter()
            .copied()
            .filter(|h| *h != best.uuid_hash)
            .collect();
        dest.source_routes.retain(|h| *h == best.uuid_hash);
        for hash in retired {
            if let Some(r) = self.route(hash) {
                events.push(Event::SourceRouteDeleted {
                    uuid: r.uuid.clone(),
                    uuid_hash: hash,
                });
            }
        }
        if dest.source_routes.is_empty() {
            dest.source_routes.push(best.uuid_hash);
            debug!("source route {} promoted", best.uuid());
            events.push(Event::SourceRouteChanged(best.to_ref()));
        }
        events
    }

    /// Relay list for a frame to `node`. Any unusable relay voids the whole route.
    pub fn get_source_route(&self, node: NodeHandle, registry: &NodeRegistry) -> Option<SourceRouteTag> {
        if !self.cfg.enabled {
            return None;
        }
        let hash = *registry.get(node)?.source_routes.first()?;
        let route = self.route(hash)?;
        if !route.is_valid() {
            return None;
        }
        let mut relays = Vec::with_capacity(route.relays().len());
        for hop in route.relays() {
            let n = registry.get(hop.node)?;
            if n.is_zombie() {
                return None;
            }
            relays.push(n.address().nwk()?);
        }
        if relays.is_empty() {
            return None;
        }
        Some(SourceRouteTag {
            uuid_hash: hash,
            relays,
        })
    }

    /// Drop every route through an erased node.
    pub fn purge_node(&mut self, node: NodeHandle, registry: &mut NodeRegistry) -> Vec<Event> {
        let mut events = Vec::new();
        let (gone, keep): (Vec<SourceRoute>, Vec<SourceRoute>) = std::mem::take(&mut self.routes)
            .into_iter()
            .partition(|r| r.contains(node) && r.hops.len() > 1);
        self.routes = keep;
        for r in gone {
            if let Some(dest) = r.destination().and_then(|d| registry.get_mut(d)) {
                dest.source_routes.retain(|h| *h != r.uuid_hash);
            }
            events.push(Event::SourceRouteDeleted {
                uuid: r.uuid,
                uuid_hash: r.uuid_hash,
            });
        }
        // a removed coordinator takes the seed with it
        self.routes.retain(|r| !(r.hops.len() == 1 && r.contains(node)));
        self.trash.retain(|t| !t.path.contains(&node));
        events
    }

    /// Add a hand-made route. The first hop must be the coordinator.
    pub fn add_user_route(
        &mut self,
        path: &[NodeHandle],
        registry: &mut NodeRegistry,
        now: Instant,
    ) -> Result<(u32, Vec<Event>), RouteError> {
        if !self.cfg.enabled {
            return Err(RouteError::Disabled);
        }
        if path.len() < 2 || path.len() > self.cfg.max_hops {
            return Err(RouteError::HopCount {
                got: path.len(),
                max: self.cfg.max_hops,
            });
        }
        if Some(path[0]) != registry.coordinator() {
            return Err(RouteError::NotFromCoordinator);
        }
        let mut hops = Vec::with_capacity(path.len());
        for (i, h) in path.iter().enumerate() {
            if path[..i].contains(h) {
                return Err(RouteError::Cycle(i));
            }
            let n = registry.get(*h).ok_or(RouteError::UnresolvedHop(i))?;
            if !n.address().has_nwk() {
                return Err(RouteError::UnresolvedHop(i));
            }
            let lqi = if i == 0 {
                COORDINATOR_HOP_LQI
            } else {
                registry
                    .get(path[i - 1])
                    .and_then(|p| p.neighbor(*h))
                    .map(|e| e.lqi)
                    .unwrap_or(0)
            };
            hops.push(RouteHop {
                node: *h,
                address: *n.address(),
                lqi,
            });
        }

        let route = SourceRoute::new(RouteOrigin::User, hops, now);
        let hash = route.uuid_hash;
        let mut events = vec![Event::SourceRouteCreated(route.to_ref())];
        let route_ref = route.to_ref();
        self.routes.push(route);
        if let Some(dest) = path.last().and_then(|d| registry.get_mut(*d)) {
            if dest.source_routes.is_empty() {
                dest.source_routes.push(hash);
                events.push(Event::SourceRouteChanged(route_ref));
            }
        }
        Ok((hash, events))
    }
}
