//! # Controller - Mesh Control Plane
//!
//! The `Controller` owns every piece of mesh state and is the only thing that
//! mutates it. It is driven from the outside by three calls:
//!
//! - [`Controller::handle_event`] for confirms, indications and link events
//!   from the radio driver, in delivery order
//! - [`Controller::tick`] at the tick period, running the scheduled tasks
//! - [`Controller::timeout_tick`] at the same period on an independent timer
//!
//! All calls take the current time so the controller never reads a clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Radio          │───→│   Controller    │───→│  NodeRegistry   │
//! │  Transport      │←───│   (dispatch)    │    │  (arena)        │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                               │
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  ApsRequest     │←───│  TickScheduler  │───→│  SourceRouting  │
//! │  Queue          │    │  ZombieDetector │    │  Engine         │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//! ```
//!
//! Observers subscribe through [`Controller::subscribe`]. Events are emitted
//! only after the operation that caused them has finished its cleanup.
mod bind;
mod discovery;
mod link;

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aps::queue::{LinkState, SendOutcome};
use crate::aps::{ApsDataConfirm, ApsDataRequest, ApsRequestQueue, ApsStatus};
use crate::config::Config;
use crate::error::{ApsError, RegistryError, RouteError, StoreError};
use crate::events::{Event, EventBus, EventKind, NodeRef, RouteRef, SubscriptionId};
use crate::metrics::Metrics;
use crate::node::{FetchItem, NodeState};
use crate::registry::{NodeHandle, NodeRegistry};
use crate::routing::SourceRoutingEngine;
use crate::scheduler::{TickScheduler, TickTask};
use crate::storage::{DeviceStore, NodeSnapshot};
use crate::transport::{RadioTransport, TransportEvent};
use crate::types::{Address, DeviceType};
use crate::zombie::ZombieDetector;

pub use bind::{BindTask, BIND_BLOCKED_TIMEOUT, MAX_BIND_RETRIES};
pub use discovery::{DiscoveryTarget, FAST_PROBE_LIFETIME, MAX_FAST_PROBES, MAX_ZDP_OUTSTANDING};

/// How a node is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum DeleteMode {
    /// Erase the node with its queue entries, routes and neighbor references.
    Finally,
    /// Keep the record but flag it zombie.
    Zombie,
    /// Hide from presentation only.
    Hide,
}

/// Read-only summary of one node.
#[derive(Clone, Debug, Serialize)]
pub struct NodeSummary {
    pub handle: NodeHandle,
    pub id: u32,
    pub address: Address,
    pub device_type: DeviceType,
    pub zombie: bool,
    pub hidden: bool,
    pub state: NodeState,
    pub last_seen_secs: u64,
    pub recv_errors: u32,
    pub endpoints: Vec<u8>,
    pub neighbors: usize,
    pub fetched: Vec<FetchItem>,
    pub source_route: Option<String>,
}

/// Read-only summary of the whole controller.
#[derive(Clone, Debug, Serialize)]
pub struct ControllerSnapshot {
    pub connected: bool,
    pub nodes: Vec<NodeSummary>,
    pub routes: Vec<RouteRef>,
    pub queued: usize,
    pub tick: u64,
}

/// Wait applied to a node after a failed delivery.
pub(crate) fn liveness_backoff(status: ApsStatus, recv_errors: u32) -> Duration {
    match status {
        ApsStatus::MacTransactionExpired => Duration::from_secs(180),
        ApsStatus::NwkRouteDiscoveryFailed if recv_errors < 3 => Duration::from_secs(30),
        ApsStatus::NwkRouteDiscoveryFailed => Duration::from_secs(120),
        _ if recv_errors <= 1 => Duration::from_secs(2),
        _ if recv_errors <= 3 => Duration::from_secs(30),
        _ if recv_errors <= 6 => Duration::from_secs(60),
        _ => Duration::from_secs(120),
    }
}

pub struct Controller<T: RadioTransport> {
    config: Config,
    transport: T,
    store: Box<dyn DeviceStore>,
    registry: NodeRegistry,
    queue: ApsRequestQueue,
    routing: SourceRoutingEngine,
    zombie: ZombieDetector,
    scheduler: TickScheduler,
    bus: EventBus,
    metrics: Arc<Metrics>,
    connected: bool,
    zdp_seq: u8,
    fetch_cursor: usize,
    link_cursor: usize,
    fast_probes: Vec<discovery::FastProbe>,
    discovery: VecDeque<DiscoveryTarget>,
    bind_tasks: VecDeque<BindTask>,
}

impl<T: RadioTransport> Controller<T> {
    /// Build a controller and install the local coordinator in slot 0.
    pub fn new(config: Config, transport: T, store: Box<dyn DeviceStore>, now: Instant) -> Result<Self> {
        let mut config = config;
        config.validate();
        let coordinator_ext = config.controller.coordinator_ext()?;

        let mut registry = NodeRegistry::new(config.discovery.fetch_intervals());
        registry.set_permit_join(config.discovery.permit_join);
        let c = registry.create_coordinator(coordinator_ext, now);
        info!(
            "controller up: coordinator {} tick {}ms routing {}",
            c,
            config.controller.tick_ms,
            if config.routing.enabled { "on" } else { "off" }
        );

        Ok(Self {
            queue: ApsRequestQueue::new(config.controller.queue_limits()),
            routing: SourceRoutingEngine::new(config.routing.engine_config()),
            zombie: ZombieDetector::new(config.zombie.detector_config()),
            scheduler: TickScheduler::standard(),
            bus: EventBus::new(),
            metrics: Arc::new(Metrics::new()),
            connected: false,
            zdp_seq: 0,
            fetch_cursor: 0,
            link_cursor: 0,
            fast_probes: Vec::new(),
            discovery: VecDeque::new(),
            bind_tasks: VecDeque::new(),
            config,
            transport,
            store,
            registry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &ApsRequestQueue {
        &self.queue
    }

    pub fn routing(&self) -> &SourceRoutingEngine {
        &self.routing
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_permit_join(&mut self, permit: bool) {
        info!("permit join {}", if permit { "open" } else { "closed" });
        self.registry.set_permit_join(permit);
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.bus.subscribe_all(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub(crate) fn node_ref(&self, h: NodeHandle) -> Option<NodeRef> {
        self.registry.get(h).map(|n| NodeRef {
            handle: h,
            id: n.id(),
            address: *n.address(),
        })
    }

    pub(crate) fn emit_all(&mut self, events: Vec<Event>) {
        for e in events {
            match &e {
                Event::SourceRouteCreated(_) => self.metrics.inc_route_created(),
                Event::SourceRouteDeleted { .. } => self.metrics.inc_route_deleted(),
                Event::NodeZombieChanged { zombie, .. } => self.metrics.inc_zombie(*zombie),
                _ => {}
            }
            self.bus.emit(&e);
        }
    }

    pub(crate) fn next_zdp_seq(&mut self) -> u8 {
        self.zdp_seq = self.zdp_seq.wrapping_add(1);
        self.zdp_seq
    }

    /// Flip a node's zombie flag and record the event when it changed.
    pub(crate) fn set_zombie(&mut self, h: NodeHandle, zombie: bool, events: &mut Vec<Event>) {
        let changed = self
            .registry
            .get_mut(h)
            .map(|n| n.set_zombie(zombie))
            .unwrap_or(false);
        if changed {
            if !zombie {
                info!("node {} woke up", h);
            }
            if let Some(node) = self.node_ref(h) {
                events.push(Event::NodeZombieChanged { node, zombie });
            }
        }
    }

    /// APSDE-DATA.request: admission, then an immediate dispatch attempt.
    pub fn apsde_data_request(&mut self, req: ApsDataRequest, now: Instant) -> Result<u8, ApsError> {
        let link = LinkState {
            connected: self.connected,
            free_slot: self.transport.has_free_slot(),
        };
        let dst = req.dst;
        match self.queue.enqueue(req, &self.registry, link, now) {
            Ok(id) => {
                self.send_pending(now);
                Ok(id)
            }
            Err(e) => {
                debug!("aps request to {} rejected: {}", dst, e);
                self.metrics.inc_reject(&e);
                Err(e)
            }
        }
    }

    /// Hand queued frames to the radio until nothing more is eligible.
    pub(crate) fn send_pending(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        let budget = self.queue.limits().max_busy.max(1);
        for _ in 0..budget {
            let routes = if self.routing.is_enabled() {
                Some(&self.routing)
            } else {
                None
            };
            match self
                .queue
                .send_next(&self.registry, routes, &mut self.transport, now)
            {
                SendOutcome::Sent { .. } => self.metrics.inc_aps_sent(),
                SendOutcome::Rejected(id) => trace!("aps request {} dropped by radio", id),
                SendOutcome::Nothing | SendOutcome::Deferred => break,
                SendOutcome::SystemicFault => {
                    self.systemic_fault();
                    break;
                }
            }
        }
    }

    /// The radio kept answering busy; drop everything and rejoin.
    fn systemic_fault(&mut self) {
        warn!("systemic fault: failing all in-flight requests and rejoining the network");
        self.metrics.inc_systemic_fault();
        let n = self.queue.fail_all();
        debug!("{} requests failed by systemic fault", n);
        self.transport.leave_and_rejoin();
        self.emit_all(vec![Event::NetworkReset]);
    }

    /// Process one event from the radio driver.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected => {
                info!("radio connected");
                self.connected = true;
            }
            TransportEvent::Disconnected { reason } => {
                warn!("radio disconnected: {}", reason);
                self.connected = false;
                self.queue.fail_all();
            }
            TransportEvent::Confirm(conf) => self.on_confirm(conf, now),
            TransportEvent::Indication(ind) => self.on_indication(ind, now),
            TransportEvent::MacPoll { address, lifetime } => {
                trace!("mac poll from {} lifetime {}", address, lifetime);
                self.on_contact(&address, now);
            }
            TransportEvent::Beacon {
                source,
                channel,
                update_id,
            } => {
                trace!(
                    "beacon from 0x{:04X} channel {} update id {}",
                    source,
                    channel,
                    update_id
                );
                self.on_contact(&Address::from_nwk(source), now);
            }
        }
        self.send_pending(now);
    }

    /// Direct sign of life from a device that is not a data frame.
    fn on_contact(&mut self, address: &Address, now: Instant) {
        let Some(h) = self
            .registry
            .get_node(address, crate::types::AddressMode::NwkAndExt)
        else {
            return;
        };
        if let Some(n) = self.registry.get_mut(h) {
            n.touch(now);
        }
        let mut events = Vec::new();
        self.set_zombie(h, false, &mut events);
        self.emit_all(events);
    }

    fn on_confirm(&mut self, conf: ApsDataConfirm, now: Instant) {
        let ok = conf.status.is_success();
        self.metrics.inc_confirm(ok);
        let mut events = Vec::new();

        match self.queue.on_confirm(&conf, now) {
            None => debug!("confirm id {} for {} matches no request", conf.id, conf.dst),
            Some(m) => {
                if let Some(sent) = m.sent_at {
                    self.metrics
                        .observe_confirm_latency(now.saturating_duration_since(sent));
                }
                if let Some(tag) = &m.source_route {
                    self.routing.record_tx(tag.uuid_hash, ok);
                }
                if let Some(h) = m.node.filter(|_| !m.broadcast) {
                    self.apply_delivery_status(h, conf.status, m.acked, now, &mut events);
                }
                if let Some(z) = m.zdp {
                    if !ok {
                        self.zdp_failed(z, now);
                    }
                }
            }
        }

        events.push(Event::ApsDataConfirm(conf));
        self.emit_all(events);
    }

    /// Liveness bookkeeping from a unicast confirm.
    fn apply_delivery_status(
        &mut self,
        h: NodeHandle,
        status: ApsStatus,
        acked: bool,
        now: Instant,
        events: &mut Vec<Event>,
    ) {
        let Some(node) = self.registry.get_mut(h) else {
            return;
        };
        if status.is_success() {
            node.recv_errors = 0;
            if acked {
                node.touch(now);
                self.set_zombie(h, false, events);
            }
            return;
        }

        node.recv_errors = node.recv_errors.saturating_add(1);
        let errors = node.recv_errors;
        if status == ApsStatus::MacTransactionExpired && !node.rx_on_when_idle() {
            debug!("node {} is asleep ({} errors)", node.address(), errors);
            node.set_state(NodeState::Sleep);
            return;
        }
        let wait = liveness_backoff(status, errors);
        debug!(
            "node {} delivery failed with {}, waiting {}s ({} errors)",
            node.address(),
            status,
            wait.as_secs(),
            errors
        );
        node.set_wait(now, wait);
    }

    /// Run the tasks due on this tick, then dispatch.
    pub fn tick(&mut self, now: Instant) {
        for task in self.scheduler.advance() {
            match task {
                TickTask::ZombieCheck => self.zombie_check(now),
                TickTask::LinkMaintenance => self.link_maintenance_step(now),
                TickTask::DeviceDiscovery => self.discovery_step(now),
                TickTask::RouteCalculation => self.route_step(now),
                TickTask::FetchZdp => self.fetch_zdp_tick(now),
                TickTask::Bind => self.bind_tick(now),
            }
        }
        self.send_pending(now);
    }

    fn zombie_check(&mut self, now: Instant) {
        if let Some(h) = self.zombie.check_step(&mut self.registry, now) {
            if let Some(node) = self.node_ref(h) {
                self.emit_all(vec![Event::NodeZombieChanged { node, zombie: true }]);
            }
        }
    }

    fn route_step(&mut self, now: Instant) {
        if !self.routing.is_enabled() {
            return;
        }
        let mut events = self.routing.calculate_step(&mut self.registry, now);
        events.extend(self.routing.select_best_step(&mut self.registry));
        self.emit_all(events);
    }

    /// Expire stale queue entries and surface synthetic confirms.
    pub fn timeout_tick(&mut self, now: Instant) {
        let report = self.queue.timeout_tick(now);
        if report.timeouts > 0 {
            self.metrics.add_timeouts(report.timeouts);
        }
        for z in report.failed_zdp {
            self.zdp_failed(z, now);
        }
        let mut events = Vec::with_capacity(report.confirms.len());
        for conf in report.confirms {
            self.metrics.inc_confirm(false);
            events.push(Event::ApsDataConfirm(conf));
        }
        self.emit_all(events);
        self.send_pending(now);
    }

    /// Delete a node. `Finally` cancels its queue entries, drops every route
    /// through it and erases it from the registry and the store.
    pub fn delete_node(&mut self, h: NodeHandle, mode: DeleteMode) -> Result<(), RegistryError> {
        if h.is_coordinator_slot() {
            return Err(RegistryError::Coordinator);
        }
        let node_ref = self.node_ref(h).ok_or(RegistryError::StaleHandle)?;
        let mut events = Vec::new();
        match mode {
            DeleteMode::Hide => {
                if let Some(n) = self.registry.get_mut(h) {
                    n.hidden = true;
                }
            }
            DeleteMode::Zombie => self.set_zombie(h, true, &mut events),
            DeleteMode::Finally => {
                let addr = node_ref.address;
                let cancelled = self.queue.cancel_for_node(h, &addr);
                events.extend(self.routing.purge_node(h, &mut self.registry));
                self.fast_probes.retain(|p| p.node != h);
                self.discovery.retain(|d| !d.matches(&addr));
                if let Some(ext) = addr.ext() {
                    self.bind_tasks.retain(|t| t.record.src_ext != ext);
                }
                self.registry.remove(h)?;
                if let Some(ext) = addr.ext() {
                    if let Err(e) = self.store.forget(ext) {
                        warn!("failed to forget {} in the node store: {}", addr, e);
                    }
                }
                info!(
                    "node {} deleted ({} queued requests cancelled)",
                    addr, cancelled
                );
                events.push(Event::NodeRemoved(node_ref));
            }
        }
        self.emit_all(events);
        Ok(())
    }

    /// Add a hand-made source route. `path[0]` must be the coordinator.
    pub fn add_user_route(&mut self, path: &[NodeHandle], now: Instant) -> Result<u32, RouteError> {
        let (hash, events) = self.routing.add_user_route(path, &mut self.registry, now)?;
        info!("user source route 0x{:08X} added ({} hops)", hash, path.len());
        self.emit_all(events);
        Ok(hash)
    }

    /// Restore the node table from the store. Returns the number of nodes added.
    pub fn load_nodes_from_store(&mut self, now: Instant) -> Result<usize, StoreError> {
        let snapshots = self.store.load_nodes()?;
        let coordinator_ext = self
            .registry
            .coordinator()
            .and_then(|c| self.registry.get(c))
            .and_then(|n| n.address().ext());
        let mut events = Vec::new();
        let mut added = 0;
        for snap in snapshots {
            if Some(snap.ext) == coordinator_ext {
                continue;
            }
            let addr = match snap.nwk {
                Some(nwk) => Address::new(snap.ext, nwk),
                None => Address::from_ext(snap.ext),
            };
            let (h, created) = match self.registry.create_node(
                &addr,
                snap.mac_capabilities,
                self.store.as_ref(),
                now,
            ) {
                Ok(r) => r,
                Err(e) => {
                    warn!("stored node {} not restored: {}", addr, e);
                    continue;
                }
            };
            if !created {
                continue;
            }
            if let Some(node) = self.registry.get_mut(h) {
                restore_snapshot(node, snap, now);
            }
            added += 1;
            if let Some(r) = self.node_ref(h) {
                events.push(Event::NodeAdded(r));
            }
        }
        info!("{} nodes restored from the store", added);
        self.emit_all(events);
        Ok(added)
    }

    /// Persist every node with a known extended address.
    pub fn save_nodes_state(&mut self, now: Instant) -> Result<usize, StoreError> {
        let wall = Utc::now();
        let snaps: Vec<NodeSnapshot> = self
            .registry
            .iter()
            .filter(|(_, n)| !n.is_coordinator())
            .filter_map(|(_, n)| {
                let ext = n.address().ext()?;
                let age = chrono::Duration::from_std(now.saturating_duration_since(n.last_seen)).ok();
                Some(NodeSnapshot {
                    ext,
                    nwk: n.address().nwk(),
                    mac_capabilities: n.mac_capabilities,
                    node_descriptor: n.node_descriptor.clone(),
                    power_descriptor: n.power_descriptor.clone(),
                    user_descriptor: n.user_descriptor.clone(),
                    endpoints: n.endpoints.clone(),
                    simple_descriptors: n.simple_descriptors.clone(),
                    zombie: n.is_zombie(),
                    firmware: n.firmware,
                    last_seen: age.map(|a| wall - a),
                })
            })
            .collect();
        self.store.save_nodes(&snaps)?;
        debug!("{} nodes saved", snaps.len());
        Ok(snaps.len())
    }

    pub fn node_summaries(&self, now: Instant) -> Vec<NodeSummary> {
        self.registry
            .iter()
            .map(|(h, n)| NodeSummary {
                handle: h,
                id: n.id(),
                address: *n.address(),
                device_type: n.device_type(),
                zombie: n.is_zombie(),
                hidden: n.hidden,
                state: n.state(now),
                last_seen_secs: now.saturating_duration_since(n.last_seen).as_secs(),
                recv_errors: n.recv_errors,
                endpoints: n.endpoints.clone(),
                neighbors: n.neighbors.len(),
                fetched: FetchItem::ALL
                    .iter()
                    .copied()
                    .filter(|i| n.fetch.get(*i).fetched)
                    .collect(),
                source_route: n
                    .source_routes
                    .first()
                    .and_then(|hash| self.routing.route(*hash))
                    .map(|r| r.uuid().to_string()),
            })
            .collect()
    }

    pub fn snapshot(&self, now: Instant) -> ControllerSnapshot {
        ControllerSnapshot {
            connected: self.connected,
            nodes: self.node_summaries(now),
            routes: self
                .routing
                .routes()
                .iter()
                .filter(|r| r.destination().is_some())
                .map(|r| r.to_ref())
                .collect(),
            queued: self.queue.len(),
            tick: self.scheduler.current_tick(),
        }
    }
}

fn restore_snapshot(node: &mut crate::node::Node, snap: NodeSnapshot, now: Instant) {
    if let Some(nd) = snap.node_descriptor {
        node.node_descriptor = Some(nd);
        node.fetch.set_fetched(FetchItem::NodeDescriptor, now);
    }
    if let Some(pd) = snap.power_descriptor {
        node.power_descriptor = Some(pd);
        node.fetch.set_fetched(FetchItem::PowerDescriptor, now);
    }
    if snap.user_descriptor.is_some() {
        node.user_descriptor = snap.user_descriptor;
        node.fetch.set_fetched(FetchItem::UserDescriptor, now);
    }
    if !snap.endpoints.is_empty() {
        node.endpoints = snap.endpoints;
        node.fetch.set_fetched(FetchItem::ActiveEndpoints, now);
    }
    for sd in snap.simple_descriptors {
        node.set_simple_descriptor(sd);
    }
    if node.fetch.get(FetchItem::ActiveEndpoints).fetched && node.missing_simple_descriptor().is_none() {
        node.fetch.set_fetched(FetchItem::SimpleDescriptor, now);
    }
    node.firmware = snap.firmware;
    if let Some(seen) = snap.last_seen {
        let age = (Utc::now() - seen).to_std().unwrap_or_default();
        node.last_seen = now.checked_sub(age).unwrap_or(now);
    }
    node.set_zombie(snap.zombie);
}
