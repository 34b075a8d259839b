//! Outbound APS request queue with admission control, dispatch limits and
//! timeout bookkeeping.
//!
//! Entries are kept in FIFO order. Only [`ApsRequestQueue::timeout_tick`]
//! removes entries, and it erases at most one per call.

use log::{debug, trace, warn};
use std::time::{Duration, Instant};

use super::{
    ApsDataConfirm, ApsDataRequest, ApsStatus, RequestState, SourceRouteTag, ZdpTag,
};
use crate::error::ApsError;
use crate::registry::{NodeHandle, NodeRegistry};
use crate::routing::engine::SourceRoutingEngine;
use crate::transport::{RadioTransport, SendResult};
use crate::types::{Address, AddressMode};

/// Tunables of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLimits {
    /// Cap on not-yet-sent entries.
    pub max_requests: usize,
    pub max_busy_per_node: usize,
    /// Frames handed to the radio and not yet confirmed.
    pub max_busy: usize,
    pub request_timeout: Duration,
    pub confirmed_timeout: Duration,
    pub busy_fault_threshold: u32,
    pub broadcast_gap_min: Duration,
    pub broadcast_gap_max: Duration,
    /// A destination not heard from for this long counts as stale.
    pub stale_destination: Duration,
    pub max_queued_sleepy: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_requests: 24,
            max_busy_per_node: 2,
            max_busy: 4,
            request_timeout: Duration::from_secs(60),
            confirmed_timeout: Duration::from_secs(10),
            busy_fault_threshold: 50,
            broadcast_gap_min: Duration::from_millis(500),
            broadcast_gap_max: Duration::from_secs(8),
            stale_destination: Duration::from_secs(60),
            max_queued_sleepy: 3,
        }
    }
}

/// Link facts needed for admission.
#[derive(Debug, Clone, Copy)]
pub struct LinkState {
    pub connected: bool,
    pub free_slot: bool,
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing eligible.
    Nothing,
    Sent { id: u8, broadcast: bool },
    /// The radio pushed back; try again later.
    Deferred,
    /// The radio refused the frame for good.
    Rejected(u8),
    /// Too many consecutive busy replies; the network session is considered stuck.
    SystemicFault,
}

/// What a confirm matched.
#[derive(Debug, Clone)]
pub struct ConfirmMatch {
    pub node: Option<NodeHandle>,
    pub zdp: Option<ZdpTag>,
    pub source_route: Option<SourceRouteTag>,
    pub broadcast: bool,
    pub acked: bool,
    pub sent_at: Option<Instant>,
}

/// Bookkeeping result of a timeout pass.
#[derive(Debug, Default)]
pub struct TimeoutReport {
    /// Synthetic confirms for entries that ended without one.
    pub confirms: Vec<ApsDataConfirm>,
    /// ZDP exchanges that ended without a usable response.
    pub failed_zdp: Vec<ZdpTag>,
    pub timeouts: u32,
    pub erased: Option<u8>,
}

#[derive(Debug)]
pub struct ApsRequestQueue {
    entries: Vec<ApsDataRequest>,
    limits: QueueLimits,
    next_id: u8,
    busy_counter: u32,
    broadcast_gap: Duration,
    last_broadcast: Option<Instant>,
}

impl ApsRequestQueue {
    pub fn new(limits: QueueLimits) -> Self {
        let gap = limits.broadcast_gap_min;
        Self {
            entries: Vec::new(),
            limits,
            next_id: 1,
            busy_counter: 0,
            broadcast_gap: gap,
            last_broadcast: None,
        }
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApsDataRequest> {
        self.entries.iter()
    }

    pub fn get(&self, id: u8) -> Option<&ApsDataRequest> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn count_state(&self, state: RequestState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    pub fn busy_counter(&self) -> u32 {
        self.busy_counter
    }

    pub fn broadcast_gap(&self) -> Duration {
        self.broadcast_gap
    }

    fn is_for(e: &ApsDataRequest, node: Option<NodeHandle>, addr: &Address) -> bool {
        match (e.node, node) {
            (Some(a), Some(b)) => a == b,
            _ => e.dst_mode != AddressMode::Group && e.dst.same_device(addr),
        }
    }

    /// Entries to this destination that have not been confirmed yet.
    pub fn unconfirmed_for(&self, node: Option<NodeHandle>, addr: &Address) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state.is_pending() && Self::is_for(e, node, addr))
            .count()
    }

    fn queued_for(&self, node: Option<NodeHandle>, addr: &Address) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.state,
                    RequestState::Idle | RequestState::Busy | RequestState::Confirmed
                ) && Self::is_for(e, node, addr)
            })
            .count()
    }

    /// ZDP requests that are still waiting for their answer.
    pub fn zdp_outstanding(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.zdp_tag().is_some()
                    && matches!(
                        e.state,
                        RequestState::Idle | RequestState::Busy | RequestState::Confirmed
                    )
            })
            .count()
    }

    fn allocate_id(&mut self) -> Option<u8> {
        for _ in 0..255 {
            let id = self.next_id;
            self.next_id = if self.next_id == 255 { 1 } else { self.next_id + 1 };
            if !self.entries.iter().any(|e| e.id == id) {
                return Some(id);
            }
        }
        None
    }

    /// Admission control. On success the request is queued and its id returned;
    /// the caller triggers dispatch.
    pub fn enqueue(
        &mut self,
        mut req: ApsDataRequest,
        registry: &NodeRegistry,
        link: LinkState,
        now: Instant,
    ) -> Result<u8, ApsError> {
        if !link.connected {
            return Err(ApsError::NotConnected);
        }
        if !link.free_slot && self.busy_counter > 0 {
            debug!("aps reject: radio has no free slot (busy counter {})", self.busy_counter);
            return Err(ApsError::QueueIsFull);
        }
        if self.count_state(RequestState::Idle) >= self.limits.max_requests {
            debug!("aps reject: {} idle requests queued", self.limits.max_requests);
            return Err(ApsError::QueueIsFull);
        }

        match req.dst_mode {
            AddressMode::Group => {
                if req.dst.group_id().is_none() {
                    return Err(ApsError::InvalidParameter("group request without group id"));
                }
            }
            _ if req.dst.is_broadcast() => {}
            mode => {
                if !req.dst.has_ext() && !req.dst.has_nwk() {
                    return Err(ApsError::InvalidParameter("unicast request without address"));
                }
                req.node = registry
                    .get_node(&req.dst, mode)
                    .or_else(|| registry.get_node(&req.dst, AddressMode::NwkAndExt));
            }
        }

        if let Some(h) = req.node {
            if registry.is_ghost_coordinator(h) {
                debug!("aps reject: {} is a second coordinator entry", req.dst);
                return Err(ApsError::NodeIsZombie);
            }
            if let Some(node) = registry.get(h) {
                if node.is_zombie() && !req.is_zdp() {
                    debug!("aps reject: {} is a zombie", req.dst);
                    return Err(ApsError::NodeIsZombie);
                }
                let stale =
                    now.saturating_duration_since(node.last_seen) > self.limits.stale_destination;
                if stale && self.unconfirmed_for(req.node, &req.dst) >= 2 {
                    debug!("aps reject: {} has unconfirmed requests and is stale", req.dst);
                    return Err(ApsError::QueueIsFull);
                }
                if node.is_end_device()
                    && !node.rx_on_when_idle()
                    && self.queued_for(req.node, &req.dst) > self.limits.max_queued_sleepy
                {
                    debug!("aps reject: sleepy {} already has queued requests", req.dst);
                    return Err(ApsError::QueueIsFull);
                }
            }
        }

        let id = self.allocate_id().ok_or(ApsError::QueueIsFull)?;
        req.id = id;
        req.state = RequestState::Idle;
        req.confirm_delivered = false;
        req.created = Some(now);
        req.sent_at = None;
        req.confirmed_at = None;

        if req.is_ota_block_response() {
            req.priority = true;
            let pos = self
                .entries
                .iter()
                .position(|e| e.state == RequestState::Idle && !e.priority)
                .unwrap_or(self.entries.len());
            self.entries.insert(pos, req);
        } else {
            self.entries.push(req);
        }
        trace!("aps request {} queued ({} entries)", id, self.entries.len());
        Ok(id)
    }

    /// Hand the first eligible Idle entry to the radio.
    pub fn send_next<T: RadioTransport + ?Sized>(
        &mut self,
        registry: &NodeRegistry,
        routes: Option<&SourceRoutingEngine>,
        transport: &mut T,
        now: Instant,
    ) -> SendOutcome {
        let busy_total = self.count_state(RequestState::Busy);
        if busy_total >= self.limits.max_busy {
            return SendOutcome::Nothing;
        }

        let mut chosen = None;
        for (idx, e) in self.entries.iter().enumerate() {
            if e.state != RequestState::Idle {
                continue;
            }
            if e.send_after.map(|t| now < t).unwrap_or(false) {
                continue;
            }
            if e.is_broadcast_or_group() {
                let ready = self
                    .last_broadcast
                    .map(|t| now.saturating_duration_since(t) >= self.broadcast_gap)
                    .unwrap_or(true);
                if !ready {
                    continue;
                }
            } else if !(e.is_ota_block_response() || e.is_default_response()) {
                let busy_here = self
                    .entries
                    .iter()
                    .filter(|o| o.state == RequestState::Busy && Self::is_for(o, e.node, &e.dst))
                    .count();
                if busy_here >= self.limits.max_busy_per_node {
                    continue;
                }
            }
            chosen = Some(idx);
            break;
        }

        let Some(idx) = chosen else {
            return SendOutcome::Nothing;
        };

        // resolve the missing address half and the source route
        {
            let e = &mut self.entries[idx];
            if !e.is_broadcast_or_group() {
                let node = e
                    .node
                    .and_then(|h| registry.get(h))
                    .or_else(|| {
                        registry
                            .get_node(&e.dst, AddressMode::NwkAndExt)
                            .and_then(|h| registry.get(h))
                    });
                if let Some(node) = node {
                    let a = node.address();
                    if !e.dst.has_nwk() {
                        if let Some(nwk) = a.nwk() {
                            e.dst.set_nwk(nwk);
                        }
                    }
                    if !e.dst.has_ext() {
                        if let Some(ext) = a.ext() {
                            e.dst.set_ext(ext);
                        }
                    }
                }
                if !e.dst.has_nwk() && e.dst_mode != AddressMode::Ext {
                    warn!("aps request {} to {} has no network address", e.id, e.dst);
                    e.state = RequestState::Failure;
                    return SendOutcome::Rejected(e.id);
                }
                e.source_route = match (routes, e.node) {
                    (Some(engine), Some(h)) => engine.get_source_route(h, registry),
                    _ => None,
                };
            }
        }

        let result = transport.send_request(&self.entries[idx]);
        let e = &mut self.entries[idx];
        match result {
            SendResult::Ok => {
                e.state = RequestState::Busy;
                e.sent_at = Some(now);
                self.busy_counter = 0;
                let broadcast = e.is_broadcast_or_group();
                if broadcast {
                    self.last_broadcast = Some(now);
                }
                trace!("aps request {} sent to {}", e.id, e.dst);
                SendOutcome::Sent { id: e.id, broadcast }
            }
            SendResult::Busy => {
                self.busy_counter += 1;
                if e.is_broadcast_or_group() {
                    self.broadcast_congested();
                }
                if self.busy_counter > self.limits.busy_fault_threshold {
                    warn!(
                        "radio busy {} times in a row, declaring systemic fault",
                        self.busy_counter
                    );
                    SendOutcome::SystemicFault
                } else {
                    SendOutcome::Deferred
                }
            }
            SendResult::NotConnected => SendOutcome::Deferred,
            SendResult::Rejected => {
                debug!("aps request {} rejected by radio", e.id);
                e.state = RequestState::Failure;
                SendOutcome::Rejected(e.id)
            }
        }
    }

    pub fn broadcast_congested(&mut self) {
        self.broadcast_gap = (self.broadcast_gap * 2).min(self.limits.broadcast_gap_max);
    }

    pub fn broadcast_succeeded(&mut self) {
        let step = self.limits.broadcast_gap_min;
        self.broadcast_gap = self
            .broadcast_gap
            .saturating_sub(step)
            .max(self.limits.broadcast_gap_min);
    }

    /// Match a confirm to its entry by id, cross-checking the address.
    pub fn on_confirm(&mut self, conf: &ApsDataConfirm, now: Instant) -> Option<ConfirmMatch> {
        let e = self.entries.iter_mut().find(|e| {
            e.id == conf.id
                && e.state == RequestState::Busy
                && match (e.dst.ext(), conf.dst.ext()) {
                    (Some(a), Some(b)) => a == b,
                    _ => match (e.dst.nwk(), conf.dst.nwk()) {
                        (Some(a), Some(b)) => a == b,
                        _ => true,
                    },
                }
        })?;

        e.confirm_delivered = true;
        let expects = e.zdp_tag().map(|z| z.expects_response).unwrap_or(false);
        e.state = if conf.status.is_success() && expects {
            e.confirmed_at = Some(now);
            RequestState::Confirmed
        } else {
            RequestState::Finish
        };
        let m = ConfirmMatch {
            node: e.node,
            zdp: e.zdp_tag(),
            source_route: e.source_route.clone(),
            broadcast: e.is_broadcast_or_group(),
            acked: e.tx_options.contains(super::TxOptions::ACK),
            sent_at: e.sent_at,
        };
        if m.broadcast {
            if conf.status == ApsStatus::MacChannelAccessFailure {
                self.broadcast_congested();
            } else if conf.status.is_success() {
                self.broadcast_succeeded();
            }
        }
        Some(m)
    }

    /// Match a ZDP response to the request that asked for it.
    pub fn match_zdp_response(&mut self, src: &Address, cluster: u16, seq: u8) -> Option<ZdpTag> {
        let req_cluster = cluster & 0x7FFF;
        let e = self.entries.iter_mut().find(|e| {
            matches!(e.state, RequestState::Busy | RequestState::Confirmed)
                && e.zdp_tag()
                    .map(|z| z.seq == seq && z.cluster == req_cluster)
                    .unwrap_or(false)
                && (e.dst.is_broadcast() || e.dst.same_device(src))
        })?;
        let tag = e.zdp;
        e.answered = true;
        // still waiting for the confirm; on_confirm finishes the entry
        if e.state == RequestState::Confirmed {
            e.state = RequestState::Finish;
            e.confirm_delivered = true;
        }
        tag
    }

    /// Terminate everything addressed to a node being erased. Entries are
    /// left undelivered so the next timeout pass surfaces a failure confirm.
    pub fn cancel_for_node(&mut self, node: NodeHandle, addr: &Address) -> usize {
        let mut n = 0;
        for e in self.entries.iter_mut() {
            if matches!(
                e.state,
                RequestState::Idle | RequestState::Busy | RequestState::Confirmed
            ) && Self::is_for(e, Some(node), addr)
            {
                e.state = RequestState::Finish;
                e.confirm_delivered = false;
                n += 1;
            }
        }
        n
    }

    /// Systemic fault: drop all in-flight work.
    pub fn fail_all(&mut self) -> usize {
        let mut n = 0;
        for e in self.entries.iter_mut() {
            if matches!(
                e.state,
                RequestState::Idle | RequestState::Busy | RequestState::Confirmed
            ) {
                e.state = RequestState::Failure;
                n += 1;
            }
        }
        self.busy_counter = 0;
        n
    }

    /// Expire stale entries, surface synthetic confirms and erase at most one
    /// finished entry.
    pub fn timeout_tick(&mut self, now: Instant) -> TimeoutReport {
        let mut report = TimeoutReport::default();
        let limits = &self.limits;

        for e in self.entries.iter_mut() {
            match e.state {
                RequestState::Busy => {
                    let sent = e.sent_at.unwrap_or(now);
                    if now.saturating_duration_since(sent) > limits.request_timeout {
                        debug!("aps request {} to {} timed out waiting for confirm", e.id, e.dst);
                        e.state = RequestState::Failure;
                        report.timeouts += 1;
                    }
                }
                RequestState::Idle => {
                    let created = e.created.unwrap_or(now);
                    if now.saturating_duration_since(created) > limits.request_timeout {
                        debug!("aps request {} to {} never left the queue", e.id, e.dst);
                        e.state = RequestState::Failure;
                        report.timeouts += 1;
                    }
                }
                RequestState::Confirmed => {
                    let at = e.confirmed_at.unwrap_or(now);
                    if now.saturating_duration_since(at) > limits.confirmed_timeout {
                        debug!("zdp response for request {} did not arrive", e.id);
                        e.state = RequestState::Finish;
                        report.timeouts += 1;
                        if let Some(z) = e.zdp_tag() {
                            report.failed_zdp.push(z);
                        }
                    }
                }
                RequestState::Finish | RequestState::Failure => {}
            }

            let undelivered = e.state == RequestState::Failure
                || (e.state == RequestState::Finish && !e.confirm_delivered);
            if undelivered {
                report.confirms.push(ApsDataConfirm {
                    id: e.id,
                    dst: e.dst,
                    dst_endpoint: e.dst_endpoint,
                    src_endpoint: e.src_endpoint,
                    status: ApsStatus::Timeout,
                });
                if let Some(z) = e.zdp_tag() {
                    report.failed_zdp.push(z);
                }
                e.state = RequestState::Finish;
                e.confirm_delivered = true;
            }
        }

        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.state == RequestState::Finish && e.confirm_delivered)
        {
            let e = self.entries.remove(pos);
            report.erased = Some(e.id);
        }
        report
    }
}
