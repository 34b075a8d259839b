//! Bind/Unbind requests issued on behalf of the application.
//!
//! Tasks run strictly one at a time in FIFO order. A task is retried up to
//! [`MAX_BIND_RETRIES`] times when its request fails or goes unanswered.
//! A task whose source is a zombie or has no network address moves to the
//! back of the queue, and is dropped once it has been blocked for
//! [`BIND_BLOCKED_TIMEOUT`].

use log::{debug, info, trace, warn};
use std::time::{Duration, Instant};

use super::Controller;
use crate::node::FetchItem;
use crate::transport::RadioTransport;
use crate::types::{Address, AddressMode};
use crate::zdp::{status, status_name, BindingRecord, ZdpRequest};

pub const MAX_BIND_RETRIES: u8 = 3;
const BIND_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const BIND_BLOCKED_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindState {
    Pending,
    Sent { seq: u8, at: Instant },
}

#[derive(Debug, Clone)]
pub struct BindTask {
    pub record: BindingRecord,
    pub unbind: bool,
    retries: u8,
    state: BindState,
    blocked_since: Option<Instant>,
}

impl BindTask {
    fn new(record: BindingRecord, unbind: bool) -> Self {
        Self {
            record,
            unbind,
            retries: 0,
            state: BindState::Pending,
            blocked_since: None,
        }
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn is_sent(&self) -> bool {
        matches!(self.state, BindState::Sent { .. })
    }

    fn sent_seq(&self) -> Option<u8> {
        match self.state {
            BindState::Sent { seq, .. } => Some(seq),
            BindState::Pending => None,
        }
    }
}

impl<T: RadioTransport> Controller<T> {
    /// Queue a Bind_req. Returns false when the same binding is already queued.
    pub fn bind(&mut self, record: BindingRecord) -> bool {
        self.push_bind_task(BindTask::new(record, false))
    }

    /// Queue an Unbind_req. Returns false when the same request is already queued.
    pub fn unbind(&mut self, record: BindingRecord) -> bool {
        self.push_bind_task(BindTask::new(record, true))
    }

    pub fn bind_tasks(&self) -> impl Iterator<Item = &BindTask> {
        self.bind_tasks.iter()
    }

    fn push_bind_task(&mut self, task: BindTask) -> bool {
        if self
            .bind_tasks
            .iter()
            .any(|t| t.unbind == task.unbind && t.record == task.record)
        {
            return false;
        }
        debug!(
            "{} task queued for {:016X} ep {} cluster 0x{:04X}",
            if task.unbind { "unbind" } else { "bind" },
            task.record.src_ext,
            task.record.src_endpoint,
            task.record.cluster_id
        );
        self.bind_tasks.push_back(task);
        true
    }

    /// Advance the task at the front of the queue.
    pub(crate) fn bind_tick(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        let Some(task) = self.bind_tasks.front() else {
            return;
        };
        let (state, record, unbind) = (task.state, task.record, task.unbind);
        match state {
            BindState::Sent { seq, at } => {
                if now.saturating_duration_since(at) >= BIND_RESPONSE_TIMEOUT {
                    debug!("bind request seq {} unanswered", seq);
                    self.bind_failed(seq);
                }
            }
            BindState::Pending => {
                let src = Address::from_ext(record.src_ext);
                let target = self
                    .registry
                    .get_node(&src, AddressMode::Ext)
                    .and_then(|h| self.registry.get(h).map(|n| (h, n.address().nwk(), n.is_zombie())));
                let (h, nwk) = match target {
                    Some((h, Some(nwk), false)) => (h, nwk),
                    Some((_, _, true)) => {
                        self.bind_blocked(now, "is a zombie");
                        return;
                    }
                    Some((_, None, _)) => {
                        self.bind_blocked(now, "has no network address");
                        return;
                    }
                    None => {
                        warn!("bind source {:016X} is not a known node, dropping task", record.src_ext);
                        self.bind_tasks.pop_front();
                        return;
                    }
                };
                let req = if unbind {
                    ZdpRequest::Unbind(record)
                } else {
                    ZdpRequest::Bind(record)
                };
                match self.send_zdp(h, None, req, Address::from_nwk(nwk), AddressMode::Nwk, now) {
                    Ok(seq) => {
                        if let Some(t) = self.bind_tasks.front_mut() {
                            t.state = BindState::Sent { seq, at: now };
                            t.blocked_since = None;
                        }
                    }
                    Err(e) => debug!("bind request not queued: {}", e),
                }
            }
        }
    }

    /// The front task cannot be sent right now. Let the others go first.
    fn bind_blocked(&mut self, now: Instant, why: &str) {
        let Some(mut task) = self.bind_tasks.pop_front() else {
            return;
        };
        let since = *task.blocked_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= BIND_BLOCKED_TIMEOUT {
            warn!(
                "dropping {} for {:016X}: source {} for {}s",
                if task.unbind { "unbind" } else { "bind" },
                task.record.src_ext,
                why,
                BIND_BLOCKED_TIMEOUT.as_secs()
            );
            return;
        }
        trace!("bind source {:016X} {}, task moved back", task.record.src_ext, why);
        self.bind_tasks.push_back(task);
    }

    /// Bind_rsp / Unbind_rsp for the request with `seq`.
    pub(crate) fn bind_response(&mut self, seq: u8, rsp_status: u8, _now: Instant) {
        let Some(task) = self.bind_tasks.front() else {
            return;
        };
        if task.sent_seq() != Some(seq) {
            debug!("bind response seq {} matches no running task", seq);
            return;
        }
        let unbind = task.unbind;
        match rsp_status {
            status::SUCCESS => {}
            // an unbind of a binding that is not there is done already
            status::NO_ENTRY if unbind => {}
            status::NOT_SUPPORTED | status::NOT_AUTHORIZED | status::TABLE_FULL => {
                warn!(
                    "{} refused: {}",
                    if unbind { "unbind" } else { "bind" },
                    status_name(rsp_status)
                );
                self.bind_tasks.pop_front();
                return;
            }
            _ => {
                debug!("bind response status {}", status_name(rsp_status));
                self.bind_failed(seq);
                return;
            }
        }

        let Some(task) = self.bind_tasks.pop_front() else {
            return;
        };
        info!(
            "{} done for {:016X} ep {} cluster 0x{:04X}",
            if unbind { "unbind" } else { "bind" },
            task.record.src_ext,
            task.record.src_endpoint,
            task.record.cluster_id
        );
        // the binding table changed; read it again
        let src = Address::from_ext(task.record.src_ext);
        if let Some(n) = self
            .registry
            .get_node(&src, AddressMode::Ext)
            .and_then(|h| self.registry.get_mut(h))
        {
            n.fetch.set_enabled(FetchItem::MgmtBind, true);
            n.fetch.set_unfetched(FetchItem::MgmtBind);
            n.mgmt_bind_start = 0;
            n.bind_pages.clear();
        }
    }

    /// The running request failed; retry or give up.
    pub(crate) fn bind_failed(&mut self, seq: u8) {
        let Some(task) = self.bind_tasks.front_mut() else {
            return;
        };
        if task.sent_seq() != Some(seq) {
            return;
        }
        task.retries += 1;
        if task.retries >= MAX_BIND_RETRIES {
            warn!(
                "giving up {} for {:016X} after {} attempts",
                if task.unbind { "unbind" } else { "bind" },
                task.record.src_ext,
                task.retries
            );
            self.bind_tasks.pop_front();
        } else {
            task.state = BindState::Pending;
        }
    }
}
