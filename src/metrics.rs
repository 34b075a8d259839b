//! Controller counters.
//!
//! One [`Metrics`] per controller; the runtime shares it behind an `Arc` so a
//! handle can read a [`MetricsSnapshot`] without going through the actor.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ApsError;

#[derive(Debug, Default)]
pub struct Metrics {
    aps_sent: AtomicU64,
    confirms_ok: AtomicU64,
    confirms_failed: AtomicU64,
    timeouts: AtomicU64,
    reject_not_connected: AtomicU64,
    reject_queue_full: AtomicU64,
    reject_zombie: AtomicU64,
    reject_invalid: AtomicU64,
    zdp_requests: AtomicU64,
    zdp_responses: AtomicU64,
    routes_created: AtomicU64,
    routes_deleted: AtomicU64,
    zombie_transitions: AtomicU64,
    wake_transitions: AtomicU64,
    systemic_faults: AtomicU64,
    confirm_latency_sum_ms: AtomicU64,
    confirm_latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_aps_sent(&self) {
        self.aps_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_confirm(&self, ok: bool) {
        if ok {
            self.confirms_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.confirms_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_timeouts(&self, n: u32) {
        self.timeouts.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub fn inc_reject(&self, err: &ApsError) {
        let c = match err {
            ApsError::NotConnected => &self.reject_not_connected,
            ApsError::QueueIsFull => &self.reject_queue_full,
            ApsError::NodeIsZombie => &self.reject_zombie,
            ApsError::InvalidParameter(_) => &self.reject_invalid,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_zdp_request(&self) {
        self.zdp_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_zdp_response(&self) {
        self.zdp_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_route_created(&self) {
        self.routes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_route_deleted(&self) {
        self.routes_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_zombie(&self, zombie: bool) {
        if zombie {
            self.zombie_transitions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.wake_transitions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_systemic_fault(&self) {
        self.systemic_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_confirm_latency(&self, latency: Duration) {
        self.confirm_latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.confirm_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let sum = load(&self.confirm_latency_sum_ms);
        let count = load(&self.confirm_latency_count);
        MetricsSnapshot {
            aps_sent: load(&self.aps_sent),
            confirms_ok: load(&self.confirms_ok),
            confirms_failed: load(&self.confirms_failed),
            timeouts: load(&self.timeouts),
            reject_not_connected: load(&self.reject_not_connected),
            reject_queue_full: load(&self.reject_queue_full),
            reject_zombie: load(&self.reject_zombie),
            reject_invalid: load(&self.reject_invalid),
            zdp_requests: load(&self.zdp_requests),
            zdp_responses: load(&self.zdp_responses),
            routes_created: load(&self.routes_created),
            routes_deleted: load(&self.routes_deleted),
            zombie_transitions: load(&self.zombie_transitions),
            wake_transitions: load(&self.wake_transitions),
            systemic_faults: load(&self.systemic_faults),
            confirm_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub aps_sent: u64,
    pub confirms_ok: u64,
    pub confirms_failed: u64,
    pub timeouts: u64,
    pub reject_not_connected: u64,
    pub reject_queue_full: u64,
    pub reject_zombie: u64,
    pub reject_invalid: u64,
    pub zdp_requests: u64,
    pub zdp_responses: u64,
    pub routes_created: u64,
    pub routes_deleted: u64,
    pub zombie_transitions: u64,
    pub wake_transitions: u64,
    pub systemic_faults: u64,
    pub confirm_latency_avg_ms: Option<u64>,
}
