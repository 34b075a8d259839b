//! Liveness classification.
//!
//! One node per run, round-robin, slot 0 (the coordinator) skipped. Receivers
//! that stay on are judged by direct contact; sleepy end devices also count
//! sightings in other nodes' neighbor tables and get a much longer threshold.

use log::info;
use std::time::{Duration, Instant};

use crate::node::Node;
use crate::registry::{NodeHandle, NodeRegistry};

/// Thresholds of the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZombieConfig {
    /// `(mesh size upper bound, threshold)` buckets, ascending.
    pub buckets: Vec<(usize, Duration)>,
    /// Threshold for meshes beyond the last bucket.
    pub max_threshold: Duration,
    pub end_device_threshold: Duration,
    pub max_recv_errors: u32,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            buckets: vec![
                (10, Duration::from_secs(600)),
                (25, Duration::from_secs(1200)),
                (50, Duration::from_secs(1800)),
                (100, Duration::from_secs(2400)),
            ],
            max_threshold: Duration::from_secs(3600),
            end_device_threshold: Duration::from_secs(4 * 3600),
            max_recv_errors: 10,
        }
    }
}

impl ZombieConfig {
    /// Threshold for a receiver-on node in a mesh of `nodes` devices.
    pub fn threshold_for(&self, nodes: usize) -> Duration {
        self.buckets
            .iter()
            .find(|(limit, _)| nodes < *limit)
            .map(|(_, d)| *d)
            .unwrap_or(self.max_threshold)
    }
}

#[derive(Debug)]
pub struct ZombieDetector {
    cfg: ZombieConfig,
    cursor: usize,
}

impl ZombieDetector {
    pub fn new(cfg: ZombieConfig) -> Self {
        Self { cfg, cursor: 0 }
    }

    pub fn config(&self) -> &ZombieConfig {
        &self.cfg
    }

    /// Whether a node should be considered gone at `now`.
    pub fn is_overdue(&self, node: &Node, mesh_size: usize, now: Instant) -> bool {
        let rx_on = node.rx_on_when_idle();
        let (last, threshold) = if rx_on || !node.is_end_device() {
            (node.last_seen, self.cfg.threshold_for(mesh_size))
        } else {
            let last = match node.last_seen_by_neighbor {
                Some(t) if t > node.last_seen => t,
                _ => node.last_seen,
            };
            (last, self.cfg.end_device_threshold)
        };
        now.saturating_duration_since(last) > threshold
            || (rx_on && node.recv_errors > self.cfg.max_recv_errors)
    }

    /// Check the next node. Returns the handle when it just became a zombie.
    pub fn check_step(&mut self, registry: &mut NodeRegistry, now: Instant) -> Option<NodeHandle> {
        let mesh_size = registry.len();
        let handles = registry.handles();
        if handles.len() < 2 {
            return None;
        }
        let mut h = handles[self.cursor % handles.len()];
        self.cursor = (self.cursor + 1) % handles.len();
        if h.is_coordinator_slot() {
            h = handles[self.cursor % handles.len()];
            self.cursor = (self.cursor + 1) % handles.len();
        }

        let overdue = {
            let node = registry.get(h)?;
            if node.is_zombie() || node.is_coordinator() {
                return None;
            }
            self.is_overdue(node, mesh_size, now)
        };
        if !overdue {
            return None;
        }
        let node = registry.get_mut(h)?;
        if node.set_zombie(true) {
            info!(
                "node {} is a zombie (last seen {}s ago, {} errors)",
                node.address(),
                now.saturating_duration_since(node.last_seen).as_secs(),
                node.recv_errors
            );
            return Some(h);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{Address, MacCapabilities};

    #[test]
    fn thresholds_scale_with_mesh() {
        let cfg = ZombieConfig::default();
        assert_eq!(cfg.threshold_for(5), Duration::from_secs(600));
        assert_eq!(cfg.threshold_for(10), Duration::from_secs(1200));
        assert_eq!(cfg.threshold_for(99), Duration::from_secs(2400));
        assert_eq!(cfg.threshold_for(100), Duration::from_secs(3600));
    }

    #[test]
    fn sleepy_device_uses_neighbor_sightings() {
        let t0 = Instant::now();
        let mut reg = NodeRegistry::default();
        reg.set_permit_join(true);
        reg.create_coordinator(0xC0, t0);
        let (h, _) = reg
            .create_node(
                &Address::new(0x10, 0x1010),
                MacCapabilities::ALLOCATE_ADDRESS,
                &MemoryStore::default(),
                t0,
            )
            .unwrap();
        let det = ZombieDetector::new(ZombieConfig::default());
        let later = t0 + Duration::from_secs(5 * 3600);
        assert!(det.is_overdue(reg.get(h).unwrap(), 2, later));
        reg.get_mut(h).unwrap().last_seen_by_neighbor = Some(t0 + Duration::from_secs(3 * 3600));
        assert!(!det.is_overdue(reg.get(h).unwrap(), 2, later));
    }

    #[test]
    fn error_streak_on_receiver() {
        let t0 = Instant::now();
        let mut reg = NodeRegistry::default();
        reg.set_permit_join(true);
        reg.create_coordinator(0xC0, t0);
        let (h, _) = reg
            .create_node(
                &Address::new(0x11, 0x1111),
                MacCapabilities::DEVICE_TYPE_FFD | MacCapabilities::RX_ON_WHEN_IDLE,
                &MemoryStore::default(),
                t0,
            )
            .unwrap();
        reg.get_mut(h).unwrap().recv_errors = 11;
        let mut det = ZombieDetector::new(ZombieConfig::default());
        assert_eq!(det.check_step(&mut reg, t0), Some(h));
        assert_eq!(det.check_step(&mut reg, t0), None);
    }
}
