//! Source routes: explicit relay chains from the coordinator to a device.

pub mod engine;

use crc::{Crc, CRC_32_ISO_HDLC};
use std::time::Instant;
use uuid::Uuid;

use crate::events::RouteRef;
use crate::registry::NodeHandle;
use crate::types::Address;

pub use engine::{RoutingConfig, SourceRoutingEngine};

/// Errors beyond which a route that does not deliver is dropped.
pub const MAX_ROUTE_ERRORS: u32 = 6;
/// A route with more errors than this is not operational.
pub const OPERATIONAL_MAX_ERRORS: u32 = 2;
/// Synthetic LQI of the coordinator hop.
pub const COORDINATOR_HOP_LQI: u8 = 255;

const UUID_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Who created a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOrigin {
    Auto,
    User,
}

impl RouteOrigin {
    fn prefix(self) -> &'static str {
        match self {
            RouteOrigin::Auto => "auto-",
            RouteOrigin::User => "user-",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteHop {
    pub node: NodeHandle,
    pub address: Address,
    /// LQI of the link from the previous hop to this one.
    pub lqi: u8,
}

#[derive(Clone, Debug)]
pub struct SourceRoute {
    uuid: String,
    uuid_hash: u32,
    hops: Vec<RouteHop>,
    pub tx_ok: u32,
    pub errors: u32,
    created_at: Instant,
    origin: RouteOrigin,
}

impl SourceRoute {
    pub fn new(origin: RouteOrigin, hops: Vec<RouteHop>, now: Instant) -> Self {
        let uuid = format!("{}{}", origin.prefix(), Uuid::new_v4());
        let uuid_hash = UUID_CRC.checksum(uuid.as_bytes());
        Self {
            uuid,
            uuid_hash,
            hops,
            tx_ok: 0,
            errors: 0,
            created_at: now,
            origin,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn uuid_hash(&self) -> u32 {
        self.uuid_hash
    }

    pub fn origin(&self) -> RouteOrigin {
        self.origin
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn hops(&self) -> &[RouteHop] {
        &self.hops
    }

    /// LQI samples can change; the hop sequence cannot.
    pub fn set_hop_lqi(&mut self, index: usize, lqi: u8) {
        if let Some(h) = self.hops.get_mut(index) {
            h.lqi = lqi;
        }
    }

    pub fn hop_handles(&self) -> Vec<NodeHandle> {
        self.hops.iter().map(|h| h.node).collect()
    }

    pub fn destination(&self) -> Option<NodeHandle> {
        if self.hops.len() < 2 {
            return None;
        }
        self.hops.last().map(|h| h.node)
    }

    pub fn last_hop(&self) -> Option<&RouteHop> {
        self.hops.last()
    }

    /// Hops between coordinator and destination.
    pub fn relays(&self) -> &[RouteHop] {
        if self.hops.len() <= 2 {
            return &[];
        }
        &self.hops[1..self.hops.len() - 1]
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        self.hops.iter().any(|h| h.node == node)
    }

    pub fn same_path(&self, path: &[NodeHandle]) -> bool {
        self.hops.len() == path.len() && self.hops.iter().zip(path).all(|(h, p)| h.node == *p)
    }

    /// Coordinator plus at least one hop, every hop with a network address.
    pub fn is_valid(&self) -> bool {
        self.hops.len() >= 2 && self.hops.iter().all(|h| h.address.has_nwk())
    }

    /// Valid, low on errors and every link has an LQI sample.
    pub fn is_operational(&self) -> bool {
        self.is_valid()
            && self.errors <= OPERATIONAL_MAX_ERRORS
            && self.hops.iter().all(|h| h.lqi > 0)
    }

    pub fn to_ref(&self) -> RouteRef {
        RouteRef {
            uuid: self.uuid.clone(),
            uuid_hash: self.uuid_hash,
            destination: self.destination(),
            hops: self.hops.iter().map(|h| h.address).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_counter_changes() {
        let now = Instant::now();
        let mut r = SourceRoute::new(RouteOrigin::Auto, Vec::new(), now);
        let hash = r.uuid_hash();
        assert!(r.uuid().starts_with("auto-"));
        r.tx_ok += 10;
        r.errors += 3;
        r.set_hop_lqi(0, 7);
        assert_eq!(r.uuid_hash(), hash);
        assert_eq!(hash, UUID_CRC.checksum(r.uuid().as_bytes()));
    }

    #[test]
    fn user_prefix() {
        let r = SourceRoute::new(RouteOrigin::User, Vec::new(), Instant::now());
        assert!(r.uuid().starts_with("user-"));
        assert!(!r.is_valid());
    }
}
