//! Core addressing and device-classification types shared by every module.
//!
//! A ZigBee device is known by two addresses: the 64-bit extended (IEEE/EUI-64)
//! address, burnt in at manufacture, and the 16-bit network (short) address that
//! the mesh assigns on join and may reassign on rejoin. Either half can be unknown
//! for a while, so [`Address`] keeps both as options.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of the coordinator.
pub const COORDINATOR_NWK: u16 = 0x0000;
/// Lowest network address reserved for broadcasts (0xFFF8..=0xFFFF).
pub const BROADCAST_NWK_MIN: u16 = 0xFFF8;
/// Broadcast to all devices with receiver on when idle.
pub const BROADCAST_RX_ON_WHEN_IDLE: u16 = 0xFFFD;
/// Broadcast to routers and coordinator.
pub const BROADCAST_ROUTERS: u16 = 0xFFFC;
/// Broadcast to every device including sleeping end devices.
pub const BROADCAST_ALL: u16 = 0xFFFF;

/// ZigBee Device Profile.
pub const ZDP_PROFILE_ID: u16 = 0x0000;
/// Home Automation profile.
pub const HA_PROFILE_ID: u16 = 0x0104;
/// ZigBee Device Object endpoint.
pub const ZDO_ENDPOINT: u8 = 0x00;
/// Endpoint used by the coordinator application.
pub const COORDINATOR_ENDPOINT: u8 = 0x01;

/// Addressing mode of an APS frame or of a registry lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    /// 16-bit network address.
    Nwk,
    /// 64-bit extended address.
    Ext,
    /// 16-bit group address.
    Group,
    /// Both network and extended address are set; lookups accept either.
    NwkAndExt,
}

/// A device address pair. Either half may be unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    ext: Option<u64>,
    nwk: Option<u16>,
    group: Option<u16>,
}

impl Address {
    pub fn from_ext(ext: u64) -> Self {
        Self {
            ext: Some(ext),
            ..Default::default()
        }
    }

    pub fn from_nwk(nwk: u16) -> Self {
        Self {
            nwk: Some(nwk),
            ..Default::default()
        }
    }

    pub fn new(ext: u64, nwk: u16) -> Self {
        Self {
            ext: Some(ext),
            nwk: Some(nwk),
            group: None,
        }
    }

    pub fn group(group: u16) -> Self {
        Self {
            group: Some(group),
            ..Default::default()
        }
    }

    pub fn ext(&self) -> Option<u64> {
        self.ext
    }

    pub fn nwk(&self) -> Option<u16> {
        self.nwk
    }

    pub fn group_id(&self) -> Option<u16> {
        self.group
    }

    pub fn has_ext(&self) -> bool {
        self.ext.is_some()
    }

    pub fn has_nwk(&self) -> bool {
        self.nwk.is_some()
    }

    pub fn set_ext(&mut self, ext: u64) {
        self.ext = Some(ext);
    }

    pub fn set_nwk(&mut self, nwk: u16) {
        self.nwk = Some(nwk);
    }

    pub fn clear_nwk(&mut self) {
        self.nwk = None;
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.nwk, Some(n) if n >= BROADCAST_NWK_MIN)
    }

    /// True when both addresses refer to the same device as far as can be told.
    ///
    /// Extended addresses win when both sides carry one; otherwise the network
    /// addresses are compared.
    pub fn same_device(&self, other: &Address) -> bool {
        match (self.ext, other.ext) {
            (Some(a), Some(b)) => a == b,
            _ => match (self.nwk, other.nwk) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ext, self.nwk, self.group) {
            (_, _, Some(g)) => write!(f, "group 0x{:04X}", g),
            (Some(e), Some(n), _) => write!(f, "0x{:016X}/0x{:04X}", e, n),
            (Some(e), None, _) => write!(f, "0x{:016X}/----", e),
            (None, Some(n), _) => write!(f, "----/0x{:04X}", n),
            (None, None, _) => write!(f, "<no address>"),
        }
    }
}

bitflags! {
    /// MAC capability flags as carried in Device_annce and the node descriptor.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MacCapabilities: u8 {
        const ALTERNATE_PAN_COORDINATOR = 0x01;
        /// Full function device (router capable).
        const DEVICE_TYPE_FFD = 0x02;
        const MAINS_POWERED = 0x04;
        const RX_ON_WHEN_IDLE = 0x08;
        const SECURITY = 0x40;
        const ALLOCATE_ADDRESS = 0x80;
    }
}

impl MacCapabilities {
    pub fn is_ffd(&self) -> bool {
        self.contains(Self::DEVICE_TYPE_FFD)
    }

    pub fn rx_on_when_idle(&self) -> bool {
        self.contains(Self::RX_ON_WHEN_IDLE)
    }
}

/// Logical device type as reported in the node descriptor or a neighbor entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Coordinator,
    Router,
    EndDevice,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DeviceType::Coordinator,
            1 => DeviceType::Router,
            2 => DeviceType::EndDevice,
            _ => DeviceType::Unknown,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            DeviceType::Coordinator => 0,
            DeviceType::Router => 1,
            DeviceType::EndDevice => 2,
            DeviceType::Unknown => 3,
        }
    }

    /// Coordinators and routers relay traffic.
    pub fn is_router(self) -> bool {
        matches!(self, DeviceType::Coordinator | DeviceType::Router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_device_prefers_ext() {
        let a = Address::new(0x00212E0000000001, 0x1234);
        let b = Address::new(0x00212E0000000001, 0x9999);
        assert!(a.same_device(&b));
        let c = Address::new(0x00212E0000000002, 0x1234);
        assert!(!a.same_device(&c));
        assert!(Address::from_nwk(0x1234).same_device(&a));
    }

    #[test]
    fn broadcast_detection() {
        assert!(Address::from_nwk(BROADCAST_ROUTERS).is_broadcast());
        assert!(!Address::from_nwk(0x0001).is_broadcast());
        assert!(!Address::from_ext(1).is_broadcast());
    }

    #[test]
    fn device_type_bits() {
        for t in [DeviceType::Coordinator, DeviceType::Router, DeviceType::EndDevice] {
            assert_eq!(DeviceType::from_bits(t.to_bits()), t);
        }
        assert!(DeviceType::Router.is_router());
        assert!(!DeviceType::EndDevice.is_router());
    }
}
