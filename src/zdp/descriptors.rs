//! Descriptor and table-record types carried in ZDP responses.
//!
//! Field order and widths follow ZigBee core sections 2.3.2 and 2.4.4;
//! everything is little-endian.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::ZdpError;
use crate::types::{DeviceType, MacCapabilities};

pub(crate) fn need(buf: &[u8], n: usize, what: &'static str) -> Result<(), ZdpError> {
    if buf.len() < n {
        return Err(ZdpError::Truncated {
            what,
            len: buf.len(),
        });
    }
    Ok(())
}

/// Node descriptor (13 bytes on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub device_type: DeviceType,
    pub complex_descriptor_available: bool,
    pub user_descriptor_available: bool,
    pub aps_flags: u8,
    pub frequency_band: u8,
    pub mac_capabilities: MacCapabilities,
    pub manufacturer_code: u16,
    pub max_buffer_size: u8,
    pub max_incoming_transfer_size: u16,
    pub server_mask: u16,
    pub max_outgoing_transfer_size: u16,
    pub descriptor_capability: u8,
}

impl NodeDescriptor {
    pub const WIRE_LEN: usize = 13;

    pub fn decode(buf: &mut &[u8]) -> Result<Self, ZdpError> {
        need(buf, Self::WIRE_LEN, "node descriptor")?;
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        let mac = buf.get_u8();
        Ok(Self {
            device_type: DeviceType::from_bits(b0 & 0x07),
            complex_descriptor_available: b0 & 0x08 != 0,
            user_descriptor_available: b0 & 0x10 != 0,
            aps_flags: b1 & 0x07,
            frequency_band: b1 >> 3,
            mac_capabilities: MacCapabilities::from_bits_retain(mac),
            manufacturer_code: buf.get_u16_le(),
            max_buffer_size: buf.get_u8(),
            max_incoming_transfer_size: buf.get_u16_le(),
            server_mask: buf.get_u16_le(),
            max_outgoing_transfer_size: buf.get_u16_le(),
            descriptor_capability: buf.get_u8(),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut b0 = self.device_type.to_bits();
        if self.complex_descriptor_available {
            b0 |= 0x08;
        }
        if self.user_descriptor_available {
            b0 |= 0x10;
        }
        out.put_u8(b0);
        out.put_u8((self.aps_flags & 0x07) | (self.frequency_band << 3));
        out.put_u8(self.mac_capabilities.bits());
        out.put_u16_le(self.manufacturer_code);
        out.put_u8(self.max_buffer_size);
        out.put_u16_le(self.max_incoming_transfer_size);
        out.put_u16_le(self.server_mask);
        out.put_u16_le(self.max_outgoing_transfer_size);
        out.put_u8(self.descriptor_capability);
    }

    /// A plausible descriptor for a given role, used by the simulator and tests.
    pub fn for_role(device_type: DeviceType, caps: MacCapabilities, manufacturer_code: u16) -> Self {
        Self {
            device_type,
            complex_descriptor_available: false,
            user_descriptor_available: false,
            aps_flags: 0,
            frequency_band: 0x08, // 2.4 GHz
            mac_capabilities: caps,
            manufacturer_code,
            max_buffer_size: 0x52,
            max_incoming_transfer_size: 0x0052,
            server_mask: 0x0000,
            max_outgoing_transfer_size: 0x0052,
            descriptor_capability: 0x00,
        }
    }
}

/// Power descriptor (2 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerDescriptor {
    pub current_power_mode: u8,
    pub available_sources: u8,
    pub current_source: u8,
    pub current_level: u8,
}

impl PowerDescriptor {
    pub const WIRE_LEN: usize = 2;

    pub fn decode(buf: &mut &[u8]) -> Result<Self, ZdpError> {
        need(buf, Self::WIRE_LEN, "power descriptor")?;
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        Ok(Self {
            current_power_mode: b0 & 0x0F,
            available_sources: b0 >> 4,
            current_source: b1 & 0x0F,
            current_level: b1 >> 4,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8((self.current_power_mode & 0x0F) | (self.available_sources << 4));
        out.put_u8((self.current_source & 0x0F) | (self.current_level << 4));
    }

    /// Mains source present.
    pub fn mains(&self) -> bool {
        self.current_source & 0x01 != 0
    }
}

/// Simple descriptor of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleDescriptor {
    pub endpoint: u8,
    pub profile_id: u16,
    pub device_id: u16,
    pub device_version: u8,
    pub in_clusters: Vec<u16>,
    pub out_clusters: Vec<u16>,
}

impl SimpleDescriptor {
    pub fn decode(buf: &mut &[u8]) -> Result<Self, ZdpError> {
        need(buf, 7, "simple descriptor")?;
        let endpoint = buf.get_u8();
        let profile_id = buf.get_u16_le();
        let device_id = buf.get_u16_le();
        let device_version = buf.get_u8() & 0x0F;
        let in_count = buf.get_u8() as usize;
        need(buf, in_count * 2 + 1, "simple descriptor clusters")?;
        let in_clusters = (0..in_count).map(|_| buf.get_u16_le()).collect();
        let out_count = buf.get_u8() as usize;
        need(buf, out_count * 2, "simple descriptor clusters")?;
        let out_clusters = (0..out_count).map(|_| buf.get_u16_le()).collect();
        Ok(Self {
            endpoint,
            profile_id,
            device_id,
            device_version,
            in_clusters,
            out_clusters,
        })
    }

    /// Encoded length without the leading length byte.
    pub fn wire_len(&self) -> usize {
        8 + 2 * (self.in_clusters.len() + self.out_clusters.len())
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8(self.endpoint);
        out.put_u16_le(self.profile_id);
        out.put_u16_le(self.device_id);
        out.put_u8(self.device_version & 0x0F);
        out.put_u8(self.in_clusters.len() as u8);
        for c in &self.in_clusters {
            out.put_u16_le(*c);
        }
        out.put_u8(self.out_clusters.len() as u8);
        for c in &self.out_clusters {
            out.put_u16_le(*c);
        }
    }
}

/// Relationship of a neighbor to the reporting device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    Parent,
    Child,
    Sibling,
    None,
    PreviousChild,
}

impl Relationship {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Relationship::Parent,
            1 => Relationship::Child,
            2 => Relationship::Sibling,
            4 => Relationship::PreviousChild,
            _ => Relationship::None,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Relationship::Parent => 0,
            Relationship::Child => 1,
            Relationship::Sibling => 2,
            Relationship::None => 3,
            Relationship::PreviousChild => 4,
        }
    }
}

/// One Mgmt_Lqi_rsp neighbor table record (22 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRecord {
    pub ext_pan_id: u64,
    pub ext: u64,
    pub nwk: u16,
    pub device_type: DeviceType,
    /// 0 = off, 1 = on, 2 = unknown.
    pub rx_on_when_idle: u8,
    pub relationship: Relationship,
    /// 0 = not accepting, 1 = accepting, 2 = unknown.
    pub permit_joining: u8,
    pub depth: u8,
    pub lqi: u8,
}

impl NeighborRecord {
    pub const WIRE_LEN: usize = 22;

    pub fn decode(buf: &mut &[u8]) -> Result<Self, ZdpError> {
        need(buf, Self::WIRE_LEN, "neighbor record")?;
        let ext_pan_id = buf.get_u64_le();
        let ext = buf.get_u64_le();
        let nwk = buf.get_u16_le();
        let b = buf.get_u8();
        let pj = buf.get_u8();
        Ok(Self {
            ext_pan_id,
            ext,
            nwk,
            device_type: DeviceType::from_bits(b & 0x03),
            rx_on_when_idle: (b >> 2) & 0x03,
            relationship: Relationship::from_bits((b >> 4) & 0x07),
            permit_joining: pj & 0x03,
            depth: buf.get_u8(),
            lqi: buf.get_u8(),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u64_le(self.ext_pan_id);
        out.put_u64_le(self.ext);
        out.put_u16_le(self.nwk);
        out.put_u8(
            self.device_type.to_bits()
                | ((self.rx_on_when_idle & 0x03) << 2)
                | (self.relationship.to_bits() << 4),
        );
        out.put_u8(self.permit_joining & 0x03);
        out.put_u8(self.depth);
        out.put_u8(self.lqi);
    }
}

/// Destination of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindTarget {
    Group(u16),
    Ext { ext: u64, endpoint: u8 },
}

/// One binding table record, also the body of Bind_req / Unbind_req.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingRecord {
    pub src_ext: u64,
    pub src_endpoint: u8,
    pub cluster_id: u16,
    pub target: BindTarget,
}

impl BindingRecord {
    pub fn decode(buf: &mut &[u8]) -> Result<Self, ZdpError> {
        need(buf, 12, "binding record")?;
        let src_ext = buf.get_u64_le();
        let src_endpoint = buf.get_u8();
        let cluster_id = buf.get_u16_le();
        let mode = buf.get_u8();
        let target = match mode {
            0x01 => {
                need(buf, 2, "binding record group")?;
                BindTarget::Group(buf.get_u16_le())
            }
            _ => {
                need(buf, 9, "binding record ext")?;
                BindTarget::Ext {
                    ext: buf.get_u64_le(),
                    endpoint: buf.get_u8(),
                }
            }
        };
        Ok(Self {
            src_ext,
            src_endpoint,
            cluster_id,
            target,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u64_le(self.src_ext);
        out.put_u8(self.src_endpoint);
        out.put_u16_le(self.cluster_id);
        match self.target {
            BindTarget::Group(g) => {
                out.put_u8(0x01);
                out.put_u16_le(g);
            }
            BindTarget::Ext { ext, endpoint } => {
                out.put_u8(0x03);
                out.put_u64_le(ext);
                out.put_u8(endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_descriptor_layout() {
        // Router, mains, rx-on, manufacturer 0x1135, 2.4 GHz
        let raw = [
            0x01, 0x40, 0x8E, 0x35, 0x11, 0x52, 0x52, 0x00, 0x00, 0x2C, 0x52, 0x00, 0x00,
        ];
        let mut b = &raw[..];
        let nd = NodeDescriptor::decode(&mut b).unwrap();
        assert_eq!(nd.device_type, DeviceType::Router);
        assert_eq!(nd.frequency_band, 0x08);
        assert!(nd.mac_capabilities.rx_on_when_idle());
        assert!(nd.mac_capabilities.is_ffd());
        assert_eq!(nd.manufacturer_code, 0x1135);
        assert_eq!(nd.server_mask, 0x2C00);
        assert!(b.is_empty());

        let mut out = Vec::new();
        nd.encode(&mut out);
        assert_eq!(out, raw);
    }

    #[test]
    fn simple_descriptor_truncated() {
        // Claims 3 input clusters but carries one.
        let raw = [0x01, 0x04, 0x01, 0x00, 0x01, 0x01, 0x03, 0x06, 0x00];
        let mut b = &raw[..];
        assert!(matches!(
            SimpleDescriptor::decode(&mut b),
            Err(ZdpError::Truncated { .. })
        ));
    }

    #[test]
    fn neighbor_record_bits() {
        let rec = NeighborRecord {
            ext_pan_id: 0xDDDD_0000_0000_0001,
            ext: 0x00212E0000000002,
            nwk: 0x4F21,
            device_type: DeviceType::Router,
            rx_on_when_idle: 1,
            relationship: Relationship::Sibling,
            permit_joining: 2,
            depth: 1,
            lqi: 200,
        };
        let mut out = Vec::new();
        rec.encode(&mut out);
        assert_eq!(out.len(), NeighborRecord::WIRE_LEN);
        assert_eq!(out[18], 0x01 | (1 << 2) | (2 << 4));
        let mut b = &out[..];
        assert_eq!(NeighborRecord::decode(&mut b).unwrap(), rec);
    }
}
