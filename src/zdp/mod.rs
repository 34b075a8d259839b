//! # ZigBee Device Profile codec
//!
//! Builders for the ZDP requests the controller issues while discovering the
//! mesh, and decoders for the matching responses. Every ZDP frame starts with
//! the transaction sequence number; the remaining layout follows ZigBee core
//! section 2.4 byte for byte (little-endian).
//!
//! Response frames for a request cluster `c` use cluster `c | 0x8000`.

pub mod descriptors;

use bytes::{Buf, BufMut};

use crate::error::ZdpError;
use crate::types::MacCapabilities;
use descriptors::need;
pub use descriptors::{
    BindTarget, BindingRecord, NeighborRecord, NodeDescriptor, PowerDescriptor, Relationship,
    SimpleDescriptor,
};

/// ZDP cluster identifiers.
pub mod cluster {
    pub const NWK_ADDR_REQ: u16 = 0x0000;
    pub const IEEE_ADDR_REQ: u16 = 0x0001;
    pub const NODE_DESC_REQ: u16 = 0x0002;
    pub const POWER_DESC_REQ: u16 = 0x0003;
    pub const SIMPLE_DESC_REQ: u16 = 0x0004;
    pub const ACTIVE_EP_REQ: u16 = 0x0005;
    pub const USER_DESC_REQ: u16 = 0x0011;
    pub const DEVICE_ANNCE: u16 = 0x0013;
    pub const BIND_REQ: u16 = 0x0021;
    pub const UNBIND_REQ: u16 = 0x0022;
    pub const MGMT_LQI_REQ: u16 = 0x0031;
    pub const MGMT_BIND_REQ: u16 = 0x0033;
    pub const MGMT_LEAVE_REQ: u16 = 0x0034;

    /// Bit set on every response cluster id.
    pub const RESPONSE_FLAG: u16 = 0x8000;

    pub const fn response_of(request: u16) -> u16 {
        request | RESPONSE_FLAG
    }

    pub const fn is_response(cluster: u16) -> bool {
        cluster & RESPONSE_FLAG != 0
    }
}

/// ZDP status codes.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const INV_REQUESTTYPE: u8 = 0x80;
    pub const DEVICE_NOT_FOUND: u8 = 0x81;
    pub const INVALID_EP: u8 = 0x82;
    pub const NOT_ACTIVE: u8 = 0x83;
    pub const NOT_SUPPORTED: u8 = 0x84;
    pub const TIMEOUT: u8 = 0x85;
    pub const NO_MATCH: u8 = 0x86;
    pub const NO_ENTRY: u8 = 0x88;
    pub const NO_DESCRIPTOR: u8 = 0x89;
    pub const INSUFFICIENT_SPACE: u8 = 0x8A;
    pub const NOT_PERMITTED: u8 = 0x8B;
    pub const TABLE_FULL: u8 = 0x8C;
    pub const NOT_AUTHORIZED: u8 = 0x8D;
}

/// A ZDP request the controller knows how to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZdpRequest {
    NwkAddr { ext: u64, extended: bool, start_index: u8 },
    IeeeAddr { nwk: u16, extended: bool, start_index: u8 },
    NodeDescriptor { nwk: u16 },
    PowerDescriptor { nwk: u16 },
    SimpleDescriptor { nwk: u16, endpoint: u8 },
    ActiveEndpoints { nwk: u16 },
    UserDescriptor { nwk: u16 },
    MgmtLqi { start_index: u8 },
    MgmtBind { start_index: u8 },
    Bind(BindingRecord),
    Unbind(BindingRecord),
    MgmtLeave { ext: u64, rejoin: bool, remove_children: bool },
}

impl ZdpRequest {
    pub fn cluster_id(&self) -> u16 {
        match self {
            ZdpRequest::NwkAddr { .. } => cluster::NWK_ADDR_REQ,
            ZdpRequest::IeeeAddr { .. } => cluster::IEEE_ADDR_REQ,
            ZdpRequest::NodeDescriptor { .. } => cluster::NODE_DESC_REQ,
            ZdpRequest::PowerDescriptor { .. } => cluster::POWER_DESC_REQ,
            ZdpRequest::SimpleDescriptor { .. } => cluster::SIMPLE_DESC_REQ,
            ZdpRequest::ActiveEndpoints { .. } => cluster::ACTIVE_EP_REQ,
            ZdpRequest::UserDescriptor { .. } => cluster::USER_DESC_REQ,
            ZdpRequest::MgmtLqi { .. } => cluster::MGMT_LQI_REQ,
            ZdpRequest::MgmtBind { .. } => cluster::MGMT_BIND_REQ,
            ZdpRequest::Bind(_) => cluster::BIND_REQ,
            ZdpRequest::Unbind(_) => cluster::UNBIND_REQ,
            ZdpRequest::MgmtLeave { .. } => cluster::MGMT_LEAVE_REQ,
        }
    }

    /// Encode the request ASDU, sequence number first.
    pub fn encode(&self, seq: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.put_u8(seq);
        match self {
            ZdpRequest::NwkAddr {
                ext,
                extended,
                start_index,
            } => {
                out.put_u64_le(*ext);
                out.put_u8(u8::from(*extended));
                out.put_u8(*start_index);
            }
            ZdpRequest::IeeeAddr {
                nwk,
                extended,
                start_index,
            } => {
                out.put_u16_le(*nwk);
                out.put_u8(u8::from(*extended));
                out.put_u8(*start_index);
            }
            ZdpRequest::NodeDescriptor { nwk }
            | ZdpRequest::PowerDescriptor { nwk }
            | ZdpRequest::ActiveEndpoints { nwk }
            | ZdpRequest::UserDescriptor { nwk } => out.put_u16_le(*nwk),
            ZdpRequest::SimpleDescriptor { nwk, endpoint } => {
                out.put_u16_le(*nwk);
                out.put_u8(*endpoint);
            }
            ZdpRequest::MgmtLqi { start_index } | ZdpRequest::MgmtBind { start_index } => {
                out.put_u8(*start_index)
            }
            ZdpRequest::Bind(rec) | ZdpRequest::Unbind(rec) => rec.encode(&mut out),
            ZdpRequest::MgmtLeave {
                ext,
                rejoin,
                remove_children,
            } => {
                out.put_u64_le(*ext);
                let mut flags = 0u8;
                if *remove_children {
                    flags |= 0x40;
                }
                if *rejoin {
                    flags |= 0x80;
                }
                out.put_u8(flags);
            }
        }
        out
    }
}

/// Decoded ZDP response (or unsolicited ZDP indication such as Device_annce).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZdpResponse {
    NwkAddr {
        status: u8,
        ext: u64,
        nwk: u16,
        associated: Vec<u16>,
    },
    IeeeAddr {
        status: u8,
        ext: u64,
        nwk: u16,
        associated: Vec<u16>,
    },
    NodeDescriptor {
        status: u8,
        nwk: u16,
        descriptor: Option<NodeDescriptor>,
    },
    PowerDescriptor {
        status: u8,
        nwk: u16,
        descriptor: Option<PowerDescriptor>,
    },
    SimpleDescriptor {
        status: u8,
        nwk: u16,
        descriptor: Option<SimpleDescriptor>,
    },
    ActiveEndpoints {
        status: u8,
        nwk: u16,
        endpoints: Vec<u8>,
    },
    UserDescriptor {
        status: u8,
        nwk: u16,
        text: Option<String>,
    },
    MgmtLqi {
        status: u8,
        total: u8,
        start_index: u8,
        neighbors: Vec<NeighborRecord>,
    },
    MgmtBind {
        status: u8,
        total: u8,
        start_index: u8,
        bindings: Vec<BindingRecord>,
    },
    Bind {
        status: u8,
    },
    Unbind {
        status: u8,
    },
    MgmtLeave {
        status: u8,
    },
    DeviceAnnounce {
        nwk: u16,
        ext: u64,
        capabilities: MacCapabilities,
    },
}

impl ZdpResponse {
    /// Status byte; Device_annce carries none and reports success.
    pub fn status(&self) -> u8 {
        match self {
            ZdpResponse::NwkAddr { status, .. }
            | ZdpResponse::IeeeAddr { status, .. }
            | ZdpResponse::NodeDescriptor { status, .. }
            | ZdpResponse::PowerDescriptor { status, .. }
            | ZdpResponse::SimpleDescriptor { status, .. }
            | ZdpResponse::ActiveEndpoints { status, .. }
            | ZdpResponse::UserDescriptor { status, .. }
            | ZdpResponse::MgmtLqi { status, .. }
            | ZdpResponse::MgmtBind { status, .. }
            | ZdpResponse::Bind { status }
            | ZdpResponse::Unbind { status }
            | ZdpResponse::MgmtLeave { status } => *status,
            ZdpResponse::DeviceAnnounce { .. } => status::SUCCESS,
        }
    }

    pub fn cluster_id(&self) -> u16 {
        match self {
            ZdpResponse::NwkAddr { .. } => cluster::response_of(cluster::NWK_ADDR_REQ),
            ZdpResponse::IeeeAddr { .. } => cluster::response_of(cluster::IEEE_ADDR_REQ),
            ZdpResponse::NodeDescriptor { .. } => cluster::response_of(cluster::NODE_DESC_REQ),
            ZdpResponse::PowerDescriptor { .. } => cluster::response_of(cluster::POWER_DESC_REQ),
            ZdpResponse::SimpleDescriptor { .. } => {
                cluster::response_of(cluster::SIMPLE_DESC_REQ)
            }
            ZdpResponse::ActiveEndpoints { .. } => cluster::response_of(cluster::ACTIVE_EP_REQ),
            ZdpResponse::UserDescriptor { .. } => cluster::response_of(cluster::USER_DESC_REQ),
            ZdpResponse::MgmtLqi { .. } => cluster::response_of(cluster::MGMT_LQI_REQ),
            ZdpResponse::MgmtBind { .. } => cluster::response_of(cluster::MGMT_BIND_REQ),
            ZdpResponse::Bind { .. } => cluster::response_of(cluster::BIND_REQ),
            ZdpResponse::Unbind { .. } => cluster::response_of(cluster::UNBIND_REQ),
            ZdpResponse::MgmtLeave { .. } => cluster::response_of(cluster::MGMT_LEAVE_REQ),
            ZdpResponse::DeviceAnnounce { .. } => cluster::DEVICE_ANNCE,
        }
    }

    /// Decode a ZDP ASDU received on `cluster_id`. Returns the sequence number
    /// and the response.
    pub fn decode(cluster_id: u16, asdu: &[u8]) -> Result<(u8, ZdpResponse), ZdpError> {
        let mut buf = asdu;
        need(buf, 1, "zdp")?;
        let seq = buf.get_u8();

        if cluster_id == cluster::DEVICE_ANNCE {
            need(buf, 11, "device announce")?;
            let nwk = buf.get_u16_le();
            let ext = buf.get_u64_le();
            let capabilities = MacCapabilities::from_bits_retain(buf.get_u8());
            return Ok((
                seq,
                ZdpResponse::DeviceAnnounce {
                    nwk,
                    ext,
                    capabilities,
                },
            ));
        }

        if !cluster::is_response(cluster_id) {
            return Err(ZdpError::UnexpectedCluster(cluster_id));
        }

        need(buf, 1, "zdp response")?;
        let status = buf.get_u8();
        let request = cluster_id & !cluster::RESPONSE_FLAG;

        let rsp = match request {
            cluster::NWK_ADDR_REQ | cluster::IEEE_ADDR_REQ => {
                need(buf, 10, "address response")?;
                let ext = buf.get_u64_le();
                let nwk = buf.get_u16_le();
                let mut associated = Vec::new();
                if buf.len() >= 2 {
                    let count = buf.get_u8() as usize;
                    let _start = buf.get_u8();
                    need(buf, count * 2, "associated device list")?;
                    associated = (0..count).map(|_| buf.get_u16_le()).collect();
                }
                if request == cluster::NWK_ADDR_REQ {
                    ZdpResponse::NwkAddr {
                        status,
                        ext,
                        nwk,
                        associated,
                    }
                } else {
                    ZdpResponse::IeeeAddr {
                        status,
                        ext,
                        nwk,
                        associated,
                    }
                }
            }
            cluster::NODE_DESC_REQ => {
                need(buf, 2, "node descriptor response")?;
                let nwk = buf.get_u16_le();
                let descriptor = if status == status::SUCCESS {
                    Some(NodeDescriptor::decode(&mut buf)?)
                } else {
                    None
                };
                ZdpResponse::NodeDescriptor {
                    status,
                    nwk,
                    descriptor,
                }
            }
            cluster::POWER_DESC_REQ => {
                need(buf, 2, "power descriptor response")?;
                let nwk = buf.get_u16_le();
                let descriptor = if status == status::SUCCESS {
                    Some(PowerDescriptor::decode(&mut buf)?)
                } else {
                    None
                };
                ZdpResponse::PowerDescriptor {
                    status,
                    nwk,
                    descriptor,
                }
            }
            cluster::SIMPLE_DESC_REQ => {
                need(buf, 2, "simple descriptor response")?;
                let nwk = buf.get_u16_le();
                let descriptor = if status == status::SUCCESS {
                    need(buf, 1, "simple descriptor length")?;
                    let len = buf.get_u8() as usize;
                    need(buf, len, "simple descriptor")?;
                    let mut body = &buf[..len];
                    Some(SimpleDescriptor::decode(&mut body)?)
                } else {
                    None
                };
                ZdpResponse::SimpleDescriptor {
                    status,
                    nwk,
                    descriptor,
                }
            }
            cluster::ACTIVE_EP_REQ => {
                need(buf, 2, "active endpoints response")?;
                let nwk = buf.get_u16_le();
                let mut endpoints = Vec::new();
                if status == status::SUCCESS {
                    need(buf, 1, "active endpoint count")?;
                    let count = buf.get_u8() as usize;
                    need(buf, count, "active endpoint list")?;
                    endpoints = buf[..count].to_vec();
                }
                ZdpResponse::ActiveEndpoints {
                    status,
                    nwk,
                    endpoints,
                }
            }
            cluster::USER_DESC_REQ => {
                need(buf, 2, "user descriptor response")?;
                let nwk = buf.get_u16_le();
                let text = if status == status::SUCCESS {
                    need(buf, 1, "user descriptor length")?;
                    let len = (buf.get_u8() as usize).min(16);
                    need(buf, len, "user descriptor")?;
                    Some(
                        String::from_utf8_lossy(&buf[..len])
                            .trim_end_matches(['\0', ' '])
                            .to_string(),
                    )
                } else {
                    None
                };
                ZdpResponse::UserDescriptor { status, nwk, text }
            }
            cluster::MGMT_LQI_REQ => {
                let (total, start_index, neighbors) = if status == status::SUCCESS {
                    need(buf, 3, "mgmt lqi response")?;
                    let total = buf.get_u8();
                    let start = buf.get_u8();
                    let count = buf.get_u8() as usize;
                    let mut list = Vec::with_capacity(count);
                    for _ in 0..count {
                        list.push(NeighborRecord::decode(&mut buf)?);
                    }
                    (total, start, list)
                } else {
                    (0, 0, Vec::new())
                };
                ZdpResponse::MgmtLqi {
                    status,
                    total,
                    start_index,
                    neighbors,
                }
            }
            cluster::MGMT_BIND_REQ => {
                let (total, start_index, bindings) = if status == status::SUCCESS {
                    need(buf, 3, "mgmt bind response")?;
                    let total = buf.get_u8();
                    let start = buf.get_u8();
                    let count = buf.get_u8() as usize;
                    let mut list = Vec::with_capacity(count);
                    for _ in 0..count {
                        list.push(BindingRecord::decode(&mut buf)?);
                    }
                    (total, start, list)
                } else {
                    (0, 0, Vec::new())
                };
                ZdpResponse::MgmtBind {
                    status,
                    total,
                    start_index,
                    bindings,
                }
            }
            cluster::BIND_REQ => ZdpResponse::Bind { status },
            cluster::UNBIND_REQ => ZdpResponse::Unbind { status },
            cluster::MGMT_LEAVE_REQ => ZdpResponse::MgmtLeave { status },
            _ => return Err(ZdpError::UnexpectedCluster(cluster_id)),
        };

        Ok((seq, rsp))
    }

    /// Encode the response ASDU, sequence number first.
    pub fn encode(&self, seq: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.put_u8(seq);
        match self {
            ZdpResponse::DeviceAnnounce {
                nwk,
                ext,
                capabilities,
            } => {
                out.put_u16_le(*nwk);
                out.put_u64_le(*ext);
                out.put_u8(capabilities.bits());
                return out;
            }
            _ => out.put_u8(self.status()),
        }
        match self {
            ZdpResponse::NwkAddr {
                ext,
                nwk,
                associated,
                ..
            }
            | ZdpResponse::IeeeAddr {
                ext,
                nwk,
                associated,
                ..
            } => {
                out.put_u64_le(*ext);
                out.put_u16_le(*nwk);
                if !associated.is_empty() {
                    out.put_u8(associated.len() as u8);
                    out.put_u8(0);
                    for a in associated {
                        out.put_u16_le(*a);
                    }
                }
            }
            ZdpResponse::NodeDescriptor {
                nwk, descriptor, ..
            } => {
                out.put_u16_le(*nwk);
                if let Some(d) = descriptor {
                    d.encode(&mut out);
                }
            }
            ZdpResponse::PowerDescriptor {
                nwk, descriptor, ..
            } => {
                out.put_u16_le(*nwk);
                if let Some(d) = descriptor {
                    d.encode(&mut out);
                }
            }
            ZdpResponse::SimpleDescriptor {
                nwk, descriptor, ..
            } => {
                out.put_u16_le(*nwk);
                match descriptor {
                    Some(d) => {
                        out.put_u8(d.wire_len() as u8);
                        d.encode(&mut out);
                    }
                    None => out.put_u8(0),
                }
            }
            ZdpResponse::ActiveEndpoints { nwk, endpoints, .. } => {
                out.put_u16_le(*nwk);
                out.put_u8(endpoints.len() as u8);
                out.extend_from_slice(endpoints);
            }
            ZdpResponse::UserDescriptor { nwk, text, .. } => {
                out.put_u16_le(*nwk);
                if let Some(t) = text {
                    let bytes = &t.as_bytes()[..t.len().min(16)];
                    out.put_u8(bytes.len() as u8);
                    out.extend_from_slice(bytes);
                }
            }
            ZdpResponse::MgmtLqi {
                total,
                start_index,
                neighbors,
                ..
            } => {
                out.put_u8(*total);
                out.put_u8(*start_index);
                out.put_u8(neighbors.len() as u8);
                for n in neighbors {
                    n.encode(&mut out);
                }
            }
            ZdpResponse::MgmtBind {
                total,
                start_index,
                bindings,
                ..
            } => {
                out.put_u8(*total);
                out.put_u8(*start_index);
                out.put_u8(bindings.len() as u8);
                for b in bindings {
                    b.encode(&mut out);
                }
            }
            ZdpResponse::Bind { .. }
            | ZdpResponse::Unbind { .. }
            | ZdpResponse::MgmtLeave { .. }
            | ZdpResponse::DeviceAnnounce { .. } => {}
        }
        out
    }
}

/// Human-readable name of a ZDP status, for logs.
pub fn status_name(status: u8) -> &'static str {
    match status {
        status::SUCCESS => "SUCCESS",
        status::INV_REQUESTTYPE => "INV_REQUESTTYPE",
        status::DEVICE_NOT_FOUND => "DEVICE_NOT_FOUND",
        status::INVALID_EP => "INVALID_EP",
        status::NOT_ACTIVE => "NOT_ACTIVE",
        status::NOT_SUPPORTED => "NOT_SUPPORTED",
        status::TIMEOUT => "TIMEOUT",
        status::NO_MATCH => "NO_MATCH",
        status::NO_ENTRY => "NO_ENTRY",
        status::NO_DESCRIPTOR => "NO_DESCRIPTOR",
        status::INSUFFICIENT_SPACE => "INSUFFICIENT_SPACE",
        status::NOT_PERMITTED => "NOT_PERMITTED",
        status::TABLE_FULL => "TABLE_FULL",
        status::NOT_AUTHORIZED => "NOT_AUTHORIZED",
        _ => "UNKNOWN",
    }
}
