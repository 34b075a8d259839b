//! # Simulated mesh
//!
//! [`SimMesh`] stands in for the radio when no hardware is attached. It loads
//! a TOML topology, implements [`RadioTransport`], and answers every ZDP
//! request the controller issues with a byte-exact response frame after the
//! configured latency. Time is whatever the caller passes to
//! [`SimMesh::poll`], so a run can go as fast as the CPU allows.
//!
//! ## Topology
//!
//! ```toml
//! latency_ms = 20
//! loss = 0.0
//! seed = 7
//!
//! [[device]]
//! ext = "0x00158D0000000001"
//! nwk = 0x1A2B
//! role = "router"
//! manufacturer_code = 0x1135
//! links = [{ peer = "coordinator", lqi = 220 }]
//!
//! [[device.endpoints]]
//! endpoint = 1
//! device_id = 0x0100
//! in_clusters = [0x0000, 0x0006]
//! ```
//!
//! `peer` is either `coordinator` or another device's extended address.
//! Links are symmetric; listing one side is enough.

use anyhow::{anyhow, Context, Result};
use bytes::Buf;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::aps::{
    ApsDataConfirm, ApsDataIndication, ApsDataRequest, ApsStatus, OTA_CLUSTER_ID,
    OTA_QUERY_NEXT_IMAGE_REQUEST,
};
use crate::transport::{RadioTransport, SendResult, TransportEvent};
use crate::types::{
    Address, AddressMode, DeviceType, MacCapabilities, BROADCAST_RX_ON_WHEN_IDLE,
    COORDINATOR_ENDPOINT, COORDINATOR_NWK, HA_PROFILE_ID, ZDO_ENDPOINT, ZDP_PROFILE_ID,
};
use crate::zdp::{
    cluster, status, BindingRecord, NeighborRecord, NodeDescriptor, PowerDescriptor, Relationship,
    SimpleDescriptor, ZdpResponse,
};

/// Frames the simulated radio holds before it answers busy.
const MAX_IN_FLIGHT: usize = 6;
/// Neighbor records per Mgmt_Lqi_rsp page.
const LQI_PAGE_SIZE: usize = 3;
const BIND_PAGE_SIZE: usize = 4;
const SIM_EXT_PAN_ID: u64 = 0x00212EFFFF00CAFE;

fn default_latency_ms() -> u64 {
    20
}

fn default_online() -> bool {
    true
}

fn default_profile() -> u16 {
    HA_PROFILE_ID
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Probability that a unicast frame goes unacknowledged.
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default, rename = "device")]
    pub devices: Vec<SimDeviceConfig>,
}

impl Topology {
    pub fn from_toml(content: &str) -> Result<Self> {
        let t: Topology = toml::from_str(content).context("invalid topology")?;
        if !(0.0..=1.0).contains(&t.loss) {
            return Err(anyhow!("loss must be between 0 and 1, got {}", t.loss));
        }
        Ok(t)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read topology {}", path.display()))?;
        Self::from_toml(&content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimRole {
    Router,
    EndDevice,
    SleepyEndDevice,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimDeviceConfig {
    pub ext: String,
    pub nwk: u16,
    pub role: SimRole,
    #[serde(default)]
    pub manufacturer_code: u16,
    #[serde(default)]
    pub endpoints: Vec<SimEndpoint>,
    #[serde(default)]
    pub links: Vec<SimLink>,
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default)]
    pub user_descriptor: Option<String>,
    /// Reported in OTA Query Next Image Requests.
    #[serde(default)]
    pub firmware_version: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimEndpoint {
    pub endpoint: u8,
    #[serde(default = "default_profile")]
    pub profile_id: u16,
    pub device_id: u16,
    #[serde(default)]
    pub in_clusters: Vec<u16>,
    #[serde(default)]
    pub out_clusters: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimLink {
    pub peer: String,
    pub lqi: u8,
}

/// Extended address from `0x00158D...`, plain hex, or colon form.
pub fn parse_ext(s: &str) -> Result<u64> {
    let t = s.trim();
    let digits: String = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t)
        .chars()
        .filter(|c| *c != ':')
        .collect();
    if digits.is_empty() || digits.len() > 16 {
        return Err(anyhow!("invalid extended address '{}'", s));
    }
    u64::from_str_radix(&digits, 16).map_err(|e| anyhow!("invalid extended address '{}': {}", s, e))
}

#[derive(Debug, Clone)]
struct SimDevice {
    ext: u64,
    nwk: u16,
    role: SimRole,
    manufacturer_code: u16,
    endpoints: Vec<SimpleDescriptor>,
    /// `None` peer is the coordinator.
    links: Vec<(Option<u64>, u8)>,
    online: bool,
    user_descriptor: Option<String>,
    firmware_version: Option<u32>,
    bindings: Vec<BindingRecord>,
}

impl SimDevice {
    fn capabilities(&self) -> MacCapabilities {
        match self.role {
            SimRole::Router => {
                MacCapabilities::DEVICE_TYPE_FFD
                    | MacCapabilities::MAINS_POWERED
                    | MacCapabilities::RX_ON_WHEN_IDLE
                    | MacCapabilities::ALLOCATE_ADDRESS
            }
            SimRole::EndDevice => {
                MacCapabilities::MAINS_POWERED
                    | MacCapabilities::RX_ON_WHEN_IDLE
                    | MacCapabilities::ALLOCATE_ADDRESS
            }
            SimRole::SleepyEndDevice => MacCapabilities::ALLOCATE_ADDRESS,
        }
    }

    fn device_type(&self) -> DeviceType {
        match self.role {
            SimRole::Router => DeviceType::Router,
            _ => DeviceType::EndDevice,
        }
    }

    fn address(&self) -> Address {
        Address::new(self.ext, self.nwk)
    }
}

/// Simulated radio and mesh behind it.
pub struct SimMesh {
    coordinator_ext: u64,
    devices: Vec<SimDevice>,
    latency: Duration,
    loss: f64,
    rng: StdRng,
    clock: Instant,
    connected: bool,
    pending: Vec<(Instant, TransportEvent)>,
    in_flight: usize,
    frames_sent: u64,
    rejoins: u32,
}

impl SimMesh {
    pub fn new(topology: Topology, coordinator_ext: u64, now: Instant) -> Result<Self> {
        let mut devices = Vec::with_capacity(topology.devices.len());
        for d in &topology.devices {
            let ext = parse_ext(&d.ext)?;
            if ext == coordinator_ext || devices.iter().any(|o: &SimDevice| o.ext == ext) {
                return Err(anyhow!("duplicate extended address {}", d.ext));
            }
            if d.nwk == COORDINATOR_NWK || d.nwk >= 0xFFF8 {
                return Err(anyhow!("device {} has reserved nwk 0x{:04X}", d.ext, d.nwk));
            }
            let mut links = Vec::with_capacity(d.links.len());
            for l in &d.links {
                let peer = if l.peer.eq_ignore_ascii_case("coordinator") {
                    None
                } else {
                    Some(parse_ext(&l.peer)?)
                };
                links.push((peer, l.lqi));
            }
            devices.push(SimDevice {
                ext,
                nwk: d.nwk,
                role: d.role,
                manufacturer_code: d.manufacturer_code,
                endpoints: d
                    .endpoints
                    .iter()
                    .map(|e| SimpleDescriptor {
                        endpoint: e.endpoint,
                        profile_id: e.profile_id,
                        device_id: e.device_id,
                        device_version: 1,
                        in_clusters: e.in_clusters.clone(),
                        out_clusters: e.out_clusters.clone(),
                    })
                    .collect(),
                links,
                online: d.online,
                user_descriptor: d.user_descriptor.clone(),
                firmware_version: d.firmware_version,
                bindings: Vec::new(),
            });
        }
        info!("simulated mesh with {} devices", devices.len());
        Ok(Self {
            coordinator_ext,
            devices,
            latency: Duration::from_millis(topology.latency_ms),
            loss: topology.loss,
            rng: StdRng::seed_from_u64(topology.seed),
            clock: now,
            connected: false,
            pending: Vec::new(),
            in_flight: 0,
            frames_sent: 0,
            rejoins: 0,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P, coordinator_ext: u64, now: Instant) -> Result<Self> {
        Self::new(Topology::load(path)?, coordinator_ext, now)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn rejoins(&self) -> u32 {
        self.rejoins
    }

    /// Bring the radio up; every online device announces itself in turn.
    pub fn connect(&mut self) {
        self.connected = true;
        self.push(Duration::ZERO, TransportEvent::Connected);
        let announcing: Vec<usize> = (0..self.devices.len())
            .filter(|i| self.devices[*i].online)
            .collect();
        for (n, i) in announcing.into_iter().enumerate() {
            let delay = self.latency * (n as u32 + 1);
            self.announce_at(i, delay);
        }
    }

    pub fn disconnect(&mut self, reason: &str) {
        self.connected = false;
        self.pending.clear();
        self.in_flight = 0;
        self.push(
            Duration::ZERO,
            TransportEvent::Disconnected {
                reason: reason.to_string(),
            },
        );
    }

    /// Take a device off the air or bring it back. Returns false for an
    /// unknown address.
    pub fn set_online(&mut self, ext: u64, online: bool) -> bool {
        let Some(i) = self.index_by_ext(ext) else {
            return false;
        };
        let was = self.devices[i].online;
        self.devices[i].online = online;
        if online && !was {
            self.announce_at(i, self.latency);
        }
        true
    }

    /// Give a device a new network address, as after a rejoin.
    pub fn renumber(&mut self, ext: u64, nwk: u16) -> bool {
        let Some(i) = self.index_by_ext(ext) else {
            return false;
        };
        self.devices[i].nwk = nwk;
        self.announce_at(i, self.latency);
        true
    }

    /// The device sends an OTA Query Next Image Request with its firmware.
    pub fn query_next_image(&mut self, ext: u64) -> bool {
        let Some(i) = self.index_by_ext(ext) else {
            return false;
        };
        let d = &self.devices[i];
        let Some(version) = d.firmware_version else {
            return false;
        };
        // cluster specific, seq, command, field control
        let mut asdu = vec![0x01, 0x00, OTA_QUERY_NEXT_IMAGE_REQUEST, 0x00];
        asdu.extend_from_slice(&d.manufacturer_code.to_le_bytes());
        asdu.extend_from_slice(&0x0001u16.to_le_bytes());
        asdu.extend_from_slice(&version.to_le_bytes());
        let ind = self.indication_from(i, HA_PROFILE_ID, OTA_CLUSTER_ID, 0x01, asdu);
        self.push(self.latency, TransportEvent::Indication(ind));
        true
    }

    /// Deliver everything due at `now`, oldest first.
    pub fn poll(&mut self, now: Instant) -> Vec<TransportEvent> {
        self.clock = now;
        self.pending.sort_by_key(|(due, _)| *due);
        let split = self.pending.partition_point(|(due, _)| *due <= now);
        let due: Vec<TransportEvent> = self.pending.drain(..split).map(|(_, e)| e).collect();
        for e in &due {
            if matches!(e, TransportEvent::Confirm(_)) {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
        due
    }

    fn push(&mut self, delay: Duration, event: TransportEvent) {
        self.pending.push((self.clock + delay, event));
    }

    fn index_by_ext(&self, ext: u64) -> Option<usize> {
        self.devices.iter().position(|d| d.ext == ext)
    }

    fn index_by_address(&self, addr: &Address) -> Option<usize> {
        addr.ext()
            .and_then(|ext| self.index_by_ext(ext))
            .or_else(|| {
                addr.nwk()
                    .and_then(|nwk| self.devices.iter().position(|d| d.nwk == nwk))
            })
    }

    fn announce_at(&mut self, i: usize, delay: Duration) {
        let d = &self.devices[i];
        let rsp = ZdpResponse::DeviceAnnounce {
            nwk: d.nwk,
            ext: d.ext,
            capabilities: d.capabilities(),
        };
        let mut ind = self.indication_from(i, ZDP_PROFILE_ID, cluster::DEVICE_ANNCE, 0, rsp.encode(0));
        ind.dst = Address::from_nwk(BROADCAST_RX_ON_WHEN_IDLE);
        self.push(delay, TransportEvent::Indication(ind));
    }

    /// Link quality and last relay as seen by the coordinator.
    fn last_hop(&self, i: usize) -> (u8, u16) {
        let d = &self.devices[i];
        if let Some((_, lqi)) = d.links.iter().find(|(p, _)| p.is_none()) {
            return (*lqi, d.nwk);
        }
        let relay = self
            .neighbors_of(i)
            .into_iter()
            .filter_map(|(peer, _)| peer.and_then(|ext| self.index_by_ext(ext)))
            .filter(|j| self.devices[*j].online && self.devices[*j].role == SimRole::Router)
            .find_map(|j| {
                self.devices[j]
                    .links
                    .iter()
                    .find(|(p, _)| p.is_none())
                    .map(|(_, lqi)| (*lqi, self.devices[j].nwk))
            });
        relay.unwrap_or((0, d.nwk))
    }

    /// Own links plus links other devices declared towards this one.
    fn neighbors_of(&self, i: usize) -> Vec<(Option<u64>, u8)> {
        let me = &self.devices[i];
        let mut out = me.links.clone();
        for other in &self.devices {
            if other.ext == me.ext {
                continue;
            }
            for (peer, lqi) in &other.links {
                if *peer == Some(me.ext) && !out.iter().any(|(p, _)| *p == Some(other.ext)) {
                    out.push((Some(other.ext), *lqi));
                }
            }
        }
        out
    }

    fn indication_from(
        &self,
        i: usize,
        profile_id: u16,
        cluster_id: u16,
        src_endpoint: u8,
        asdu: Vec<u8>,
    ) -> ApsDataIndication {
        let (link_quality, previous_hop) = self.last_hop(i);
        let zdp = profile_id == ZDP_PROFILE_ID;
        ApsDataIndication {
            src: self.devices[i].address(),
            src_mode: AddressMode::Nwk,
            dst: Address::from_nwk(COORDINATOR_NWK),
            src_endpoint: if zdp { ZDO_ENDPOINT } else { src_endpoint },
            dst_endpoint: if zdp { ZDO_ENDPOINT } else { COORDINATOR_ENDPOINT },
            profile_id,
            cluster_id,
            asdu,
            link_quality,
            rssi: (i16::from(link_quality) / 3 - 90) as i8,
            previous_hop: Some(previous_hop),
        }
    }

    fn neighbor_record(&self, peer: Option<u64>, lqi: u8, reporter: &SimDevice) -> Option<NeighborRecord> {
        let (ext, nwk, device_type, rx_on, depth) = match peer {
            None => (self.coordinator_ext, COORDINATOR_NWK, DeviceType::Coordinator, 1, 0),
            Some(ext) => {
                let d = &self.devices[self.index_by_ext(ext)?];
                let rx_on = u8::from(d.role != SimRole::SleepyEndDevice);
                (d.ext, d.nwk, d.device_type(), rx_on, 1)
            }
        };
        let relationship = match (reporter.role, device_type) {
            (SimRole::Router, DeviceType::EndDevice) => Relationship::Child,
            (_, DeviceType::Coordinator) => Relationship::Parent,
            _ => Relationship::Sibling,
        };
        Some(NeighborRecord {
            ext_pan_id: SIM_EXT_PAN_ID,
            ext,
            nwk,
            device_type,
            rx_on_when_idle: rx_on,
            relationship,
            permit_joining: 0,
            depth,
            lqi,
        })
    }

    /// Build the answer of device `i` to a ZDP request.
    fn answer_zdp(&mut self, i: usize, cluster_id: u16, body: &[u8]) -> Option<ZdpResponse> {
        let mut buf = body;
        let d = self.devices[i].clone();
        let rsp = match cluster_id {
            cluster::NWK_ADDR_REQ => ZdpResponse::NwkAddr {
                status: status::SUCCESS,
                ext: d.ext,
                nwk: d.nwk,
                associated: Vec::new(),
            },
            cluster::IEEE_ADDR_REQ => ZdpResponse::IeeeAddr {
                status: status::SUCCESS,
                ext: d.ext,
                nwk: d.nwk,
                associated: Vec::new(),
            },
            cluster::NODE_DESC_REQ => ZdpResponse::NodeDescriptor {
                status: status::SUCCESS,
                nwk: d.nwk,
                descriptor: Some(NodeDescriptor {
                    user_descriptor_available: d.user_descriptor.is_some(),
                    ..NodeDescriptor::for_role(d.device_type(), d.capabilities(), d.manufacturer_code)
                }),
            },
            cluster::POWER_DESC_REQ => {
                let mains = d.role != SimRole::SleepyEndDevice;
                ZdpResponse::PowerDescriptor {
                    status: status::SUCCESS,
                    nwk: d.nwk,
                    descriptor: Some(PowerDescriptor {
                        current_power_mode: if mains { 0 } else { 1 },
                        available_sources: if mains { 0x01 } else { 0x04 },
                        current_source: if mains { 0x01 } else { 0x04 },
                        current_level: 0x0C,
                    }),
                }
            }
            cluster::ACTIVE_EP_REQ => ZdpResponse::ActiveEndpoints {
                status: status::SUCCESS,
                nwk: d.nwk,
                endpoints: d.endpoints.iter().map(|e| e.endpoint).collect(),
            },
            cluster::SIMPLE_DESC_REQ => {
                if buf.remaining() < 3 {
                    return None;
                }
                buf.advance(2);
                let ep = buf.get_u8();
                match d.endpoints.iter().find(|e| e.endpoint == ep) {
                    Some(sd) => ZdpResponse::SimpleDescriptor {
                        status: status::SUCCESS,
                        nwk: d.nwk,
                        descriptor: Some(sd.clone()),
                    },
                    None => ZdpResponse::SimpleDescriptor {
                        status: status::NOT_ACTIVE,
                        nwk: d.nwk,
                        descriptor: None,
                    },
                }
            }
            cluster::USER_DESC_REQ => match &d.user_descriptor {
                Some(text) => ZdpResponse::UserDescriptor {
                    status: status::SUCCESS,
                    nwk: d.nwk,
                    text: Some(text.clone()),
                },
                None => ZdpResponse::UserDescriptor {
                    status: status::NOT_SUPPORTED,
                    nwk: d.nwk,
                    text: None,
                },
            },
            cluster::MGMT_LQI_REQ => {
                let start = if buf.has_remaining() { buf.get_u8() } else { 0 };
                if d.role != SimRole::Router {
                    ZdpResponse::MgmtLqi {
                        status: status::NOT_SUPPORTED,
                        total: 0,
                        start_index: start,
                        neighbors: Vec::new(),
                    }
                } else {
                    let all: Vec<NeighborRecord> = self
                        .neighbors_of(i)
                        .into_iter()
                        .filter_map(|(peer, lqi)| self.neighbor_record(peer, lqi, &d))
                        .collect();
                    ZdpResponse::MgmtLqi {
                        status: status::SUCCESS,
                        total: all.len() as u8,
                        start_index: start,
                        neighbors: all
                            .into_iter()
                            .skip(usize::from(start))
                            .take(LQI_PAGE_SIZE)
                            .collect(),
                    }
                }
            }
            cluster::MGMT_BIND_REQ => {
                let start = if buf.has_remaining() { buf.get_u8() } else { 0 };
                ZdpResponse::MgmtBind {
                    status: status::SUCCESS,
                    total: d.bindings.len() as u8,
                    start_index: start,
                    bindings: d
                        .bindings
                        .iter()
                        .skip(usize::from(start))
                        .take(BIND_PAGE_SIZE)
                        .copied()
                        .collect(),
                }
            }
            cluster::BIND_REQ | cluster::UNBIND_REQ => {
                let rec = BindingRecord::decode(&mut buf).ok()?;
                let bindings = &mut self.devices[i].bindings;
                let status = if rec.src_ext != d.ext {
                    status::INVALID_EP
                } else if cluster_id == cluster::BIND_REQ {
                    if !bindings.contains(&rec) {
                        bindings.push(rec);
                    }
                    status::SUCCESS
                } else if let Some(pos) = bindings.iter().position(|b| *b == rec) {
                    bindings.remove(pos);
                    status::SUCCESS
                } else {
                    status::NO_ENTRY
                };
                if cluster_id == cluster::BIND_REQ {
                    ZdpResponse::Bind { status }
                } else {
                    ZdpResponse::Unbind { status }
                }
            }
            cluster::MGMT_LEAVE_REQ => ZdpResponse::MgmtLeave {
                status: status::SUCCESS,
            },
            other => {
                trace!("sim: no answer for zdp 0x{:04X}", other);
                return None;
            }
        };
        Some(rsp)
    }

    fn respond_zdp(&mut self, i: usize, req: &ApsDataRequest) {
        if req.asdu.is_empty() {
            return;
        }
        let seq = req.asdu[0];
        let Some(rsp) = self.answer_zdp(i, req.cluster_id, &req.asdu[1..]) else {
            return;
        };
        let ind = self.indication_from(
            i,
            ZDP_PROFILE_ID,
            cluster::response_of(req.cluster_id),
            0,
            rsp.encode(seq),
        );
        self.push(self.latency * 2, TransportEvent::Indication(ind));
    }

    fn confirm(&mut self, req: &ApsDataRequest, status: ApsStatus) {
        let conf = ApsDataConfirm {
            id: req.id,
            dst: req.dst,
            dst_endpoint: req.dst_endpoint,
            src_endpoint: req.src_endpoint,
            status,
        };
        self.push(self.latency, TransportEvent::Confirm(conf));
    }
}

impl RadioTransport for SimMesh {
    fn send_request(&mut self, req: &ApsDataRequest) -> SendResult {
        if !self.connected {
            return SendResult::NotConnected;
        }
        if self.in_flight >= MAX_IN_FLIGHT {
            return SendResult::Busy;
        }
        self.in_flight += 1;
        self.frames_sent += 1;
        let zdp = req.profile_id == ZDP_PROFILE_ID && req.dst_endpoint == ZDO_ENDPOINT;

        if req.dst_mode == AddressMode::Group || req.dst.is_broadcast() {
            self.confirm(req, ApsStatus::Success);
            if zdp && req.cluster_id == cluster::NWK_ADDR_REQ && req.asdu.len() >= 9 {
                let mut b = &req.asdu[1..];
                let ext = b.get_u64_le();
                if let Some(i) = self.index_by_ext(ext).filter(|i| self.devices[*i].online) {
                    self.respond_zdp(i, req);
                }
            }
            return SendResult::Ok;
        }

        let Some(i) = self.index_by_address(&req.dst) else {
            debug!("sim: no device at {}", req.dst);
            self.confirm(req, ApsStatus::NwkRouteDiscoveryFailed);
            return SendResult::Ok;
        };
        let d = &self.devices[i];
        if !d.online {
            let status = if d.role == SimRole::SleepyEndDevice {
                ApsStatus::MacTransactionExpired
            } else {
                ApsStatus::ApsNoAck
            };
            self.confirm(req, status);
            return SendResult::Ok;
        }
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.confirm(req, ApsStatus::ApsNoAck);
            return SendResult::Ok;
        }
        self.confirm(req, ApsStatus::Success);
        if zdp {
            self.respond_zdp(i, req);
        }
        SendResult::Ok
    }

    fn has_free_slot(&self) -> bool {
        self.connected && self.in_flight < MAX_IN_FLIGHT
    }

    fn leave_and_rejoin(&mut self) {
        info!("sim: leave and rejoin");
        self.rejoins += 1;
        self.pending.retain(|(_, e)| !matches!(e, TransportEvent::Confirm(_)));
        self.in_flight = 0;
    }
}
