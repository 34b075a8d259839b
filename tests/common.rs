//! Test utilities & fixtures.
//! A radio that records every frame and helpers to fake what a device sends back.
#![allow(dead_code)]

use std::time::Instant;

use zbmesh::aps::{ApsDataConfirm, ApsDataIndication, ApsDataRequest, ApsStatus};
use zbmesh::config::Config;
use zbmesh::controller::Controller;
use zbmesh::storage::MemoryStore;
use zbmesh::transport::{RadioTransport, SendResult, TransportEvent};
use zbmesh::types::{Address, AddressMode, MacCapabilities, ZDP_PROFILE_ID};
use zbmesh::zdp::{cluster, ZdpResponse};

pub const COORDINATOR_EXT: u64 = 0x00212EFFFF000001;

/// Accepts every frame and keeps a copy. With `busy` set it answers busy
/// to everything instead.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Vec<ApsDataRequest>,
    pub rejoins: u32,
    pub busy: bool,
}

impl RecordingTransport {
    pub fn last_to(&self, cluster_id: u16) -> Option<&ApsDataRequest> {
        self.sent.iter().rev().find(|r| r.cluster_id == cluster_id)
    }
}

impl RadioTransport for RecordingTransport {
    fn send_request(&mut self, req: &ApsDataRequest) -> SendResult {
        if self.busy {
            return SendResult::Busy;
        }
        self.sent.push(req.clone());
        SendResult::Ok
    }

    fn has_free_slot(&self) -> bool {
        true
    }

    fn leave_and_rejoin(&mut self) {
        self.rejoins += 1;
    }
}

pub fn config(permit_join: bool) -> Config {
    let mut c = Config::default();
    c.controller.coordinator_ext = format!("0x{:016X}", COORDINATOR_EXT);
    c.discovery.permit_join = permit_join;
    c
}

/// Controller with joining open, not yet connected.
pub fn controller(now: Instant) -> Controller<RecordingTransport> {
    Controller::new(
        config(true),
        RecordingTransport::default(),
        Box::new(MemoryStore::default()),
        now,
    )
    .expect("controller")
}

pub fn router_caps() -> MacCapabilities {
    MacCapabilities::DEVICE_TYPE_FFD
        | MacCapabilities::MAINS_POWERED
        | MacCapabilities::RX_ON_WHEN_IDLE
        | MacCapabilities::ALLOCATE_ADDRESS
}

/// A ZDP frame from `src`, heard directly by the coordinator.
pub fn zdp_indication(src: Address, cluster_id: u16, asdu: Vec<u8>) -> TransportEvent {
    TransportEvent::Indication(ApsDataIndication {
        src,
        src_mode: AddressMode::Nwk,
        dst: Address::from_nwk(0x0000),
        src_endpoint: 0,
        dst_endpoint: 0,
        profile_id: ZDP_PROFILE_ID,
        cluster_id,
        asdu,
        link_quality: 200,
        rssi: -55,
        previous_hop: src.nwk(),
    })
}

pub fn announce(ext: u64, nwk: u16, caps: MacCapabilities) -> TransportEvent {
    let rsp = ZdpResponse::DeviceAnnounce {
        nwk,
        ext,
        capabilities: caps,
    };
    zdp_indication(Address::new(ext, nwk), cluster::DEVICE_ANNCE, rsp.encode(0))
}

pub fn confirm(req: &ApsDataRequest, status: ApsStatus) -> TransportEvent {
    TransportEvent::Confirm(ApsDataConfirm {
        id: req.id,
        dst: req.dst,
        dst_endpoint: req.dst_endpoint,
        src_endpoint: req.src_endpoint,
        status,
    })
}
