//! Admission and dispatch limits of the APS request queue.

mod common;

use std::time::{Duration, Instant};

use common::{router_caps, RecordingTransport, COORDINATOR_EXT};
use zbmesh::aps::queue::{LinkState, SendOutcome};
use zbmesh::aps::{ApsDataRequest, ApsRequestQueue, QueueLimits, OTA_CLUSTER_ID};
use zbmesh::error::ApsError;
use zbmesh::registry::{NodeHandle, NodeRegistry};
use zbmesh::storage::MemoryStore;
use zbmesh::transport::{RadioTransport, SendResult};
use zbmesh::types::{
    Address, AddressMode, DeviceType, MacCapabilities, BROADCAST_RX_ON_WHEN_IDLE, HA_PROFILE_ID,
};
use zbmesh::zdp::NodeDescriptor;

const UP: LinkState = LinkState {
    connected: true,
    free_slot: true,
};

fn on_off(nwk: u16) -> ApsDataRequest {
    ApsDataRequest::new(
        Address::from_nwk(nwk),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x20, 0x02],
    )
}

/// A radio with every buffer taken.
struct JammedRadio;

impl RadioTransport for JammedRadio {
    fn send_request(&mut self, _req: &ApsDataRequest) -> SendResult {
        SendResult::Busy
    }

    fn has_free_slot(&self) -> bool {
        false
    }

    fn leave_and_rejoin(&mut self) {}
}

fn broadcast() -> ApsDataRequest {
    ApsDataRequest::new(
        Address::from_nwk(BROADCAST_RX_ON_WHEN_IDLE),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x30, 0x00],
    )
}

fn router_at(reg: &mut NodeRegistry, ext: u64, nwk: u16, now: Instant) -> NodeHandle {
    reg.set_permit_join(true);
    let (h, _) = reg
        .create_node(&Address::new(ext, nwk), router_caps(), &MemoryStore::default(), now)
        .unwrap();
    h
}

#[test]
fn twenty_fifth_idle_request_is_refused() {
    let now = Instant::now();
    let reg = NodeRegistry::default();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    for i in 0..24u16 {
        q.enqueue(on_off(0x0100 + i), &reg, UP, now).expect("room left");
    }
    assert_eq!(
        q.enqueue(on_off(0x0200), &reg, UP, now),
        Err(ApsError::QueueIsFull)
    );
    assert_eq!(q.len(), 24);
}

#[test]
fn at_most_four_frames_in_flight() {
    let now = Instant::now();
    let reg = NodeRegistry::default();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    let mut radio = RecordingTransport::default();
    for i in 0..6u16 {
        q.enqueue(on_off(0x0300 + i), &reg, UP, now).unwrap();
    }
    for _ in 0..4 {
        assert!(matches!(
            q.send_next(&reg, None, &mut radio, now),
            SendOutcome::Sent { broadcast: false, .. }
        ));
    }
    assert_eq!(q.send_next(&reg, None, &mut radio, now), SendOutcome::Nothing);
    assert_eq!(radio.sent.len(), 4);
}

#[test]
fn sleepy_device_gets_a_short_queue() {
    let now = Instant::now();
    let mut reg = NodeRegistry::default();
    reg.set_permit_join(true);
    reg.create_node(
        &Address::new(0x00158D00000000AA, 0x0AAA),
        MacCapabilities::empty(),
        &MemoryStore::default(),
        now,
    )
    .unwrap();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    for _ in 0..4 {
        q.enqueue(on_off(0x0AAA), &reg, UP, now).unwrap();
    }
    assert_eq!(
        q.enqueue(on_off(0x0AAA), &reg, UP, now),
        Err(ApsError::QueueIsFull)
    );
    // other destinations are unaffected
    assert!(q.enqueue(on_off(0x0BBB), &reg, UP, now).is_ok());
}

#[test]
fn ota_block_response_jumps_the_line() {
    let now = Instant::now();
    let reg = NodeRegistry::default();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    q.enqueue(on_off(0x0401), &reg, UP, now).unwrap();
    q.enqueue(on_off(0x0402), &reg, UP, now).unwrap();
    let block = ApsDataRequest::new(
        Address::from_nwk(0x0403),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        OTA_CLUSTER_ID,
        vec![0x19, 0x07, 0x05, 0x00],
    );
    let ota = q.enqueue(block, &reg, UP, now).unwrap();

    let mut radio = RecordingTransport::default();
    assert_eq!(
        q.send_next(&reg, None, &mut radio, now),
        SendOutcome::Sent {
            id: ota,
            broadcast: false
        }
    );
    assert_eq!(radio.sent[0].cluster_id, OTA_CLUSTER_ID);
}

#[test]
fn malformed_requests_are_rejected() {
    let now = Instant::now();
    let reg = NodeRegistry::default();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    let no_group = ApsDataRequest::new(
        Address::from_nwk(0x1234),
        AddressMode::Group,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x21, 0x00],
    );
    assert!(matches!(
        q.enqueue(no_group, &reg, UP, now),
        Err(ApsError::InvalidParameter(_))
    ));
    let group = ApsDataRequest::new(
        Address::group(0x0007),
        AddressMode::Group,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x22, 0x00],
    );
    assert!(q.enqueue(group, &reg, UP, now).is_ok());
}

#[test]
fn stale_destination_with_unconfirmed_requests_is_refused() {
    let t0 = Instant::now();
    let mut reg = NodeRegistry::default();
    router_at(&mut reg, 0x00158D00000000B1, 0x0B01, t0);
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    q.enqueue(on_off(0x0B01), &reg, UP, t0).unwrap();
    q.enqueue(on_off(0x0B01), &reg, UP, t0).unwrap();

    // recently heard: more may queue up
    q.enqueue(on_off(0x0B01), &reg, UP, t0 + Duration::from_secs(30))
        .unwrap();
    assert_eq!(
        q.enqueue(on_off(0x0B01), &reg, UP, t0 + Duration::from_secs(61)),
        Err(ApsError::QueueIsFull)
    );
    // a fresh destination is still fine
    router_at(&mut reg, 0x00158D00000000B2, 0x0B02, t0 + Duration::from_secs(61));
    assert!(q
        .enqueue(on_off(0x0B02), &reg, UP, t0 + Duration::from_secs(61))
        .is_ok());
}

#[test]
fn second_coordinator_entry_is_refused() {
    let now = Instant::now();
    let mut reg = NodeRegistry::default();
    reg.create_coordinator(COORDINATOR_EXT, now);
    let h = router_at(&mut reg, 0x00158D00000000C0, 0x0C0C, now);
    reg.get_mut(h).unwrap().node_descriptor = Some(NodeDescriptor::for_role(
        DeviceType::Coordinator,
        router_caps(),
        0x1037,
    ));
    assert!(reg.is_ghost_coordinator(h));

    let mut q = ApsRequestQueue::new(QueueLimits::default());
    assert_eq!(
        q.enqueue(on_off(0x0C0C), &reg, UP, now),
        Err(ApsError::NodeIsZombie)
    );
    assert!(q.is_empty());
}

#[test]
fn full_radio_refuses_once_it_reported_busy() {
    let now = Instant::now();
    let reg = NodeRegistry::default();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    let jammed = LinkState {
        connected: true,
        free_slot: false,
    };

    // no busy answer yet, so a full radio is not held against the request
    q.enqueue(on_off(0x0D01), &reg, jammed, now).unwrap();
    assert_eq!(
        q.send_next(&reg, None, &mut JammedRadio, now),
        SendOutcome::Deferred
    );
    assert_eq!(q.busy_counter(), 1);

    assert_eq!(
        q.enqueue(on_off(0x0D02), &reg, jammed, now),
        Err(ApsError::QueueIsFull)
    );
    assert!(q.enqueue(on_off(0x0D02), &reg, UP, now).is_ok());

    // a successful send clears the counter
    let mut radio = RecordingTransport::default();
    assert!(matches!(
        q.send_next(&reg, None, &mut radio, now),
        SendOutcome::Sent { .. }
    ));
    assert_eq!(q.busy_counter(), 0);
    assert!(q.enqueue(on_off(0x0D03), &reg, jammed, now).is_ok());
}

#[test]
fn broadcast_gap_backs_off_and_recovers_linearly() {
    let now = Instant::now();
    let reg = NodeRegistry::default();
    let mut q = ApsRequestQueue::new(QueueLimits::default());
    assert_eq!(q.broadcast_gap(), Duration::from_millis(500));

    q.enqueue(broadcast(), &reg, UP, now).unwrap();
    assert_eq!(
        q.send_next(&reg, None, &mut JammedRadio, now),
        SendOutcome::Deferred
    );
    assert_eq!(q.broadcast_gap(), Duration::from_secs(1));
    for _ in 0..5 {
        q.broadcast_congested();
    }
    assert_eq!(q.broadcast_gap(), Duration::from_secs(8));

    q.broadcast_succeeded();
    assert_eq!(q.broadcast_gap(), Duration::from_millis(7500));
    for _ in 0..3 {
        q.broadcast_succeeded();
    }
    assert_eq!(q.broadcast_gap(), Duration::from_secs(6));
    for _ in 0..20 {
        q.broadcast_succeeded();
    }
    assert_eq!(q.broadcast_gap(), Duration::from_millis(500));

    // consecutive broadcasts are spaced by the gap
    q.enqueue(broadcast(), &reg, UP, now).unwrap();
    let mut radio = RecordingTransport::default();
    assert!(matches!(
        q.send_next(&reg, None, &mut radio, now),
        SendOutcome::Sent { broadcast: true, .. }
    ));
    assert_eq!(q.send_next(&reg, None, &mut radio, now), SendOutcome::Nothing);
    assert!(matches!(
        q.send_next(&reg, None, &mut radio, now + Duration::from_millis(500)),
        SendOutcome::Sent { broadcast: true, .. }
    ));
    assert_eq!(radio.sent.len(), 2);
}
