//! Node creation, the closed-network gate and deletion cleanup.

mod common;

use std::time::{Duration, Instant};

use common::{announce, confirm, controller, router_caps, zdp_indication};
use zbmesh::aps::{ApsDataRequest, ApsStatus};
use zbmesh::controller::DeleteMode;
use zbmesh::error::RegistryError;
use zbmesh::events::{Event, EventKind};
use zbmesh::registry::NodeRegistry;
use zbmesh::storage::MemoryStore;
use zbmesh::transport::TransportEvent;
use zbmesh::types::{Address, AddressMode, DeviceType, MacCapabilities, HA_PROFILE_ID};
use zbmesh::zdp::{cluster, status, NeighborRecord, Relationship, ZdpResponse};

#[test]
fn create_node_is_idempotent() {
    let now = Instant::now();
    let mut reg = NodeRegistry::default();
    reg.set_permit_join(true);
    let caps = MacCapabilities::DEVICE_TYPE_FFD | MacCapabilities::MAINS_POWERED;
    let addr = Address::from_ext(0x00212E0000000001);

    let (h, created) = reg
        .create_node(&addr, caps, &MemoryStore::default(), now)
        .expect("created");
    assert!(created);
    assert_eq!(reg.get(h).unwrap().id(), 1);

    let (again, created) = reg
        .create_node(&addr, MacCapabilities::empty(), &MemoryStore::default(), now)
        .expect("found");
    assert!(!created);
    assert_eq!(again, h);
    assert_eq!(reg.get(again).unwrap().id(), 1);
    assert_eq!(reg.get(again).unwrap().mac_capabilities, caps);
    assert_eq!(reg.len(), 1);
}

#[test]
fn closed_network_only_admits_known_devices() {
    let now = Instant::now();
    let mut reg = NodeRegistry::default();
    let addr = Address::new(0x00212E0000000002, 0x2222);
    let mut store = MemoryStore::default();

    let err = reg
        .create_node(&addr, router_caps(), &store, now)
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnknownDevice(0x00212E0000000002)));
    assert!(reg.is_empty());

    store.remember(0x00212E0000000002);
    let (h, created) = reg.create_node(&addr, router_caps(), &store, now).unwrap();
    assert!(created);
    assert_eq!(reg.get_node(&Address::from_nwk(0x2222), AddressMode::Nwk), Some(h));
}

#[test]
fn announce_from_unknown_device_is_ignored_while_closed() {
    let now = Instant::now();
    let mut c = zbmesh::controller::Controller::new(
        common::config(false),
        common::RecordingTransport::default(),
        Box::new(MemoryStore::default()),
        now,
    )
    .unwrap();
    c.handle_event(announce(0x00158D0000000077, 0x7777, router_caps()), now);
    assert_eq!(c.registry().len(), 1, "only the coordinator");
}

#[test]
fn delete_finally_cleans_queue_and_neighbor_tables() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);

    let router = Address::new(0x00158D0000000001, 0x1001);
    let doomed = Address::new(0x00158D0000000002, 0x1002);
    c.handle_event(announce(0x00158D0000000001, 0x1001, router_caps()), now);
    c.handle_event(announce(0x00158D0000000002, 0x1002, router_caps()), now);

    // the router reports the doomed node as its neighbor
    let lqi = ZdpResponse::MgmtLqi {
        status: status::SUCCESS,
        total: 1,
        start_index: 0,
        neighbors: vec![NeighborRecord {
            ext_pan_id: 0xDDDD,
            ext: 0x00158D0000000002,
            nwk: 0x1002,
            device_type: DeviceType::Router,
            rx_on_when_idle: 1,
            relationship: Relationship::Sibling,
            permit_joining: 0,
            depth: 2,
            lqi: 180,
        }],
    };
    c.handle_event(
        zdp_indication(router, cluster::response_of(cluster::MGMT_LQI_REQ), lqi.encode(0x40)),
        now,
    );
    let rh = c.registry().get_node(&router, AddressMode::Ext).unwrap();
    let dh = c.registry().get_node(&doomed, AddressMode::Ext).unwrap();
    assert!(c.registry().get(rh).unwrap().neighbor(dh).is_some());
    let coordinator = c.registry().coordinator().unwrap();
    assert!(c.registry().get(coordinator).unwrap().neighbor(dh).is_some());

    for _ in 0..3 {
        let req = ApsDataRequest::new(doomed, AddressMode::Nwk, HA_PROFILE_ID, 0x0006, vec![0x01, 0x10, 0x02]);
        c.apsde_data_request(req, now).expect("queued");
    }
    assert!(c
        .queue()
        .iter()
        .any(|r| r.dst.same_device(&doomed) && r.state().is_pending()));

    let removed = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = removed.clone();
    c.subscribe(EventKind::NodeRemoved, move |e| {
        if let Event::NodeRemoved(n) = e {
            sink.lock().unwrap().push(n.address);
        }
    });

    c.delete_node(dh, DeleteMode::Finally).expect("deleted");

    assert!(c
        .queue()
        .iter()
        .filter(|r| r.dst.same_device(&doomed))
        .all(|r| !r.state().is_pending()));
    for (_, n) in c.registry().iter() {
        assert!(n.neighbors.iter().all(|e| !e.address.same_device(&doomed)));
    }
    assert!(c.registry().get(dh).is_none());
    assert!(c.registry().get_node(&doomed, AddressMode::Ext).is_none());
    assert_eq!(removed.lock().unwrap().len(), 1);

    // the cancelled requests come back as failed confirms
    let failed = std::sync::Arc::new(std::sync::Mutex::new(0));
    let count = failed.clone();
    c.subscribe(EventKind::ApsDataConfirm, move |e| {
        if let Event::ApsDataConfirm(conf) = e {
            if !conf.status.is_success() {
                *count.lock().unwrap() += 1;
            }
        }
    });
    for i in 1..=3 {
        c.timeout_tick(now + Duration::from_millis(80 * i));
    }
    assert_eq!(*failed.lock().unwrap(), 3);
    assert!(c.queue().iter().all(|r| !r.dst.same_device(&doomed)));
}

#[test]
fn coordinator_cannot_be_deleted() {
    let now = Instant::now();
    let mut c = controller(now);
    let coordinator = c.registry().coordinator().unwrap();
    assert!(c.delete_node(coordinator, DeleteMode::Finally).is_err());
}

#[test]
fn zombie_and_wake_are_idempotent() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(0x00158D0000000005, 0x1005, router_caps()), now);
    let h = c
        .registry()
        .get_node(&Address::from_nwk(0x1005), AddressMode::Nwk)
        .unwrap();

    let changes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = changes.clone();
    c.subscribe(EventKind::NodeZombieChanged, move |e| {
        if let Event::NodeZombieChanged { zombie, .. } = e {
            sink.lock().unwrap().push(*zombie);
        }
    });

    c.delete_node(h, DeleteMode::Zombie).unwrap();
    c.delete_node(h, DeleteMode::Zombie).unwrap();
    assert_eq!(*changes.lock().unwrap(), vec![true]);
    assert!(c.registry().get(h).unwrap().is_zombie());

    // zombies refuse application traffic
    let req = ApsDataRequest::new(
        Address::from_nwk(0x1005),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x11, 0x01],
    );
    assert!(c.apsde_data_request(req, now).is_err());

    // any frame from the device wakes it, once
    c.handle_event(announce(0x00158D0000000005, 0x1005, router_caps()), now);
    c.handle_event(announce(0x00158D0000000005, 0x1005, router_caps()), now);
    assert_eq!(*changes.lock().unwrap(), vec![true, false]);
    assert!(!c.registry().get(h).unwrap().is_zombie());
}

#[test]
fn failed_delivery_backs_off_the_node() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(0x00158D0000000006, 0x1006, router_caps()), now);
    let h = c
        .registry()
        .get_node(&Address::from_nwk(0x1006), AddressMode::Nwk)
        .unwrap();

    let req = ApsDataRequest::new(
        Address::from_nwk(0x1006),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x12, 0x01],
    );
    let id = c.apsde_data_request(req, now).unwrap();
    let sent = c.transport().sent.iter().find(|r| r.id == id).cloned().unwrap();
    c.handle_event(confirm(&sent, ApsStatus::ApsNoAck), now);

    let n = c.registry().get(h).unwrap();
    assert_eq!(n.recv_errors, 1);
    assert_eq!(n.state(now), zbmesh::node::NodeState::Wait);
    assert_eq!(n.state(now + Duration::from_secs(3)), zbmesh::node::NodeState::Idle);
}
