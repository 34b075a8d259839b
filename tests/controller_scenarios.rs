//! Controller behavior driven through transport events and ticks.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{announce, confirm, controller, router_caps, zdp_indication};
use zbmesh::aps::{ApsDataRequest, ApsStatus, RequestState};
use zbmesh::controller::FAST_PROBE_LIFETIME;
use zbmesh::events::{Event, EventKind};
use zbmesh::node::FetchItem;
use zbmesh::transport::TransportEvent;
use zbmesh::types::{Address, AddressMode, DeviceType, MacCapabilities, HA_PROFILE_ID};
use zbmesh::zdp::{cluster, status, NodeDescriptor, SimpleDescriptor, ZdpResponse};

const EXT: u64 = 0x00158D0000000010;
const NWK: u16 = 0x4A10;

#[test]
fn node_descriptor_fetch_round_trip() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(EXT, NWK, router_caps()), now);
    let h = c
        .registry()
        .get_node(&Address::from_ext(EXT), AddressMode::Ext)
        .unwrap();

    let seq = c.request_fetch(h, FetchItem::NodeDescriptor, now).expect("queued");
    let req = c.transport().last_to(cluster::NODE_DESC_REQ).cloned().expect("sent");
    assert_eq!(req.asdu, vec![seq, 0x10, 0x4A]);
    assert!(c.registry().get(h).unwrap().fetch.get(FetchItem::NodeDescriptor).in_flight);

    c.handle_event(confirm(&req, ApsStatus::Success), now);
    assert_eq!(c.queue().get(req.id).unwrap().state(), RequestState::Confirmed);

    let rsp = ZdpResponse::NodeDescriptor {
        status: status::SUCCESS,
        nwk: NWK,
        descriptor: Some(NodeDescriptor::for_role(DeviceType::Router, router_caps(), 0x1135)),
    };
    c.handle_event(
        zdp_indication(Address::new(EXT, NWK), cluster::response_of(cluster::NODE_DESC_REQ), rsp.encode(seq)),
        now,
    );

    let n = c.registry().get(h).unwrap();
    assert!(n.fetch.get(FetchItem::NodeDescriptor).fetched);
    assert!(!n.fetch.get(FetchItem::NodeDescriptor).in_flight);
    assert_eq!(n.node_descriptor.as_ref().unwrap().manufacturer_code, 0x1135);
    assert_eq!(n.manufacturer_code(), Some(0x1135));
    assert_eq!(c.queue().get(req.id).unwrap().state(), RequestState::Finish);
}

#[test]
fn simple_descriptors_wait_for_active_endpoints() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(EXT, NWK, router_caps()), now);
    let h = c
        .registry()
        .get_node(&Address::from_ext(EXT), AddressMode::Ext)
        .unwrap();
    let src = Address::new(EXT, NWK);

    // descriptors for endpoints nobody asked about yet change nothing
    assert!(c.request_fetch(h, FetchItem::SimpleDescriptor, now).is_err());

    let seq = c.request_fetch(h, FetchItem::ActiveEndpoints, now).unwrap();
    let rsp = ZdpResponse::ActiveEndpoints {
        status: status::SUCCESS,
        nwk: NWK,
        endpoints: vec![1, 2],
    };
    c.handle_event(
        zdp_indication(src, cluster::response_of(cluster::ACTIVE_EP_REQ), rsp.encode(seq)),
        now,
    );
    assert_eq!(c.registry().get(h).unwrap().endpoints, vec![1, 2]);
    assert_eq!(c.registry().get(h).unwrap().missing_simple_descriptor(), Some(1));

    let seq = c.request_fetch(h, FetchItem::SimpleDescriptor, now).unwrap();
    let req = c.transport().last_to(cluster::SIMPLE_DESC_REQ).unwrap();
    assert_eq!(req.asdu, vec![seq, 0x10, 0x4A, 1]);
    let rsp = ZdpResponse::SimpleDescriptor {
        status: status::SUCCESS,
        nwk: NWK,
        descriptor: Some(SimpleDescriptor {
            endpoint: 1,
            profile_id: HA_PROFILE_ID,
            device_id: 0x0100,
            device_version: 1,
            in_clusters: vec![0x0000, 0x0006],
            out_clusters: vec![],
        }),
    };
    c.handle_event(
        zdp_indication(src, cluster::response_of(cluster::SIMPLE_DESC_REQ), rsp.encode(seq)),
        now,
    );
    assert_eq!(c.registry().get(h).unwrap().missing_simple_descriptor(), Some(2));
}

#[test]
fn quiet_receiver_turns_zombie_once() {
    let t0 = Instant::now();
    let mut c = controller(t0);
    let rx_on = MacCapabilities::MAINS_POWERED | MacCapabilities::RX_ON_WHEN_IDLE;
    for i in 0..4u64 {
        c.handle_event(announce(0x00158D0000000100 + i, 0x5000 + i as u16, rx_on), t0);
    }
    assert_eq!(c.registry().len(), 5);
    let target = c
        .registry()
        .get_node(&Address::from_nwk(0x5000), AddressMode::Nwk)
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    c.subscribe(EventKind::NodeZombieChanged, move |e| {
        if let Event::NodeZombieChanged { node, zombie } = e {
            sink.lock().unwrap().push((node.handle, *zombie));
        }
    });

    let tick = c.config().controller.tick();
    let mut now = t0;
    let run_until = |c: &mut zbmesh::controller::Controller<common::RecordingTransport>,
                     now: &mut Instant,
                     end: Instant| {
        while *now < end {
            *now += tick;
            c.timeout_tick(*now);
            c.tick(*now);
        }
    };

    run_until(&mut c, &mut now, t0 + Duration::from_secs(590));
    assert!(seen.lock().unwrap().is_empty());

    run_until(&mut c, &mut now, t0 + Duration::from_secs(700));
    let for_target: Vec<bool> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(h, _)| *h == target)
        .map(|(_, z)| *z)
        .collect();
    assert_eq!(for_target, vec![true]);
    assert!(c.registry().get(target).unwrap().is_zombie());
    assert_eq!(c.metrics().snapshot().zombie_transitions, 4);
}

#[test]
fn unanswered_zdp_request_counts_against_the_item() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(EXT, NWK, router_caps()), now);
    let h = c
        .registry()
        .get_node(&Address::from_ext(EXT), AddressMode::Ext)
        .unwrap();

    c.request_fetch(h, FetchItem::PowerDescriptor, now).unwrap();
    let req = c.transport().last_to(cluster::POWER_DESC_REQ).cloned().unwrap();
    c.handle_event(confirm(&req, ApsStatus::Success), now);

    // confirmed but the response never comes
    c.timeout_tick(now + Duration::from_secs(11));
    let st = c.registry().get(h).unwrap().fetch.get(FetchItem::PowerDescriptor).clone();
    assert!(!st.in_flight);
    assert!(!st.fetched);
    assert_eq!(st.retries, 1);
}

#[test]
fn request_ids_stay_unique_while_pending() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    for i in 0..6u16 {
        c.handle_event(announce(0x00158D0000000200 + u64::from(i), 0x6000 + i, router_caps()), now);
    }

    let mut t = now;
    for round in 0..400u32 {
        t += Duration::from_millis(80);
        let nwk = 0x6000 + (round % 6) as u16;
        let req = ApsDataRequest::new(
            Address::from_nwk(nwk),
            AddressMode::Nwk,
            HA_PROFILE_ID,
            0x0006,
            vec![0x01, round as u8, 0x02],
        );
        let _ = c.apsde_data_request(req, t);

        // confirm about half of what is in flight
        let busy: Vec<ApsDataRequest> = c
            .queue()
            .iter()
            .filter(|r| r.state() == RequestState::Busy)
            .cloned()
            .collect();
        for r in busy.iter().filter(|r| (r.id as u32 + round) % 2 == 0) {
            c.handle_event(confirm(r, ApsStatus::Success), t);
        }
        c.timeout_tick(t);

        let mut ids: Vec<u8> = c
            .queue()
            .iter()
            .filter(|r| !matches!(r.state(), RequestState::Finish | RequestState::Failure))
            .map(|r| r.id)
            .collect();
        let n = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), n, "duplicate request id in round {}", round);
        assert!(c.queue().count_state(RequestState::Idle) <= 24);
    }
}

#[test]
fn device_announce_with_new_address_updates_node() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(announce(EXT, NWK, router_caps()), now);
    let h = c
        .registry()
        .get_node(&Address::from_ext(EXT), AddressMode::Ext)
        .unwrap();

    let moved = Arc::new(Mutex::new(None));
    let sink = moved.clone();
    c.subscribe(EventKind::UpdatedNodeAddress, move |e| {
        if let Event::UpdatedNodeAddress { node, previous } = e {
            *sink.lock().unwrap() = Some((node.address, *previous));
        }
    });

    c.handle_event(announce(EXT, 0x7B7B, router_caps()), now + Duration::from_secs(1));
    assert_eq!(c.registry().get(h).unwrap().address().nwk(), Some(0x7B7B));
    assert!(c
        .registry()
        .get_node(&Address::from_nwk(NWK), AddressMode::Nwk)
        .is_none());
    let got = *moved.lock().unwrap();
    let (addr, previous) = got.expect("address event");
    assert_eq!(addr.nwk(), Some(0x7B7B));
    assert_eq!(previous.nwk(), Some(NWK));
}

#[test]
fn disconnect_fails_everything_in_flight() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(EXT, NWK, router_caps()), now);
    let req = ApsDataRequest::new(
        Address::from_nwk(NWK),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x01, 0x02],
    );
    c.apsde_data_request(req.clone(), now).unwrap();
    c.handle_event(
        TransportEvent::Disconnected {
            reason: "unplugged".into(),
        },
        now,
    );
    assert!(!c.is_connected());
    assert!(c.queue().iter().all(|r| r.state() == RequestState::Failure));
    assert!(c.apsde_data_request(req, now).is_err());
}

#[test]
fn response_ahead_of_confirm_still_counts_the_delivery() {
    let now = Instant::now();
    let mut c = controller(now);
    c.handle_event(TransportEvent::Connected, now);
    c.handle_event(announce(0x00158D0000000020, 0x4A20, router_caps()), now);
    c.handle_event(announce(EXT, NWK, router_caps()), now);
    let relay = c
        .registry()
        .get_node(&Address::from_nwk(0x4A20), AddressMode::Nwk)
        .unwrap();
    let dest = c
        .registry()
        .get_node(&Address::from_ext(EXT), AddressMode::Ext)
        .unwrap();
    let coordinator = c.registry().coordinator().unwrap();
    let hash = c.add_user_route(&[coordinator, relay, dest], now).unwrap();

    let confirms = Arc::new(Mutex::new(Vec::new()));
    let sink = confirms.clone();
    c.subscribe(EventKind::ApsDataConfirm, move |e| {
        if let Event::ApsDataConfirm(conf) = e {
            sink.lock().unwrap().push(conf.status);
        }
    });

    let seq = c.request_fetch(dest, FetchItem::ActiveEndpoints, now).unwrap();
    let req = c.transport().last_to(cluster::ACTIVE_EP_REQ).cloned().unwrap();
    assert_eq!(req.source_route.as_ref().map(|t| t.uuid_hash), Some(hash));

    // fast radio: the answer overtakes the confirm
    let rsp = ZdpResponse::ActiveEndpoints {
        status: status::SUCCESS,
        nwk: NWK,
        endpoints: vec![1],
    };
    c.handle_event(
        zdp_indication(Address::new(EXT, NWK), cluster::response_of(cluster::ACTIVE_EP_REQ), rsp.encode(seq)),
        now,
    );
    assert_eq!(c.registry().get(dest).unwrap().endpoints, vec![1]);
    assert_eq!(c.queue().get(req.id).unwrap().state(), RequestState::Busy);

    c.handle_event(confirm(&req, ApsStatus::Success), now);
    assert_eq!(c.routing().route(hash).unwrap().tx_ok, 1);
    assert_eq!(c.queue().get(req.id).unwrap().state(), RequestState::Finish);
    assert_eq!(c.registry().get(dest).unwrap().recv_errors, 0);

    c.timeout_tick(now + Duration::from_secs(1));
    assert!(c.queue().get(req.id).is_none());
    assert_eq!(*confirms.lock().unwrap(), vec![ApsStatus::Success]);
}

#[test]
fn radio_stuck_busy_triggers_rejoin() {
    let t0 = Instant::now();
    let mut c = controller(t0);
    c.handle_event(TransportEvent::Connected, t0);
    c.handle_event(announce(EXT, NWK, router_caps()), t0);
    c.transport_mut().busy = true;

    let resets = Arc::new(Mutex::new(0u32));
    let sink = resets.clone();
    c.subscribe(EventKind::NetworkReset, move |_| *sink.lock().unwrap() += 1);

    let req = ApsDataRequest::new(
        Address::from_nwk(NWK),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x05, 0x02],
    );
    let id = c.apsde_data_request(req, t0).unwrap();

    let tick = c.config().controller.tick();
    let mut now = t0;
    for _ in 0..500 {
        if c.transport().rejoins > 0 {
            break;
        }
        now += tick;
        c.timeout_tick(now);
        c.tick(now);
    }

    assert_eq!(c.transport().rejoins, 1);
    assert_eq!(*resets.lock().unwrap(), 1);
    assert_eq!(c.metrics().snapshot().systemic_faults, 1);
    assert_eq!(c.queue().get(id).unwrap().state(), RequestState::Failure);
    assert!(c.transport().sent.is_empty());
}

#[test]
fn fast_probe_expires_after_quiet_period() {
    let t0 = Instant::now();
    let mut c = controller(t0);
    c.handle_event(TransportEvent::Connected, t0);
    c.handle_event(announce(EXT, NWK, router_caps()), t0);
    let h = c
        .registry()
        .get_node(&Address::from_ext(EXT), AddressMode::Ext)
        .unwrap();
    assert_eq!(c.fast_probe_nodes().collect::<Vec<_>>(), vec![h]);

    // the radio goes away, so nothing refreshes the probe
    c.handle_event(
        TransportEvent::Disconnected {
            reason: "unplugged".into(),
        },
        t0,
    );
    let tick = c.config().controller.tick();
    let mut now = t0;
    while now < t0 + FAST_PROBE_LIFETIME - Duration::from_secs(10) {
        now += tick;
        c.tick(now);
    }
    assert_eq!(c.fast_probe_nodes().count(), 1);

    while now < t0 + FAST_PROBE_LIFETIME + Duration::from_secs(1) {
        now += tick;
        c.tick(now);
    }
    assert_eq!(c.fast_probe_nodes().count(), 0);
}
