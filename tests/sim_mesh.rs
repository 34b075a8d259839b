//! Controller against the simulated mesh, end to end in virtual time.

use std::time::{Duration, Instant};

use zbmesh::config::Config;
use zbmesh::controller::Controller;
use zbmesh::node::FetchItem;
use zbmesh::registry::NodeHandle;
use zbmesh::sim::{SimMesh, Topology};
use zbmesh::storage::MemoryStore;
use zbmesh::types::{Address, AddressMode};

const COORDINATOR: u64 = 0x00212EFFFF000001;
const R1: u64 = 0x00158D0000000001;
const R2: u64 = 0x00158D0000000002;
const SLEEPER: u64 = 0x00158D0000000003;

const TOPOLOGY: &str = r#"
latency_ms = 20
seed = 3

[[device]]
ext = "0x00158D0000000001"
nwk = 0x1001
role = "router"
manufacturer_code = 0x1135
links = [{ peer = "coordinator", lqi = 220 }]

[[device.endpoints]]
endpoint = 1
device_id = 0x0100
in_clusters = [0x0000, 0x0006]

[[device]]
ext = "0x00158D0000000002"
nwk = 0x1002
role = "router"
manufacturer_code = 0x1135
firmware_version = 0x00000012
links = [{ peer = "0x00158D0000000001", lqi = 200 }]

[[device.endpoints]]
endpoint = 1
device_id = 0x0100
in_clusters = [0x0000, 0x0006, 0x0019]

[[device]]
ext = "0x00158D0000000003"
nwk = 0x1003
role = "sleepy_end_device"
links = [{ peer = "0x00158D0000000001", lqi = 160 }]

[[device.endpoints]]
endpoint = 1
device_id = 0x0402
in_clusters = [0x0000, 0x0500]
"#;

fn boot(start: Instant) -> Controller<SimMesh> {
    let mut config = Config::default();
    config.controller.coordinator_ext = format!("0x{:016X}", COORDINATOR);
    config.discovery.permit_join = true;
    let topology = Topology::from_toml(TOPOLOGY).unwrap();
    let mut mesh = SimMesh::new(topology, COORDINATOR, start).unwrap();
    mesh.connect();
    Controller::new(config, mesh, Box::new(MemoryStore::default()), start).unwrap()
}

fn run(c: &mut Controller<SimMesh>, now: &mut Instant, secs: u64) {
    let step = c.config().controller.tick();
    let end = *now + Duration::from_secs(secs);
    while *now < end {
        *now += step;
        for ev in c.transport_mut().poll(*now) {
            c.handle_event(ev, *now);
        }
        c.timeout_tick(*now);
        c.tick(*now);
    }
}

fn handle(c: &Controller<SimMesh>, ext: u64) -> NodeHandle {
    c.registry()
        .get_node(&Address::from_ext(ext), AddressMode::Ext)
        .unwrap_or_else(|| panic!("node {:016X} missing", ext))
}

#[test]
fn discovers_mesh_and_routes_through_relay() {
    let start = Instant::now();
    let mut now = start;
    let mut c = boot(start);
    run(&mut c, &mut now, 300);

    assert!(c.is_connected());
    assert_eq!(c.registry().len(), 4);
    let r1 = handle(&c, R1);
    let r2 = handle(&c, R2);
    let sleeper = handle(&c, SLEEPER);

    for h in [r1, r2] {
        let n = c.registry().get(h).unwrap();
        assert!(n.fetch.get(FetchItem::NodeDescriptor).fetched);
        assert!(n.fetch.get(FetchItem::ActiveEndpoints).fetched);
        assert_eq!(n.endpoints, vec![1]);
        assert_eq!(n.manufacturer_code(), Some(0x1135));
        assert!(n.is_router());
    }
    assert!(c.registry().get(sleeper).unwrap().is_end_device());

    // R1's neighbor table, learned via Mgmt_Lqi
    let r1_node = c.registry().get(r1).unwrap();
    assert_eq!(r1_node.neighbor(r2).map(|e| e.lqi), Some(200));
    assert!(r1_node.neighbor(sleeper).is_some());

    let coordinator = c.registry().coordinator().unwrap();
    assert!(c
        .routing()
        .routes_to(r2)
        .any(|r| r.hop_handles() == vec![coordinator, r1, r2]));
    let tag = c.routing().get_source_route(r2, c.registry()).expect("route to R2");
    assert_eq!(tag.relays, vec![0x1001]);
    assert!(c.metrics().snapshot().zdp_responses > 0);
}

#[test]
fn renumbered_device_keeps_its_identity() {
    let start = Instant::now();
    let mut now = start;
    let mut c = boot(start);
    run(&mut c, &mut now, 30);
    let r1 = handle(&c, R1);
    let id = c.registry().get(r1).unwrap().id();

    assert!(c.transport_mut().renumber(R1, 0x2001));
    run(&mut c, &mut now, 5);
    let n = c.registry().get(r1).unwrap();
    assert_eq!(n.id(), id);
    assert_eq!(n.address().nwk(), Some(0x2001));
    assert!(c
        .registry()
        .get_node(&Address::from_nwk(0x1001), AddressMode::Nwk)
        .is_none());
}

#[test]
fn ota_query_reports_firmware() {
    let start = Instant::now();
    let mut now = start;
    let mut c = boot(start);
    run(&mut c, &mut now, 30);
    assert!(c.transport_mut().query_next_image(R2));
    run(&mut c, &mut now, 2);
    let fw = c.registry().get(handle(&c, R2)).unwrap().firmware.expect("firmware");
    assert_eq!(fw.file_version, 0x00000012);
}

#[test]
fn bundled_demo_topology_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/topology.toml");
    let mesh = SimMesh::load(path, COORDINATOR, Instant::now()).expect("demo topology");
    assert_eq!(mesh.device_count(), 5);
}

#[tokio::test]
async fn bundled_demo_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/config.toml");
    let loaded = Config::load(path).await.expect("demo config");
    let defaults = Config::default();
    assert_eq!(loaded.controller.tick_ms, defaults.controller.tick_ms);
    assert_eq!(loaded.routing.min_lqi, defaults.routing.min_lqi);
    assert_eq!(loaded.zombie.end_device_secs, defaults.zombie.end_device_secs);
    assert_eq!(
        loaded.controller.coordinator_ext().unwrap(),
        defaults.controller.coordinator_ext().unwrap()
    );
}
