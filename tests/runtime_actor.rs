//! The tokio actor: commands, transport events and fan-out of controller events.

mod common;

use std::time::{Duration, Instant};

use common::{announce, config, router_caps, RecordingTransport};
use tokio::sync::{broadcast, mpsc};
use zbmesh::aps::ApsDataRequest;
use zbmesh::controller::Controller;
use zbmesh::error::ApsError;
use zbmesh::events::Event;
use zbmesh::runtime::start_controller;
use zbmesh::storage::MemoryStore;
use zbmesh::transport::TransportEvent;
use zbmesh::types::{Address, AddressMode, HA_PROFILE_ID};

const EXT: u64 = 0x00158D0000000099;
const NWK: u16 = 0x9999;

fn spawn() -> (zbmesh::ControllerHandle, mpsc::Sender<TransportEvent>) {
    let mut cfg = config(true);
    cfg.controller.tick_ms = 10;
    let controller = Controller::new(
        cfg,
        RecordingTransport::default(),
        Box::new(MemoryStore::default()),
        Instant::now(),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel(64);
    (start_controller(controller, rx), tx)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(e) if pred(&e) => return e,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event in time")
}

fn on_off() -> ApsDataRequest {
    ApsDataRequest::new(
        Address::from_nwk(NWK),
        AddressMode::Nwk,
        HA_PROFILE_ID,
        0x0006,
        vec![0x01, 0x30, 0x02],
    )
}

#[tokio::test]
async fn announce_then_request_through_handle() {
    let (handle, radio) = spawn();
    let mut events = handle.subscribe();

    radio.send(TransportEvent::Connected).await.unwrap();
    radio.send(announce(EXT, NWK, router_caps())).await.unwrap();
    let added = wait_for(&mut events, |e| matches!(e, Event::NodeAdded(_))).await;
    if let Event::NodeAdded(n) = added {
        assert_eq!(n.address.ext(), Some(EXT));
    }

    let id = handle.apsde_data_request(on_off()).await.expect("queued");
    assert_ne!(id, 0);

    let snap = handle.snapshot().await.expect("snapshot");
    assert!(snap.connected);
    assert!(snap.nodes.iter().any(|n| n.address.ext() == Some(EXT)));

    // the ticker hands the frame to the radio on its own
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.metrics().aps_sent == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frame sent");

    handle.shutdown().await;
    assert_eq!(
        handle.apsde_data_request(on_off()).await,
        Err(ApsError::NotConnected)
    );
    assert!(handle.snapshot().await.is_none());
}

#[tokio::test]
async fn dropped_driver_reads_as_disconnect() {
    let (handle, radio) = spawn();
    let mut events = handle.subscribe();
    radio.send(TransportEvent::Connected).await.unwrap();
    radio.send(announce(EXT, NWK, router_caps())).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::NodeAdded(_))).await;

    drop(radio);
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.snapshot().await.map(|s| s.connected).unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect noticed");
    assert_eq!(
        handle.apsde_data_request(on_off()).await,
        Err(ApsError::NotConnected)
    );
    handle.shutdown().await;
}
