//! Tokio actor around the [`Controller`].
//!
//! The controller itself is synchronous and clock-free. [`start_controller`]
//! moves it into a task that serializes three inputs onto one thread of
//! control:
//!
//! * transport events, in delivery order, from an mpsc channel fed by the
//!   radio driver
//! * two independent timers at the tick period, one for `tick` and one for
//!   `timeout_tick`
//! * commands from any number of [`ControllerHandle`] clones
//!
//! Events emitted by the controller are fanned out on a broadcast channel.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, interval_at, MissedTickBehavior};

use crate::aps::ApsDataRequest;
use crate::controller::{Controller, ControllerSnapshot, DeleteMode};
use crate::error::{ApsError, RegistryError};
use crate::events::Event;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::NodeHandle;
use crate::transport::{RadioTransport, TransportEvent};
use crate::zdp::BindingRecord;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The one time source for every controller input. Readings come from the
/// tokio clock and never go backwards.
#[derive(Debug)]
struct Clock {
    last: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            last: tokio::time::Instant::now().into_std(),
        }
    }

    fn now(&mut self) -> Instant {
        let t = tokio::time::Instant::now().into_std().max(self.last);
        self.last = t;
        t
    }
}

pub enum ControllerCommand {
    ApsDataRequest(ApsDataRequest, oneshot::Sender<Result<u8, ApsError>>),
    Snapshot(oneshot::Sender<ControllerSnapshot>),
    DeleteNode(NodeHandle, DeleteMode, oneshot::Sender<Result<(), RegistryError>>),
    Bind {
        record: BindingRecord,
        unbind: bool,
        resp: oneshot::Sender<bool>,
    },
    SetPermitJoin(bool),
    Save(oneshot::Sender<Result<usize>>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerCommand>,
    events: broadcast::Sender<Event>,
    metrics: Arc<Metrics>,
}

impl ControllerHandle {
    /// Submit an APSDE-DATA.request. A stopped controller reads as not connected.
    pub async fn apsde_data_request(&self, req: ApsDataRequest) -> Result<u8, ApsError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ControllerCommand::ApsDataRequest(req, tx)).is_err() {
            return Err(ApsError::NotConnected);
        }
        rx.await.unwrap_or(Err(ApsError::NotConnected))
    }

    pub async fn snapshot(&self) -> Option<ControllerSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ControllerCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn delete_node(&self, node: NodeHandle, mode: DeleteMode) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControllerCommand::DeleteNode(node, mode, tx))
            .map_err(|_| anyhow!("controller stopped"))?;
        rx.await.map_err(|_| anyhow!("controller stopped"))??;
        Ok(())
    }

    pub async fn bind(&self, record: BindingRecord) -> Result<bool> {
        self.bind_command(record, false).await
    }

    pub async fn unbind(&self, record: BindingRecord) -> Result<bool> {
        self.bind_command(record, true).await
    }

    async fn bind_command(&self, record: BindingRecord, unbind: bool) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControllerCommand::Bind {
                record,
                unbind,
                resp: tx,
            })
            .map_err(|_| anyhow!("controller stopped"))?;
        rx.await.map_err(|_| anyhow!("controller stopped"))
    }

    pub fn set_permit_join(&self, permit: bool) {
        let _ = self.tx.send(ControllerCommand::SetPermitJoin(permit));
    }

    /// Persist the node table now. Returns how many nodes were written.
    pub async fn save(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControllerCommand::Save(tx))
            .map_err(|_| anyhow!("controller stopped"))?;
        rx.await.map_err(|_| anyhow!("controller stopped"))?
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Save the node table and stop the actor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(ControllerCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

fn save<T: RadioTransport>(controller: &mut Controller<T>, now: Instant) -> Result<usize> {
    let n = controller.save_nodes_state(now)?;
    debug!("node table saved ({} nodes)", n);
    Ok(n)
}

/// Spawn the controller task. `events_rx` carries transport events from the
/// radio driver.
pub fn start_controller<T>(
    mut controller: Controller<T>,
    mut events_rx: mpsc::Receiver<TransportEvent>,
) -> ControllerHandle
where
    T: RadioTransport + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ControllerCommand>();
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let forward = event_tx.clone();
    controller.subscribe_all(move |e| {
        // no receivers is fine
        let _ = forward.send(e.clone());
    });
    let handle = ControllerHandle {
        tx,
        events: event_tx,
        metrics: controller.metrics(),
    };

    tokio::spawn(async move {
        let period = controller.config().controller.tick();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timeouts = interval(period);
        timeouts.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let save_secs = controller.config().storage.save_interval_secs;
        let save_period = Duration::from_secs(save_secs.max(1));
        let mut saver = interval_at(tokio::time::Instant::now() + save_period, save_period);
        saver.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut clock = Clock::new();
        let mut transport_open = true;
        info!("controller started, tick {} ms", period.as_millis());
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("all controller handles dropped");
                        break;
                    };
                    match cmd {
                        ControllerCommand::ApsDataRequest(req, resp) => {
                            let _ = resp.send(controller.apsde_data_request(req, clock.now()));
                        }
                        ControllerCommand::Snapshot(resp) => {
                            let _ = resp.send(controller.snapshot(clock.now()));
                        }
                        ControllerCommand::DeleteNode(h, mode, resp) => {
                            let _ = resp.send(controller.delete_node(h, mode));
                        }
                        ControllerCommand::Bind { record, unbind, resp } => {
                            let queued = if unbind {
                                controller.unbind(record)
                            } else {
                                controller.bind(record)
                            };
                            let _ = resp.send(queued);
                        }
                        ControllerCommand::SetPermitJoin(permit) => controller.set_permit_join(permit),
                        ControllerCommand::Save(resp) => {
                            let _ = resp.send(save(&mut controller, clock.now()));
                        }
                        ControllerCommand::Shutdown(done) => {
                            if let Err(e) = save(&mut controller, clock.now()) {
                                warn!("final save failed: {}", e);
                            }
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                ev = events_rx.recv(), if transport_open => {
                    match ev {
                        Some(ev) => controller.handle_event(ev, clock.now()),
                        None => {
                            warn!("transport event channel closed");
                            transport_open = false;
                            controller.handle_event(
                                TransportEvent::Disconnected { reason: "driver gone".to_string() },
                                clock.now(),
                            );
                        }
                    }
                }
                _ = ticker.tick() => controller.tick(clock.now()),
                _ = timeouts.tick() => controller.timeout_tick(clock.now()),
                _ = saver.tick(), if save_secs > 0 => {
                    if let Err(e) = save(&mut controller, clock.now()) {
                        warn!("periodic save failed: {}", e);
                    }
                }
            }
        }
        debug!("controller loop terminated");
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_never_runs_backwards() {
        let mut clock = Clock::new();
        let a = clock.now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = clock.now();
        assert!(b >= a + Duration::from_millis(5));

        // a reading ahead of the tokio clock holds until time catches up
        let ahead = b + Duration::from_secs(60);
        clock.last = ahead;
        assert_eq!(clock.now(), ahead);
        assert_eq!(clock.now(), ahead);
    }
}
