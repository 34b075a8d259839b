//! Notification events emitted by the controller.
//!
//! Observers register with [`EventBus::subscribe`] and are called
//! synchronously in emission order. Handlers only see an `&Event`; they cannot
//! reach back into the controller while it is mid-operation.

use serde::Serialize;

use crate::aps::{ApsDataConfirm, ApsDataIndication};
use crate::registry::NodeHandle;
use crate::types::Address;

/// Snapshot of a node at emission time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeRef {
    pub handle: NodeHandle,
    pub id: u32,
    pub address: Address,
}

/// Snapshot of a source route at emission time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteRef {
    pub uuid: String,
    pub uuid_hash: u32,
    pub destination: Option<NodeHandle>,
    pub hops: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Event {
    NodeAdded(NodeRef),
    NodeRemoved(NodeRef),
    NodeZombieChanged { node: NodeRef, zombie: bool },
    UpdatedNodeDescriptor(NodeRef),
    UpdatedSimpleDescriptor { node: NodeRef, endpoint: u8 },
    UpdatedPowerDescriptor(NodeRef),
    UpdatedUserDescriptor(NodeRef),
    UpdatedNodeAddress { node: NodeRef, previous: Address },
    SourceRouteCreated(RouteRef),
    SourceRouteChanged(RouteRef),
    SourceRouteDeleted { uuid: String, uuid_hash: u32 },
    ApsDataConfirm(ApsDataConfirm),
    ApsDataIndication(ApsDataIndication),
    /// Systemic fault recovery dropped all in-flight work.
    NetworkReset,
}

/// Discriminant of [`Event`], used to filter subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeAdded,
    NodeRemoved,
    NodeZombieChanged,
    UpdatedNodeDescriptor,
    UpdatedSimpleDescriptor,
    UpdatedPowerDescriptor,
    UpdatedUserDescriptor,
    UpdatedNodeAddress,
    SourceRouteCreated,
    SourceRouteChanged,
    SourceRouteDeleted,
    ApsDataConfirm,
    ApsDataIndication,
    NetworkReset,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NodeAdded(_) => EventKind::NodeAdded,
            Event::NodeRemoved(_) => EventKind::NodeRemoved,
            Event::NodeZombieChanged { .. } => EventKind::NodeZombieChanged,
            Event::UpdatedNodeDescriptor(_) => EventKind::UpdatedNodeDescriptor,
            Event::UpdatedSimpleDescriptor { .. } => EventKind::UpdatedSimpleDescriptor,
            Event::UpdatedPowerDescriptor(_) => EventKind::UpdatedPowerDescriptor,
            Event::UpdatedUserDescriptor(_) => EventKind::UpdatedUserDescriptor,
            Event::UpdatedNodeAddress { .. } => EventKind::UpdatedNodeAddress,
            Event::SourceRouteCreated(_) => EventKind::SourceRouteCreated,
            Event::SourceRouteChanged(_) => EventKind::SourceRouteChanged,
            Event::SourceRouteDeleted { .. } => EventKind::SourceRouteDeleted,
            Event::ApsDataConfirm(_) => EventKind::ApsDataConfirm,
            Event::ApsDataIndication(_) => EventKind::ApsDataIndication,
            Event::NetworkReset => EventKind::NetworkReset,
        }
    }
}

pub type SubscriptionId = u64;

type Handler = Box<dyn FnMut(&Event) + Send>;

struct Subscriber {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    next_id: SubscriptionId,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for one kind of event.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.add(Some(kind), Box::new(handler))
    }

    /// Register for every event.
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.add(None, Box::new(handler))
    }

    fn add(&mut self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id: self.next_id,
            kind,
            handler,
        });
        self.next_id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before != self.subscribers.len()
    }

    pub fn emit(&mut self, event: &Event) {
        let kind = event.kind();
        for s in self.subscribers.iter_mut() {
            if s.kind.map(|k| k == kind).unwrap_or(true) {
                (s.handler)(event);
            }
        }
    }
}
