//! # zbmesh - ZigBee coordinator control plane
//!
//! zbmesh keeps the network-side view of a ZigBee mesh on the coordinator:
//! which devices exist, what they are, who hears whom, and how frames to
//! them should be routed. It sits between an application and a radio driver
//! that speaks APSDE-DATA.
//!
//! ## Features
//!
//! - **APS Request Queue**: Bounded per-destination queueing with busy/sleep backoff and confirm matching.
//! - **Device Discovery**: Device_annce handling, ZDP fetch of descriptors, endpoints, neighbor and binding tables.
//! - **Source Routing**: Route calculation from collected neighbor tables, health scoring and route selection.
//! - **Zombie Detection**: Devices that stop talking are flagged and their routes retired.
//! - **Persistence**: Node table stored as JSON with lock-protected atomic writes.
//! - **Simulator**: A TOML-described mesh behind the same transport seam, for tests and demos.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use zbmesh::config::Config;
//! use zbmesh::controller::Controller;
//! use zbmesh::sim::SimMesh;
//! use zbmesh::storage::MemoryStore;
//! use zbmesh::transport::RadioTransport;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let now = Instant::now();
//!     let ext = config.controller.coordinator_ext()?;
//!     let mut mesh = SimMesh::load("demos/topology.toml", ext, now)?;
//!     mesh.connect();
//!     let mut controller = Controller::new(config, mesh, Box::new(MemoryStore::default()), now)?;
//!     for event in controller.transport_mut().poll(now) {
//!         controller.handle_event(event, now);
//!     }
//!     controller.tick(now);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`controller`] - The façade: event intake, tick work, discovery and bind tasks
//! - [`aps`] - APSDE-DATA primitives and the request queue
//! - [`zdp`] - ZigBee Device Profile frame codec
//! - [`node`] / [`registry`] - Node records and the node arena
//! - [`routing`] - Source route engine
//! - [`zombie`] - Liveness detection
//! - [`runtime`] - Tokio actor around the controller
//! - [`sim`] - Simulated mesh transport
//! - [`storage`] - Device store
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Application   │ ← ControllerHandle, event subscribers
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Controller    │ ← queue, registry, routing, zombie, scheduler
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ RadioTransport  │ ← radio driver or SimMesh
//! └─────────────────┘
//! ```

pub mod aps;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logutil;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod scheduler;
pub mod sim;
pub mod storage;
pub mod transport;
pub mod types;
pub mod zdp;
pub mod zombie;

pub use aps::{ApsDataConfirm, ApsDataIndication, ApsDataRequest, ApsStatus};
pub use controller::{Controller, ControllerSnapshot, DeleteMode};
pub use events::{Event, EventKind};
pub use registry::NodeHandle;
pub use runtime::{start_controller, ControllerHandle};
pub use transport::{RadioTransport, SendResult, TransportEvent};
pub use types::{Address, AddressMode};
