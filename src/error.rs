use thiserror::Error;

/// Synchronous admission errors returned by `apsde_data_request`.
///
/// Callers are expected to drop or reschedule the request; nothing is queued
/// on their behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApsError {
    /// The radio link is down.
    #[error("not connected to the radio")]
    NotConnected,

    /// The queue, the radio or the destination cannot take more frames now.
    #[error("aps request queue is full")]
    QueueIsFull,

    /// The destination is flagged zombie (or is a ghost coordinator entry).
    #[error("destination node is a zombie")]
    NodeIsZombie,

    /// The request itself is malformed (no destination address, empty ZDP frame).
    #[error("invalid request parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Errors raised by the node registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Joining is closed and the device store does not know this address.
    #[error("unknown device {0:#018x} while joining is closed")]
    UnknownDevice(u64),

    /// Joining is closed and only the network address is known, so the store
    /// cannot vouch for the device.
    #[error("network address 0x{0:04X} has no extended address while joining is closed")]
    UnresolvedAddress(u16),

    /// Creation needs at least one address half.
    #[error("address carries neither extended nor network address")]
    NoAddress,

    /// Another live node already owns this extended address.
    #[error("extended address {0:#018x} already belongs to another node")]
    DuplicateExtAddress(u64),

    /// Slot 0 holds the local coordinator, which cannot be deleted.
    #[error("the coordinator node cannot be deleted")]
    Coordinator,

    /// The handle refers to a node that has been erased.
    #[error("stale node handle")]
    StaleHandle,
}

/// Errors while decoding ZDP frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZdpError {
    /// Frame ended before a mandatory field.
    #[error("truncated {what} frame ({len} bytes)")]
    Truncated { what: &'static str, len: usize },

    /// Decoder invoked for the wrong cluster.
    #[error("unexpected zdp cluster 0x{0:04X}")]
    UnexpectedCluster(u16),

    /// Response carries a non-success status; no payload follows.
    #[error("zdp status 0x{0:02X}")]
    Status(u8),
}

/// Rejections when a source route is built by hand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route needs between 2 and {max} hops, got {got}")]
    HopCount { got: usize, max: usize },

    #[error("first hop must be the coordinator")]
    NotFromCoordinator,

    #[error("hop {0} appears twice")]
    Cycle(usize),

    /// A hop refers to an erased node or one without a network address.
    #[error("hop {0} cannot be resolved")]
    UnresolvedHop(usize),

    /// Source routing is switched off in the configuration.
    #[error("source routing is disabled")]
    Disabled,
}

/// Errors of the persistent device store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
