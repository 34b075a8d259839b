//! Boundary to the serial-attached radio.
//!
//! The wire protocol to the radio is not part of this crate; a driver
//! implements [`RadioTransport`] for the outbound direction and feeds
//! [`TransportEvent`]s back in delivery order.

use serde::{Deserialize, Serialize};

use crate::aps::{ApsDataConfirm, ApsDataIndication, ApsDataRequest};
use crate::types::Address;

/// Immediate answer of the radio to a send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendResult {
    /// Accepted; a confirm will follow.
    Ok,
    /// No buffer free right now.
    Busy,
    NotConnected,
    /// Refused for good (not joined, malformed).
    Rejected,
}

pub trait RadioTransport {
    fn send_request(&mut self, req: &ApsDataRequest) -> SendResult;

    /// The radio has a free request slot.
    fn has_free_slot(&self) -> bool;

    /// Leave the network and rejoin; last resort when the radio appears stuck.
    fn leave_and_rejoin(&mut self);
}

impl<T: RadioTransport + ?Sized> RadioTransport for Box<T> {
    fn send_request(&mut self, req: &ApsDataRequest) -> SendResult {
        (**self).send_request(req)
    }

    fn has_free_slot(&self) -> bool {
        (**self).has_free_slot()
    }

    fn leave_and_rejoin(&mut self) {
        (**self).leave_and_rejoin()
    }
}

/// Asynchronous events delivered by the radio driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Confirm(ApsDataConfirm),
    Indication(ApsDataIndication),
    /// A sleeping end device polled its parent.
    MacPoll { address: Address, lifetime: u32 },
    Beacon { source: u16, channel: u8, update_id: u8 },
}
