//! APSDE-DATA primitives exchanged with the radio.

pub mod queue;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::node::FetchItem;
use crate::registry::NodeHandle;
use crate::types::{Address, AddressMode, ZDO_ENDPOINT, ZDP_PROFILE_ID};
use crate::zdp::ZdpRequest;

pub use queue::{ApsRequestQueue, QueueLimits};

/// OTA Upgrade cluster.
pub const OTA_CLUSTER_ID: u16 = 0x0019;
/// OTA Query Next Image Request command.
pub const OTA_QUERY_NEXT_IMAGE_REQUEST: u8 = 0x01;
/// OTA Image Block Response command.
pub const OTA_IMAGE_BLOCK_RESPONSE: u8 = 0x05;
/// ZCL Default Response command.
pub const ZCL_DEFAULT_RESPONSE: u8 = 0x0B;

bitflags! {
    /// APSDE-DATA.request transmit options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TxOptions: u8 {
        const SECURITY = 0x01;
        const USE_NWK_KEY = 0x02;
        const ACK = 0x04;
        const FRAGMENTATION = 0x08;
    }
}

/// Queue state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Waiting to be handed to the radio.
    Idle,
    /// Handed to the radio, confirm outstanding.
    Busy,
    /// Confirm received; a ZDP response is still awaited.
    Confirmed,
    /// Done.
    Finish,
    /// Failed; a confirm has not been surfaced yet.
    Failure,
}

impl RequestState {
    /// Idle or Busy: still on its way to the device.
    pub fn is_pending(self) -> bool {
        matches!(self, RequestState::Idle | RequestState::Busy)
    }
}

/// APSDE-DATA.confirm status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApsStatus {
    Success,
    ApsNoAck,
    MacNoAck,
    MacTransactionExpired,
    NwkRouteDiscoveryFailed,
    MacChannelAccessFailure,
    /// Synthesized by the queue when no confirm arrived in time.
    Timeout,
    Other(u8),
}

impl ApsStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ApsStatus::Success,
            0xA7 => ApsStatus::ApsNoAck,
            0xE9 => ApsStatus::MacNoAck,
            0xF0 => ApsStatus::MacTransactionExpired,
            0xD0 => ApsStatus::NwkRouteDiscoveryFailed,
            0xE1 => ApsStatus::MacChannelAccessFailure,
            other => ApsStatus::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ApsStatus::Success => 0x00,
            ApsStatus::ApsNoAck => 0xA7,
            ApsStatus::MacNoAck => 0xE9,
            ApsStatus::MacTransactionExpired => 0xF0,
            ApsStatus::NwkRouteDiscoveryFailed => 0xD0,
            ApsStatus::MacChannelAccessFailure => 0xE1,
            ApsStatus::Timeout => 0xFF,
            ApsStatus::Other(c) => c,
        }
    }

    pub fn is_success(self) -> bool {
        self == ApsStatus::Success
    }
}

impl fmt::Display for ApsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.code())
    }
}

/// Source route attached to an outgoing frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRouteTag {
    pub uuid_hash: u32,
    /// Network addresses of the relays, coordinator excluded, destination excluded.
    pub relays: Vec<u16>,
}

/// Marks a request issued by the controller itself for a ZDP exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZdpTag {
    pub node: NodeHandle,
    pub item: Option<FetchItem>,
    pub seq: u8,
    /// Request cluster id.
    pub cluster: u16,
    /// A response frame is expected after the confirm.
    pub expects_response: bool,
}

/// One outbound APSDE-DATA.request.
#[derive(Clone, Debug)]
pub struct ApsDataRequest {
    pub id: u8,
    pub dst: Address,
    pub dst_mode: AddressMode,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub asdu: Vec<u8>,
    pub tx_options: TxOptions,
    pub radius: u8,
    pub send_after: Option<Instant>,
    pub source_route: Option<SourceRouteTag>,
    pub(crate) state: RequestState,
    pub(crate) confirm_delivered: bool,
    pub(crate) priority: bool,
    pub(crate) created: Option<Instant>,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) confirmed_at: Option<Instant>,
    pub(crate) zdp: Option<ZdpTag>,
    /// The ZDP response came in before the confirm.
    pub(crate) answered: bool,
    pub(crate) node: Option<NodeHandle>,
}

impl ApsDataRequest {
    pub fn new(dst: Address, dst_mode: AddressMode, profile_id: u16, cluster_id: u16, asdu: Vec<u8>) -> Self {
        Self {
            id: 0,
            dst,
            dst_mode,
            dst_endpoint: 0x01,
            src_endpoint: 0x01,
            profile_id,
            cluster_id,
            asdu,
            tx_options: TxOptions::ACK,
            radius: 0,
            send_after: None,
            source_route: None,
            state: RequestState::Idle,
            confirm_delivered: false,
            priority: false,
            created: None,
            sent_at: None,
            confirmed_at: None,
            zdp: None,
            answered: false,
            node: None,
        }
    }

    /// A ZDP request frame to `dst`.
    pub fn zdp(dst: Address, dst_mode: AddressMode, req: &ZdpRequest, seq: u8) -> Self {
        let mut r = Self::new(dst, dst_mode, ZDP_PROFILE_ID, req.cluster_id(), req.encode(seq));
        r.dst_endpoint = ZDO_ENDPOINT;
        r.src_endpoint = ZDO_ENDPOINT;
        if dst.is_broadcast() {
            r.tx_options = TxOptions::empty();
        }
        r
    }

    pub fn with_endpoints(mut self, src: u8, dst: u8) -> Self {
        self.src_endpoint = src;
        self.dst_endpoint = dst;
        self
    }

    pub fn with_tx_options(mut self, opts: TxOptions) -> Self {
        self.tx_options = opts;
        self
    }

    pub fn with_send_after(mut self, at: Instant) -> Self {
        self.send_after = Some(at);
        self
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_zdp(&self) -> bool {
        self.profile_id == ZDP_PROFILE_ID
    }

    pub fn is_broadcast_or_group(&self) -> bool {
        self.dst_mode == AddressMode::Group || self.dst.is_broadcast()
    }

    /// ZCL command id of a profile-wide or cluster specific frame.
    pub fn zcl_command(&self) -> Option<u8> {
        let fc = *self.asdu.first()?;
        let idx = if fc & 0x04 != 0 { 4 } else { 2 };
        self.asdu.get(idx).copied()
    }

    pub fn is_ota_block_response(&self) -> bool {
        !self.is_zdp()
            && self.cluster_id == OTA_CLUSTER_ID
            && self.asdu.first().map(|fc| fc & 0x03 == 0x01).unwrap_or(false)
            && self.zcl_command() == Some(OTA_IMAGE_BLOCK_RESPONSE)
    }

    pub fn is_default_response(&self) -> bool {
        !self.is_zdp()
            && self.asdu.first().map(|fc| fc & 0x03 == 0x00).unwrap_or(false)
            && self.zcl_command() == Some(ZCL_DEFAULT_RESPONSE)
    }

    /// ZDP tag of a request still waiting for its response.
    pub(crate) fn zdp_tag(&self) -> Option<ZdpTag> {
        self.zdp.filter(|_| !self.answered)
    }

    pub(crate) fn set_zdp_tag(&mut self, tag: ZdpTag) {
        self.zdp = Some(tag);
    }

    pub fn node(&self) -> Option<NodeHandle> {
        self.node
    }
}

/// APSDE-DATA.confirm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApsDataConfirm {
    pub id: u8,
    pub dst: Address,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub status: ApsStatus,
}

/// APSDE-DATA.indication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApsDataIndication {
    pub src: Address,
    pub src_mode: AddressMode,
    pub dst: Address,
    pub src_endpoint: u8,
    pub dst_endpoint: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub asdu: Vec<u8>,
    pub link_quality: u8,
    pub rssi: i8,
    /// Network address of the last relay, when the radio reports it.
    pub previous_hop: Option<u16>,
}

impl ApsDataIndication {
    pub fn is_zdp(&self) -> bool {
        self.profile_id == ZDP_PROFILE_ID && self.dst_endpoint == ZDO_ENDPOINT
    }

    /// Received straight from the source, no relay in between.
    pub fn is_direct(&self) -> bool {
        matches!((self.previous_hop, self.src.nwk()), (Some(p), Some(s)) if p == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HA_PROFILE_ID;

    #[test]
    fn ota_block_response_detection() {
        let r = ApsDataRequest::new(
            Address::from_nwk(0x1234),
            AddressMode::Nwk,
            HA_PROFILE_ID,
            OTA_CLUSTER_ID,
            vec![0x19, 0x22, OTA_IMAGE_BLOCK_RESPONSE, 0x00],
        );
        assert!(r.is_ota_block_response());
        assert!(!r.is_default_response());
    }

    #[test]
    fn manufacturer_specific_command_offset() {
        let r = ApsDataRequest::new(
            Address::from_nwk(0x1234),
            AddressMode::Nwk,
            HA_PROFILE_ID,
            0x0006,
            vec![0x04, 0x5F, 0x11, 0x07, ZCL_DEFAULT_RESPONSE, 0x01, 0x00],
        );
        assert_eq!(r.zcl_command(), Some(ZCL_DEFAULT_RESPONSE));
        assert!(r.is_default_response());
    }

    #[test]
    fn status_codes() {
        for s in [
            ApsStatus::Success,
            ApsStatus::ApsNoAck,
            ApsStatus::MacTransactionExpired,
            ApsStatus::NwkRouteDiscoveryFailed,
        ] {
            assert_eq!(ApsStatus::from_code(s.code()), s);
        }
    }
}
