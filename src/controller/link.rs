//! Inbound data frames and neighbor-table upkeep.

use bytes::Buf;
use log::{debug, info, trace};
use std::time::{Duration, Instant};

use super::discovery::DiscoveryTarget;
use super::Controller;
use crate::aps::{ApsDataIndication, OTA_CLUSTER_ID, OTA_QUERY_NEXT_IMAGE_REQUEST};
use crate::events::Event;
use crate::node::{FirmwareVersion, NeighborEntry};
use crate::registry::NodeHandle;
use crate::transport::RadioTransport;
use crate::types::{Address, AddressMode, HA_PROFILE_ID};
use crate::zdp::Relationship;

const ZCL_FC_CLUSTER_SPECIFIC: u8 = 0x01;
const ZCL_FC_MANUFACTURER_SPECIFIC: u8 = 0x04;
const ZCL_FC_SERVER_TO_CLIENT: u8 = 0x08;

/// Parse an OTA Query Next Image Request into the firmware it reports.
pub(crate) fn parse_query_next_image(asdu: &[u8]) -> Option<FirmwareVersion> {
    let mut buf = asdu;
    if buf.remaining() < 3 {
        return None;
    }
    let fc = buf.get_u8();
    if fc & 0x03 != ZCL_FC_CLUSTER_SPECIFIC || fc & ZCL_FC_SERVER_TO_CLIENT != 0 {
        return None;
    }
    if fc & ZCL_FC_MANUFACTURER_SPECIFIC != 0 {
        if buf.remaining() < 2 {
            return None;
        }
        buf.advance(2);
    }
    if buf.remaining() < 2 {
        return None;
    }
    let _seq = buf.get_u8();
    if buf.get_u8() != OTA_QUERY_NEXT_IMAGE_REQUEST {
        return None;
    }
    // field control, manufacturer code, image type, file version
    if buf.remaining() < 9 {
        return None;
    }
    let _field_control = buf.get_u8();
    Some(FirmwareVersion {
        manufacturer_code: buf.get_u16_le(),
        image_type: buf.get_u16_le(),
        file_version: buf.get_u32_le(),
    })
}

impl<T: RadioTransport> Controller<T> {
    pub(crate) fn on_indication(&mut self, ind: ApsDataIndication, now: Instant) {
        let mut events = Vec::new();

        match self.registry.get_node(&ind.src, AddressMode::NwkAndExt) {
            Some(h) if h.is_coordinator_slot() => {}
            Some(h) => {
                if let Some(n) = self.registry.get_mut(h) {
                    n.touch(now);
                    n.recv_errors = 0;
                }
                self.set_zombie(h, false, &mut events);
                if let (Some(nwk), true) = (ind.src.nwk(), ind.src.has_ext()) {
                    self.update_node_nwk(h, nwk, &mut events);
                }
                if ind.is_direct() {
                    self.refresh_coordinator_neighbor(h, ind.link_quality, now);
                }
            }
            None => {
                self.on_unknown_source(&ind.src, now, &mut events);
                if ind.is_direct() {
                    if let Some(h) = self.registry.get_node(&ind.src, AddressMode::NwkAndExt) {
                        self.refresh_coordinator_neighbor(h, ind.link_quality, now);
                    }
                }
            }
        }

        if ind.is_zdp() {
            self.on_zdp_indication(&ind.src, ind.cluster_id, &ind.asdu, now, &mut events);
        } else if ind.profile_id == HA_PROFILE_ID && ind.cluster_id == OTA_CLUSTER_ID {
            self.capture_firmware(&ind);
        }

        events.push(Event::ApsDataIndication(ind));
        self.emit_all(events);
    }

    fn on_unknown_source(&mut self, src: &Address, now: Instant, events: &mut Vec<Event>) {
        match (src.ext(), src.nwk()) {
            (Some(_), Some(_)) => {
                match self
                    .registry
                    .create_node(src, Default::default(), self.store.as_ref(), now)
                {
                    Ok((h, created)) => {
                        if created {
                            info!("node {} joined by data frame", src);
                            events.extend(self.node_ref(h).map(Event::NodeAdded));
                        }
                        self.add_fast_probe(h, now);
                    }
                    Err(e) => debug!("frame from {} dropped from registry: {}", src, e),
                }
            }
            (None, Some(nwk)) => self.queue_discovery(DiscoveryTarget::Nwk(nwk)),
            (Some(ext), None) => self.queue_discovery(DiscoveryTarget::Ext(ext)),
            (None, None) => {}
        }
    }

    /// The coordinator heard `h` without a relay; sample the link.
    fn refresh_coordinator_neighbor(&mut self, h: NodeHandle, lqi: u8, now: Instant) {
        let Some(n) = self.registry.get(h) else {
            return;
        };
        let Some(coordinator) = self.registry.coordinator() else {
            return;
        };
        let previous = self
            .registry
            .get(coordinator)
            .and_then(|c| c.neighbor(h))
            .cloned();
        let entry = NeighborEntry {
            node: h,
            address: *n.address(),
            device_type: n.device_type(),
            relationship: previous.as_ref().map(|p| p.relationship).unwrap_or(
                if n.is_end_device() {
                    Relationship::Child
                } else {
                    Relationship::Sibling
                },
            ),
            rx_on_when_idle: u8::from(n.rx_on_when_idle()),
            depth: previous.as_ref().map(|p| p.depth).unwrap_or(1),
            lqi,
            last_seen: now,
        };
        if let Some(c) = self.registry.get_mut(coordinator) {
            c.update_neighbor(entry);
        }
    }

    fn capture_firmware(&mut self, ind: &ApsDataIndication) {
        let Some(fw) = parse_query_next_image(&ind.asdu) else {
            return;
        };
        let Some(h) = self.registry.get_node(&ind.src, AddressMode::NwkAndExt) else {
            return;
        };
        if let Some(n) = self.registry.get_mut(h) {
            if n.firmware != Some(fw) {
                debug!(
                    "node {} firmware mfc 0x{:04X} image 0x{:04X} version 0x{:08X}",
                    n.address(),
                    fw.manufacturer_code,
                    fw.image_type,
                    fw.file_version
                );
            }
            n.firmware = Some(fw);
        }
    }

    /// Age out neighbor entries of one node per run.
    pub(crate) fn link_maintenance_step(&mut self, now: Instant) {
        let Some((cursor, h)) = self.registry.next_after(self.link_cursor) else {
            return;
        };
        self.link_cursor = cursor;
        let max_age = Duration::from_secs(self.config.discovery.neighbor_max_age_secs);
        if let Some(n) = self.registry.get_mut(h) {
            let dropped = n.drop_stale_neighbors(now, max_age);
            if dropped > 0 {
                trace!("node {} dropped {} stale neighbors", n.address(), dropped);
            }
        }
    }
}
