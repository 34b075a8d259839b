//! Per-node ZDP fetch state machine.
//!
//! Every node carries one [`FetchState`] per [`FetchItem`]. The generic gate
//! ([`FetchTable::gate`]) handles the enabled flag, prerequisite items and the
//! retry backoff window; item specific rules live on [`super::Node::need_fetch`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Discovery items a node is queried for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchItem {
    NodeDescriptor,
    ActiveEndpoints,
    SimpleDescriptor,
    PowerDescriptor,
    UserDescriptor,
    MgmtLqi,
    MgmtBind,
    IeeeAddr,
    NwkAddr,
}

impl FetchItem {
    /// Scan order used when picking the next item.
    pub const ALL: [FetchItem; 9] = [
        FetchItem::NodeDescriptor,
        FetchItem::ActiveEndpoints,
        FetchItem::SimpleDescriptor,
        FetchItem::PowerDescriptor,
        FetchItem::UserDescriptor,
        FetchItem::MgmtLqi,
        FetchItem::MgmtBind,
        FetchItem::IeeeAddr,
        FetchItem::NwkAddr,
    ];

    pub fn index(self) -> usize {
        match self {
            FetchItem::NodeDescriptor => 0,
            FetchItem::ActiveEndpoints => 1,
            FetchItem::SimpleDescriptor => 2,
            FetchItem::PowerDescriptor => 3,
            FetchItem::UserDescriptor => 4,
            FetchItem::MgmtLqi => 5,
            FetchItem::MgmtBind => 6,
            FetchItem::IeeeAddr => 7,
            FetchItem::NwkAddr => 8,
        }
    }

    pub fn bit(self) -> u16 {
        1 << self.index()
    }

    /// Items chased by the fast-discovery path for newly announced devices.
    pub fn is_fast_discovery(self) -> bool {
        matches!(
            self,
            FetchItem::NodeDescriptor | FetchItem::ActiveEndpoints | FetchItem::SimpleDescriptor
        )
    }
}

/// Intervals and retry limits of the fetch items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchIntervals {
    pub active_endpoints: Duration,
    pub mgmt_lqi: Duration,
    pub power_descriptor: Duration,
    pub retries_max: u8,
    pub retry_backoff: Duration,
}

impl Default for FetchIntervals {
    fn default() -> Self {
        Self {
            active_endpoints: Duration::from_secs(30 * 60),
            mgmt_lqi: Duration::from_secs(3 * 60),
            power_descriptor: Duration::from_secs(60 * 60),
            retries_max: 2,
            retry_backoff: Duration::from_secs(10 * 60),
        }
    }
}

/// Bookkeeping of one fetch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchState {
    pub enabled: bool,
    pub fetched: bool,
    pub retries: u8,
    pub retries_max: u8,
    pub last_check: Option<Instant>,
    /// `None` for fetch-once items.
    pub check_interval: Option<Duration>,
    /// Bitmask of [`FetchItem::bit`] that must be fetched first.
    pub depends: u16,
    /// A request for this item sits in the APS queue.
    pub in_flight: bool,
}

impl FetchState {
    fn new(retries_max: u8, check_interval: Option<Duration>, depends: u16) -> Self {
        Self {
            enabled: true,
            fetched: false,
            retries: 0,
            retries_max,
            last_check: None,
            check_interval,
            depends,
            in_flight: false,
        }
    }

    /// Periodic items are due again once their interval has elapsed.
    pub fn interval_elapsed(&self, now: Instant) -> bool {
        match (self.check_interval, self.last_check) {
            (Some(iv), Some(last)) => now.saturating_duration_since(last) >= iv,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// All fetch items of a node plus the scan cursor.
#[derive(Debug, Clone)]
pub struct FetchTable {
    items: [FetchState; 9],
    retry_backoff: Duration,
    cursor: usize,
}

impl FetchTable {
    pub fn new(iv: &FetchIntervals) -> Self {
        let max = iv.retries_max;
        let nd = FetchItem::NodeDescriptor.bit();
        let items = [
            FetchState::new(max, None, 0),
            FetchState::new(max, Some(iv.active_endpoints), 0),
            FetchState::new(max, None, FetchItem::ActiveEndpoints.bit()),
            FetchState::new(max, Some(iv.power_descriptor), nd),
            FetchState::new(max, None, nd),
            FetchState::new(max, Some(iv.mgmt_lqi), nd),
            FetchState::new(max, None, nd),
            FetchState::new(max, None, 0),
            FetchState::new(max, None, 0),
        ];
        Self {
            items,
            retry_backoff: iv.retry_backoff,
            cursor: 0,
        }
    }

    pub fn get(&self, item: FetchItem) -> &FetchState {
        &self.items[item.index()]
    }

    pub fn get_mut(&mut self, item: FetchItem) -> &mut FetchState {
        &mut self.items[item.index()]
    }

    pub fn set_enabled(&mut self, item: FetchItem, enabled: bool) {
        self.items[item.index()].enabled = enabled;
    }

    fn deps_fetched(&self, depends: u16) -> bool {
        FetchItem::ALL
            .iter()
            .filter(|i| depends & i.bit() != 0)
            .all(|i| self.items[i.index()].fetched)
    }

    /// Generic part of `need_fetch`. Resets an exhausted retry counter once
    /// the backoff window has passed.
    pub fn gate(&mut self, item: FetchItem, now: Instant) -> bool {
        let backoff = self.retry_backoff;
        let depends = self.items[item.index()].depends;
        if !self.items[item.index()].enabled || !self.deps_fetched(depends) {
            return false;
        }
        let st = &mut self.items[item.index()];
        if st.in_flight {
            return false;
        }
        if st.retries >= st.retries_max {
            let waited = st
                .last_check
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(backoff);
            if waited < backoff {
                return false;
            }
            st.retries = 0;
        }
        true
    }

    /// A request for `item` was queued.
    pub fn mark_requested(&mut self, item: FetchItem, now: Instant) {
        let st = &mut self.items[item.index()];
        st.last_check = Some(now);
        st.in_flight = true;
    }

    /// Response received and applied.
    pub fn set_fetched(&mut self, item: FetchItem, now: Instant) {
        let st = &mut self.items[item.index()];
        st.fetched = true;
        st.retries = 0;
        st.in_flight = false;
        st.last_check = Some(now);
    }

    /// Response received but more is to come (paging) or it must be refetched.
    pub fn set_unfetched(&mut self, item: FetchItem) {
        let st = &mut self.items[item.index()];
        st.fetched = false;
        st.in_flight = false;
    }

    /// Request failed, timed out or came back with an error status.
    /// Returns true when the item just ran out of retries.
    pub fn record_failure(&mut self, item: FetchItem, now: Instant) -> bool {
        let st = &mut self.items[item.index()];
        st.in_flight = false;
        st.last_check = Some(now);
        st.retries = st.retries.saturating_add(1);
        st.retries == st.retries_max
    }

    /// Clear the in-flight flag without counting a retry (admission reject).
    pub fn cancel(&mut self, item: FetchItem) {
        self.items[item.index()].in_flight = false;
    }

    pub fn any_in_flight(&self) -> bool {
        self.items.iter().any(|s| s.in_flight)
    }

    pub fn cursor(&self) -> FetchItem {
        FetchItem::ALL[self.cursor]
    }

    /// Move the cursor to the next item, wrapping.
    pub fn advance(&mut self) -> FetchItem {
        self.cursor = (self.cursor + 1) % FetchItem::ALL.len();
        FetchItem::ALL[self.cursor]
    }

    pub(crate) fn set_cursor(&mut self, item: FetchItem) {
        self.cursor = item.index();
    }
}
