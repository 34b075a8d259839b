//! # Configuration Management Module
//!
//! TOML configuration of the controller. Every tunable the core consumes is
//! surfaced here as a named value with the default the controller was tuned
//! against; the core itself only sees the derived structs
//! ([`QueueLimits`], [`FetchIntervals`], [`RoutingConfig`], [`ZombieConfig`]).
//!
//! ## Configuration Structure
//!
//! - [`ControllerConfig`] - tick period, queue limits, systemic fault threshold
//! - [`DiscoveryConfig`] - join policy, auto fetch, fetch intervals
//! - [`RoutingSection`] - source routing switch, LQI floor, hop bound
//! - [`ZombieSection`] - liveness thresholds
//! - [`StorageConfig`] - node store location
//! - [`LoggingConfig`] - log level and file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use zbmesh::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("tick period: {} ms", config.controller.tick_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [controller]
//! tick_ms = 80
//! max_aps_requests = 24
//!
//! [routing]
//! enabled = true
//! min_lqi = 130
//! max_hops = 5
//! ```
//!
//! Missing sections and keys fall back to their defaults. [`Config::validate`]
//! clamps out-of-range values and logs each correction.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::aps::QueueLimits;
use crate::node::FetchIntervals;
use crate::routing::engine::{
    BlockedFirmware, RoutingConfig, LEGACY_RELAY_FIXED_VERSION, LEGACY_RELAY_MANUFACTURER,
};
use crate::zombie::ZombieConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub zombie: ZombieSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Period of the tick and of the timeout tick.
    pub tick_ms: u64,
    pub max_aps_requests: usize,
    pub max_busy_aps_per_node: usize,
    pub max_busy_aps: usize,
    pub request_timeout_secs: u64,
    pub confirmed_timeout_secs: u64,
    /// Consecutive busy replies from the radio before a forced leave/rejoin.
    pub busy_fault_threshold: u32,
    pub broadcast_gap_min_ms: u64,
    pub broadcast_gap_max_ms: u64,
    /// Extended address of the local coordinator, hex (`0x00212EFFFF000001`).
    pub coordinator_ext: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 80,
            max_aps_requests: 24,
            max_busy_aps_per_node: 2,
            max_busy_aps: 4,
            request_timeout_secs: 60,
            confirmed_timeout_secs: 10,
            busy_fault_threshold: 50,
            broadcast_gap_min_ms: 500,
            broadcast_gap_max_ms: 8000,
            coordinator_ext: "0x00212EFFFF000001".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Parse `coordinator_ext`; accepts an optional `0x` prefix.
    pub fn coordinator_ext(&self) -> Result<u64> {
        let s = self.coordinator_ext.trim();
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        u64::from_str_radix(digits, 16)
            .map_err(|e| anyhow!("Invalid coordinator_ext '{}': {}", self.coordinator_ext, e))
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_requests: self.max_aps_requests,
            max_busy_per_node: self.max_busy_aps_per_node,
            max_busy: self.max_busy_aps,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            confirmed_timeout: Duration::from_secs(self.confirmed_timeout_secs),
            busy_fault_threshold: self.busy_fault_threshold,
            broadcast_gap_min: Duration::from_millis(self.broadcast_gap_min_ms),
            broadcast_gap_max: Duration::from_millis(self.broadcast_gap_max_ms),
            ..QueueLimits::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Chase descriptors of freshly announced devices ahead of the round-robin.
    pub fast_discovery: bool,
    pub auto_fetch_ffd: bool,
    pub auto_fetch_rfd: bool,
    /// Accept unknown devices.
    pub permit_join: bool,
    pub fetch_retries_max: u8,
    pub fetch_retry_backoff_secs: u64,
    pub active_endpoints_interval_secs: u64,
    pub mgmt_lqi_interval_secs: u64,
    pub power_descriptor_interval_secs: u64,
    /// Pause after each ZDP request before the node is picked again.
    pub zdp_wait_ms: u64,
    /// Neighbor entries not refreshed within this window are dropped.
    pub neighbor_max_age_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            fast_discovery: true,
            auto_fetch_ffd: true,
            auto_fetch_rfd: true,
            permit_join: false,
            fetch_retries_max: 2,
            fetch_retry_backoff_secs: 600,
            active_endpoints_interval_secs: 1800,
            mgmt_lqi_interval_secs: 180,
            power_descriptor_interval_secs: 3600,
            zdp_wait_ms: 1000,
            neighbor_max_age_secs: 1800,
        }
    }
}

impl DiscoveryConfig {
    pub fn fetch_intervals(&self) -> FetchIntervals {
        FetchIntervals {
            active_endpoints: Duration::from_secs(self.active_endpoints_interval_secs),
            mgmt_lqi: Duration::from_secs(self.mgmt_lqi_interval_secs),
            power_descriptor: Duration::from_secs(self.power_descriptor_interval_secs),
            retries_max: self.fetch_retries_max,
            retry_backoff: Duration::from_secs(self.fetch_retry_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedFirmwareEntry {
    pub manufacturer_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below_version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub enabled: bool,
    pub min_lqi: u8,
    /// Hops including the coordinator, 2..=9.
    pub max_hops: usize,
    pub min_route_age_secs: u64,
    pub blocked_firmware: Vec<BlockedFirmwareEntry>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_lqi: 130,
            max_hops: 5,
            min_route_age_secs: 3600,
            blocked_firmware: vec![BlockedFirmwareEntry {
                manufacturer_code: LEGACY_RELAY_MANUFACTURER,
                below_version: Some(LEGACY_RELAY_FIXED_VERSION),
            }],
        }
    }
}

impl RoutingSection {
    pub fn engine_config(&self) -> RoutingConfig {
        RoutingConfig {
            enabled: self.enabled,
            min_lqi: self.min_lqi,
            max_hops: self.max_hops,
            blocked_firmware: self
                .blocked_firmware
                .iter()
                .map(|b| BlockedFirmware {
                    manufacturer_code: b.manufacturer_code,
                    below_version: b.below_version,
                })
                .collect(),
            min_route_age: Duration::from_secs(self.min_route_age_secs),
            ..RoutingConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieSection {
    pub below_10_secs: u64,
    pub below_25_secs: u64,
    pub below_50_secs: u64,
    pub below_100_secs: u64,
    pub max_secs: u64,
    pub end_device_secs: u64,
    pub max_recv_errors: u32,
}

impl Default for ZombieSection {
    fn default() -> Self {
        Self {
            below_10_secs: 600,
            below_25_secs: 1200,
            below_50_secs: 1800,
            below_100_secs: 2400,
            max_secs: 3600,
            end_device_secs: 4 * 3600,
            max_recv_errors: 10,
        }
    }
}

impl ZombieSection {
    pub fn detector_config(&self) -> ZombieConfig {
        ZombieConfig {
            buckets: vec![
                (10, Duration::from_secs(self.below_10_secs)),
                (25, Duration::from_secs(self.below_25_secs)),
                (50, Duration::from_secs(self.below_50_secs)),
                (100, Duration::from_secs(self.below_100_secs)),
            ],
            max_threshold: Duration::from_secs(self.max_secs),
            end_device_threshold: Duration::from_secs(self.end_device_secs),
            max_recv_errors: self.max_recv_errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Write the node table back every this many seconds while running.
    pub save_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            save_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("zbmesh.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate();
        config.controller.coordinator_ext()?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Clamp out-of-range values. Returns the number of corrections made.
    pub fn validate(&mut self) -> usize {
        let mut fixed = 0;
        let r = &mut self.routing;
        if !(2..=9).contains(&r.max_hops) {
            let v = r.max_hops.clamp(2, 9);
            warn!("routing.max_hops {} out of range 2..=9, using {}", r.max_hops, v);
            r.max_hops = v;
            fixed += 1;
        }
        if r.min_lqi == 0 {
            warn!("routing.min_lqi must be non-zero, using 1");
            r.min_lqi = 1;
            fixed += 1;
        }
        let c = &mut self.controller;
        if c.tick_ms < 10 {
            warn!("controller.tick_ms {} too small, using 10", c.tick_ms);
            c.tick_ms = 10;
            fixed += 1;
        }
        if c.max_aps_requests == 0 {
            warn!("controller.max_aps_requests must be positive, using 24");
            c.max_aps_requests = 24;
            fixed += 1;
        }
        if c.max_busy_aps == 0 {
            warn!("controller.max_busy_aps must be positive, using 4");
            c.max_busy_aps = 4;
            fixed += 1;
        }
        if c.max_busy_aps_per_node == 0 {
            warn!("controller.max_busy_aps_per_node must be positive, using 2");
            c.max_busy_aps_per_node = 2;
            fixed += 1;
        }
        if c.broadcast_gap_max_ms < c.broadcast_gap_min_ms {
            warn!(
                "controller.broadcast_gap_max_ms {} below min {}, raising",
                c.broadcast_gap_max_ms, c.broadcast_gap_min_ms
            );
            c.broadcast_gap_max_ms = c.broadcast_gap_min_ms;
            fixed += 1;
        }
        if self.discovery.fetch_retries_max == 0 {
            warn!("discovery.fetch_retries_max must be positive, using 2");
            self.discovery.fetch_retries_max = 2;
            fixed += 1;
        }
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_values() {
        let c = Config::default();
        assert_eq!(c.controller.tick_ms, 80);
        assert_eq!(c.controller.queue_limits().max_requests, 24);
        assert_eq!(c.routing.engine_config().min_lqi, 130);
        assert_eq!(c.routing.engine_config().max_hops, 5);
        assert_eq!(
            c.zombie.detector_config().end_device_threshold,
            Duration::from_secs(14400)
        );
        assert_eq!(c.controller.coordinator_ext().unwrap(), 0x00212EFFFF000001);
    }

    #[test]
    fn validate_clamps() {
        let mut c = Config::default();
        c.routing.max_hops = 12;
        c.routing.min_lqi = 0;
        c.controller.tick_ms = 1;
        assert_eq!(c.validate(), 3);
        assert_eq!(c.routing.max_hops, 9);
        assert_eq!(c.routing.min_lqi, 1);
        assert_eq!(c.controller.tick_ms, 10);
        assert_eq!(c.validate(), 0);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let c: Config = toml::from_str("[routing]\nmax_hops = 3\n").unwrap();
        assert_eq!(c.routing.max_hops, 3);
        assert_eq!(c.routing.min_lqi, 130);
        assert_eq!(c.controller.max_busy_aps, 4);
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let c = Config::load(path).await.unwrap();
        assert_eq!(c.storage.data_dir, "./data");
        assert!(c.discovery.fast_discovery);
    }
}
