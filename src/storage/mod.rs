//! # Storage Module - Device Store
//!
//! Persistence seam of the controller. The core only needs two things from a
//! store: whether an extended address belongs to a device seen before (the
//! closed-network gate in [`crate::registry::NodeRegistry::create_node`]) and
//! a snapshot/restore of the node table.
//!
//! ## Layout
//!
//! ```text
//! data/
//! └── nodes.json      ← one NodeSnapshot per device, keyed by EUI-64
//! ```
//!
//! [`JsonNodeStore`] writes the file atomically: the destination is locked
//! with `fs2`, the content goes to a unique temp file in the same directory
//! which is fsynced and renamed over the original.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::node::FirmwareVersion;
use crate::types::MacCapabilities;
use crate::zdp::{NodeDescriptor, PowerDescriptor, SimpleDescriptor};

/// Persisted view of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub ext: u64,
    #[serde(default)]
    pub nwk: Option<u16>,
    pub mac_capabilities: MacCapabilities,
    #[serde(default)]
    pub node_descriptor: Option<NodeDescriptor>,
    #[serde(default)]
    pub power_descriptor: Option<PowerDescriptor>,
    #[serde(default)]
    pub user_descriptor: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<u8>,
    #[serde(default)]
    pub simple_descriptors: Vec<SimpleDescriptor>,
    #[serde(default)]
    pub zombie: bool,
    #[serde(default)]
    pub firmware: Option<FirmwareVersion>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Persistent device store.
pub trait DeviceStore: Send {
    /// The device has been part of this network before.
    fn exists_device(&self, ext: u64) -> bool;

    fn load_nodes(&mut self) -> Result<Vec<NodeSnapshot>, StoreError>;

    /// Merge the given snapshots into the store and persist.
    fn save_nodes(&mut self, nodes: &[NodeSnapshot]) -> Result<(), StoreError>;

    /// Forget a device after a permanent delete.
    fn forget(&mut self, ext: u64) -> Result<(), StoreError>;
}

/// In-memory store, used by tests and the simulator.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    nodes: BTreeMap<u64, NodeSnapshot>,
    known: Vec<u64>,
}

impl MemoryStore {
    /// Mark a device as known without a full snapshot.
    pub fn remember(&mut self, ext: u64) {
        if !self.known.contains(&ext) {
            self.known.push(ext);
        }
    }
}

impl DeviceStore for MemoryStore {
    fn exists_device(&self, ext: u64) -> bool {
        self.nodes.contains_key(&ext) || self.known.contains(&ext)
    }

    fn load_nodes(&mut self) -> Result<Vec<NodeSnapshot>, StoreError> {
        Ok(self.nodes.values().cloned().collect())
    }

    fn save_nodes(&mut self, nodes: &[NodeSnapshot]) -> Result<(), StoreError> {
        for n in nodes {
            self.nodes.insert(n.ext, n.clone());
        }
        Ok(())
    }

    fn forget(&mut self, ext: u64) -> Result<(), StoreError> {
        self.nodes.remove(&ext);
        self.known.retain(|e| *e != ext);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeFile {
    saved_at: Option<DateTime<Utc>>,
    /// Keyed by EUI-64 in hex so the file stays readable.
    nodes: BTreeMap<String, NodeSnapshot>,
}

/// File backed store at `<data_dir>/nodes.json`.
#[derive(Debug)]
pub struct JsonNodeStore {
    path: PathBuf,
    nodes: BTreeMap<u64, NodeSnapshot>,
}

impl JsonNodeStore {
    pub const FILE_NAME: &'static str = "nodes.json";

    /// Open the store, reading the node file when it exists.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        let nodes = match fs::read_to_string(&path) {
            Ok(content) => {
                // tolerate leading NULs left by an interrupted write
                let cleaned = content.trim_start_matches('\0');
                if cleaned.trim().is_empty() {
                    BTreeMap::new()
                } else {
                    let file: NodeFile = serde_json::from_str(cleaned)?;
                    file.nodes.into_values().map(|n| (n.ext, n)).collect()
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("node store {} opened with {} nodes", path.display(), nodes.len());
        Ok(Self { path, nodes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = NodeFile {
            saved_at: Some(Utc::now()),
            nodes: self
                .nodes
                .values()
                .map(|n| (format!("{:016X}", n.ext), n.clone()))
                .collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        write_file_locked(&self.path, &content)
    }
}

impl DeviceStore for JsonNodeStore {
    fn exists_device(&self, ext: u64) -> bool {
        self.nodes.contains_key(&ext)
    }

    fn load_nodes(&mut self) -> Result<Vec<NodeSnapshot>, StoreError> {
        Ok(self.nodes.values().cloned().collect())
    }

    fn save_nodes(&mut self, nodes: &[NodeSnapshot]) -> Result<(), StoreError> {
        for n in nodes {
            self.nodes.insert(n.ext, n.clone());
        }
        self.persist()
    }

    fn forget(&mut self, ext: u64) -> Result<(), StoreError> {
        if self.nodes.remove(&ext).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

/// Write `content` to `path` under an exclusive lock via temp file + rename.
fn write_file_locked(path: &Path, content: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(JsonNodeStore::FILE_NAME);
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => {
                let _ = lock_file.unlock();
                return Err(e.into());
            }
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        warn!("node store rename failed: {}", e);
        let _ = fs::remove_file(&tmp_path);
        let _ = lock_file.unlock();
        return Err(e.into());
    }
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    let _ = lock_file.unlock();
    Ok(())
}
