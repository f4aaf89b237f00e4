use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::SettingsError;

/// Tag that marks every VM managed by the portal. It must always be present
/// in the catalogue and is re-inserted on load if an admin removed it.
pub const MANDATORY_TAG: &str = "pvmss";

/// Inclusive lower/upper bound for one per-VM resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: u64,
    pub max: u64,
}

impl Bounds {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Clamps both ends to >= 1 and swaps an inverted pair. Returns true if
    /// anything changed.
    fn normalize(&mut self) -> bool {
        let before = *self;
        if self.min == 0 {
            self.min = 1;
        }
        if self.max == 0 {
            self.max = 1;
        }
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        *self != before
    }
}

/// Per-VM resource windows. `ram` and `disk` are gigabytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLimits {
    pub sockets: Bounds,
    pub cores: Bounds,
    pub ram: Bounds,
    pub disk: Bounds,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            sockets: Bounds::new(1, 2),
            cores: Bounds::new(1, 8),
            ram: Bounds::new(1, 16),
            disk: Bounds::new(10, 200),
        }
    }
}

/// Aggregate upper caps for one node, summed over every portal-managed VM
/// on that node. `ram` is gigabytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLimits {
    pub sockets: u64,
    pub cores: u64,
    pub ram: u64,
}

impl NodeLimits {
    fn normalize(&mut self) -> bool {
        let before = self.clone();
        self.sockets = self.sockets.max(1);
        self.cores = self.cores.max(1);
        self.ram = self.ram.max(1);
        *self != before
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub vm: VmLimits,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeLimits>,
}

/// The persisted catalogue: everything an admin curates and user-facing
/// validation consults. Consumers must tolerate missing keys, so every
/// field defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub isos: BTreeSet<String>,
    #[serde(default)]
    pub vmbrs: BTreeSet<String>,
    #[serde(default)]
    pub storages: BTreeSet<String>,
    #[serde(default)]
    pub enabled_storages: BTreeSet<String>,
    #[serde(default)]
    pub limits: Limits,
}

impl Settings {
    /// Enforces the document invariants in place: the mandatory tag is
    /// present, every numeric bound is >= 1, min <= max. Returns true when
    /// the document was altered.
    pub fn normalize(&mut self) -> bool {
        let mut changed = self.tags.insert(MANDATORY_TAG.to_string());
        changed |= self.limits.vm.sockets.normalize();
        changed |= self.limits.vm.cores.normalize();
        changed |= self.limits.vm.ram.normalize();
        changed |= self.limits.vm.disk.normalize();
        for limits in self.limits.nodes.values_mut() {
            changed |= limits.normalize();
        }
        changed
    }
}

/// Owner of the settings document. Reads are lock-free snapshots; writes
/// are serialized and persisted with a temp-file-then-rename so a crash
/// mid-save never leaves a torn document behind.
pub struct SettingsStore {
    path: PathBuf,
    snapshot: ArcSwap<Settings>,
    writer: Mutex<()>,
}

impl SettingsStore {
    /// Reads and normalizes the document at `path`. A missing file yields
    /// the default catalogue and persists it; an unreadable or malformed
    /// file is an error the caller should treat as fatal.
    pub fn load(path: impl Into<PathBuf>) -> Result<(Self, bool), SettingsError> {
        let path = path.into();
        let (mut settings, existed) = match std::fs::read(&path) {
            Ok(bytes) => {
                let parsed =
                    serde_json::from_slice::<Settings>(&bytes).map_err(|source| {
                        SettingsError::Parse {
                            path: path.display().to_string(),
                            source,
                        }
                    })?;
                (parsed, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Settings::default(), false),
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let was_normalized = settings.normalize() || !existed;
        if was_normalized {
            write_atomic(&path, &settings)?;
            info!(path = %path.display(), "settings document normalized on load");
        }

        let store = Self {
            path,
            snapshot: ArcSwap::from_pointee(settings),
            writer: Mutex::new(()),
        };
        Ok((store, was_normalized))
    }

    /// Current snapshot. Cheap, never blocks.
    pub fn get(&self) -> Arc<Settings> {
        self.snapshot.load_full()
    }

    /// Persists `settings` and swaps the snapshot. Writers are serialized;
    /// the snapshot only changes after the rename succeeded.
    pub async fn set(&self, settings: Settings) -> Result<(), SettingsError> {
        let _guard = self.writer.lock().await;
        let path = self.path.clone();
        let to_write = settings.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &to_write))
            .await
            .expect("settings writer task panicked")?;
        self.snapshot.store(Arc::new(settings));
        Ok(())
    }

    /// Swaps the in-memory snapshot without touching the disk document.
    pub fn set_without_save(&self, settings: Settings) {
        self.snapshot.store(Arc::new(settings));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let bytes = serde_json::to_vec_pretty(settings)?;
    // The temp file lives next to the target so the rename stays on one
    // filesystem.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).map_err(|source| SettingsError::Write {
        path: tmp.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| SettingsError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_inserts_mandatory_tag() {
        let mut settings = Settings::default();
        assert!(settings.normalize());
        assert!(settings.tags.contains(MANDATORY_TAG));
        // Second pass is a no-op.
        assert!(!settings.normalize());
    }

    #[test]
    fn normalize_clamps_and_swaps_bounds() {
        let mut settings = Settings::default();
        settings.normalize();
        settings.limits.vm.cores = Bounds::new(0, 4);
        settings.limits.vm.sockets = Bounds::new(3, 1);
        settings.limits.vm.ram = Bounds::new(1, 1);
        assert!(settings.normalize());
        assert_eq!(settings.limits.vm.cores, Bounds::new(1, 4));
        assert_eq!(settings.limits.vm.sockets, Bounds::new(1, 3));
        // min = max = 1 is legal and untouched.
        assert_eq!(settings.limits.vm.ram, Bounds::new(1, 1));
    }

    #[test]
    fn normalize_clamps_node_caps() {
        let mut settings = Settings::default();
        settings.normalize();
        settings.limits.nodes.insert(
            "pve1".into(),
            NodeLimits {
                sockets: 0,
                cores: 8,
                ram: 0,
            },
        );
        assert!(settings.normalize());
        let node = &settings.limits.nodes["pve1"];
        assert_eq!(node.sockets, 1);
        assert_eq!(node.cores, 8);
        assert_eq!(node.ram, 1);
    }

    #[tokio::test]
    async fn set_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let (store, was_normalized) = SettingsStore::load(&path).unwrap();
        assert!(was_normalized);

        let mut settings = (*store.get()).clone();
        settings.isos.insert("local:iso/debian-12.iso".into());
        settings.vmbrs.insert("vmbr0".into());
        settings.limits.nodes.insert(
            "pve1".into(),
            NodeLimits {
                sockets: 4,
                cores: 32,
                ram: 128,
            },
        );
        store.set(settings.clone()).await.unwrap();

        // A fresh store sees the exact persisted document.
        let (reloaded, was_normalized) = SettingsStore::load(&path).unwrap();
        assert!(!was_normalized);
        assert_eq!(*reloaded.get(), settings);
    }

    #[test]
    fn missing_optional_keys_tolerated() {
        let settings: Settings =
            serde_json::from_str(r#"{"tags":["pvmss","web"]}"#).unwrap();
        assert!(settings.isos.is_empty());
        assert_eq!(settings.limits.vm, VmLimits::default());
    }

    #[test]
    fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            SettingsStore::load(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn set_without_save_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let (store, _) = SettingsStore::load(&path).unwrap();
        let on_disk = std::fs::read(&path).unwrap();

        let mut settings = (*store.get()).clone();
        settings.isos.insert("local:iso/alpine.iso".into());
        store.set_without_save(settings);

        assert!(store.get().isos.contains("local:iso/alpine.iso"));
        assert_eq!(std::fs::read(&path).unwrap(), on_disk);
    }
}
