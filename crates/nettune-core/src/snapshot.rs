//! The snapshot store: durable captures of the mutable host surface.
//!
//! Each snapshot is a directory named by its id containing `state.json`
//! (the authoritative payload, written atomically) and a `backups/`
//! subdirectory with slashified copies of the managed files for operator
//! inspection. Rollback restores exclusively from the JSON payload; the
//! on-disk copies are informational. A snapshot directory is either fully
//! readable or treated as non-existent.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::adapter::{HostAdapter, NETWORK_SYSCTL_KEYS};
use crate::config::ManagedPaths;
use crate::error::CoreError;
use crate::fsutil;
use crate::state::{Snapshot, SnapshotMeta, SystemState};

/// Store of snapshot directories under one root.
pub struct SnapshotStore {
    dir: PathBuf,
    host: HostAdapter,
    managed: ManagedPaths,
    // Serialises create/delete and remembers the last issued id so ids stay
    // strictly increasing under lexical comparison.
    last_id: Mutex<String>,
}

impl SnapshotStore {
    /// Creates the store, ensuring the snapshot root exists.
    pub fn new(
        dir: impl Into<PathBuf>,
        host: HostAdapter,
        managed: ManagedPaths,
    ) -> Result<Self, CoreError> {
        let dir = dir.into();
        fsutil::ensure_dir(&dir)
            .map_err(|e| CoreError::io(format!("create snapshot root {}", dir.display()), e))?;
        Ok(Self {
            dir,
            host,
            managed,
            last_id: Mutex::new(String::new()),
        })
    }

    /// Captures a new snapshot of the current host state.
    ///
    /// On any failure after the snapshot directory is created, the partial
    /// directory is removed so the store never exposes a half-written
    /// snapshot.
    pub fn create(&self) -> Result<Snapshot, CoreError> {
        let mut last_id = self
            .last_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // The hash suffix is not ordered within one second, so regenerate
        // until the id sorts after the previously issued one.
        let (id, created_at) = loop {
            let created_at = Utc::now();
            let id = snapshot_id_at(created_at);
            if id > *last_id {
                break (id, created_at);
            }
        };
        last_id.clone_from(&id);

        let snapshot_dir = self.dir.join(&id);
        fsutil::ensure_dir(&snapshot_dir).map_err(|e| {
            CoreError::io(format!("create snapshot directory {}", snapshot_dir.display()), e)
        })?;

        let result = self.populate(&id, created_at, &snapshot_dir);
        if result.is_err() {
            if let Err(err) = fs::remove_dir_all(&snapshot_dir) {
                warn!(id = %id, error = %err, "failed to clean up partial snapshot");
            }
        }
        result
    }

    fn populate(
        &self,
        id: &str,
        created_at: DateTime<Utc>,
        snapshot_dir: &Path,
    ) -> Result<Snapshot, CoreError> {
        let state = self.collect_state();
        let backups = self.create_backups(snapshot_dir)?;

        let snapshot = Snapshot {
            id: id.to_string(),
            created_at,
            state,
            backups,
            metadata: BTreeMap::from([(
                "created_by".to_string(),
                serde_json::Value::String("nettune".to_string()),
            )]),
        };

        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| CoreError::json("serialize snapshot", e))?;
        let state_file = snapshot_dir.join("state.json");
        fsutil::atomic_write(&state_file, &data)
            .map_err(|e| CoreError::io(format!("write {}", state_file.display()), e))?;

        info!(id, "created snapshot");
        Ok(snapshot)
    }

    /// Reads one snapshot by id.
    pub fn get(&self, id: &str) -> Result<Snapshot, CoreError> {
        if !is_safe_snapshot_id(id) {
            return Err(CoreError::SnapshotNotFound(id.to_string()));
        }
        let state_file = self.dir.join(id).join("state.json");
        let data = match fs::read_to_string(&state_file) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::SnapshotNotFound(id.to_string()));
            }
            Err(err) => {
                return Err(CoreError::io(format!("read {}", state_file.display()), err));
            }
        };
        serde_json::from_str(&data).map_err(|e| CoreError::json(format!("parse snapshot {id}"), e))
    }

    /// Lists all snapshots, newest first. Unreadable directories are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>, CoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::io("list snapshots", err)),
        };

        let mut metas = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            match self.get(&name) {
                Ok(snapshot) => metas.push(SnapshotMeta {
                    id: snapshot.id,
                    created_at: snapshot.created_at,
                    size_bytes: directory_size(&entry.path()),
                }),
                Err(err) => {
                    warn!(id = %name, error = %err, "skipping unreadable snapshot");
                }
            }
        }

        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    /// The most recent snapshot.
    pub fn get_latest(&self) -> Result<Snapshot, CoreError> {
        let metas = self.list()?;
        let latest = metas
            .first()
            .ok_or_else(|| CoreError::SnapshotNotFound("latest".to_string()))?;
        self.get(&latest.id)
    }

    /// Deletes one snapshot directory.
    pub fn delete(&self, id: &str) -> Result<(), CoreError> {
        let _guard = self
            .last_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !is_safe_snapshot_id(id) {
            return Err(CoreError::SnapshotNotFound(id.to_string()));
        }
        let snapshot_dir = self.dir.join(id);
        if !snapshot_dir.is_dir() {
            return Err(CoreError::SnapshotNotFound(id.to_string()));
        }
        fs::remove_dir_all(&snapshot_dir)
            .map_err(|e| CoreError::io(format!("delete snapshot {id}"), e))?;
        info!(id, "deleted snapshot");
        Ok(())
    }

    /// Observes the current host state without creating a snapshot.
    pub fn current_state(&self) -> Result<SystemState, CoreError> {
        Ok(self.collect_state())
    }

    /// Reads the canonical sysctl keys, all qdiscs, the persistence unit's
    /// active state, and the managed-file hashes.
    fn collect_state(&self) -> SystemState {
        let mut state = SystemState {
            sysctl: self.host.sysctl.get_multiple(&NETWORK_SYSCTL_KEYS),
            ..SystemState::default()
        };

        match self.host.qdisc.get_all() {
            Ok(qdiscs) => state.qdisc = qdiscs,
            Err(err) => warn!(error = %err, "failed to collect qdisc state"),
        }

        let unit = &self.managed.unit_name;
        let active = self.host.systemd.is_active(unit).unwrap_or(false);
        state.systemd_units.insert(unit.clone(), active);

        for file in self.managed.managed_files() {
            if file.exists() {
                match fsutil::sha256_file(file) {
                    Ok(hash) => {
                        state.file_hashes.insert(file.display().to_string(), hash);
                    }
                    Err(err) => {
                        warn!(file = %file.display(), error = %err, "failed to hash managed file");
                    }
                }
            }
        }

        state
    }

    /// Copies each existing managed file into the backups map and writes a
    /// slashified copy under `<snapshot>/backups/` for inspection.
    fn create_backups(&self, snapshot_dir: &Path) -> Result<BTreeMap<String, String>, CoreError> {
        let backups_dir = snapshot_dir.join("backups");
        fsutil::ensure_dir(&backups_dir)
            .map_err(|e| CoreError::io("create backups directory", e))?;

        let mut backups = BTreeMap::new();
        for file in self.managed.managed_files() {
            let content = match fs::read_to_string(file) {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "failed to read managed file for backup");
                    continue;
                }
            };

            backups.insert(file.display().to_string(), content.clone());

            let backup_name = file.display().to_string().replace('/', "_");
            if let Err(err) = fs::write(backups_dir.join(&backup_name), &content) {
                warn!(file = %file.display(), error = %err, "failed to write inspection backup");
            }
        }

        Ok(backups)
    }
}

/// Snapshot id at `now`: second-resolution UTC stamp plus 8 hex chars of a
/// hash over the nanosecond count, so lexical order matches creation order
/// while back-to-back captures stay distinct.
fn snapshot_id_at(now: DateTime<Utc>) -> String {
    let nanos = now.timestamp_nanos_opt().unwrap_or_default();
    let suffix = fsutil::sha256_hex(nanos.to_string().as_bytes());
    format!("{}_{}", now.format("%Y-%m-%dT%H-%M-%SZ"), &suffix[..8])
}

/// Guards `get`/`delete` against path traversal through crafted ids.
fn is_safe_snapshot_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn directory_size(dir: &Path) -> u64 {
    let mut size = 0;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            size += directory_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            size += meta.len();
        }
    }
    size
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::adapter::MemoryHost;

    fn seeded_host() -> Arc<MemoryHost> {
        let host = Arc::new(MemoryHost::new());
        host.insert_sysctl("net.ipv4.tcp_congestion_control", "cubic");
        host.insert_sysctl("net.core.default_qdisc", "pfifo_fast");
        host.insert_interface("eth0", "pfifo_fast");
        host
    }

    fn store_in(dir: &Path, host: Arc<MemoryHost>) -> SnapshotStore {
        let managed = ManagedPaths::rooted_at(&dir.join("host"));
        SnapshotStore::new(
            dir.join("snapshots"),
            HostAdapter::in_memory(host),
            managed,
        )
        .unwrap()
    }

    #[test]
    fn create_writes_a_complete_readable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        let snapshot = store.create().unwrap();
        assert_eq!(
            snapshot.state.sysctl.get("net.ipv4.tcp_congestion_control"),
            Some(&"cubic".to_string())
        );
        assert_eq!(snapshot.state.qdisc["eth0"].kind, "pfifo_fast");
        assert_eq!(
            snapshot.state.systemd_units.get("nettune-qdisc.service"),
            Some(&false)
        );

        let read_back = store.get(&snapshot.id).unwrap();
        assert_eq!(read_back, snapshot);
    }

    #[test]
    fn backups_capture_managed_file_contents_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let managed = ManagedPaths::rooted_at(&dir.path().join("host"));
        let conf = "# Managed by nettune - DO NOT EDIT\n\nnet.core.default_qdisc = fq\n";
        fs::create_dir_all(managed.sysctl_conf.parent().unwrap()).unwrap();
        fs::write(&managed.sysctl_conf, conf).unwrap();

        let store = SnapshotStore::new(
            dir.path().join("snapshots"),
            HostAdapter::in_memory(seeded_host()),
            managed.clone(),
        )
        .unwrap();

        let snapshot = store.create().unwrap();
        let key = managed.sysctl_conf.display().to_string();
        assert_eq!(snapshot.backups.get(&key).map(String::as_str), Some(conf));
        assert!(snapshot.state.file_hashes.contains_key(&key));

        // Inspection copy on disk, slashes flattened.
        let backup_name = key.replace('/', "_");
        let on_disk = dir
            .path()
            .join("snapshots")
            .join(&snapshot.id)
            .join("backups")
            .join(backup_name);
        assert_eq!(fs::read_to_string(on_disk).unwrap(), conf);
    }

    #[test]
    fn missing_managed_files_have_no_backup_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        let snapshot = store.create().unwrap();
        assert!(snapshot.backups.is_empty());
        assert!(snapshot.state.file_hashes.is_empty());
    }

    #[test]
    fn list_is_newest_first_and_get_latest_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        let first = store.create().unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let second = store.create().unwrap();

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].id, second.id);
        assert_eq!(metas[1].id, first.id);
        assert!(metas[0].size_bytes > 0);

        assert_eq!(store.get_latest().unwrap().id, second.id);
    }

    #[test]
    fn back_to_back_creates_yield_strictly_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.create().unwrap().id);
        }
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "ids: {ids:?}");
    }

    #[test]
    fn snapshot_ids_sort_lexically_in_creation_order() {
        let a = snapshot_id_at(Utc.with_ymd_and_hms(2026, 8, 2, 9, 59, 59).unwrap());
        let b = snapshot_id_at(Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap());
        let c = snapshot_id_at(Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 1).unwrap());

        let mut sorted = vec![c.clone(), a.clone(), b.clone()];
        sorted.sort();
        assert_eq!(sorted, vec![a, b, c]);
    }

    #[test]
    fn delete_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        let snapshot = store.create().unwrap();
        store.delete(&snapshot.id).unwrap();

        assert!(matches!(
            store.get(&snapshot.id),
            Err(CoreError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            store.delete(&snapshot.id),
            Err(CoreError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn traversal_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        assert!(matches!(
            store.get("../../etc/passwd"),
            Err(CoreError::SnapshotNotFound(_))
        ));
        assert!(matches!(store.get(""), Err(CoreError::SnapshotNotFound(_))));
    }

    #[test]
    fn half_written_directories_are_skipped_in_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), seeded_host());

        let snapshot = store.create().unwrap();
        // A directory without state.json is treated as non-existent.
        fs::create_dir_all(dir.path().join("snapshots/2026-01-01T00-00-00Z_deadbeef")).unwrap();

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, snapshot.id);
    }
}
