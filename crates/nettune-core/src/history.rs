//! The append-only history journal.
//!
//! One JSON entry per line in `journal.jsonl`. The file is opened, appended,
//! and closed per entry under an in-process mutex; the core never rewrites
//! or removes an entry. Readers tolerate partial lines by skipping anything
//! that does not parse.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::error::CoreError;
use crate::fsutil;
use crate::state::{HistoryAction, HistoryEntry, LastApplyInfo};

/// How many trailing entries the startup recovery scan examines.
const RECOVERY_SCAN_LIMIT: usize = 100;

/// The journal plus the recovered last-successful-apply cache.
pub struct HistoryJournal {
    path: PathBuf,
    // Guards both the file append and the cached last apply.
    inner: Mutex<Option<LastApplyInfo>>,
}

impl HistoryJournal {
    /// Opens the journal in `dir`, recovering the most recent successful
    /// apply from the final entries.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        fsutil::ensure_dir(&dir)
            .map_err(|e| CoreError::io(format!("create history directory {}", dir.display()), e))?;

        let journal = Self {
            path: dir.join("journal.jsonl"),
            inner: Mutex::new(None),
        };

        let last = journal
            .recent_entries(RECOVERY_SCAN_LIMIT)?
            .into_iter()
            .find(|entry| entry.action == HistoryAction::Apply && entry.success)
            .and_then(|entry| {
                entry.profile_id.map(|profile_id| LastApplyInfo {
                    profile_id,
                    applied_at: entry.timestamp,
                    success: true,
                })
            });
        *journal.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = last;

        Ok(journal)
    }

    /// Records a profile apply; a successful one becomes the new last apply.
    pub fn record_apply(
        &self,
        profile_id: &str,
        snapshot_id: &str,
        success: bool,
    ) -> Result<(), CoreError> {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            action: HistoryAction::Apply,
            profile_id: Some(profile_id.to_string()),
            snapshot_id: Some(snapshot_id.to_string()),
            success,
            details: BTreeMap::new(),
        };

        let mut last = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.append(&entry)?;
        if success {
            *last = Some(LastApplyInfo {
                profile_id: profile_id.to_string(),
                applied_at: entry.timestamp,
                success: true,
            });
        }
        Ok(())
    }

    /// Records a rollback.
    pub fn record_rollback(&self, snapshot_id: &str, success: bool) -> Result<(), CoreError> {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            action: HistoryAction::Rollback,
            profile_id: None,
            snapshot_id: Some(snapshot_id.to_string()),
            success,
            details: BTreeMap::new(),
        };
        let _guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.append(&entry)
    }

    /// Records a snapshot capture.
    pub fn record_snapshot(&self, snapshot_id: &str) -> Result<(), CoreError> {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            action: HistoryAction::Snapshot,
            profile_id: None,
            snapshot_id: Some(snapshot_id.to_string()),
            success: true,
            details: BTreeMap::new(),
        };
        let _guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.append(&entry)
    }

    /// The most recent successful apply, if any.
    #[must_use]
    pub fn last_apply(&self) -> Option<LastApplyInfo> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The last `limit` entries, newest first. A missing journal file reads
    /// as empty; unparsable lines are skipped silently.
    pub fn recent_entries(&self, limit: usize) -> Result<Vec<HistoryEntry>, CoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CoreError::io(
                    format!("read journal {}", self.path.display()),
                    err,
                ));
            }
        };

        let mut entries: Vec<HistoryEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        if limit > 0 && entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries.reverse();
        Ok(entries)
    }

    fn append(&self, entry: &HistoryEntry) -> Result<(), CoreError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| CoreError::json("serialize history entry", e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CoreError::io(format!("open journal {}", self.path.display()), e))?;
        writeln!(file, "{line}")
            .map_err(|e| CoreError::io(format!("append to journal {}", self.path.display()), e))
    }
}

/// Appends `entry` best-effort, logging instead of failing the caller's
/// operation when the journal is unavailable.
pub(crate) fn record_or_warn(result: Result<(), CoreError>) {
    if let Err(err) = result {
        warn!(error = %err, "failed to record history entry");
    }
}
