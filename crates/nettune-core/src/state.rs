//! Observed host state, snapshots, and history records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A qdisc attached to an interface, as reported by `tc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QdiscInfo {
    /// Qdisc kind (`fq`, `fq_codel`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Qdisc handle (`8001:`).
    pub handle: String,
    /// Remaining options keyed by `tc`'s own names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// An observational record of the mutable host surface.
///
/// Never edited after capture; rollback replays it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    /// Canonical network sysctl keys and their observed values.
    pub sysctl: BTreeMap<String, String>,
    /// Interface name to attached root qdisc.
    pub qdisc: BTreeMap<String, QdiscInfo>,
    /// Managed unit name to whether it was active.
    pub systemd_units: BTreeMap<String, bool>,
    /// Managed file path to hex SHA-256 of its contents.
    pub file_hashes: BTreeMap<String, String>,
}

/// A durable capture of host state plus verbatim backups of managed files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id; lexical order matches creation order.
    pub id: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Observed state at capture time.
    pub state: SystemState,
    /// Managed file path to its full prior contents. A missing key means
    /// the file did not exist at capture time.
    pub backups: BTreeMap<String, String>,
    /// Free-form capture metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Listing projection of a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Snapshot id.
    pub id: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Total on-disk size of the snapshot directory in bytes.
    pub size_bytes: u64,
}

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// A profile apply (dry-run snapshots are recorded as `snapshot`).
    Apply,
    /// A rollback to a snapshot.
    Rollback,
    /// A snapshot capture.
    Snapshot,
}

/// One line of the append-only history journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    pub action: HistoryAction,
    /// Profile involved, for applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    /// Snapshot involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Free-form context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// The most recent successful apply, recovered from the journal on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastApplyInfo {
    /// Profile that was applied.
    pub profile_id: String,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
    /// Always true; kept for the API shape.
    pub success: bool,
}

/// Packet counters for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    /// Packets received.
    pub rx_packets: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Receive drops.
    pub rx_dropped: u64,
    /// Transmit drops.
    pub tx_dropped: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Transmit errors.
    pub tx_errors: u64,
}

/// Read-only host facts served by `/probe/info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Host name.
    pub hostname: String,
    /// Kernel release.
    pub kernel_version: String,
    /// Distribution pretty-name.
    pub distribution: String,
    /// Current TCP congestion control algorithm.
    pub congestion_control: String,
    /// Current default qdisc.
    pub default_qdisc: String,
    /// Available congestion control algorithms.
    pub available_ccs: Vec<String>,
    /// Default-route interface, when resolvable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_interface: Option<String>,
    /// MTU of the default-route interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_mtu: Option<u32>,
    /// Counters for the default-route interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_stats: Option<InterfaceStats>,
    /// Tool availability probe: `tc`, `systemd`, `iproute2`, `bbr`.
    pub dependencies: BTreeMap<String, String>,
}
