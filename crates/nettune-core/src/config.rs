//! State-directory layout and managed host file paths.

use std::path::{Path, PathBuf};

/// Resolved locations for the persistent state stores.
///
/// Layout under the root:
///
/// ```text
/// <root>/profiles/<id>.json
/// <root>/snapshots/<snapshot-id>/state.json
/// <root>/snapshots/<snapshot-id>/backups/<file>
/// <root>/history/journal.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Creates state paths rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default state root: `$XDG_CONFIG_HOME/nettune`, else
    /// `~/.config/nettune`, else `/var/lib/nettune`.
    #[must_use]
    pub fn default_root() -> PathBuf {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg).join("nettune");
            }
        }
        if let Some(home) = std::env::var_os("HOME") {
            if !home.is_empty() {
                return PathBuf::from(home).join(".config").join("nettune");
            }
        }
        PathBuf::from("/var/lib/nettune")
    }

    /// The state root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding user-defined profile files.
    #[must_use]
    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    /// Directory holding snapshot directories.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Directory holding the history journal.
    #[must_use]
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

/// Host files owned exclusively by nettune, and the persistence unit name.
///
/// The defaults point at the real system locations. Paths are overridable so
/// the transaction engine can be exercised against a scratch root.
#[derive(Debug, Clone)]
pub struct ManagedPaths {
    /// Generated sysctl drop-in, authoritative after reboot.
    pub sysctl_conf: PathBuf,
    /// Directory where systemd unit files are written.
    pub unit_dir: PathBuf,
    /// Name of the qdisc persistence unit.
    pub unit_name: String,
    /// Generated script the persistence unit executes.
    pub qdisc_script: PathBuf,
}

impl ManagedPaths {
    /// Every managed file that snapshots back up and rollback restores.
    #[must_use]
    pub fn managed_files(&self) -> [&Path; 2] {
        [self.sysctl_conf.as_path(), self.qdisc_script.as_path()]
    }

    /// Full path of the persistence unit file.
    #[must_use]
    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit_name)
    }

    /// Managed paths relocated under `root`, for scratch deployments and
    /// tests.
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            sysctl_conf: root.join("etc/sysctl.d/99-nettune.conf"),
            unit_dir: root.join("etc/systemd/system"),
            unit_name: "nettune-qdisc.service".to_string(),
            qdisc_script: root.join("usr/local/bin/nettune-qdisc-setup.sh"),
        }
    }
}

impl Default for ManagedPaths {
    fn default() -> Self {
        Self {
            sysctl_conf: PathBuf::from("/etc/sysctl.d/99-nettune.conf"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            unit_name: "nettune-qdisc.service".to_string(),
            qdisc_script: PathBuf::from("/usr/local/bin/nettune-qdisc-setup.sh"),
        }
    }
}
