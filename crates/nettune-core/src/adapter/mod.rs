//! Host adapters: the seams between the transaction engine and the Linux
//! mutable surface.
//!
//! The three mutating surfaces (sysctl, qdisc, systemd) are traits so the
//! apply engine and snapshot store run unchanged against the in-memory host
//! used by tests. Production wires the Linux implementations via
//! [`HostAdapter::linux`]. Read-only host facts live in [`system_info`] and
//! need no seam.

pub mod memory;
pub mod qdisc;
pub mod sysctl;
pub mod system_info;
pub mod systemd;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tracing::warn;

use crate::error::HostError;
use crate::state::QdiscInfo;

pub use memory::MemoryHost;
pub use qdisc::QdiscAdapter;
pub use sysctl::{SysctlAdapter, NETWORK_SYSCTL_KEYS};
pub use system_info::collect_server_info;
pub use systemd::SystemdAdapter;

/// Kernel tunable access via the pseudo-filesystem with external-tool
/// fallback.
pub trait SysctlOps: Send + Sync {
    /// Reads one tunable, trimmed of trailing whitespace.
    fn get(&self, key: &str) -> Result<String, HostError>;

    /// Writes one tunable.
    fn set(&self, key: &str, value: &str) -> Result<(), HostError>;

    /// Makes the on-disk configuration at `path` authoritative by invoking
    /// the external loader.
    fn load_config_file(&self, path: &Path) -> Result<(), HostError>;

    /// Renders `values` as a managed drop-in and writes it atomically
    /// (temp file + fsync + rename).
    fn write_config_file(
        &self,
        path: &Path,
        values: &BTreeMap<String, String>,
    ) -> Result<(), HostError> {
        let conf = sysctl::render_conf(values);
        crate::fsutil::atomic_write(path, conf.as_bytes())
            .map_err(|e| HostError::io(format!("write sysctl config {}", path.display()), e))
    }

    /// Reads several tunables; unreadable keys are skipped with a warning.
    fn get_multiple(&self, keys: &[&str]) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for key in keys {
            match self.get(key) {
                Ok(value) => {
                    out.insert((*key).to_string(), value);
                }
                Err(err) => {
                    warn!(key, error = %err, "failed to read sysctl");
                }
            }
        }
        out
    }

    /// Writes several tunables. Every entry is attempted; failures are
    /// aggregated into a single [`HostError::Partial`] rather than
    /// short-circuiting.
    fn set_multiple(&self, values: &BTreeMap<String, String>) -> Result<(), HostError> {
        let mut failures = Vec::new();
        for (key, value) in values {
            if let Err(err) = self.set(key, value) {
                failures.push(format!("{key}: {err}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HostError::Partial {
                attempted: values.len(),
                failed: failures.len(),
                summary: failures.join("; "),
            })
        }
    }
}

/// Traffic-control queueing discipline access.
pub trait QdiscOps: Send + Sync {
    /// All root qdiscs keyed by interface.
    fn get_all(&self) -> Result<BTreeMap<String, QdiscInfo>, HostError>;

    /// The root qdisc of one interface.
    fn get(&self, interface: &str) -> Result<QdiscInfo, HostError>;

    /// Replaces the root qdisc on an interface.
    fn replace(
        &self,
        interface: &str,
        kind: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), HostError>;

    /// The interface carrying the default route.
    fn default_route_interface(&self) -> Result<String, HostError>;

    /// Every non-loopback interface.
    fn non_loopback_interfaces(&self) -> Result<Vec<String>, HostError>;

    /// MTU of an interface.
    fn interface_mtu(&self, interface: &str) -> Result<u32, HostError>;
}

/// Service-manager unit access.
///
/// `is_active`/`is_enabled` interpret a non-zero exit as "no", not as an
/// error, matching `systemctl` semantics.
pub trait SystemdOps: Send + Sync {
    /// Whether the unit is active.
    fn is_active(&self, unit: &str) -> Result<bool, HostError>;

    /// Whether the unit is enabled.
    fn is_enabled(&self, unit: &str) -> Result<bool, HostError>;

    /// Enables the unit.
    fn enable(&self, unit: &str) -> Result<(), HostError>;

    /// Disables the unit.
    fn disable(&self, unit: &str) -> Result<(), HostError>;

    /// Starts the unit.
    fn start(&self, unit: &str) -> Result<(), HostError>;

    /// Stops the unit.
    fn stop(&self, unit: &str) -> Result<(), HostError>;

    /// Restarts the unit.
    fn restart(&self, unit: &str) -> Result<(), HostError>;

    /// Reloads the service manager after unit file changes.
    fn daemon_reload(&self) -> Result<(), HostError>;

    /// Writes a unit file atomically and reloads the manager.
    fn create_unit(&self, name: &str, body: &str) -> Result<(), HostError>;

    /// Stops, disables, and deletes a unit file, then reloads.
    fn remove_unit(&self, name: &str) -> Result<(), HostError>;

    /// Whether a unit file exists.
    fn unit_exists(&self, name: &str) -> bool;

    /// Reads a unit file's contents.
    fn read_unit(&self, name: &str) -> Result<String, HostError>;
}

/// Aggregate of the mutating host surfaces handed to the engine and stores.
#[derive(Clone)]
pub struct HostAdapter {
    /// Kernel tunable surface.
    pub sysctl: Arc<dyn SysctlOps>,
    /// Queueing discipline surface.
    pub qdisc: Arc<dyn QdiscOps>,
    /// Service-manager surface.
    pub systemd: Arc<dyn SystemdOps>,
}

impl HostAdapter {
    /// The real Linux host.
    #[must_use]
    pub fn linux() -> Self {
        Self {
            sysctl: Arc::new(SysctlAdapter::new()),
            qdisc: Arc::new(QdiscAdapter::new()),
            systemd: Arc::new(SystemdAdapter::new()),
        }
    }

    /// A host backed entirely by one in-memory store.
    #[must_use]
    pub fn in_memory(host: Arc<MemoryHost>) -> Self {
        Self {
            sysctl: host.clone(),
            qdisc: host.clone(),
            systemd: host,
        }
    }
}

impl std::fmt::Debug for HostAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAdapter").finish_non_exhaustive()
    }
}

/// Runs an external tool and returns its stdout, capturing stderr into the
/// error on non-zero exit.
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Result<String, HostError> {
    let command_line = || format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| HostError::Spawn {
            command: command_line(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(HostError::CommandFailed {
            command: command_line(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_tool_missing_binary_is_a_spawn_error() {
        let err = run_tool("nettune-no-such-tool", &["--version"]).unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }

    #[test]
    fn run_tool_captures_stderr_on_failure() {
        // `sh -c` is available everywhere the test suite runs.
        let err = run_tool("sh", &["-c", "echo boom >&2; exit 3"]).unwrap_err();
        match err {
            HostError::CommandFailed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn set_multiple_attempts_every_entry() {
        let host = Arc::new(MemoryHost::new());
        host.insert_sysctl("net.core.rmem_max", "212992");
        host.fail_sysctl_set("net.core.wmem_max");

        let values = std::collections::BTreeMap::from([
            ("net.core.rmem_max".to_string(), "16777216".to_string()),
            ("net.core.wmem_max".to_string(), "16777216".to_string()),
        ]);

        let err = host.set_multiple(&values).unwrap_err();
        match err {
            HostError::Partial {
                attempted, failed, ..
            } => {
                assert_eq!(attempted, 2);
                assert_eq!(failed, 1);
            }
            other => panic!("expected Partial, got {other:?}"),
        }
        // The non-failing entry was still written.
        assert_eq!(host.sysctl_value("net.core.rmem_max").as_deref(), Some("16777216"));
    }
}
