//! Kernel tunable access through `/proc/sys` with `sysctl(8)` fallback.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{run_tool, SysctlOps};
use crate::error::HostError;

/// The canonical network sysctl keys captured in every snapshot.
pub const NETWORK_SYSCTL_KEYS: [&str; 14] = [
    "net.core.default_qdisc",
    "net.ipv4.tcp_congestion_control",
    "net.core.rmem_max",
    "net.core.wmem_max",
    "net.core.rmem_default",
    "net.core.wmem_default",
    "net.ipv4.tcp_rmem",
    "net.ipv4.tcp_wmem",
    "net.ipv4.tcp_mtu_probing",
    "net.ipv4.tcp_slow_start_after_idle",
    "net.ipv4.tcp_no_metrics_save",
    "net.ipv4.tcp_timestamps",
    "net.ipv4.tcp_sack",
    "net.ipv4.tcp_window_scaling",
];

/// Sysctl access backed by the pseudo-filesystem, falling back to the
/// external `sysctl` tool when the direct path fails (containers commonly
/// mount `/proc/sys` read-only).
#[derive(Debug, Clone)]
pub struct SysctlAdapter {
    proc_root: PathBuf,
}

impl SysctlAdapter {
    /// Adapter over the real `/proc/sys`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root("/proc/sys")
    }

    /// Adapter over a custom pseudo-filesystem root (test hook).
    #[must_use]
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    /// `net.core.rmem_max` -> `<root>/net/core/rmem_max`.
    fn key_path(&self, key: &str) -> PathBuf {
        self.proc_root.join(key.replace('.', "/"))
    }

    fn get_via_tool(key: &str) -> Result<String, HostError> {
        run_tool("sysctl", &["-n", key]).map(|out| out.trim_end().to_string())
    }

    fn set_via_tool(key: &str, value: &str) -> Result<(), HostError> {
        let assignment = format!("{key}={value}");
        run_tool("sysctl", &["-w", &assignment]).map(|_| ())
    }
}

impl Default for SysctlAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SysctlOps for SysctlAdapter {
    fn get(&self, key: &str) -> Result<String, HostError> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(raw) => Ok(raw.trim_end().to_string()),
            Err(err) => {
                debug!(key, error = %err, "proc read failed, falling back to sysctl tool");
                Self::get_via_tool(key)
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), HostError> {
        let path = self.key_path(key);
        match fs::write(&path, value) {
            Ok(()) => {
                debug!(key, value, "sysctl set via proc");
                Ok(())
            }
            Err(err) => {
                debug!(key, error = %err, "proc write failed, falling back to sysctl tool");
                Self::set_via_tool(key, value)
            }
        }
    }

    fn load_config_file(&self, path: &Path) -> Result<(), HostError> {
        let path_str = path.to_string_lossy();
        run_tool("sysctl", &["-p", path_str.as_ref()]).map(|_| ())
    }
}

/// Renders a managed sysctl drop-in: marker line, blank line, then
/// `key = value` lines.
#[must_use]
pub fn render_conf(values: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# Managed by nettune - DO NOT EDIT\n\n");
    for (key, value) in values {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_key(root: &Path, key: &str, value: &str) {
        let path = root.join(key.replace('.', "/"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value).unwrap();
    }

    #[test]
    fn get_reads_proc_path_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), "net.ipv4.tcp_congestion_control", "cubic\n");

        let adapter = SysctlAdapter::with_proc_root(dir.path());
        assert_eq!(
            adapter.get("net.ipv4.tcp_congestion_control").unwrap(),
            "cubic"
        );
    }

    #[test]
    fn set_writes_through_proc_path() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), "net.core.default_qdisc", "pfifo_fast\n");

        let adapter = SysctlAdapter::with_proc_root(dir.path());
        adapter.set("net.core.default_qdisc", "fq").unwrap();
        assert_eq!(adapter.get("net.core.default_qdisc").unwrap(), "fq");
    }

    #[test]
    fn get_multiple_skips_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), "net.core.rmem_max", "212992");

        let adapter = SysctlAdapter::with_proc_root(dir.path());
        // The missing key falls back to the external tool, which reports it
        // as unknown; get_multiple drops it instead of failing.
        let values = adapter.get_multiple(&["net.core.rmem_max", "net.nettune.does_not_exist"]);
        assert_eq!(values.get("net.core.rmem_max").map(String::as_str), Some("212992"));
        assert!(!values.contains_key("net.nettune.does_not_exist"));
    }

    #[test]
    fn rendered_conf_starts_with_managed_marker() {
        let values = BTreeMap::from([
            ("net.core.default_qdisc".to_string(), "fq".to_string()),
            (
                "net.ipv4.tcp_congestion_control".to_string(),
                "bbr".to_string(),
            ),
        ]);

        let conf = render_conf(&values);
        let mut lines = conf.lines();
        assert_eq!(lines.next(), Some("# Managed by nettune - DO NOT EDIT"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("net.core.default_qdisc = fq"));
        assert_eq!(
            lines.next(),
            Some("net.ipv4.tcp_congestion_control = bbr")
        );
    }
}
