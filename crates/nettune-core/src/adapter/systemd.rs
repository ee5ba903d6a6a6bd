//! Service-manager access through `systemctl`, plus generation of the qdisc
//! persistence unit and its setup script.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::{run_tool, SystemdOps};
use crate::error::HostError;
use crate::fsutil;

/// Systemd access via `systemctl`, with unit files written under a
/// configurable directory (default `/etc/systemd/system`).
#[derive(Debug, Clone)]
pub struct SystemdAdapter {
    unit_dir: PathBuf,
}

impl SystemdAdapter {
    /// Adapter over the real unit directory.
    #[must_use]
    pub fn new() -> Self {
        Self::with_unit_dir("/etc/systemd/system")
    }

    /// Adapter over a custom unit directory (test hook).
    #[must_use]
    pub fn with_unit_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: dir.into(),
        }
    }

    /// Whether `systemctl` is available at all.
    #[must_use]
    pub fn is_available(&self) -> bool {
        run_tool("systemctl", &["--version"]).is_ok()
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(name)
    }
}

impl Default for SystemdAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemdOps for SystemdAdapter {
    fn is_active(&self, unit: &str) -> Result<bool, HostError> {
        // Non-zero exit means inactive/failed/unknown, not an error.
        match run_tool("systemctl", &["is-active", unit]) {
            Ok(out) => Ok(out.trim() == "active"),
            Err(_) => Ok(false),
        }
    }

    fn is_enabled(&self, unit: &str) -> Result<bool, HostError> {
        match run_tool("systemctl", &["is-enabled", unit]) {
            Ok(out) => Ok(out.trim() == "enabled"),
            Err(_) => Ok(false),
        }
    }

    fn enable(&self, unit: &str) -> Result<(), HostError> {
        run_tool("systemctl", &["enable", unit])?;
        info!(unit, "enabled systemd unit");
        Ok(())
    }

    fn disable(&self, unit: &str) -> Result<(), HostError> {
        run_tool("systemctl", &["disable", unit])?;
        info!(unit, "disabled systemd unit");
        Ok(())
    }

    fn start(&self, unit: &str) -> Result<(), HostError> {
        run_tool("systemctl", &["start", unit])?;
        info!(unit, "started systemd unit");
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<(), HostError> {
        run_tool("systemctl", &["stop", unit])?;
        info!(unit, "stopped systemd unit");
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<(), HostError> {
        run_tool("systemctl", &["restart", unit])?;
        info!(unit, "restarted systemd unit");
        Ok(())
    }

    fn daemon_reload(&self) -> Result<(), HostError> {
        run_tool("systemctl", &["daemon-reload"])?;
        Ok(())
    }

    fn create_unit(&self, name: &str, body: &str) -> Result<(), HostError> {
        let path = self.unit_path(name);
        fsutil::atomic_write(&path, body.as_bytes())
            .map_err(|e| HostError::io(format!("write unit file {}", path.display()), e))?;
        self.daemon_reload()?;
        info!(unit = name, path = %path.display(), "created systemd unit");
        Ok(())
    }

    fn remove_unit(&self, name: &str) -> Result<(), HostError> {
        // Best effort: the unit may already be stopped or disabled.
        let _ = self.stop(name);
        let _ = self.disable(name);

        let path = self.unit_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(HostError::io(
                    format!("remove unit file {}", path.display()),
                    err,
                ));
            }
        }
        self.daemon_reload()?;
        info!(unit = name, "removed systemd unit");
        Ok(())
    }

    fn unit_exists(&self, name: &str) -> bool {
        self.unit_path(name).exists()
    }

    fn read_unit(&self, name: &str) -> Result<String, HostError> {
        let path = self.unit_path(name);
        fs::read_to_string(&path)
            .map_err(|e| HostError::io(format!("read unit file {}", path.display()), e))
    }
}

/// Generates the oneshot persistence unit body invoking `script`.
#[must_use]
pub fn generate_qdisc_unit(script: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=Nettune qdisc persistence\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=yes\n\
         ExecStart={}\n\
         ExecStop=/bin/true\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        script.display()
    )
}

/// Generates the qdisc setup script.
///
/// With `interface == None` the script resolves the default-route interface
/// at run time; otherwise the given interface is baked in.
#[must_use]
pub fn generate_qdisc_script(kind: &str, interface: Option<&str>) -> String {
    match interface {
        Some(iface) => format!(
            "#!/bin/bash\n\
             # Managed by nettune - DO NOT EDIT\n\
             tc qdisc replace dev {iface} root {kind}\n"
        ),
        None => format!(
            "#!/bin/bash\n\
             # Managed by nettune - DO NOT EDIT\n\
             DEFAULT_IFACE=$(ip route | grep default | awk '{{print $5}}' | head -n1)\n\
             if [ -n \"$DEFAULT_IFACE\" ]; then\n\
                 tc qdisc replace dev \"$DEFAULT_IFACE\" root {kind}\n\
             fi\n"
        ),
    }
}
