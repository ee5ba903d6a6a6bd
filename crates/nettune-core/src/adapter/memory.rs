//! An in-memory host implementing all three mutating surfaces.
//!
//! Used by the transaction-engine tests and by scratch deployments that
//! exercise the control plane without touching a real kernel. Failure
//! injection hooks let tests drive the rollback paths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use super::{QdiscOps, SysctlOps, SystemdOps};
use crate::error::HostError;
use crate::state::QdiscInfo;

/// Shared in-memory host state.
#[derive(Debug, Default)]
pub struct MemoryHost {
    sysctl: Mutex<BTreeMap<String, String>>,
    qdiscs: Mutex<BTreeMap<String, QdiscInfo>>,
    active_units: Mutex<BTreeMap<String, bool>>,
    enabled_units: Mutex<BTreeSet<String>>,
    unit_files: Mutex<BTreeMap<String, String>>,
    default_iface: Mutex<Option<String>>,
    fail_sysctl_sets: Mutex<BTreeSet<String>>,
    fail_qdisc_replaces: Mutex<BTreeSet<String>>,
    fail_unit_starts: Mutex<BTreeSet<String>>,
}

impl MemoryHost {
    /// An empty host with no interfaces or tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one sysctl key.
    pub fn insert_sysctl(&self, key: &str, value: &str) {
        self.sysctl
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Seeds one interface with a root qdisc; the first seeded interface
    /// becomes the default route.
    pub fn insert_interface(&self, name: &str, kind: &str) {
        self.qdiscs.lock().unwrap().insert(
            name.to_string(),
            QdiscInfo {
                kind: kind.to_string(),
                handle: "0:".to_string(),
                params: BTreeMap::new(),
            },
        );
        let mut default = self.default_iface.lock().unwrap();
        if default.is_none() {
            *default = Some(name.to_string());
        }
    }

    /// Removes an interface, simulating it vanishing mid-transaction.
    pub fn remove_interface(&self, name: &str) {
        self.qdiscs.lock().unwrap().remove(name);
    }

    /// Seeds a unit's active state.
    pub fn set_unit_active(&self, unit: &str, active: bool) {
        self.active_units
            .lock()
            .unwrap()
            .insert(unit.to_string(), active);
    }

    /// Makes future `set` calls for `key` fail.
    pub fn fail_sysctl_set(&self, key: &str) {
        self.fail_sysctl_sets.lock().unwrap().insert(key.to_string());
    }

    /// Makes future `replace` calls for `interface` fail.
    pub fn fail_qdisc_replace(&self, interface: &str) {
        self.fail_qdisc_replaces
            .lock()
            .unwrap()
            .insert(interface.to_string());
    }

    /// Makes future `start` calls for `unit` fail.
    pub fn fail_unit_start(&self, unit: &str) {
        self.fail_unit_starts.lock().unwrap().insert(unit.to_string());
    }

    /// Current value of one tunable, for assertions.
    #[must_use]
    pub fn sysctl_value(&self, key: &str) -> Option<String> {
        self.sysctl.lock().unwrap().get(key).cloned()
    }

    /// Current qdisc kind on one interface, for assertions.
    #[must_use]
    pub fn qdisc_kind(&self, interface: &str) -> Option<String> {
        self.qdiscs
            .lock()
            .unwrap()
            .get(interface)
            .map(|info| info.kind.clone())
    }

    /// Whether a unit is currently active, for assertions.
    #[must_use]
    pub fn unit_active(&self, unit: &str) -> bool {
        self.active_units
            .lock()
            .unwrap()
            .get(unit)
            .copied()
            .unwrap_or(false)
    }
}

impl SysctlOps for MemoryHost {
    fn get(&self, key: &str) -> Result<String, HostError> {
        self.sysctl.lock().unwrap().get(key).cloned().ok_or_else(|| {
            HostError::CommandFailed {
                command: format!("sysctl -n {key}"),
                stderr: format!("cannot stat /proc/sys/{}: No such file", key.replace('.', "/")),
            }
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), HostError> {
        if self.fail_sysctl_sets.lock().unwrap().contains(key) {
            return Err(HostError::CommandFailed {
                command: format!("sysctl -w {key}={value}"),
                stderr: "permission denied".to_string(),
            });
        }
        self.sysctl
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load_config_file(&self, _path: &Path) -> Result<(), HostError> {
        Ok(())
    }
}

impl QdiscOps for MemoryHost {
    fn get_all(&self) -> Result<BTreeMap<String, QdiscInfo>, HostError> {
        Ok(self.qdiscs.lock().unwrap().clone())
    }

    fn get(&self, interface: &str) -> Result<QdiscInfo, HostError> {
        self.qdiscs
            .lock()
            .unwrap()
            .get(interface)
            .cloned()
            .ok_or_else(|| HostError::QdiscNotFound {
                interface: interface.to_string(),
            })
    }

    fn replace(
        &self,
        interface: &str,
        kind: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), HostError> {
        if self.fail_qdisc_replaces.lock().unwrap().contains(interface) {
            return Err(HostError::CommandFailed {
                command: format!("tc qdisc replace dev {interface} root {kind}"),
                stderr: format!("Cannot find device \"{interface}\""),
            });
        }
        self.qdiscs.lock().unwrap().insert(
            interface.to_string(),
            QdiscInfo {
                kind: kind.to_string(),
                handle: "8001:".to_string(),
                params: params.clone(),
            },
        );
        Ok(())
    }

    fn default_route_interface(&self) -> Result<String, HostError> {
        self.default_iface
            .lock()
            .unwrap()
            .clone()
            .ok_or(HostError::NoDefaultRoute)
    }

    fn non_loopback_interfaces(&self) -> Result<Vec<String>, HostError> {
        Ok(self.qdiscs.lock().unwrap().keys().cloned().collect())
    }

    fn interface_mtu(&self, _interface: &str) -> Result<u32, HostError> {
        Ok(1500)
    }
}

impl SystemdOps for MemoryHost {
    fn is_active(&self, unit: &str) -> Result<bool, HostError> {
        Ok(self.unit_active(unit))
    }

    fn is_enabled(&self, unit: &str) -> Result<bool, HostError> {
        Ok(self.enabled_units.lock().unwrap().contains(unit))
    }

    fn enable(&self, unit: &str) -> Result<(), HostError> {
        self.enabled_units.lock().unwrap().insert(unit.to_string());
        Ok(())
    }

    fn disable(&self, unit: &str) -> Result<(), HostError> {
        self.enabled_units.lock().unwrap().remove(unit);
        Ok(())
    }

    fn start(&self, unit: &str) -> Result<(), HostError> {
        if self.fail_unit_starts.lock().unwrap().contains(unit) {
            return Err(HostError::CommandFailed {
                command: format!("systemctl start {unit}"),
                stderr: format!("Failed to start {unit}: Unit not found."),
            });
        }
        self.set_unit_active(unit, true);
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<(), HostError> {
        self.set_unit_active(unit, false);
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<(), HostError> {
        self.start(unit)
    }

    fn daemon_reload(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn create_unit(&self, name: &str, body: &str) -> Result<(), HostError> {
        self.unit_files
            .lock()
            .unwrap()
            .insert(name.to_string(), body.to_string());
        Ok(())
    }

    fn remove_unit(&self, name: &str) -> Result<(), HostError> {
        self.set_unit_active(name, false);
        self.enabled_units.lock().unwrap().remove(name);
        self.unit_files.lock().unwrap().remove(name);
        Ok(())
    }

    fn unit_exists(&self, name: &str) -> bool {
        self.unit_files.lock().unwrap().contains_key(name)
    }

    fn read_unit(&self, name: &str) -> Result<String, HostError> {
        self.unit_files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                HostError::io(
                    format!("read unit file {name}"),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such unit"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_seeded_interface_is_the_default_route() {
        let host = MemoryHost::new();
        host.insert_interface("eth0", "pfifo_fast");
        host.insert_interface("wlan0", "fq_codel");

        assert_eq!(host.default_route_interface().unwrap(), "eth0");
        assert_eq!(
            host.non_loopback_interfaces().unwrap(),
            vec!["eth0".to_string(), "wlan0".to_string()]
        );
    }

    #[test]
    fn replace_updates_the_qdisc_map() {
        let host = MemoryHost::new();
        host.insert_interface("eth0", "pfifo_fast");

        host.replace("eth0", "fq", &BTreeMap::new()).unwrap();
        assert_eq!(host.qdisc_kind("eth0").as_deref(), Some("fq"));
    }

    #[test]
    fn injected_failures_surface_as_command_errors() {
        let host = Arc::new(MemoryHost::new());
        host.insert_interface("eth0", "pfifo_fast");
        host.fail_qdisc_replace("eth0");

        let err = host.replace("eth0", "fq", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, HostError::CommandFailed { .. }));
        assert_eq!(host.qdisc_kind("eth0").as_deref(), Some("pfifo_fast"));
    }

    #[test]
    fn unit_lifecycle_tracks_active_and_enabled() {
        let host = MemoryHost::new();
        host.create_unit("nettune-qdisc.service", "[Unit]\n").unwrap();
        assert!(host.unit_exists("nettune-qdisc.service"));
        assert!(!host.is_active("nettune-qdisc.service").unwrap());

        host.enable("nettune-qdisc.service").unwrap();
        host.start("nettune-qdisc.service").unwrap();
        assert!(host.is_active("nettune-qdisc.service").unwrap());
        assert!(host.is_enabled("nettune-qdisc.service").unwrap());

        host.stop("nettune-qdisc.service").unwrap();
        assert!(!host.is_active("nettune-qdisc.service").unwrap());
    }
}
