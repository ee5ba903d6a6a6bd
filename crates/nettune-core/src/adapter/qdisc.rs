//! Queueing-discipline access through the `tc` and `ip` tools.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::info;

use super::{run_tool, QdiscOps};
use crate::error::HostError;
use crate::state::QdiscInfo;

/// Qdisc access via `tc qdisc show` / `tc qdisc replace`, route resolution
/// via `ip route`, and interface facts via `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct QdiscAdapter {
    sys_class_net: PathBuf,
}

impl QdiscAdapter {
    /// Adapter over the real `/sys/class/net`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sys_class_net("/sys/class/net")
    }

    /// Adapter over a custom interface tree (test hook).
    #[must_use]
    pub fn with_sys_class_net(root: impl Into<PathBuf>) -> Self {
        Self {
            sys_class_net: root.into(),
        }
    }
}

impl Default for QdiscAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl QdiscOps for QdiscAdapter {
    fn get_all(&self) -> Result<BTreeMap<String, QdiscInfo>, HostError> {
        let output = run_tool("tc", &["qdisc", "show"])?;
        let mut out = BTreeMap::new();
        for line in output.lines() {
            if let Some((Some(dev), info)) = parse_qdisc_line(line) {
                // Only the root qdisc per interface; `tc` prints it first.
                out.entry(dev).or_insert(info);
            }
        }
        Ok(out)
    }

    fn get(&self, interface: &str) -> Result<QdiscInfo, HostError> {
        let output = run_tool("tc", &["qdisc", "show", "dev", interface])?;
        output
            .lines()
            .find_map(|line| parse_qdisc_line(line).map(|(_, info)| info))
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
        let mut args = vec!["qdisc", "replace", "dev", interface, "root", kind];
        for (key, value) in params {
            args.push(key);
            args.push(value);
        }
        run_tool("tc", &args)?;
        info!(interface, qdisc = kind, "replaced root qdisc");
        Ok(())
    }

    fn default_route_interface(&self) -> Result<String, HostError> {
        let output = run_tool("ip", &["route", "show", "default"])?;
        output
            .lines()
            .find_map(interface_from_route_line)
            .ok_or(HostError::NoDefaultRoute)
    }

    fn non_loopback_interfaces(&self) -> Result<Vec<String>, HostError> {
        let entries = fs::read_dir(&self.sys_class_net)
            .map_err(|e| HostError::io("list network interfaces", e))?;
        let mut interfaces: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name != "lo")
            .collect();
        interfaces.sort();
        Ok(interfaces)
    }

    fn interface_mtu(&self, interface: &str) -> Result<u32, HostError> {
        let path = self.sys_class_net.join(interface).join("mtu");
        let raw = fs::read_to_string(&path)
            .map_err(|e| HostError::io(format!("read mtu of {interface}"), e))?;
        raw.trim().parse().map_err(|_| {
            HostError::io(
                format!("parse mtu of {interface}"),
                std::io::Error::new(std::io::ErrorKind::InvalidData, raw.trim().to_string()),
            )
        })
    }
}

/// Parses one `tc qdisc show` line.
///
/// Format: `qdisc <type> <handle> [dev <iface>] [root|parent ...] <options>`.
/// The first two tokens after `qdisc` are the type and handle; the remainder
/// becomes the params map. In `tc` output option values are numeric-led
/// (counts, sizes like `32Mb`, durations like `5ms`); bare keywords such as
/// `ecn` are flags and map to `"true"`.
fn parse_qdisc_line(line: &str) -> Option<(Option<String>, QdiscInfo)> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("qdisc") {
        return None;
    }
    let kind = tokens.next()?.to_string();
    let handle = tokens.next()?.to_string();

    let mut dev = None;
    let mut params = BTreeMap::new();
    let rest: Vec<&str> = tokens.collect();
    let mut i = 0;
    while i < rest.len() {
        let token = rest[i];
        match token {
            "dev" => {
                if let Some(name) = rest.get(i + 1) {
                    dev = Some((*name).to_string());
                    i += 2;
                    continue;
                }
                i += 1;
            }
            "root" => {
                i += 1;
            }
            "parent" => {
                // Skip the parent handle as well.
                i += 2;
            }
            key => {
                let value_like = rest
                    .get(i + 1)
                    .is_some_and(|v| v.starts_with(|c: char| c.is_ascii_digit()));
                if value_like {
                    params.insert(key.to_string(), rest[i + 1].to_string());
                    i += 2;
                } else {
                    params.insert(key.to_string(), "true".to_string());
                    i += 1;
                }
            }
        }
    }

    Some((
        dev,
        QdiscInfo {
            kind,
            handle,
            params,
        },
    ))
}

/// Extracts the interface from an `ip route show default` line
/// (`default via 192.168.1.1 dev eth0 proto dhcp`).
fn interface_from_route_line(line: &str) -> Option<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|pair| pair[0] == "dev")
        .map(|pair| pair[1].to_string())
}
