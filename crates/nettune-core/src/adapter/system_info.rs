//! Read-only host facts: kernel, distribution, congestion control, default
//! route, interface statistics, and the tool dependency probe.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{run_tool, QdiscOps};
use crate::state::{InterfaceStats, ServerInfo};

/// Collects the full fact set served by `/probe/info`.
///
/// Facts are best-effort: anything unreadable degrades to `"unknown"` or is
/// omitted rather than failing the whole collection.
#[must_use]
pub fn collect_server_info(qdisc: &dyn QdiscOps) -> ServerInfo {
    let mut info = ServerInfo {
        hostname: hostname(),
        kernel_version: kernel_version(),
        distribution: distribution(),
        congestion_control: read_proc_value("/proc/sys/net/ipv4/tcp_congestion_control"),
        default_qdisc: read_proc_value("/proc/sys/net/core/default_qdisc"),
        available_ccs: available_congestion_algorithms(),
        ..ServerInfo::default()
    };

    if let Ok(iface) = qdisc.default_route_interface() {
        info.interface_mtu = qdisc.interface_mtu(&iface).ok();
        info.interface_stats = Some(interface_stats(Path::new("/sys/class/net"), &iface));
        info.default_interface = Some(iface);
    }

    info.dependencies = check_dependencies(&info.available_ccs);
    info
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn kernel_version() -> String {
    match fs::read_to_string("/proc/version") {
        Ok(content) => parse_kernel_version(&content),
        Err(_) => run_tool("uname", &["-r"])
            .map(|out| out.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
    }
}

/// `/proc/version` reads `Linux version 6.8.0-41-generic (...)`; the third
/// field is the release.
fn parse_kernel_version(content: &str) -> String {
    content
        .split_whitespace()
        .nth(2)
        .unwrap_or(content.trim())
        .to_string()
}

fn distribution() -> String {
    match fs::read_to_string("/etc/os-release") {
        Ok(content) => parse_os_release(&content),
        Err(_) => "Linux".to_string(),
    }
}

/// Prefers `PRETTY_NAME`, falls back to `NAME VERSION`, then `"Linux"`.
fn parse_os_release(content: &str) -> String {
    let mut name = None;
    let mut version = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
            return value.trim_matches('"').to_string();
        }
        if let Some(value) = line.strip_prefix("NAME=") {
            name = Some(value.trim_matches('"').to_string());
        }
        if let Some(value) = line.strip_prefix("VERSION=") {
            version = Some(value.trim_matches('"').to_string());
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{name} {version}"),
        (Some(name), None) => name,
        _ => "Linux".to_string(),
    }
}

fn read_proc_value(path: &str) -> String {
    fs::read_to_string(path)
        .map(|raw| raw.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn available_congestion_algorithms() -> Vec<String> {
    fs::read_to_string("/proc/sys/net/ipv4/tcp_available_congestion_control")
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn interface_stats(sys_class_net: &Path, interface: &str) -> InterfaceStats {
    let base = sys_class_net.join(interface).join("statistics");
    let read = |name: &str| -> u64 {
        fs::read_to_string(base.join(name))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    };

    InterfaceStats {
        rx_packets: read("rx_packets"),
        tx_packets: read("tx_packets"),
        rx_dropped: read("rx_dropped"),
        tx_dropped: read("tx_dropped"),
        rx_errors: read("rx_errors"),
        tx_errors: read("tx_errors"),
    }
}

fn check_dependencies(available_ccs: &[String]) -> BTreeMap<String, String> {
    let mut deps = BTreeMap::new();

    deps.insert(
        "tc".to_string(),
        match run_tool("tc", &["-V"]) {
            // `tc -V` prints `tc utility, iproute2-6.1.0`; keep the part
            // before the comma.
            Ok(out) => out
                .trim()
                .split(',')
                .next()
                .unwrap_or("unknown")
                .to_string(),
            Err(_) => "not found".to_string(),
        },
    );

    deps.insert(
        "systemd".to_string(),
        match run_tool("systemctl", &["--version"]) {
            Ok(out) => out.lines().next().unwrap_or("unknown").trim().to_string(),
            Err(_) => "not found".to_string(),
        },
    );

    deps.insert(
        "iproute2".to_string(),
        match run_tool("ip", &["-V"]) {
            Ok(out) => out.trim().to_string(),
            Err(_) => "not found".to_string(),
        },
    );

    deps.insert(
        "bbr".to_string(),
        if available_ccs.iter().any(|cc| cc == "bbr") {
            "available".to_string()
        } else {
            "not available (kernel module may need loading)".to_string()
        },
    );

    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_is_the_third_proc_field() {
        let content = "Linux version 6.8.0-41-generic (buildd@lcy02-amd64-100) (gcc 13.2.0)";
        assert_eq!(parse_kernel_version(content), "6.8.0-41-generic");
    }

    #[test]
    fn os_release_prefers_pretty_name() {
        let content = "NAME=\"Ubuntu\"\nVERSION=\"24.04 LTS\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n";
        assert_eq!(parse_os_release(content), "Ubuntu 24.04 LTS");
    }

    #[test]
    fn os_release_falls_back_to_name_and_version() {
        let content = "NAME=\"Debian GNU/Linux\"\nVERSION=\"12 (bookworm)\"\n";
        assert_eq!(parse_os_release(content), "Debian GNU/Linux 12 (bookworm)");
        assert_eq!(parse_os_release("ID=minimal\n"), "Linux");
    }

    #[test]
    fn interface_stats_read_sysfs_counters() {
        let dir = tempfile::tempdir().unwrap();
        let stats_dir = dir.path().join("eth0/statistics");
        fs::create_dir_all(&stats_dir).unwrap();
        fs::write(stats_dir.join("rx_packets"), "12345\n").unwrap();
        fs::write(stats_dir.join("tx_packets"), "678\n").unwrap();
        fs::write(stats_dir.join("rx_dropped"), "2\n").unwrap();

        let stats = interface_stats(dir.path(), "eth0");
        assert_eq!(stats.rx_packets, 12345);
        assert_eq!(stats.tx_packets, 678);
        assert_eq!(stats.rx_dropped, 2);
        // Missing counters read as zero.
        assert_eq!(stats.tx_errors, 0);
    }

    #[test]
    fn bbr_dependency_reflects_available_algorithms() {
        let deps = check_dependencies(&["cubic".to_string(), "bbr".to_string()]);
        assert_eq!(deps.get("bbr").map(String::as_str), Some("available"));

        let deps = check_dependencies(&["cubic".to_string()]);
        assert!(deps.get("bbr").unwrap().starts_with("not available"));
    }
}
