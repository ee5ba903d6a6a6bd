//! Declarative tuning profiles and the store that loads them.
//!
//! A profile is immutable once loaded: the store reads JSON files from the
//! profiles directory and merges them with the compiled-in defaults. A user
//! profile whose id collides with a builtin shadows it, so operators can pin
//! their own variant of a default.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

/// A sysctl value as written in a profile.
///
/// Kernel tunables are heterogeneous: plain integers, strings
/// (`bbr`, `fq`), or whitespace-separated integer tuples (`tcp_rmem`).
/// [`SysctlValue::render`] is the single place a value becomes the string
/// handed to the kernel; [`normalize`] is the single equality used by both
/// planning and verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SysctlValue {
    /// A single integer, rendered as plain decimal.
    Int(i64),
    /// A verbatim string.
    Str(String),
    /// An integer tuple, rendered space-joined (`4096 87380 16777216`).
    Tuple(Vec<i64>),
}

impl SysctlValue {
    /// Renders the value to the canonical string written to the kernel.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s.clone(),
            Self::Tuple(parts) => parts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Normalises a sysctl string for comparison: trims and collapses interior
/// whitespace runs (the kernel reports tuples tab-separated) to one space.
#[must_use]
pub fn normalize(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Operator-facing risk classification of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Reversible settings with no throughput/latency trade-off surprises.
    Low,
    /// Settings that can regress some workloads.
    Medium,
    /// Settings that need operator attention after apply.
    High,
}

/// Queueing disciplines a profile may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QdiscType {
    /// Fair queueing with pacing, the usual BBR companion.
    Fq,
    /// Fair queueing with CoDel AQM.
    FqCodel,
    /// Common Applications Kept Enhanced.
    Cake,
    /// The kernel's legacy default.
    PfifoFast,
}

impl QdiscType {
    /// The name `tc` knows this qdisc by.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fq => "fq",
            Self::FqCodel => "fq_codel",
            Self::Cake => "cake",
            Self::PfifoFast => "pfifo_fast",
        }
    }
}

/// Which interfaces a qdisc payload targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceSelector {
    /// Only the interface carrying the default route.
    DefaultRoute,
    /// Every non-loopback interface.
    All,
}

/// The qdisc payload of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QdiscConfig {
    /// Desired qdisc.
    #[serde(rename = "type")]
    pub kind: QdiscType,
    /// Target interface set.
    pub interfaces: InterfaceSelector,
    /// Extra `tc` options passed through on replace.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// The systemd payload of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemdConfig {
    /// Ensure the qdisc persistence unit exists and is active.
    pub ensure_qdisc_service: bool,
}

/// A declarative bundle of network settings, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Stable slug identifying the profile.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the profile is for.
    #[serde(default)]
    pub description: String,
    /// Operator-facing risk classification.
    pub risk_level: RiskLevel,
    /// Advisory: some settings only take full effect after reboot.
    #[serde(default)]
    pub requires_reboot: bool,
    /// Kernel tunables to set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, SysctlValue>,
    /// Queueing-discipline payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qdisc: Option<QdiscConfig>,
    /// Persistence-unit payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systemd: Option<SystemdConfig>,
}

/// Listing projection of a [`Profile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMeta {
    /// Stable slug identifying the profile.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the profile is for.
    pub description: String,
    /// Operator-facing risk classification.
    pub risk_level: RiskLevel,
    /// Advisory reboot flag.
    pub requires_reboot: bool,
}

impl Profile {
    /// The listing projection of this profile.
    #[must_use]
    pub fn meta(&self) -> ProfileMeta {
        ProfileMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            risk_level: self.risk_level,
            requires_reboot: self.requires_reboot,
        }
    }

    /// The sysctl payload rendered to canonical strings.
    #[must_use]
    pub fn rendered_sysctl(&self) -> BTreeMap<String, String> {
        self.sysctl
            .iter()
            .map(|(key, value)| (key.clone(), value.render()))
            .collect()
    }

    /// Validates fields serde cannot: the id slug and non-empty name.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !is_valid_profile_id(&self.id) {
            return Err(CoreError::Validation(format!(
                "profile id {:?} is not a valid slug",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "profile {} has an empty name",
                self.id
            )));
        }
        Ok(())
    }
}

/// Whether `id` is an acceptable profile slug.
#[must_use]
pub fn is_valid_profile_id(id: &str) -> bool {
    static SLUG: OnceLock<Regex> = OnceLock::new();
    SLUG.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("static slug pattern"))
        .is_match(id)
}

/// Loads profiles from a directory and the compiled-in defaults.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Creates a store over `dir`. The directory does not need to exist;
    /// a missing directory just means only builtins are served.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lists all profiles, user-defined merged over builtins, sorted by id.
    pub fn list(&self) -> Result<Vec<ProfileMeta>, CoreError> {
        Ok(self.load_all().iter().map(Profile::meta).collect())
    }

    /// Returns one profile by id.
    pub fn get(&self, id: &str) -> Result<Profile, CoreError> {
        self.load_all()
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::ProfileNotFound(id.to_string()))
    }

    fn load_all(&self) -> Vec<Profile> {
        let mut by_id: BTreeMap<String, Profile> = builtin_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return by_id.into_values().collect();
            }
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "failed to read profiles directory");
                return by_id.into_values().collect();
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_profile_file(&path) {
                Ok(profile) => {
                    by_id.insert(profile.id.clone(), profile);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping invalid profile file");
                }
            }
        }

        by_id.into_values().collect()
    }
}

fn load_profile_file(path: &std::path::Path) -> Result<Profile, CoreError> {
    let data = fs::read_to_string(path)
        .map_err(|e| CoreError::io(format!("read profile {}", path.display()), e))?;
    let profile: Profile = serde_json::from_str(&data)
        .map_err(|e| CoreError::json(format!("parse profile {}", path.display()), e))?;
    profile.validate()?;
    Ok(profile)
}

/// The compiled-in default profiles.
#[must_use]
pub fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile {
            id: "bbr-fq-default".to_string(),
            name: "BBR + FQ defaults".to_string(),
            description: "Switch TCP congestion control to BBR and the default qdisc to fq"
                .to_string(),
            risk_level: RiskLevel::Low,
            requires_reboot: false,
            sysctl: BTreeMap::from([
                (
                    "net.ipv4.tcp_congestion_control".to_string(),
                    SysctlValue::Str("bbr".to_string()),
                ),
                (
                    "net.core.default_qdisc".to_string(),
                    SysctlValue::Str("fq".to_string()),
                ),
            ]),
            qdisc: None,
            systemd: None,
        },
        Profile {
            id: "bbr-fq-throughput".to_string(),
            name: "BBR + FQ, large buffers".to_string(),
            description:
                "BBR with fq on the default-route interface, enlarged socket buffers, and the \
                 qdisc persistence unit"
                    .to_string(),
            risk_level: RiskLevel::Medium,
            requires_reboot: false,
            sysctl: BTreeMap::from([
                (
                    "net.ipv4.tcp_congestion_control".to_string(),
                    SysctlValue::Str("bbr".to_string()),
                ),
                (
                    "net.core.default_qdisc".to_string(),
                    SysctlValue::Str("fq".to_string()),
                ),
                (
                    "net.core.rmem_max".to_string(),
                    SysctlValue::Int(67_108_864),
                ),
                (
                    "net.core.wmem_max".to_string(),
                    SysctlValue::Int(67_108_864),
                ),
                (
                    "net.ipv4.tcp_rmem".to_string(),
                    SysctlValue::Tuple(vec![4096, 87380, 33_554_432]),
                ),
                (
                    "net.ipv4.tcp_wmem".to_string(),
                    SysctlValue::Tuple(vec![4096, 65536, 33_554_432]),
                ),
                ("net.ipv4.tcp_mtu_probing".to_string(), SysctlValue::Int(1)),
                (
                    "net.ipv4.tcp_slow_start_after_idle".to_string(),
                    SysctlValue::Int(0),
                ),
            ]),
            qdisc: Some(QdiscConfig {
                kind: QdiscType::Fq,
                interfaces: InterfaceSelector::DefaultRoute,
                params: BTreeMap::new(),
            }),
            systemd: Some(SystemdConfig {
                ensure_qdisc_service: true,
            }),
        },
        Profile {
            id: "latency-fq-codel".to_string(),
            name: "Low latency with fq_codel".to_string(),
            description: "fq_codel on the default-route interface for interactive workloads"
                .to_string(),
            risk_level: RiskLevel::Low,
            requires_reboot: false,
            sysctl: BTreeMap::from([(
                "net.core.default_qdisc".to_string(),
                SysctlValue::Str("fq_codel".to_string()),
            )]),
            qdisc: Some(QdiscConfig {
                kind: QdiscType::FqCodel,
                interfaces: InterfaceSelector::DefaultRoute,
                params: BTreeMap::new(),
            }),
            systemd: None,
        },
    ]
}
