//! The apply engine: plan, snapshot, mutate, verify, roll back.
//!
//! One process-wide lock serialises apply and rollback; a second caller gets
//! [`CoreError::ApplyInProgress`] instead of waiting. The lock is held for
//! the whole sequence of one operation and never across the auto-rollback
//! timer's wait.

mod timer;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapter::HostAdapter;
use crate::config::ManagedPaths;
use crate::error::CoreError;
use crate::fsutil;
use crate::history::{record_or_warn, HistoryJournal};
use crate::profile::{normalize, InterfaceSelector, Profile};
use crate::snapshot::SnapshotStore;
use crate::state::{LastApplyInfo, Snapshot, SystemState};
use crate::ProfileStore;

use timer::RollbackTimer;

/// Whether an apply only reports the plan or also mutates the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Compute and return the plan without mutating anything.
    DryRun,
    /// Mutate the host and verify.
    Commit,
}

/// A request to apply a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyRequest {
    /// Profile to apply.
    pub profile_id: String,
    /// Dry-run or commit.
    pub mode: ApplyMode,
    /// Arm an auto-rollback this many seconds after a successful commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rollback_seconds: Option<u64>,
}

/// One keyed `from -> to` change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Observed value before the apply.
    pub from: String,
    /// Desired value.
    pub to: String,
}

/// The minimal set of changes derived by diffing a profile against observed
/// state. A key appears only when the normalised values differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyPlan {
    /// Sysctl key to change.
    pub sysctl_changes: BTreeMap<String, Change>,
    /// Interface to qdisc change.
    pub qdisc_changes: BTreeMap<String, Change>,
    /// Unit name to activation change.
    pub systemd_changes: BTreeMap<String, Change>,
}

impl ApplyPlan {
    /// Whether the plan contains no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sysctl_changes.is_empty()
            && self.qdisc_changes.is_empty()
            && self.systemd_changes.is_empty()
    }
}

/// Post-mutation verification outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// All planned sysctl keys re-read with the desired value.
    pub sysctl_ok: bool,
    /// All planned interfaces carry the desired qdisc.
    pub qdisc_ok: bool,
    /// The persistence unit is active when the plan required it.
    pub systemd_ok: bool,
    /// Individual mismatches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl VerificationResult {
    /// Whether every surface verified clean.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.sysctl_ok && self.qdisc_ok && self.systemd_ok
    }
}

/// The result of one apply call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Mode the apply ran in.
    pub mode: ApplyMode,
    /// Profile that was applied.
    pub profile_id: String,
    /// Snapshot captured before any mutation.
    pub snapshot_id: String,
    /// The computed plan.
    pub plan: ApplyPlan,
    /// Whether the apply succeeded end to end.
    pub success: bool,
    /// Commit time, absent on dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Verification outcome, absent on dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    /// Mutation and verification failures, plus rollback failures when the
    /// apply was rolled back.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// A request to roll back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackRequest {
    /// Roll back to this snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Roll back to the most recent snapshot instead.
    #[serde(default)]
    pub rollback_last: bool,
}

/// The result of one rollback call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    /// Snapshot that was restored.
    pub snapshot_id: String,
    /// Whether every restore step succeeded.
    pub success: bool,
    /// Host state observed after the restore.
    pub current_state: SystemState,
    /// Individual restore failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Current system status served by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Most recent successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply: Option<LastApplyInfo>,
    /// Observed host state.
    pub current_state: SystemState,
    /// Number of durable snapshots.
    pub snapshots_count: usize,
    /// Most recent snapshot id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_snapshot_id: Option<String>,
}

/// The transaction engine owning all mutating adapters behind one lock.
pub struct ApplyEngine {
    profiles: ProfileStore,
    snapshots: SnapshotStore,
    history: HistoryJournal,
    host: HostAdapter,
    managed: ManagedPaths,
    op_lock: Mutex<()>,
    timer: Mutex<Option<RollbackTimer>>,
}

impl ApplyEngine {
    /// Assembles the engine.
    #[must_use]
    pub fn new(
        profiles: ProfileStore,
        snapshots: SnapshotStore,
        history: HistoryJournal,
        host: HostAdapter,
        managed: ManagedPaths,
    ) -> Arc<Self> {
        Arc::new(Self {
            profiles,
            snapshots,
            history,
            host,
            managed,
            op_lock: Mutex::new(()),
            timer: Mutex::new(None),
        })
    }

    /// The profile store behind this engine.
    #[must_use]
    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// The snapshot store behind this engine.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// The history journal behind this engine.
    #[must_use]
    pub fn history(&self) -> &HistoryJournal {
        &self.history
    }

    /// Applies a profile in dry-run or commit mode.
    pub fn apply(self: &Arc<Self>, request: &ApplyRequest) -> Result<ApplyResult, CoreError> {
        let Ok(_guard) = self.op_lock.try_lock() else {
            return Err(CoreError::ApplyInProgress);
        };

        let profile = self.profiles.get(&request.profile_id)?;

        // The snapshot is captured in both modes so even a dry run leaves an
        // audit point, and its state is the observation the plan diffs
        // against.
        let snapshot = self.snapshots.create()?;
        record_or_warn(self.history.record_snapshot(&snapshot.id));

        let plan = self.plan(&profile, &snapshot.state)?;
        info!(
            profile_id = %profile.id,
            mode = ?request.mode,
            sysctl = plan.sysctl_changes.len(),
            qdisc = plan.qdisc_changes.len(),
            systemd = plan.systemd_changes.len(),
            "computed apply plan"
        );

        match request.mode {
            ApplyMode::DryRun => Ok(ApplyResult {
                mode: ApplyMode::DryRun,
                profile_id: profile.id,
                snapshot_id: snapshot.id,
                plan,
                success: true,
                applied_at: None,
                verification: None,
                errors: Vec::new(),
            }),
            ApplyMode::Commit => self.commit(request, &profile, snapshot, plan),
        }
    }

    /// Rolls back to a snapshot by id.
    pub fn rollback(self: &Arc<Self>, snapshot_id: &str) -> Result<RollbackResult, CoreError> {
        let Ok(_guard) = self.op_lock.try_lock() else {
            return Err(CoreError::ApplyInProgress);
        };

        // An explicit rollback supersedes any pending auto-rollback.
        self.cancel_timer();

        let snapshot = self.snapshots.get(snapshot_id)?;
        let errors = self.restore(&snapshot);
        let success = errors.is_empty();
        record_or_warn(self.history.record_rollback(snapshot_id, success));

        if success {
            info!(snapshot_id, "rollback completed");
        } else {
            warn!(snapshot_id, ?errors, "rollback finished with errors");
        }

        Ok(RollbackResult {
            snapshot_id: snapshot_id.to_string(),
            success,
            current_state: self.snapshots.current_state()?,
            errors,
        })
    }

    /// Current status: last apply, observed state, snapshot inventory.
    ///
    /// Read-only collection, so no operation lock is taken.
    pub fn status(&self) -> Result<SystemStatus, CoreError> {
        let metas = self.snapshots.list()?;
        Ok(SystemStatus {
            last_apply: self.history.last_apply(),
            current_state: self.snapshots.current_state()?,
            snapshots_count: metas.len(),
            latest_snapshot_id: metas.first().map(|meta| meta.id.clone()),
        })
    }

    /// Diffs the profile against the observed state.
    fn plan(&self, profile: &Profile, observed: &SystemState) -> Result<ApplyPlan, CoreError> {
        let mut plan = ApplyPlan::default();

        for (key, value) in &profile.sysctl {
            let desired = normalize(&value.render());
            let current = observed
                .sysctl
                .get(key)
                .map(|raw| normalize(raw))
                .unwrap_or_default();
            if current != desired {
                plan.sysctl_changes.insert(
                    key.clone(),
                    Change {
                        from: current,
                        to: desired,
                    },
                );
            }
        }

        if let Some(qdisc) = &profile.qdisc {
            let interfaces = match qdisc.interfaces {
                InterfaceSelector::DefaultRoute => {
                    vec![self.host.qdisc.default_route_interface()?]
                }
                InterfaceSelector::All => self.host.qdisc.non_loopback_interfaces()?,
            };
            for interface in interfaces {
                let current = observed
                    .qdisc
                    .get(&interface)
                    .map(|info| info.kind.clone())
                    .unwrap_or_else(|| "none".to_string());
                if current != qdisc.kind.as_str() {
                    plan.qdisc_changes.insert(
                        interface,
                        Change {
                            from: current,
                            to: qdisc.kind.as_str().to_string(),
                        },
                    );
                }
            }
        }

        if let Some(systemd) = &profile.systemd {
            if systemd.ensure_qdisc_service {
                let unit = &self.managed.unit_name;
                let active = observed.systemd_units.get(unit).copied().unwrap_or(false);
                if !active {
                    plan.systemd_changes.insert(
                        unit.clone(),
                        Change {
                            from: "inactive".to_string(),
                            to: "active".to_string(),
                        },
                    );
                }
            }
        }

        Ok(plan)
    }

    fn commit(
        self: &Arc<Self>,
        request: &ApplyRequest,
        profile: &Profile,
        snapshot: Snapshot,
        plan: ApplyPlan,
    ) -> Result<ApplyResult, CoreError> {
        let mut fatal = Vec::new();
        let mut soft = Vec::new();

        self.stage_sysctl(profile, &plan, &mut fatal);
        self.stage_qdisc(profile, &plan, &mut fatal, &mut soft);
        self.stage_systemd(profile, &plan, &mut fatal);

        let verification = self.verify(profile, &plan);
        let success = fatal.is_empty() && verification.passed();

        let mut errors = fatal;
        errors.extend(soft);
        errors.extend(verification.errors.iter().cloned());

        if success {
            record_or_warn(self.history.record_apply(&profile.id, &snapshot.id, true));
            self.replace_timer(request.auto_rollback_seconds, &snapshot.id);
            info!(profile_id = %profile.id, snapshot_id = %snapshot.id, "apply committed");
        } else {
            warn!(
                profile_id = %profile.id,
                snapshot_id = %snapshot.id,
                ?errors,
                "apply failed, rolling back to pre-apply snapshot"
            );
            let rollback_errors = self.restore(&snapshot);
            record_or_warn(
                self.history
                    .record_rollback(&snapshot.id, rollback_errors.is_empty()),
            );
            errors.extend(rollback_errors);
            record_or_warn(self.history.record_apply(&profile.id, &snapshot.id, false));
        }

        Ok(ApplyResult {
            mode: ApplyMode::Commit,
            profile_id: profile.id.clone(),
            snapshot_id: snapshot.id,
            plan,
            success,
            applied_at: success.then(Utc::now),
            verification: Some(verification),
            errors,
        })
    }

    fn stage_sysctl(&self, profile: &Profile, plan: &ApplyPlan, fatal: &mut Vec<String>) {
        for (key, change) in &plan.sysctl_changes {
            if let Err(err) = self.host.sysctl.set(key, &change.to) {
                fatal.push(format!("sysctl {key}: {err}"));
            }
        }

        if profile.sysctl.is_empty() {
            return;
        }

        // Merge the complete profile sysctl set into the managed drop-in so
        // the on-disk values are authoritative after reboot.
        if let Err(err) = self
            .host
            .sysctl
            .write_config_file(&self.managed.sysctl_conf, &profile.rendered_sysctl())
        {
            fatal.push(format!(
                "write {}: {err}",
                self.managed.sysctl_conf.display()
            ));
            return;
        }
        if let Err(err) = self.host.sysctl.load_config_file(&self.managed.sysctl_conf) {
            fatal.push(format!(
                "load {}: {err}",
                self.managed.sysctl_conf.display()
            ));
        }
    }

    /// A per-interface failure is non-fatal while at least one interface
    /// succeeded (the interface may have vanished since planning);
    /// verification decides overall success. A total failure is fatal.
    fn stage_qdisc(
        &self,
        profile: &Profile,
        plan: &ApplyPlan,
        fatal: &mut Vec<String>,
        soft: &mut Vec<String>,
    ) {
        let Some(qdisc) = &profile.qdisc else {
            return;
        };
        if plan.qdisc_changes.is_empty() {
            return;
        }

        let mut succeeded = 0usize;
        let mut failures = Vec::new();
        for interface in plan.qdisc_changes.keys() {
            match self
                .host
                .qdisc
                .replace(interface, qdisc.kind.as_str(), &qdisc.params)
            {
                Ok(()) => succeeded += 1,
                Err(err) => failures.push(format!("qdisc {interface}: {err}")),
            }
        }

        if succeeded == 0 {
            fatal.extend(failures);
        } else {
            soft.extend(failures);
        }
    }

    fn stage_systemd(&self, profile: &Profile, plan: &ApplyPlan, fatal: &mut Vec<String>) {
        if plan.systemd_changes.is_empty() {
            return;
        }
        let Some(qdisc) = &profile.qdisc else {
            // The persistence unit exists to re-apply a qdisc; without a
            // qdisc payload there is nothing to persist.
            fatal.push("systemd change planned but profile has no qdisc payload".to_string());
            return;
        };

        let script = crate::adapter::systemd::generate_qdisc_script(qdisc.kind.as_str(), None);
        if let Err(err) =
            fsutil::atomic_write_mode(&self.managed.qdisc_script, script.as_bytes(), Some(0o755))
        {
            fatal.push(format!(
                "write {}: {err}",
                self.managed.qdisc_script.display()
            ));
            return;
        }

        let unit = &self.managed.unit_name;
        let body = crate::adapter::systemd::generate_qdisc_unit(&self.managed.qdisc_script);
        let steps: [(&str, Result<(), crate::error::HostError>); 3] = [
            ("create", self.host.systemd.create_unit(unit, &body)),
            ("enable", self.host.systemd.enable(unit)),
            ("start", self.host.systemd.start(unit)),
        ];
        for (step, result) in steps {
            if let Err(err) = result {
                fatal.push(format!("systemd {step} {unit}: {err}"));
            }
        }
    }

    /// Re-reads every planned key and compares with normalised equality.
    fn verify(&self, profile: &Profile, plan: &ApplyPlan) -> VerificationResult {
        let mut result = VerificationResult {
            sysctl_ok: true,
            qdisc_ok: true,
            systemd_ok: true,
            errors: Vec::new(),
        };

        for (key, change) in &plan.sysctl_changes {
            match self.host.sysctl.get(key) {
                Ok(observed) if normalize(&observed) == normalize(&change.to) => {}
                Ok(observed) => {
                    result.sysctl_ok = false;
                    result.errors.push(format!(
                        "sysctl {key}: expected {:?}, observed {:?}",
                        change.to,
                        normalize(&observed)
                    ));
                }
                Err(err) => {
                    result.sysctl_ok = false;
                    result.errors.push(format!("sysctl {key}: {err}"));
                }
            }
        }

        if let Some(qdisc) = &profile.qdisc {
            for interface in plan.qdisc_changes.keys() {
                match self.host.qdisc.get(interface) {
                    Ok(info) if info.kind == qdisc.kind.as_str() => {}
                    Ok(info) => {
                        result.qdisc_ok = false;
                        result.errors.push(format!(
                            "qdisc {interface}: expected {}, observed {}",
                            qdisc.kind.as_str(),
                            info.kind
                        ));
                    }
                    Err(_) => {
                        // The interface vanished between plan and verify;
                        // nothing left to check on it.
                        warn!(
                            interface = %interface,
                            "planned interface disappeared before verification"
                        );
                    }
                }
            }
        }

        for unit in plan.systemd_changes.keys() {
            match self.host.systemd.is_active(unit) {
                Ok(true) => {}
                Ok(false) => {
                    result.systemd_ok = false;
                    result.errors.push(format!("unit {unit} is not active"));
                }
                Err(err) => {
                    result.systemd_ok = false;
                    result.errors.push(format!("unit {unit}: {err}"));
                }
            }
        }

        result
    }

    /// Restores the recorded state. Returns per-step failures instead of
    /// short-circuiting, so a partly failed restore still undoes everything
    /// it can.
    fn restore(&self, snapshot: &Snapshot) -> Vec<String> {
        let mut errors = Vec::new();

        for (key, value) in &snapshot.state.sysctl {
            if let Err(err) = self.host.sysctl.set(key, value) {
                errors.push(format!("sysctl {key}: {err}"));
            }
        }

        for (interface, info) in &snapshot.state.qdisc {
            // Restore the recorded type; observed params are tc's reporting
            // vocabulary, not valid replace arguments.
            if let Err(err) = self
                .host
                .qdisc
                .replace(interface, &info.kind, &BTreeMap::new())
            {
                errors.push(format!("qdisc {interface}: {err}"));
            }
        }

        for file in self.managed.managed_files() {
            let key = file.display().to_string();
            match snapshot.backups.get(&key) {
                Some(content) => {
                    let mode = (file == self.managed.qdisc_script).then_some(0o755);
                    if let Err(err) = fsutil::atomic_write_mode(file, content.as_bytes(), mode) {
                        errors.push(format!("restore {key}: {err}"));
                    }
                }
                // No backup entry means the file did not exist at capture
                // time; remove whatever the apply wrote.
                None => match std::fs::remove_file(file) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => errors.push(format!("remove {key}: {err}")),
                },
            }
        }

        for (unit, was_active) in &snapshot.state.systemd_units {
            let now_active = self.host.systemd.is_active(unit).unwrap_or(false);
            let result = if *was_active && !now_active {
                self.host.systemd.start(unit)
            } else if !*was_active && now_active {
                self.host.systemd.stop(unit)
            } else {
                Ok(())
            };
            if let Err(err) = result {
                errors.push(format!("unit {unit}: {err}"));
            }
        }

        errors
    }

    /// Replaces any pending timer; arms a new one when a window was given.
    fn replace_timer(self: &Arc<Self>, auto_rollback_seconds: Option<u64>, snapshot_id: &str) {
        let mut slot = self
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        if let Some(seconds) = auto_rollback_seconds.filter(|s| *s > 0) {
            info!(snapshot_id, seconds, "armed auto-rollback timer");
            *slot = Some(RollbackTimer::arm(
                Arc::downgrade(self),
                snapshot_id.to_string(),
                Duration::from_secs(seconds),
            ));
        }
    }

    fn cancel_timer(&self) {
        let mut slot = self
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(timer) = slot.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use super::*;
    use crate::adapter::{MemoryHost, SystemdOps};
    use crate::profile::{QdiscConfig, QdiscType, RiskLevel, SysctlValue, SystemdConfig};

    struct Fixture {
        engine: Arc<ApplyEngine>,
        host: Arc<MemoryHost>,
        managed: ManagedPaths,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(host: Arc<MemoryHost>, extra_profiles: Vec<Profile>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let managed = ManagedPaths::rooted_at(&dir.path().join("hostfs"));

        let profiles_dir = dir.path().join("profiles");
        fs::create_dir_all(&profiles_dir).unwrap();
        for profile in &extra_profiles {
            fs::write(
                profiles_dir.join(format!("{}.json", profile.id)),
                serde_json::to_vec_pretty(profile).unwrap(),
            )
            .unwrap();
        }

        let adapter = HostAdapter::in_memory(host.clone());
        let snapshots = SnapshotStore::new(
            dir.path().join("snapshots"),
            adapter.clone(),
            managed.clone(),
        )
        .unwrap();
        let history = HistoryJournal::new(dir.path().join("history")).unwrap();
        let engine = ApplyEngine::new(
            ProfileStore::new(profiles_dir),
            snapshots,
            history,
            adapter,
            managed.clone(),
        );

        Fixture {
            engine,
            host,
            managed,
            _dir: dir,
        }
    }

    fn cubic_host() -> Arc<MemoryHost> {
        let host = Arc::new(MemoryHost::new());
        host.insert_sysctl("net.ipv4.tcp_congestion_control", "cubic");
        host.insert_sysctl("net.core.default_qdisc", "pfifo_fast");
        host.insert_interface("eth0", "pfifo_fast");
        host
    }

    fn commit_request(profile_id: &str) -> ApplyRequest {
        ApplyRequest {
            profile_id: profile_id.to_string(),
            mode: ApplyMode::Commit,
            auto_rollback_seconds: None,
        }
    }

    #[test]
    fn dry_run_surfaces_only_real_diffs_and_never_mutates() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let result = fx
            .engine
            .apply(&ApplyRequest {
                profile_id: "bbr-fq-default".to_string(),
                mode: ApplyMode::DryRun,
                auto_rollback_seconds: None,
            })
            .unwrap();

        assert!(result.success);
        assert_eq!(result.plan.sysctl_changes.len(), 2);
        let cc = &result.plan.sysctl_changes["net.ipv4.tcp_congestion_control"];
        assert_eq!(cc.from, "cubic");
        assert_eq!(cc.to, "bbr");
        let qd = &result.plan.sysctl_changes["net.core.default_qdisc"];
        assert_eq!(qd.from, "pfifo_fast");
        assert_eq!(qd.to, "fq");
        assert!(result.verification.is_none());
        assert!(!result.snapshot_id.is_empty());

        // Host untouched.
        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("cubic")
        );
        assert!(!fx.managed.sysctl_conf.exists());
    }

    #[test]
    fn dry_run_still_commits_an_audit_point() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let result = fx
            .engine
            .apply(&ApplyRequest {
                profile_id: "bbr-fq-default".to_string(),
                mode: ApplyMode::DryRun,
                auto_rollback_seconds: None,
            })
            .unwrap();

        assert!(fx.engine.snapshots().get(&result.snapshot_id).is_ok());
        let entries = fx.engine.history().recent_entries(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].action,
            crate::state::HistoryAction::Snapshot
        );
        // Dry runs never become the last apply.
        assert!(fx.engine.history().last_apply().is_none());
    }

    #[test]
    fn commit_mutates_writes_conf_and_verifies() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let result = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();

        assert!(result.success, "errors: {:?}", result.errors);
        assert!(result.applied_at.is_some());
        assert!(result.verification.as_ref().unwrap().passed());
        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("bbr")
        );

        let conf = fs::read_to_string(&fx.managed.sysctl_conf).unwrap();
        assert!(conf.starts_with("# Managed by nettune - DO NOT EDIT"));
        assert!(conf.contains("net.ipv4.tcp_congestion_control = bbr"));

        let last = fx.engine.history().last_apply().unwrap();
        assert_eq!(last.profile_id, "bbr-fq-default");
    }

    #[test]
    fn commit_then_rollback_round_trips_host_state() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let apply = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
        assert!(apply.success);
        assert!(fx.managed.sysctl_conf.exists());

        let rollback = fx.engine.rollback(&apply.snapshot_id).unwrap();
        assert!(rollback.success, "errors: {:?}", rollback.errors);
        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("cubic")
        );
        assert_eq!(
            rollback.current_state.sysctl["net.ipv4.tcp_congestion_control"],
            "cubic"
        );
        // The managed conf did not exist at capture time, so rollback
        // removed it.
        assert!(!fx.managed.sysctl_conf.exists());
    }

    #[test]
    fn commit_applies_qdisc_and_persistence_unit() {
        let profile = Profile {
            id: "fq-with-unit".to_string(),
            name: "fq with persistence".to_string(),
            description: String::new(),
            risk_level: RiskLevel::Medium,
            requires_reboot: false,
            sysctl: BTreeMap::from([(
                "net.core.default_qdisc".to_string(),
                SysctlValue::Str("fq".to_string()),
            )]),
            qdisc: Some(QdiscConfig {
                kind: QdiscType::Fq,
                interfaces: InterfaceSelector::DefaultRoute,
                params: BTreeMap::new(),
            }),
            systemd: Some(SystemdConfig {
                ensure_qdisc_service: true,
            }),
        };
        let fx = fixture_with(cubic_host(), vec![profile]);

        let result = fx.engine.apply(&commit_request("fq-with-unit")).unwrap();

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.plan.qdisc_changes["eth0"].from, "pfifo_fast");
        assert_eq!(result.plan.qdisc_changes["eth0"].to, "fq");
        assert_eq!(
            result.plan.systemd_changes["nettune-qdisc.service"].to,
            "active"
        );

        assert_eq!(fx.host.qdisc_kind("eth0").as_deref(), Some("fq"));
        assert!(fx.host.unit_active("nettune-qdisc.service"));
        assert!(fx.host.unit_exists("nettune-qdisc.service"));

        let script = fs::read_to_string(&fx.managed.qdisc_script).unwrap();
        assert!(script.contains("root fq"));
    }

    #[test]
    fn profile_matching_current_state_yields_empty_plan() {
        let host = cubic_host();
        host.insert_sysctl("net.ipv4.tcp_congestion_control", "bbr");
        host.insert_sysctl("net.core.default_qdisc", "fq");
        let fx = fixture_with(host, Vec::new());

        let result = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
        assert!(result.success);
        assert!(result.plan.sysctl_changes.is_empty());
        assert!(result.plan.is_empty());
    }

    #[test]
    fn whitespace_variants_normalise_to_an_empty_plan() {
        let profile = Profile {
            id: "tuple-spacing".to_string(),
            name: "tuple spacing".to_string(),
            description: String::new(),
            risk_level: RiskLevel::Low,
            requires_reboot: false,
            sysctl: BTreeMap::from([(
                "net.ipv4.tcp_rmem".to_string(),
                SysctlValue::Str("4096  87380\t16777216".to_string()),
            )]),
            qdisc: None,
            systemd: None,
        };
        let host = cubic_host();
        host.insert_sysctl("net.ipv4.tcp_rmem", "4096 87380 16777216");
        let fx = fixture_with(host, vec![profile]);

        let result = fx.engine.apply(&commit_request("tuple-spacing")).unwrap();
        assert!(result.plan.sysctl_changes.is_empty());
    }

    #[test]
    fn unknown_profile_is_not_found() {
        let fx = fixture_with(cubic_host(), Vec::new());
        match fx.engine.apply(&commit_request("missing")) {
            Err(CoreError::ProfileNotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected ProfileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn unknown_snapshot_is_not_found() {
        let fx = fixture_with(cubic_host(), Vec::new());
        assert!(matches!(
            fx.engine.rollback("2020-01-01T00-00-00Z_deadbeef"),
            Err(CoreError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn concurrent_applies_reject_exactly_one() {
        let fx = fixture_with(cubic_host(), Vec::new());

        // Hold the operation lock as a stand-in for an in-flight apply.
        let guard = fx.engine.op_lock.try_lock().unwrap();
        let engine = Arc::clone(&fx.engine);
        let handle = thread::spawn(move || engine.apply(&commit_request("bbr-fq-default")));
        let second = handle.join().unwrap();
        assert!(matches!(second, Err(CoreError::ApplyInProgress)));
        drop(guard);

        // With the lock released the same call runs to completion.
        let result = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
        assert!(result.success);
    }

    #[test]
    fn failed_mutation_rolls_back_and_journals_failure() {
        let host = cubic_host();
        host.fail_sysctl_set("net.ipv4.tcp_congestion_control");
        let fx = fixture_with(host, Vec::new());

        let result = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();

        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("tcp_congestion_control")));
        // default_qdisc was set before the failure was detected, then the
        // rollback restored it.
        assert_eq!(
            fx.host.sysctl_value("net.core.default_qdisc").as_deref(),
            Some("pfifo_fast")
        );

        let entries = fx.engine.history().recent_entries(10).unwrap();
        let apply_entry = entries
            .iter()
            .find(|e| e.action == crate::state::HistoryAction::Apply)
            .unwrap();
        assert!(!apply_entry.success);
        assert!(entries
            .iter()
            .any(|e| e.action == crate::state::HistoryAction::Rollback));
        assert!(fx.engine.history().last_apply().is_none());
    }

    #[test]
    fn vanished_interface_is_soft_when_another_succeeds() {
        let profile = Profile {
            id: "fq-all".to_string(),
            name: "fq everywhere".to_string(),
            description: String::new(),
            risk_level: RiskLevel::Low,
            requires_reboot: false,
            sysctl: BTreeMap::new(),
            qdisc: Some(QdiscConfig {
                kind: QdiscType::Fq,
                interfaces: InterfaceSelector::All,
                params: BTreeMap::new(),
            }),
            systemd: None,
        };
        let host = cubic_host();
        host.insert_interface("wlan0", "pfifo_fast");
        let fx = fixture_with(host, vec![profile.clone()]);

        // Plan both interfaces, then have wlan0 vanish before mutation.
        let plan = ApplyPlan {
            qdisc_changes: BTreeMap::from([
                (
                    "eth0".to_string(),
                    Change {
                        from: "pfifo_fast".to_string(),
                        to: "fq".to_string(),
                    },
                ),
                (
                    "wlan0".to_string(),
                    Change {
                        from: "pfifo_fast".to_string(),
                        to: "fq".to_string(),
                    },
                ),
            ]),
            ..ApplyPlan::default()
        };
        fx.host.fail_qdisc_replace("wlan0");

        let mut fatal = Vec::new();
        let mut soft = Vec::new();
        fx.engine.stage_qdisc(&profile, &plan, &mut fatal, &mut soft);

        // One interface succeeded, so the other's failure is non-fatal.
        assert!(fatal.is_empty(), "fatal: {fatal:?}");
        assert_eq!(soft.len(), 1);
        assert!(soft[0].contains("wlan0"));
        assert_eq!(fx.host.qdisc_kind("eth0").as_deref(), Some("fq"));

        // With wlan0 gone entirely, verification lets it pass.
        fx.host.remove_interface("wlan0");
        let verification = fx.engine.verify(&profile, &plan);
        assert!(verification.qdisc_ok);

        // But a total failure is fatal.
        fx.host.fail_qdisc_replace("eth0");
        let mut fatal = Vec::new();
        let mut soft = Vec::new();
        let lone_plan = ApplyPlan {
            qdisc_changes: BTreeMap::from([(
                "eth0".to_string(),
                Change {
                    from: "fq".to_string(),
                    to: "cake".to_string(),
                },
            )]),
            ..ApplyPlan::default()
        };
        fx.engine.stage_qdisc(&profile, &lone_plan, &mut fatal, &mut soft);
        assert_eq!(fatal.len(), 1);
        assert!(soft.is_empty());
    }

    #[test]
    fn status_reflects_snapshots_and_last_apply() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let before = fx.engine.status().unwrap();
        assert_eq!(before.snapshots_count, 0);
        assert!(before.last_apply.is_none());
        assert!(before.latest_snapshot_id.is_none());

        let apply = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();

        let after = fx.engine.status().unwrap();
        assert_eq!(after.snapshots_count, 1);
        assert_eq!(after.latest_snapshot_id.as_deref(), Some(apply.snapshot_id.as_str()));
        assert_eq!(after.last_apply.unwrap().profile_id, "bbr-fq-default");
        assert_eq!(
            after.current_state.sysctl["net.ipv4.tcp_congestion_control"],
            "bbr"
        );
    }

    #[test]
    fn auto_rollback_fires_after_the_window() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let result = fx
            .engine
            .apply(&ApplyRequest {
                profile_id: "bbr-fq-default".to_string(),
                mode: ApplyMode::Commit,
                auto_rollback_seconds: Some(1),
            })
            .unwrap();
        assert!(result.success);
        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("bbr")
        );

        thread::sleep(Duration::from_millis(1900));

        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("cubic")
        );
        let entries = fx.engine.history().recent_entries(10).unwrap();
        assert!(entries
            .iter()
            .any(|e| e.action == crate::state::HistoryAction::Rollback && e.success));
    }

    #[test]
    fn explicit_rollback_cancels_the_pending_timer() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let apply = fx
            .engine
            .apply(&ApplyRequest {
                profile_id: "bbr-fq-default".to_string(),
                mode: ApplyMode::Commit,
                auto_rollback_seconds: Some(1),
            })
            .unwrap();

        fx.engine.rollback(&apply.snapshot_id).unwrap();
        assert!(fx.engine.timer.lock().unwrap().is_none());

        // Re-apply after the original window would have expired; the old
        // timer must not fire and undo this.
        let reapplied = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
        assert!(reapplied.success);
        thread::sleep(Duration::from_millis(1400));
        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("bbr")
        );
    }

    #[test]
    fn subsequent_apply_replaces_the_pending_timer() {
        let fx = fixture_with(cubic_host(), Vec::new());

        fx.engine
            .apply(&ApplyRequest {
                profile_id: "bbr-fq-default".to_string(),
                mode: ApplyMode::Commit,
                auto_rollback_seconds: Some(1),
            })
            .unwrap();

        // Second apply without a window cancels the first timer.
        let second = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
        assert!(second.success);
        assert!(fx.engine.timer.lock().unwrap().is_none());

        thread::sleep(Duration::from_millis(1400));
        assert_eq!(
            fx.host.sysctl_value("net.ipv4.tcp_congestion_control").as_deref(),
            Some("bbr")
        );
    }

    #[test]
    fn rollback_restores_managed_file_contents_by_value() {
        let fx = fixture_with(cubic_host(), Vec::new());

        // Pre-existing managed conf with known contents.
        let original = "# Managed by nettune - DO NOT EDIT\n\nnet.core.default_qdisc = fq_codel\n";
        fs::create_dir_all(fx.managed.sysctl_conf.parent().unwrap()).unwrap();
        fs::write(&fx.managed.sysctl_conf, original).unwrap();

        let apply = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
        assert!(apply.success);
        let rewritten = fs::read_to_string(&fx.managed.sysctl_conf).unwrap();
        assert_ne!(rewritten, original);

        fx.engine.rollback(&apply.snapshot_id).unwrap();
        assert_eq!(fs::read_to_string(&fx.managed.sysctl_conf).unwrap(), original);
    }

    #[test]
    fn request_mode_rejects_unknown_strings() {
        let err = serde_json::from_str::<ApplyRequest>(
            r#"{"profile_id": "x", "mode": "yolo"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown variant"));

        let ok: ApplyRequest =
            serde_json::from_str(r#"{"profile_id": "x", "mode": "dry_run"}"#).unwrap();
        assert_eq!(ok.mode, ApplyMode::DryRun);
    }

    #[test]
    fn snapshot_ids_are_monotone_across_applies() {
        let fx = fixture_with(cubic_host(), Vec::new());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let result = fx.engine.apply(&commit_request("bbr-fq-default")).unwrap();
            ids.push(result.snapshot_id);
        }

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, ids);
    }

    #[test]
    fn restore_compares_unit_state_before_acting(){
        let fx = fixture_with(cubic_host(), Vec::new());
        let snapshot = fx.engine.snapshots().create().unwrap();

        // Unit inactive in snapshot and inactive now: restore must not try
        // to stop it (a stop on a never-created unit would error).
        let errors = fx.engine.restore(&snapshot);
        assert!(errors.is_empty(), "errors: {errors:?}");
    }

    fn assert_send_sync<T: Send + Sync>(_: &T) {}

    #[test]
    fn engine_is_shareable_across_threads() {
        let fx = fixture_with(cubic_host(), Vec::new());
        assert_send_sync(&fx.engine);
    }
}
