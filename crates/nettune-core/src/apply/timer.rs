//! One-shot auto-rollback timer.
//!
//! The engine owns at most one timer handle. Arming a new timer cancels the
//! previous one; dropping the handle cancels it too. The timer thread holds
//! only a `Weak` reference to the engine, so an engine being torn down never
//! keeps a timer thread rolling back.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use super::ApplyEngine;

#[derive(Default)]
struct CancelFlag {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Handle to a pending auto-rollback.
pub(crate) struct RollbackTimer {
    flag: Arc<CancelFlag>,
    snapshot_id: String,
}

impl RollbackTimer {
    /// Spawns a timer that rolls back to `snapshot_id` after `delay` unless
    /// cancelled first.
    pub(crate) fn arm(engine: Weak<ApplyEngine>, snapshot_id: String, delay: Duration) -> Self {
        let flag = Arc::new(CancelFlag::default());
        let thread_flag = Arc::clone(&flag);
        let thread_snapshot = snapshot_id.clone();

        thread::Builder::new()
            .name("nettune-auto-rollback".to_string())
            .spawn(move || run(engine, thread_flag, thread_snapshot, delay))
            .map_err(|err| warn!(error = %err, "failed to spawn auto-rollback timer"))
            .ok();

        Self { flag, snapshot_id }
    }

    /// Cancels the pending rollback. Safe to call more than once.
    pub(crate) fn cancel(&self) {
        let mut cancelled = self
            .flag
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !*cancelled {
            *cancelled = true;
            info!(snapshot_id = %self.snapshot_id, "cancelled auto-rollback timer");
        }
        self.flag.signal.notify_all();
    }
}

impl Drop for RollbackTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run(engine: Weak<ApplyEngine>, flag: Arc<CancelFlag>, snapshot_id: String, delay: Duration) {
    let cancelled = flag
        .cancelled
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let (cancelled, timeout) = flag
        .signal
        .wait_timeout_while(cancelled, delay, |cancelled| !*cancelled)
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    if *cancelled || !timeout.timed_out() {
        return;
    }
    drop(cancelled);

    let Some(engine) = engine.upgrade() else {
        return;
    };

    info!(snapshot_id = %snapshot_id, "auto-rollback window expired, rolling back");
    match engine.rollback(&snapshot_id) {
        Ok(result) if result.success => {
            info!(snapshot_id = %snapshot_id, "auto-rollback completed");
        }
        Ok(result) => {
            warn!(
                snapshot_id = %snapshot_id,
                errors = ?result.errors,
                "auto-rollback finished with errors"
            );
        }
        Err(err) => {
            error!(snapshot_id = %snapshot_id, error = %err, "auto-rollback failed");
        }
    }
}
