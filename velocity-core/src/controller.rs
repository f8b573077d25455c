/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Lifecycle control for a [`TransitWorker`] (§4.6): enable/disable,
//! manual and full-history triggers, periodic ticking, and health
//! reporting. Grounded on the `RwLock`-guarded snapshot-replace pattern
//! `nimbus`'s `DatabaseCache` uses for its own shared, mutation-guarded
//! state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::clock::now_unix;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::transit::{TransitWorker, TransitWorkerConfig};

/// One execution of the worker, as tracked by the controller.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub trigger: String,
    pub started_at: f64,
    pub finished_at: f64,
    pub duration_ms: f64,
    pub error: Option<String>,
}

#[derive(Default)]
struct ControllerState {
    enabled: bool,
    last_run_at: Option<f64>,
    last_run_error: Option<String>,
    run_count: u64,
    current_run: Option<RunRecord>,
    last_run: Option<RunRecord>,
}

/// A consistent snapshot of the controller's state, taken under one
/// read-lock acquisition.
#[derive(Clone, Debug)]
pub struct ControllerStatus {
    pub enabled: bool,
    pub last_run_at: Option<f64>,
    pub last_run_error: Option<String>,
    pub run_count: u64,
    pub current_run: Option<RunRecord>,
    pub last_run: Option<RunRecord>,
    pub healthy: bool,
}

enum RunKind {
    Once,
    FullHistory,
}

/// Owns an exclusive reference to its worker's configuration; holds no
/// state between runs beyond what's in `ControllerState`. The single
/// `run` loop (or repeated calls to [`Self::step`]) is the only caller
/// of the worker's `run_once`/`run_full_history`.
pub struct TransitController<'a> {
    store: &'a Store,
    worker_config: TransitWorkerConfig,
    state: RwLock<ControllerState>,
    manual_tx: SyncSender<()>,
    manual_rx: Mutex<Receiver<()>>,
    full_tx: SyncSender<()>,
    full_rx: Mutex<Receiver<()>>,
}

impl<'a> TransitController<'a> {
    pub fn new(store: &'a Store, worker_config: TransitWorkerConfig, enabled: bool) -> Self {
        let (manual_tx, manual_rx) = sync_channel(1);
        let (full_tx, full_rx) = sync_channel(1);
        Self {
            store,
            worker_config,
            state: RwLock::new(ControllerState {
                enabled,
                ..Default::default()
            }),
            manual_tx,
            manual_rx: Mutex::new(manual_rx),
            full_tx,
            full_rx: Mutex::new(full_rx),
        }
    }

    fn worker(&self) -> TransitWorker<'_> {
        TransitWorker::new(self.store, self.worker_config.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().unwrap().enabled
    }

    /// Flips the enabled flag; transitioning `false -> true` also enqueues
    /// an immediate manual run (picked up by the next `step`/tick).
    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = {
            let mut state = self.state.write().unwrap();
            let was = state.enabled;
            state.enabled = enabled;
            was
        };
        if enabled && !was_enabled {
            self.trigger_manual();
        }
    }

    /// Enqueues a manual run. Dropped silently if one is already pending
    /// (unit-capacity channel), coalescing rapid-fire requests.
    pub fn trigger_manual(&self) {
        let _ = self.manual_tx.try_send(());
    }

    /// Enqueues a full-history rebuild. Same coalescing behavior as
    /// [`Self::trigger_manual`].
    pub fn trigger_full_history(&self) {
        let _ = self.full_tx.try_send(());
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.state.read().unwrap();
        let healthy = state.last_run_error.is_none()
            && (!state.enabled
                || state
                    .last_run_at
                    .is_some_and(|t| now_unix() - t <= 2.0 * self.worker_config.interval_seconds));
        ControllerStatus {
            enabled: state.enabled,
            last_run_at: state.last_run_at,
            last_run_error: state.last_run_error.clone(),
            run_count: state.run_count,
            current_run: state.current_run.clone(),
            last_run: state.last_run.clone(),
            healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status().healthy
    }

    fn execute(&self, trigger: &str, kind: RunKind) {
        let started_at = now_unix();
        {
            let mut state = self.state.write().unwrap();
            state.current_run = Some(RunRecord {
                trigger: trigger.to_string(),
                started_at,
                finished_at: 0.0,
                duration_ms: 0.0,
                error: None,
            });
        }
        let worker = self.worker();
        let result = match kind {
            RunKind::Once => worker.run_once().map(|_| ()),
            RunKind::FullHistory => worker.run_full_history().map(|_| ()),
        };
        let finished_at = now_unix();
        let error = result.err().map(|e| e.to_string());
        if let Some(ref e) = error {
            log::warn!("transit controller run ({trigger}) failed: {e}");
        }
        let record = RunRecord {
            trigger: trigger.to_string(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at) * 1000.0,
            error: error.clone(),
        };
        let mut state = self.state.write().unwrap();
        state.current_run = None;
        state.last_run = Some(record);
        state.last_run_at = Some(finished_at);
        state.last_run_error = error;
        state.run_count += 1;
    }

    /// One iteration of the `Run` loop's body: waits up to `interval` for
    /// a manual trigger, ticks on timeout, then polls the full-history
    /// trigger without blocking. Public so tests (and callers wanting
    /// finer-grained control than [`Self::run`]) can drive it directly.
    pub fn step(&self, interval: Duration) -> Result<()> {
        {
            let manual_rx = self.manual_rx.lock().unwrap();
            match manual_rx.recv_timeout(interval) {
                Ok(()) => {
                    if self.is_enabled() {
                        drop(manual_rx);
                        self.execute("manual", RunKind::Once);
                    } else {
                        log::debug!("transit controller disabled; skipping manual trigger");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_enabled() {
                        drop(manual_rx);
                        self.execute("tick", RunKind::Once);
                    } else {
                        log::debug!("transit controller disabled; skipping tick");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Internal("manual trigger channel disconnected".into()));
                }
            }
        }
        {
            let full_rx = self.full_rx.lock().unwrap();
            let pending = full_rx.try_recv().is_ok();
            drop(full_rx);
            if pending {
                if self.is_enabled() {
                    self.execute("full-history", RunKind::FullHistory);
                } else {
                    log::debug!("transit controller disabled; skipping full-history trigger");
                }
            }
        }
        Ok(())
    }

    /// Runs an initial pass immediately if enabled, then loops calling
    /// [`Self::step`] at `worker_config.interval_seconds` until `stop` is
    /// set, at which point it returns [`Error::Cancelled`].
    pub fn run(&self, stop: &AtomicBool) -> Result<()> {
        if self.is_enabled() {
            self.execute("initial", RunKind::Once);
        }
        let interval = Duration::from_secs_f64(self.worker_config.interval_seconds.max(0.001));
        while !stop.load(Ordering::SeqCst) {
            self.step(interval)?;
        }
        Err(Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VelocityConfig;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn test_store() -> Store {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Store::open(VelocityConfig::new(format!(
            "file:controller_test_{n}?mode=memory&cache=shared"
        )))
        .unwrap()
    }

    fn config() -> TransitWorkerConfig {
        TransitWorkerConfig {
            interval_seconds: 0.01,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_controller_skips_tick() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), false);
        controller.step(Duration::from_millis(5)).unwrap();
        let status = controller.status();
        assert_eq!(status.run_count, 0);
    }

    #[test]
    fn enabling_from_disabled_queues_a_manual_run() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), false);
        controller.set_enabled(true);
        controller.step(Duration::from_secs(1)).unwrap();
        let status = controller.status();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.last_run.unwrap().trigger, "manual");
    }

    #[test]
    fn tick_runs_when_enabled_and_idle() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), true);
        controller.step(Duration::from_millis(20)).unwrap();
        let status = controller.status();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.last_run.unwrap().trigger, "tick");
    }

    #[test]
    fn manual_trigger_is_coalesced() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), true);
        controller.trigger_manual();
        controller.trigger_manual();
        controller.trigger_manual();
        controller.step(Duration::from_secs(1)).unwrap();
        let status = controller.status();
        assert_eq!(status.run_count, 1);
    }

    #[test]
    fn full_history_trigger_runs_full_history() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), true);
        controller.trigger_full_history();
        controller.step(Duration::from_secs(1)).unwrap();
        let status = controller.status();
        assert_eq!(status.last_run.unwrap().trigger, "full-history");
    }

    #[test]
    fn unhealthy_when_enabled_and_stale() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), true);
        {
            let mut state = controller.state.write().unwrap();
            state.last_run_at = Some(0.0);
        }
        assert!(!controller.is_healthy());
    }

    #[test]
    fn healthy_when_disabled_with_no_runs() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), false);
        assert!(controller.is_healthy());
    }

    #[test]
    fn run_returns_cancelled_when_stopped() {
        let store = test_store();
        let controller = TransitController::new(&store, config(), false);
        let stop = AtomicBool::new(true);
        let err = controller.run(&stop).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
