//! Supervised reconciliation worker.
//!
//! Runs `Engine::reconcile_all` on a fixed interval inside a tokio task. The
//! sweep itself is blocking ledger work, so each pass goes through
//! `spawn_blocking`. Lifecycle is explicit: `start`, `stop`, `health`.

use crate::engine::{Engine, SweepReport};
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker is not running")]
    NotRunning,

    #[error("no tokio runtime available to run the worker")]
    NoRuntime,

    #[error("worker task failed: {0}")]
    Join(String),

    #[error("reconciliation sweep failed: {0}")]
    Sweep(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub running: bool,
    pub runs: u64,
    pub last_run_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub open_issues: usize,
}

#[derive(Debug, Default)]
struct PassStats {
    runs: u64,
    last_run_at: Option<Timestamp>,
    last_error: Option<String>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ReconciliationWorker {
    engine: Arc<Engine>,
    interval: Duration,
    stats: Arc<Mutex<PassStats>>,
    running: Mutex<Option<Running>>,
}

impl ReconciliationWorker {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            stats: Arc::new(Mutex::new(PassStats::default())),
            running: Mutex::new(None),
        }
    }

    /// Uses the interval from the engine's reconciliation config.
    pub fn from_config(engine: Arc<Engine>) -> Self {
        let interval = engine.config().reconciliation.interval();
        Self::new(engine, interval)
    }

    /// Spawns the sweep loop on the current tokio runtime. The first pass runs immediately.
    pub fn start(&self) -> Result<(), WorkerError> {
        let runtime = Handle::try_current().map_err(|_| WorkerError::NoRuntime)?;
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(WorkerError::AlreadyRunning);
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(&self.engine);
        let stats = Arc::clone(&self.stats);
        // tokio panics on a zero period
        let period = self.interval.max(Duration::from_millis(1));

        let handle = runtime.spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "reconciliation worker started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = run_pass(&engine, &stats).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciliation worker stopped");
        });

        *running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Signals the loop and waits for the pass in progress, if any, to finish.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let running = self.running.lock().take().ok_or(WorkerError::NotRunning)?;
        let _ = running.shutdown.send(true);
        running
            .handle
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))
    }

    /// One sweep outside the schedule. Counts towards the health stats.
    pub async fn run_once(&self) -> Result<SweepReport, WorkerError> {
        run_pass(&self.engine, &self.stats).await
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn health(&self) -> WorkerHealth {
        let stats = self.stats.lock();
        WorkerHealth {
            running: self.is_running(),
            runs: stats.runs,
            last_run_at: stats.last_run_at,
            last_error: stats.last_error.clone(),
            open_issues: self.engine.open_issues().len(),
        }
    }
}

impl Drop for ReconciliationWorker {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn run_pass(engine: &Arc<Engine>, stats: &Mutex<PassStats>) -> Result<SweepReport, WorkerError> {
    let sweeper = Arc::clone(engine);
    let outcome = tokio::task::spawn_blocking(move || sweeper.reconcile_all()).await;

    let mut stats = stats.lock();
    stats.runs += 1;
    stats.last_run_at = Some(engine.now());
    match outcome {
        Ok(Ok(report)) => {
            stats.last_error = None;
            Ok(report)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "reconciliation sweep failed");
            stats.last_error = Some(e.to_string());
            Err(WorkerError::Sweep(e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "reconciliation sweep panicked");
            stats.last_error = Some(e.to_string());
            Err(WorkerError::Join(e.to_string()))
        }
    }
}
