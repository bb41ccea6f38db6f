//! Periodic reconciliation scheduler.
//!
//! Drives the controller from three trigger sources: a poll interval,
//! source change events, and drift signals from the observer. Errors
//! from individual applications are logged and never stop the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::controller::{ReconcileController, ReconcileReason};
use crate::error::ConvergeError;
use crate::observer::ClusterObserver;
use crate::source::SourceChangeEvent;

/// Default poll interval between full reconciliation sweeps.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 180;

/// Periodic reconciliation scheduler.
pub struct SyncScheduler {
    controller: Arc<ReconcileController>,
    observer: Arc<ClusterObserver>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new(
        controller: Arc<ReconcileController>,
        observer: Arc<ClusterObserver>,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            observer,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the scheduling loop as a background task.
    /// Accepts a receiver for source change events from a watcher.
    pub fn start(
        &self,
        mut source_rx: broadcast::Receiver<SourceChangeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let observer = Arc::clone(&self.observer);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut drift_rx = observer.subscribe_drift();
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.tick().await; // skip immediate first tick

            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = interval_timer.tick() => {
                        sweep(Arc::clone(&controller), ReconcileReason::Tick).await;
                    }
                    Ok(event) = source_rx.recv() => {
                        log::info!("Source change at '{}', reconciling", event.path);
                        sweep(Arc::clone(&controller), ReconcileReason::RevisionChange).await;
                    }
                    Ok(signal) = drift_rx.recv() => {
                        log::info!(
                            "Drift on {} of application '{}'",
                            signal.key,
                            signal.application
                        );
                        match controller
                            .reconcile(&signal.application, ReconcileReason::Drift)
                            .await
                        {
                            Ok(_) => {}
                            // The application may have been deleted between
                            // signal and dispatch.
                            Err(ConvergeError::ApplicationNotFound(_)) => {}
                            Err(e) => log::error!(
                                "Drift reconcile of '{}' failed: {}",
                                signal.application,
                                e
                            ),
                        }
                    }
                }
            }
            log::info!("Sync scheduler stopped");
        })
    }

    /// Signals the scheduling loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Reconciles every automated application once. Failures are logged per
/// application so one broken app cannot starve the rest.
async fn sweep(controller: Arc<ReconcileController>, reason: ReconcileReason) {
    let names: Vec<String> = controller.automated_applications().await;
    for name in names {
        if let Err(e) = controller.reconcile(name.as_str(), reason).await {
            log::error!("Reconcile of '{}' failed: {}", name, e);
        }
    }
}
