//! Live state observer: watch events in, snapshot cache out.
//!
//! Maintains a cache of resources owned by managed applications by
//! consuming the cluster's watch stream. On a watch gap (lag, closed
//! stream, list failure) the cache is marked stale and rebuilt with a
//! full re-list after exponential backoff; resource versions are not
//! trusted across a gap. The observer never writes to the cluster.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::cluster::{ClusterApi, ClusterEvent};
use crate::diff::three_way_patch;
use crate::resource::{LiveResource, ResourceKey, APPLICATION_LABEL};

/// Base delay before retrying a broken watch connection.
const WATCH_RETRY_BASE_DELAY_MS: u64 = 500;
/// Upper bound on the watch retry backoff.
const WATCH_RETRY_MAX_DELAY_MS: u64 = 30_000;
/// How long to block on the event stream before re-checking shutdown.
const EVENT_POLL_TIMEOUT_MS: u64 = 200;

/// Signal that a live resource diverged from its last-applied state
/// outside of a sync.
#[derive(Debug, Clone)]
pub struct DriftSignal {
    pub application: String,
    pub key: ResourceKey,
}

/// Point-in-time view of the resources owned by one application.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub resources: HashMap<ResourceKey, LiveResource>,
    /// When the underlying cache was last refreshed from the cluster.
    pub observed_at: DateTime<Utc>,
    /// True when the watch connection is down and the data may lag.
    pub stale: bool,
}

impl LiveSnapshot {
    pub fn empty() -> Self {
        Self::fresh(HashMap::new())
    }

    pub fn fresh(resources: HashMap<ResourceKey, LiveResource>) -> Self {
        Self {
            resources,
            observed_at: Utc::now(),
            stale: false,
        }
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }
}

struct SnapshotCache {
    resources: HashMap<ResourceKey, LiveResource>,
    observed_at: DateTime<Utc>,
    stale: bool,
}

/// Watches one destination cluster and caches owned resources.
pub struct ClusterObserver {
    cluster: Arc<dyn ClusterApi>,
    cache: RwLock<SnapshotCache>,
    drift_sender: broadcast::Sender<DriftSignal>,
    shutdown: Arc<AtomicBool>,
}

impl ClusterObserver {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        let (drift_sender, _) = broadcast::channel(64);
        Self {
            cluster,
            cache: RwLock::new(SnapshotCache {
                resources: HashMap::new(),
                observed_at: Utc::now(),
                stale: true,
            }),
            drift_sender,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a receiver for drift signals.
    pub fn subscribe_drift(&self) -> broadcast::Receiver<DriftSignal> {
        self.drift_sender.subscribe()
    }

    /// Non-blocking read of the cached snapshot for one application.
    /// Never fails; the snapshot carries its timestamp and staleness.
    pub fn get_snapshot(&self, application: &str) -> LiveSnapshot {
        let cache = self.cache.read().unwrap();
        LiveSnapshot {
            resources: filter_by_application(&cache.resources, application),
            observed_at: cache.observed_at,
            stale: cache.stale,
        }
    }

    /// Re-lists one application's owned resources and refreshes the cache.
    ///
    /// Used at the start of a reconciliation pass so the diff runs against
    /// current state. Falls back to the cached (stale-flagged) snapshot
    /// when the list fails, so a pass can still report status.
    pub async fn refresh(&self, application: &str) -> LiveSnapshot {
        match self
            .cluster
            .list(Some((APPLICATION_LABEL, application)))
            .await
        {
            Ok(listed) => {
                let mut cache = self.cache.write().unwrap();
                cache
                    .resources
                    .retain(|_, live| live.application() != Some(application));
                for live in listed {
                    cache.resources.insert(live.key(), live);
                }
                cache.observed_at = Utc::now();
                LiveSnapshot {
                    resources: filter_by_application(&cache.resources, application),
                    observed_at: cache.observed_at,
                    stale: false,
                }
            }
            Err(e) => {
                log::warn!(
                    "Re-list for application '{}' failed, using cached snapshot: {}",
                    application,
                    e
                );
                let mut snapshot = self.get_snapshot(application);
                snapshot.stale = true;
                snapshot
            }
        }
    }

    /// Starts the watch loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let observer = Arc::clone(self);
        tokio::spawn(async move { observer.run().await })
    }

    /// Signals the watch loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    async fn run(&self) {
        let mut backoff = Duration::from_millis(WATCH_RETRY_BASE_DELAY_MS);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Subscribe before listing so no event falls into the gap.
            let mut events = self.cluster.watch();

            match self.relist_all().await {
                Ok(()) => {
                    backoff = Duration::from_millis(WATCH_RETRY_BASE_DELAY_MS);
                }
                Err(e) => {
                    log::warn!("Full re-list failed, retrying in {:?}: {}", backoff, e);
                    self.mark_stale();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(WATCH_RETRY_MAX_DELAY_MS));
                    continue;
                }
            }

            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }

                let recv = tokio::time::timeout(
                    Duration::from_millis(EVENT_POLL_TIMEOUT_MS),
                    events.recv(),
                )
                .await;

                match recv {
                    Err(_) => continue,
                    Ok(Ok(event)) => self.handle_event(event),
                    Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                        log::warn!("Watch stream lagged by {} events, re-listing", missed);
                        break;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        log::warn!("Watch stream closed");
                        self.mark_stale();
                        return;
                    }
                }
            }

            self.mark_stale();
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(WATCH_RETRY_MAX_DELAY_MS));
        }
    }

    async fn relist_all(&self) -> crate::error::Result<()> {
        let listed = self.cluster.list(None).await?;
        let mut resources = HashMap::new();
        for live in listed {
            if live.application().is_some() {
                resources.insert(live.key(), live);
            }
        }

        let mut cache = self.cache.write().unwrap();
        cache.resources = resources;
        cache.observed_at = Utc::now();
        cache.stale = false;
        Ok(())
    }

    fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Applied { resource } => {
                let key = resource.key();
                match resource.application().map(str::to_string) {
                    Some(application) => {
                        self.detect_drift(&application, &resource);
                        let mut cache = self.cache.write().unwrap();
                        cache.resources.insert(key, resource);
                        cache.observed_at = Utc::now();
                    }
                    None => {
                        // Ownership label removed; stop tracking.
                        let mut cache = self.cache.write().unwrap();
                        cache.resources.remove(&key);
                    }
                }
            }
            ClusterEvent::Deleted { key } => {
                let mut cache = self.cache.write().unwrap();
                cache.resources.remove(&key);
                cache.observed_at = Utc::now();
            }
        }
    }

    fn detect_drift(&self, application: &str, resource: &LiveResource) {
        let Some(last_applied) = resource.last_applied() else {
            return;
        };
        // Only managed fields count as drift; additions by other
        // controllers are left alone, like the diff engine leaves them.
        let divergence = three_way_patch(&last_applied, Some(&last_applied), &resource.manifest.spec);
        if divergence.is_some() {
            log::info!(
                "Drift detected on {} (application '{}')",
                resource.key(),
                application
            );
            let _ = self.drift_sender.send(DriftSignal {
                application: application.to_string(),
                key: resource.key(),
            });
        }
    }

    fn mark_stale(&self) {
        self.cache.write().unwrap().stale = true;
    }
}

fn filter_by_application(
    resources: &HashMap<ResourceKey, LiveResource>,
    application: &str,
) -> HashMap<ResourceKey, LiveResource> {
    resources
        .iter()
        .filter(|(_, live)| live.application() == Some(application))
        .map(|(key, live)| (key.clone(), live.clone()))
        .collect()
}
