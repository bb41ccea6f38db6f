//! In-memory cluster backing tests and demos.
//!
//! Behaves like the real contract: merge-patch applies, label-filtered
//! lists, watch events, namespace checks. Failure injection and apply
//! latency hooks exist so retry, fail-fast and fan-out behavior can be
//! exercised deterministically.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::diff::merge_patch;
use crate::error::{ConvergeError, Result};
use crate::resource::{LiveResource, Manifest, ResourceKey};

use super::{ClusterApi, ClusterEvent};

/// Kind of failure to inject on a resource's next applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Conflict,
    AdmissionRejected,
    Transient,
}

struct FailPlan {
    failure: InjectedFailure,
    remaining: u32,
}

/// In-memory implementation of [`ClusterApi`].
pub struct InMemoryCluster {
    resources: Mutex<HashMap<ResourceKey, LiveResource>>,
    namespaces: Mutex<HashSet<String>>,
    events: broadcast::Sender<ClusterEvent>,
    fail_plans: Mutex<HashMap<ResourceKey, FailPlan>>,
    fail_delete_plans: Mutex<HashMap<ResourceKey, FailPlan>>,
    apply_delay: Mutex<Duration>,
    apply_log: Mutex<Vec<ResourceKey>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryCluster {
    /// Creates an empty cluster with a `default` namespace.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let mut namespaces = HashSet::new();
        namespaces.insert("default".to_string());
        Self {
            resources: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(namespaces),
            events,
            fail_plans: Mutex::new(HashMap::new()),
            fail_delete_plans: Mutex::new(HashMap::new()),
            apply_delay: Mutex::new(Duration::ZERO),
            apply_log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Registers a namespace.
    pub fn create_namespace(&self, namespace: &str) {
        self.namespaces.lock().unwrap().insert(namespace.to_string());
    }

    /// Makes the next `times` applies of `key` fail with the given error.
    pub fn fail_next_applies(&self, key: ResourceKey, failure: InjectedFailure, times: u32) {
        self.fail_plans.lock().unwrap().insert(
            key,
            FailPlan {
                failure,
                remaining: times,
            },
        );
    }

    /// Makes the next `times` deletes of `key` fail with the given error.
    pub fn fail_next_deletes(&self, key: ResourceKey, failure: InjectedFailure, times: u32) {
        self.fail_delete_plans.lock().unwrap().insert(
            key,
            FailPlan {
                failure,
                remaining: times,
            },
        );
    }

    /// Adds artificial latency to every apply.
    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock().unwrap() = delay;
    }

    /// Highest number of applies observed in flight simultaneously.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    /// Keys applied so far, in completion order.
    pub fn apply_log(&self) -> Vec<ResourceKey> {
        self.apply_log.lock().unwrap().clone()
    }

    /// Synchronous resource read for assertions.
    pub fn resource(&self, key: &ResourceKey) -> Option<LiveResource> {
        self.resources.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites a resource's status document, simulating the cluster's
    /// own controllers reporting readiness.
    pub fn set_status(&self, key: &ResourceKey, status: Value) {
        let mut resources = self.resources.lock().unwrap();
        if let Some(live) = resources.get_mut(key) {
            live.status = status;
            let _ = self.events.send(ClusterEvent::Applied {
                resource: live.clone(),
            });
        }
    }

    /// Merge-patches a resource's spec without going through the engine,
    /// simulating manual drift: the last-applied annotation is untouched.
    pub fn patch_spec(&self, key: &ResourceKey, patch: Value) {
        let mut resources = self.resources.lock().unwrap();
        if let Some(live) = resources.get_mut(key) {
            merge_patch(&mut live.manifest.spec, &patch);
            let _ = self.events.send(ClusterEvent::Applied {
                resource: live.clone(),
            });
        }
    }

}

fn take_injected_failure(
    plans: &Mutex<HashMap<ResourceKey, FailPlan>>,
    key: &ResourceKey,
) -> Option<ConvergeError> {
    let mut plans = plans.lock().unwrap();
    let plan = plans.get_mut(key)?;
    if plan.remaining == 0 {
        return None;
    }
    plan.remaining -= 1;
    let error = match plan.failure {
        InjectedFailure::Conflict => ConvergeError::Conflict {
            key: key.to_string(),
            message: "the object has been modified".to_string(),
        },
        InjectedFailure::AdmissionRejected => ConvergeError::AdmissionRejected {
            key: key.to_string(),
            message: "admission webhook denied the request".to_string(),
        },
        InjectedFailure::Transient => {
            ConvergeError::TransientApi("request timed out".to_string())
        }
    };
    Some(error)
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list(&self, label: Option<(&str, &str)>) -> Result<Vec<LiveResource>> {
        let resources = self.resources.lock().unwrap();
        let mut matched: Vec<LiveResource> = resources
            .values()
            .filter(|live| match label {
                Some((key, value)) => {
                    live.manifest.metadata.labels.get(key).map(String::as_str) == Some(value)
                }
                None => true,
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(matched)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<LiveResource>> {
        Ok(self.resources.lock().unwrap().get(key).cloned())
    }

    async fn apply(&self, manifest: Manifest) -> Result<LiveResource> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::AcqRel);

        let delay = *self.apply_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = self.apply_inner(manifest);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        if let Some(error) = take_injected_failure(&self.fail_delete_plans, key) {
            return Err(error);
        }

        let removed = self.resources.lock().unwrap().remove(key);
        if removed.is_some() {
            let _ = self.events.send(ClusterEvent::Deleted { key: key.clone() });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

impl InMemoryCluster {
    fn apply_inner(&self, manifest: Manifest) -> Result<LiveResource> {
        let key = manifest.key();

        if let Some(error) = take_injected_failure(&self.fail_plans, &key) {
            return Err(error);
        }

        if !self
            .namespaces
            .lock()
            .unwrap()
            .contains(&manifest.metadata.namespace)
        {
            return Err(ConvergeError::Config(format!(
                "destination namespace '{}' not found",
                manifest.metadata.namespace
            )));
        }

        let mut resources = self.resources.lock().unwrap();
        let live = match resources.get_mut(&key) {
            Some(existing) => {
                merge_patch(&mut existing.manifest.spec, &manifest.spec);
                existing
                    .manifest
                    .metadata
                    .labels
                    .extend(manifest.metadata.labels);
                existing
                    .manifest
                    .metadata
                    .annotations
                    .extend(manifest.metadata.annotations);
                existing.clone()
            }
            None => {
                let live = LiveResource {
                    manifest,
                    status: json!({}),
                };
                resources.insert(key.clone(), live.clone());
                live
            }
        };
        drop(resources);

        self.apply_log.lock().unwrap().push(key);
        let _ = self.events.send(ClusterEvent::Applied {
            resource: live.clone(),
        });
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(name: &str, spec: Value) -> Manifest {
        Manifest::new("Deployment", "default", name, spec)
    }

    #[tokio::test]
    async fn test_apply_creates_then_merges() {
        let cluster = InMemoryCluster::new();
        cluster
            .apply(manifest("web", json!({"replicas": 2, "image": "nginx"})))
            .await
            .unwrap();

        // Merge-patch: untouched fields survive, nulls delete.
        let live = cluster
            .apply(manifest("web", json!({"replicas": 3, "image": null})))
            .await
            .unwrap();
        assert_eq!(live.manifest.spec, json!({"replicas": 3}));
    }

    #[tokio::test]
    async fn test_apply_unknown_namespace_is_config_error() {
        let cluster = InMemoryCluster::new();
        let result = cluster
            .apply(Manifest::new("Deployment", "staging", "web", json!({})))
            .await;
        assert!(matches!(result, Err(ConvergeError::Config(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let cluster = InMemoryCluster::new();
        let mut owned = manifest("web", json!({}));
        owned.set_application("nginx");
        cluster.apply(owned).await.unwrap();
        cluster.apply(manifest("other", json!({}))).await.unwrap();

        let all = cluster.list(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = cluster
            .list(Some(("converge.io/application", "nginx")))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].manifest.metadata.name, "web");
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let cluster = InMemoryCluster::new();
        let key = ResourceKey::new("Deployment", "default", "web");
        cluster.fail_next_applies(key.clone(), InjectedFailure::Transient, 1);

        let first = cluster.apply(manifest("web", json!({}))).await;
        assert!(matches!(first, Err(ConvergeError::TransientApi(_))));

        let second = cluster.apply(manifest("web", json!({}))).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_injected_delete_failure_is_consumed() {
        let cluster = InMemoryCluster::new();
        cluster.apply(manifest("web", json!({}))).await.unwrap();

        let key = ResourceKey::new("Deployment", "default", "web");
        cluster.fail_next_deletes(key.clone(), InjectedFailure::Transient, 1);

        let first = cluster.delete(&key).await;
        assert!(matches!(first, Err(ConvergeError::TransientApi(_))));
        assert!(cluster.resource(&key).is_some());

        cluster.delete(&key).await.unwrap();
        assert!(cluster.resource(&key).is_none());
    }

    #[tokio::test]
    async fn test_watch_receives_events() {
        let cluster = InMemoryCluster::new();
        let mut rx = cluster.watch();

        cluster.apply(manifest("web", json!({}))).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ClusterEvent::Applied { .. }));

        let key = ResourceKey::new("Deployment", "default", "web");
        cluster.delete(&key).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ClusterEvent::Deleted { .. }));
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let cluster = InMemoryCluster::new();
        let key = ResourceKey::new("Deployment", "default", "ghost");
        assert!(cluster.delete(&key).await.is_ok());
    }
}
