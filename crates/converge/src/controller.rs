//! Reconciliation controller: one serialized diff-then-apply loop per
//! application.
//!
//! Inspired by ArgoCD's application controller. Guarantees at most one
//! in-flight pass per application; triggers arriving mid-pass coalesce
//! into a single follow-up pass. Fetch and render errors surface as
//! status, never as a crashed loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;

use crate::app::{Application, ApplicationStatus, HealthStatus, SyncPolicy, SyncStatus};
use crate::cluster::ClusterApi;
use crate::diff::diff;
use crate::error::{ConvergeError, Result};
use crate::observer::{ClusterObserver, LiveSnapshot};
use crate::planner::{plan, CancelFlag, PlannerConfig, SyncPlanner, SyncResult};
use crate::resource::{ManifestSet, ResourceKey, APPLICATION_LABEL};
use crate::source::ManifestSource;

/// Why a reconciliation pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    /// Explicit external trigger.
    Manual,
    /// Periodic poll tick.
    Tick,
    /// New revision detected in the source.
    RevisionChange,
    /// Live drift signal from the observer.
    Drift,
}

impl ReconcileReason {
    fn priority(self) -> u8 {
        match self {
            ReconcileReason::Manual => 3,
            ReconcileReason::RevisionChange => 2,
            ReconcileReason::Drift => 1,
            ReconcileReason::Tick => 0,
        }
    }
}

impl std::fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileReason::Manual => write!(f, "manual trigger"),
            ReconcileReason::Tick => write!(f, "poll tick"),
            ReconcileReason::RevisionChange => write!(f, "revision change"),
            ReconcileReason::Drift => write!(f, "drift signal"),
        }
    }
}

/// Whether a pass executes its plan or only reports the diff.
///
/// Manual triggers always execute. Automated passes execute when the
/// revision moved since the last successful sync, or when selfHeal is
/// on and live state diverged. Divergence at an unchanged revision with
/// selfHeal off is reported as OutOfSync and left alone.
fn should_execute(
    reason: ReconcileReason,
    policy: &SyncPolicy,
    revision_changed: bool,
    out_of_sync: usize,
) -> bool {
    match reason {
        ReconcileReason::Manual => true,
        ReconcileReason::Tick | ReconcileReason::RevisionChange | ReconcileReason::Drift => {
            policy.automated && (revision_changed || (policy.self_heal && out_of_sync > 0))
        }
    }
}

/// Application plus its current status, as served to control surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub application: Application,
    pub status: ApplicationStatus,
}

struct AppHandle {
    application: RwLock<Application>,
    status: RwLock<ApplicationStatus>,
    /// Serializes reconciliation passes for this application.
    reconcile_lock: Mutex<()>,
    /// Coalesced follow-up trigger; bounded queue depth of one.
    pending: std::sync::Mutex<Option<ReconcileReason>>,
    /// Revision of the last sync that executed and succeeded.
    synced_revision: std::sync::Mutex<Option<String>>,
    cancel: CancelFlag,
}

impl AppHandle {
    fn new(application: Application) -> Self {
        Self {
            application: RwLock::new(application),
            status: RwLock::new(ApplicationStatus::default()),
            reconcile_lock: Mutex::new(()),
            pending: std::sync::Mutex::new(None),
            synced_revision: std::sync::Mutex::new(None),
            cancel: CancelFlag::new(),
        }
    }

    fn set_pending(&self, reason: ReconcileReason) {
        let mut pending = self.pending.lock().unwrap();
        *pending = Some(match *pending {
            Some(existing) if existing.priority() >= reason.priority() => existing,
            _ => reason,
        });
    }

    fn take_pending(&self) -> Option<ReconcileReason> {
        self.pending.lock().unwrap().take()
    }

    fn has_pending(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }

    fn synced_revision(&self) -> Option<String> {
        self.synced_revision.lock().unwrap().clone()
    }

    fn record_synced_revision(&self, revision: &str) {
        *self.synced_revision.lock().unwrap() = Some(revision.to_string());
    }
}

/// The top-level reconciliation controller.
pub struct ReconcileController {
    source: Arc<dyn ManifestSource>,
    cluster: Arc<dyn ClusterApi>,
    observer: Arc<ClusterObserver>,
    planner: SyncPlanner,
    apps: RwLock<HashMap<String, Arc<AppHandle>>>,
    /// Resource ownership claims; the same key claimed by two
    /// applications is a misconfiguration, rejected loudly.
    claims: std::sync::Mutex<HashMap<ResourceKey, String>>,
}

impl ReconcileController {
    pub fn new(
        source: Arc<dyn ManifestSource>,
        cluster: Arc<dyn ClusterApi>,
        observer: Arc<ClusterObserver>,
        planner_config: PlannerConfig,
    ) -> Self {
        let planner = SyncPlanner::new(Arc::clone(&cluster), planner_config);
        Self {
            source,
            cluster,
            observer,
            planner,
            apps: RwLock::new(HashMap::new()),
            claims: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new application. Name must be unique.
    pub async fn create_application(&self, application: Application) -> Result<()> {
        let name = application.name().to_string();
        if name.is_empty() {
            return Err(ConvergeError::Config(
                "application name must not be empty".to_string(),
            ));
        }
        if application.spec.destination.namespace.is_empty() {
            return Err(ConvergeError::Config(format!(
                "application '{name}' has no destination namespace"
            )));
        }

        let mut apps = self.apps.write().await;
        if apps.contains_key(&name) {
            return Err(ConvergeError::ApplicationExists(name));
        }
        log::info!("Registered application '{}'", name);
        apps.insert(name, Arc::new(AppHandle::new(application)));
        Ok(())
    }

    /// Removes an application. With `prune`, owned live resources are
    /// deleted; otherwise they are left behind untracked.
    ///
    /// Prune failures do not stop the sweep: every owned resource is
    /// attempted and the failures are aggregated into the returned error.
    pub async fn delete_application(&self, name: &str, prune: bool) -> Result<()> {
        let handle = {
            let mut apps = self.apps.write().await;
            apps.remove(name)
                .ok_or_else(|| ConvergeError::ApplicationNotFound(name.to_string()))?
        };

        // Cancel the in-flight pass (takes effect at a wave boundary)
        // and wait for it to wind down before touching its resources.
        handle.cancel.cancel();
        let _guard = handle.reconcile_lock.lock().await;

        self.claims
            .lock()
            .unwrap()
            .retain(|_, owner| owner != name);

        if prune {
            let owned = self
                .cluster
                .list(Some((APPLICATION_LABEL, name)))
                .await?;
            let mut failures = Vec::new();
            for live in owned {
                let key = live.key();
                match self.cluster.delete(&key).await {
                    Ok(()) => {
                        log::info!("Pruned {} of deleted application '{}'", key, name);
                    }
                    Err(e) => {
                        log::error!(
                            "Failed to prune {} of deleted application '{}': {}",
                            key,
                            name,
                            e
                        );
                        failures.push(format!("{key}: {e}"));
                    }
                }
            }
            if !failures.is_empty() {
                return Err(ConvergeError::Config(format!(
                    "application '{}' deleted, but {} owned resource(s) could not be pruned: {}",
                    name,
                    failures.len(),
                    failures.join("; ")
                )));
            }
        }

        log::info!("Deleted application '{}' (prune: {})", name, prune);
        Ok(())
    }

    /// Returns an application's spec and current status.
    pub async fn get_application(&self, name: &str) -> Result<ApplicationState> {
        let handle = self.handle(name).await?;
        let application = handle.application.read().await.clone();
        let status = handle.status.read().await.clone();
        Ok(ApplicationState {
            application,
            status,
        })
    }

    /// Lists all registered applications with their statuses.
    pub async fn list_applications(&self) -> Vec<ApplicationState> {
        let handles: Vec<Arc<AppHandle>> = self.apps.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(handles.len());
        for handle in handles {
            let application = handle.application.read().await.clone();
            let status = handle.status.read().await.clone();
            states.push(ApplicationState {
                application,
                status,
            });
        }
        states.sort_by(|a, b| a.application.metadata.name.cmp(&b.application.metadata.name));
        states
    }

    /// Explicit sync trigger; executes regardless of the automated flag.
    pub async fn trigger_sync(&self, name: &str) -> Result<SyncStatus> {
        self.reconcile(name, ReconcileReason::Manual).await
    }

    /// Runs (or coalesces) a reconciliation pass for one application.
    ///
    /// At most one pass is in flight per application; a trigger arriving
    /// mid-pass is recorded and folded into a single follow-up pass. The
    /// lock holder re-checks the pending slot after releasing the lock,
    /// so a trigger recorded while the holder was winding down is served
    /// instead of sitting until the next tick.
    pub async fn reconcile(&self, name: &str, reason: ReconcileReason) -> Result<SyncStatus> {
        let handle = self.handle(name).await?;
        let mut pending = Some(reason);
        let mut sync: Option<SyncStatus> = None;

        loop {
            let guard = match handle.reconcile_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    if let Some(reason) = pending.take() {
                        log::info!(
                            "Reconcile of '{}' ({}) coalesced into in-flight pass",
                            name,
                            reason
                        );
                        handle.set_pending(reason);
                        // The holder may have finished its own pending
                        // check before the trigger was recorded; one more
                        // acquisition attempt guarantees it is served.
                        continue;
                    }
                    break;
                }
            };

            let mut current = pending.take().or_else(|| handle.take_pending());
            while let Some(reason) = current {
                if handle.cancel.is_cancelled() {
                    break;
                }
                sync = Some(self.run_pass(name, &handle, reason).await);
                current = handle.take_pending();
            }
            drop(guard);

            // A trigger may have slipped into the pending slot between
            // the last take_pending and the lock release; go back for it.
            if handle.cancel.is_cancelled() || !handle.has_pending() {
                break;
            }
        }

        match sync {
            Some(sync) => Ok(sync),
            None => {
                let status = handle.status.read().await;
                let sync = status.sync;
                drop(status);
                Ok(sync)
            }
        }
    }

    /// Names of applications with automated sync, for the scheduler.
    pub async fn automated_applications(&self) -> Vec<String> {
        let handles: Vec<(String, Arc<AppHandle>)> = {
            let apps = self.apps.read().await;
            apps.iter()
                .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
                .collect()
        };

        let mut names = Vec::new();
        for (name, handle) in handles {
            let automated = {
                let application = handle.application.read().await;
                application.spec.sync_policy.automated
            };
            if automated {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    async fn handle(&self, name: &str) -> Result<Arc<AppHandle>> {
        let apps = self.apps.read().await;
        let handle = apps.get(name).cloned();
        drop(apps);
        handle.ok_or_else(|| ConvergeError::ApplicationNotFound(name.to_string()))
    }

    async fn run_pass(
        &self,
        name: &str,
        handle: &Arc<AppHandle>,
        reason: ReconcileReason,
    ) -> SyncStatus {
        log::info!("Reconciling '{}' ({})", name, reason);
        {
            let mut status = handle.status.write().await;
            status.sync = SyncStatus::Syncing;
            status.updated_at = Utc::now();
        }

        let spec = {
            let application = handle.application.read().await;
            application.spec.clone()
        };

        let fetched = self
            .source
            .fetch(
                &spec.repo_url,
                &spec.target_revision,
                &spec.path,
                &spec.overrides,
            )
            .await;
        let desired = match fetched {
            Ok(set) => set,
            Err(e) => {
                log::warn!("Fetch for '{}' failed: {}", name, e);
                return self.fail_pass(handle, e.to_string()).await;
            }
        };

        let desired = match normalize_namespaces(desired, &spec.destination.namespace) {
            Ok(set) => set,
            Err(e) => return self.fail_pass(handle, e.to_string()).await,
        };

        if let Err(e) = self.claim_resources(name, &desired) {
            log::error!("Claim check for '{}' failed: {}", name, e);
            return self.fail_pass(handle, e.to_string()).await;
        }

        let snapshot = self.observer.refresh(name).await;
        let operations = diff(&desired, &snapshot, &spec.sync_policy);
        let out_of_sync = operations.iter().filter(|op| op.is_actionable()).count();
        let revision = desired.revision.clone();
        let revision_changed = handle.synced_revision().as_deref() != Some(revision.as_str());

        if !should_execute(reason, &spec.sync_policy, revision_changed, out_of_sync) {
            let sync = if out_of_sync == 0 {
                SyncStatus::Synced
            } else {
                SyncStatus::OutOfSync
            };
            let health = aggregate_health(&snapshot);
            log::info!(
                "'{}' observed {} resource(s) out of sync, not executing ({}, policy)",
                name,
                out_of_sync,
                reason
            );
            {
                let mut status = handle.status.write().await;
                status.sync = sync;
                status.health = health;
                status.revision = Some(revision);
                status.message = None;
                status.updated_at = Utc::now();
            }
            return sync;
        }

        let execution_plan = plan(operations, &spec.sync_policy);
        let result = self
            .planner
            .execute(name, &desired.revision, &execution_plan, &handle.cancel)
            .await;
        if result.succeeded() {
            handle.record_synced_revision(&revision);
        }

        let (sync, health, message) = self.conclude(name, &desired, &result).await;
        {
            let mut status = handle.status.write().await;
            status.sync = sync;
            status.health = health;
            status.revision = Some(revision);
            status.message = message;
            status.last_sync = Some(result);
            status.updated_at = Utc::now();
        }
        sync
    }

    /// Records a pass that failed before a plan could be executed.
    async fn fail_pass(&self, handle: &Arc<AppHandle>, message: String) -> SyncStatus {
        let mut status = handle.status.write().await;
        status.sync = SyncStatus::Unknown;
        status.message = Some(message);
        status.updated_at = Utc::now();
        drop(status);
        SyncStatus::Unknown
    }

    /// Derives the resting status from an executed sync result.
    async fn conclude(
        &self,
        name: &str,
        desired: &ManifestSet,
        result: &SyncResult,
    ) -> (SyncStatus, HealthStatus, Option<String>) {
        if result.cancelled {
            return (
                SyncStatus::OutOfSync,
                HealthStatus::Unknown,
                Some("sync cancelled at wave boundary".to_string()),
            );
        }
        if !result.succeeded() {
            let message = result
                .failure_message()
                .unwrap_or("sync failed")
                .to_string();
            return (SyncStatus::OutOfSync, HealthStatus::Unknown, Some(message));
        }

        self.release_stale_claims(name, desired);

        let post = self.observer.refresh(name).await;
        let health = aggregate_health(&post);
        let sync = if health == HealthStatus::Degraded {
            SyncStatus::Degraded
        } else {
            SyncStatus::Synced
        };
        (sync, health, None)
    }

    fn claim_resources(&self, name: &str, desired: &ManifestSet) -> Result<()> {
        let mut claims = self.claims.lock().unwrap();
        for manifest in &desired.manifests {
            let key = manifest.key();
            if let Some(owner) = claims.get(&key) {
                if owner != name {
                    return Err(ConvergeError::OwnershipConflict {
                        key: key.to_string(),
                        owner: owner.clone(),
                    });
                }
            }
        }
        for manifest in &desired.manifests {
            claims.insert(manifest.key(), name.to_string());
        }
        Ok(())
    }

    fn release_stale_claims(&self, name: &str, desired: &ManifestSet) {
        let keys: HashSet<ResourceKey> = desired.manifests.iter().map(|m| m.key()).collect();
        self.claims
            .lock()
            .unwrap()
            .retain(|key, owner| owner != name || keys.contains(key));
    }
}

/// Manifests without a namespace inherit the destination namespace.
fn normalize_namespaces(set: ManifestSet, namespace: &str) -> Result<ManifestSet> {
    let revision = set.revision.clone();
    let manifests = set
        .manifests
        .into_iter()
        .map(|mut manifest| {
            if manifest.metadata.namespace.is_empty() {
                manifest.metadata.namespace = namespace.to_string();
            }
            manifest
        })
        .collect();
    ManifestSet::new(revision, manifests)
}

fn aggregate_health(snapshot: &LiveSnapshot) -> HealthStatus {
    if snapshot
        .resources
        .values()
        .any(|live| !live.is_healthy())
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{ApplicationSpec, Destination, SyncPolicy};
    use crate::cluster::InMemoryCluster;
    use crate::source::DirSource;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const REPO: &str = "https://example.com/deploy.git";

    fn write_deployment(dir: &Path, name: &str, replicas: i64) {
        let yaml = format!(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
spec:
  replicas: {replicas}
"#
        );
        fs::write(dir.join(format!("{name}.yaml")), yaml).unwrap();
    }

    fn test_app(name: &str, policy: SyncPolicy) -> Application {
        Application::new(
            name,
            ApplicationSpec {
                repo_url: REPO.to_string(),
                target_revision: "HEAD".to_string(),
                path: String::new(),
                destination: Destination {
                    cluster: "in-cluster".to_string(),
                    namespace: "default".to_string(),
                },
                overrides: Default::default(),
                sync_policy: policy,
            },
        )
    }

    fn setup(dir: &TempDir) -> (Arc<ReconcileController>, Arc<InMemoryCluster>) {
        let cluster = Arc::new(InMemoryCluster::new());
        let cluster_api: Arc<dyn ClusterApi> = cluster.clone();
        let observer = Arc::new(ClusterObserver::new(cluster_api.clone()));
        let source: Arc<dyn ManifestSource> = Arc::new(DirSource::new(REPO, dir.path()));
        let controller = Arc::new(ReconcileController::new(
            source,
            cluster_api,
            observer,
            PlannerConfig {
                retry_base_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        ));
        (controller, cluster)
    }

    #[tokio::test]
    async fn test_create_application_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir);

        controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await
            .unwrap();
        let result = controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await;
        assert!(matches!(result, Err(ConvergeError::ApplicationExists(_))));
    }

    #[tokio::test]
    async fn test_create_application_requires_namespace() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir);

        let mut app = test_app("nginx", SyncPolicy::default());
        app.spec.destination.namespace = String::new();
        let result = controller.create_application(app).await;
        assert!(matches!(result, Err(ConvergeError::Config(_))));
    }

    #[tokio::test]
    async fn test_manual_trigger_syncs_manual_policy_app() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await
            .unwrap();

        let sync = controller.trigger_sync("nginx").await.unwrap();
        assert_eq!(sync, SyncStatus::Synced);
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_reports_but_does_not_execute_for_manual_policy() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await
            .unwrap();

        let sync = controller
            .reconcile("nginx", ReconcileReason::Tick)
            .await
            .unwrap();
        assert_eq!(sync, SyncStatus::OutOfSync);
        assert!(cluster.is_empty());
    }

    #[tokio::test]
    async fn test_tick_executes_for_automated_policy() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        let policy = SyncPolicy {
            automated: true,
            ..Default::default()
        };
        controller
            .create_application(test_app("nginx", policy))
            .await
            .unwrap();

        let sync = controller
            .reconcile("nginx", ReconcileReason::Tick)
            .await
            .unwrap();
        assert_eq!(sync, SyncStatus::Synced);
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sync_is_retried_on_next_tick() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        let policy = SyncPolicy {
            automated: true,
            ..Default::default()
        };
        controller
            .create_application(test_app("nginx", policy))
            .await
            .unwrap();

        let key = ResourceKey::new("Deployment", "default", "web");
        // Exactly the retry budget of one pass.
        cluster.fail_next_applies(
            key.clone(),
            crate::cluster::InjectedFailure::Transient,
            3,
        );
        let sync = controller
            .reconcile("nginx", ReconcileReason::Tick)
            .await
            .unwrap();
        assert_eq!(sync, SyncStatus::OutOfSync);

        // Same revision, but the last sync never succeeded: re-executed.
        let sync = controller
            .reconcile("nginx", ReconcileReason::Tick)
            .await
            .unwrap();
        assert_eq!(sync, SyncStatus::Synced);
        assert!(cluster.resource(&key).is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_as_unknown() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir);

        let mut app = test_app("nginx", SyncPolicy::default());
        app.spec.target_revision = "deadbeef".to_string();
        controller.create_application(app).await.unwrap();

        let sync = controller.trigger_sync("nginx").await.unwrap();
        assert_eq!(sync, SyncStatus::Unknown);

        let state = controller.get_application("nginx").await.unwrap();
        assert!(state.status.message.unwrap().contains("deadbeef"));
    }

    #[tokio::test]
    async fn test_ownership_conflict_between_applications() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, _) = setup(&dir);

        controller
            .create_application(test_app("first", SyncPolicy::default()))
            .await
            .unwrap();
        controller
            .create_application(test_app("second", SyncPolicy::default()))
            .await
            .unwrap();

        assert_eq!(
            controller.trigger_sync("first").await.unwrap(),
            SyncStatus::Synced
        );
        // Same manifests, different application: rejected, not resolved.
        let sync = controller.trigger_sync("second").await.unwrap();
        assert_eq!(sync, SyncStatus::Unknown);

        let state = controller.get_application("second").await.unwrap();
        assert!(state
            .status
            .message
            .unwrap()
            .contains("already managed by application 'first'"));
    }

    #[tokio::test]
    async fn test_delete_application_with_prune_removes_owned_resources() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await
            .unwrap();
        controller.trigger_sync("nginx").await.unwrap();
        assert_eq!(cluster.len(), 1);

        controller.delete_application("nginx", true).await.unwrap();
        assert!(cluster.is_empty());
        assert!(matches!(
            controller.get_application("nginx").await,
            Err(ConvergeError::ApplicationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_application_without_prune_leaves_resources() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await
            .unwrap();
        controller.trigger_sync("nginx").await.unwrap();

        controller.delete_application("nginx", false).await.unwrap();
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_after_successful_apply_with_unhealthy_resource() {
        let dir = TempDir::new().unwrap();
        write_deployment(dir.path(), "web", 2);
        let (controller, cluster) = setup(&dir);

        controller
            .create_application(test_app("nginx", SyncPolicy::default()))
            .await
            .unwrap();
        controller.trigger_sync("nginx").await.unwrap();

        let key = ResourceKey::new("Deployment", "default", "web");
        cluster.set_status(&key, json!({"ready": false}));

        let sync = controller.trigger_sync("nginx").await.unwrap();
        assert_eq!(sync, SyncStatus::Degraded);

        let state = controller.get_application("nginx").await.unwrap();
        assert_eq!(state.status.health, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_application() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir);
        assert!(matches!(
            controller.trigger_sync("ghost").await,
            Err(ConvergeError::ApplicationNotFound(_))
        ));
    }
}
