//! Shared test utilities for converge integration tests.
//!
//! `TestHarness` wires a directory-backed manifest source, an in-memory
//! cluster and a controller into one isolated environment per test.

#![allow(dead_code)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use converge::{
    Application, ApplicationSpec, ClusterApi, ClusterObserver, Destination, DirSource,
    InMemoryCluster, ManifestSource, PlannerConfig, ReconcileController, SyncPolicy,
};

pub const REPO_URL: &str = "https://example.com/deploy.git";

/// Isolated reconciliation environment backed by a temp manifest tree.
pub struct TestHarness {
    repo: TempDir,
    pub cluster: Arc<InMemoryCluster>,
    pub observer: Arc<ClusterObserver>,
    pub controller: Arc<ReconcileController>,
}

impl TestHarness {
    pub fn new() -> Self {
        // Tight retry backoff keeps failure-path tests fast.
        Self::with_planner_config(PlannerConfig {
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        })
    }

    pub fn with_planner_config(config: PlannerConfig) -> Self {
        let repo = TempDir::new().expect("Failed to create temp repo");
        let cluster = Arc::new(InMemoryCluster::new());
        let cluster_api: Arc<dyn ClusterApi> = cluster.clone();
        let observer = Arc::new(ClusterObserver::new(cluster_api.clone()));
        let source: Arc<dyn ManifestSource> = Arc::new(DirSource::new(REPO_URL, repo.path()));
        let controller = Arc::new(ReconcileController::new(
            source,
            cluster_api,
            Arc::clone(&observer),
            config,
        ));
        Self {
            repo,
            cluster,
            observer,
            controller,
        }
    }

    /// Writes (or overwrites) a manifest file in the source tree.
    pub fn write_manifest(&self, file: &str, content: &str) {
        fs::write(self.repo.path().join(file), content).expect("Failed to write manifest");
    }

    /// Removes a manifest file from the source tree.
    pub fn remove_manifest(&self, file: &str) {
        fs::remove_file(self.repo.path().join(file)).expect("Failed to remove manifest");
    }
}

/// An application pointing at the harness repo root.
pub fn application(name: &str, policy: SyncPolicy) -> Application {
    Application::new(
        name,
        ApplicationSpec {
            repo_url: REPO_URL.to_string(),
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

pub fn automated_policy() -> SyncPolicy {
    SyncPolicy {
        automated: true,
        prune: false,
        self_heal: false,
    }
}

pub fn self_heal_policy() -> SyncPolicy {
    SyncPolicy {
        automated: true,
        prune: true,
        self_heal: true,
    }
}

pub fn deployment_yaml(name: &str, replicas: i64) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
spec:
  replicas: {replicas}
  image: nginx:1.27
"#
    )
}

pub fn deployment_yaml_with_wave(name: &str, replicas: i64, wave: i64) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  annotations:
    converge.io/sync-wave: "{wave}"
spec:
  replicas: {replicas}
"#
    )
}

pub fn service_yaml(name: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Service
metadata:
  name: {name}
spec:
  type: LoadBalancer
  ports:
    - port: 80
"#
    )
}
