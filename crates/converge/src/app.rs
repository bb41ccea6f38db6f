//! Application resource: the named binding of a source to a destination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::planner::SyncResult;
use crate::resource::{ObjectMeta, API_VERSION};

/// An application: binds a repository/revision/path to a destination
/// cluster and namespace. Name is unique per controller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// API version, should always be `converge.io/v1`.
    pub api_version: String,

    /// Resource metadata; `metadata.name` identifies the application.
    pub metadata: ObjectMeta,

    /// The application specification.
    pub spec: ApplicationSpec,
}

impl Application {
    /// Creates a new application with the given name and spec.
    pub fn new(name: impl Into<String>, spec: ApplicationSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            metadata: ObjectMeta::new(name, ""),
            spec,
        }
    }

    /// Returns the name of the application.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Specification of an application's desired source and destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Source repository URL.
    pub repo_url: String,

    /// Revision to track.
    #[serde(default = "default_revision")]
    pub target_revision: String,

    /// Path within the repository holding the manifests.
    #[serde(default)]
    pub path: String,

    /// Destination cluster and namespace.
    pub destination: Destination,

    /// Value overrides applied at render time, keyed as
    /// `<kind>/<name>:<dotted.path>` into the resource spec.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, Value>,

    /// Sync policy for this application.
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

/// Destination cluster and namespace for an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Destination cluster name.
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Destination namespace; required.
    pub namespace: String,
}

fn default_cluster() -> String {
    "in-cluster".to_string()
}

/// Per-application sync policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Reconcile without a manual trigger.
    #[serde(default)]
    pub automated: bool,

    /// Delete live resources absent from the desired set.
    #[serde(default)]
    pub prune: bool,

    /// Re-apply on detected manual drift even without a revision change.
    #[serde(default)]
    pub self_heal: bool,
}

/// Sync status of an application.
///
/// State machine: `Unknown → Syncing → {Synced, OutOfSync, Degraded}`
/// and back to `Syncing` on the next trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Unknown,
    Syncing,
    Synced,
    OutOfSync,
    Degraded,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Unknown => write!(f, "Unknown"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::OutOfSync => write!(f, "OutOfSync"),
            SyncStatus::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Aggregate health of an application's owned resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Current status of an application, updated after every pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Current sync status.
    pub sync: SyncStatus,

    /// Aggregate health of owned resources.
    pub health: HealthStatus,

    /// Revision last reconciled against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Human-readable message, populated on errors for operator visibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Result of the most recent executed sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<SyncResult>,

    /// When the status was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self {
            sync: SyncStatus::Unknown,
            health: HealthStatus::Unknown,
            revision: None,
            message: None,
            last_sync: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_policy_defaults_off() {
        let policy = SyncPolicy::default();
        assert!(!policy.automated);
        assert!(!policy.prune);
        assert!(!policy.self_heal);
    }

    #[test]
    fn test_application_deserialization_defaults() {
        let yaml = r#"
apiVersion: converge.io/v1
metadata:
  name: nginx
spec:
  repoUrl: https://example.com/deploy.git
  destination:
    namespace: default
  syncPolicy:
    automated: true
    selfHeal: true
"#;
        let app: Application = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(app.name(), "nginx");
        assert_eq!(app.spec.target_revision, "HEAD");
        assert_eq!(app.spec.destination.cluster, "in-cluster");
        assert!(app.spec.sync_policy.automated);
        assert!(app.spec.sync_policy.self_heal);
        assert!(!app.spec.sync_policy.prune);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SyncStatus::OutOfSync.to_string(), "OutOfSync");
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
    }
}
