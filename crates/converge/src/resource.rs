//! K8s-style resource model: manifests, identity keys and live state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ConvergeError, Result};

/// The API version for converge-owned resources.
pub const API_VERSION: &str = "converge.io/v1";

/// Annotation carrying the sync wave of a resource (integer, default 0).
pub const SYNC_WAVE_ANNOTATION: &str = "converge.io/sync-wave";

/// Annotation recording the full desired spec last applied by the engine.
/// Read back for the three-way merge on subsequent passes.
pub const LAST_APPLIED_ANNOTATION: &str = "converge.io/last-applied";

/// Label marking a live resource as owned by an application.
pub const APPLICATION_LABEL: &str = "converge.io/application";

/// Identity of a resource within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The unique name of the resource within its kind and namespace.
    pub name: String,

    /// The namespace the resource lives in.
    #[serde(default)]
    pub namespace: String,

    /// Key-value labels for organizing and selecting resources.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Key-value annotations for storing additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ObjectMeta {
    /// Creates a new ObjectMeta with a name and namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }
}

/// A single declarative resource definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// API version of the resource itself (e.g. `apps/v1`).
    pub api_version: String,

    /// The kind of resource (e.g. `Deployment`).
    pub kind: String,

    /// Resource metadata.
    pub metadata: ObjectMeta,

    /// The declared specification.
    #[serde(default)]
    pub spec: Value,
}

impl Manifest {
    /// Creates a new manifest with the given kind, identity and spec.
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: Value,
    ) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: kind.into(),
            metadata: ObjectMeta::new(name, namespace),
            spec,
        }
    }

    /// Returns the identity key of the manifest.
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    /// Returns the sync wave of this resource. Defaults to 0 when the
    /// annotation is absent or unparsable.
    pub fn sync_wave(&self) -> i64 {
        self.metadata
            .annotations
            .get(SYNC_WAVE_ANNOTATION)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Sets the sync wave annotation.
    pub fn with_sync_wave(mut self, wave: i64) -> Self {
        self.metadata
            .annotations
            .insert(SYNC_WAVE_ANNOTATION.to_string(), wave.to_string());
        self
    }

    /// Returns the owning application name, if labeled.
    pub fn application(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(APPLICATION_LABEL)
            .map(String::as_str)
    }

    /// Labels the manifest as owned by the given application.
    pub fn set_application(&mut self, application: &str) {
        self.metadata
            .labels
            .insert(APPLICATION_LABEL.to_string(), application.to_string());
    }

    /// Records the full desired spec in the last-applied annotation.
    pub fn set_last_applied(&mut self, spec: &Value) {
        self.metadata.annotations.insert(
            LAST_APPLIED_ANNOTATION.to_string(),
            spec.to_string(),
        );
    }

    /// Reads back the last-applied spec, if recorded and parsable.
    pub fn last_applied(&self) -> Option<Value> {
        self.metadata
            .annotations
            .get(LAST_APPLIED_ANNOTATION)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// An immutable set of desired manifests rendered at a specific revision.
#[derive(Debug, Clone)]
pub struct ManifestSet {
    /// Content-addressed revision the set was rendered from.
    pub revision: String,
    /// Manifests in source order.
    pub manifests: Vec<Manifest>,
}

impl ManifestSet {
    /// Creates a manifest set, rejecting duplicate resource keys.
    pub fn new(revision: impl Into<String>, manifests: Vec<Manifest>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for manifest in &manifests {
            let key = manifest.key();
            if !seen.insert(key.clone()) {
                return Err(ConvergeError::DuplicateResource {
                    key: key.to_string(),
                });
            }
        }
        Ok(Self {
            revision: revision.into(),
            manifests,
        })
    }

    /// Returns an identity index over the set.
    pub fn index(&self) -> HashMap<ResourceKey, &Manifest> {
        self.manifests.iter().map(|m| (m.key(), m)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }
}

/// A resource as currently observed in the cluster: the stored manifest
/// plus the server-populated status document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveResource {
    pub manifest: Manifest,

    /// Server-populated status (readiness etc.). Never compared by the
    /// diff engine.
    #[serde(default)]
    pub status: Value,
}

impl LiveResource {
    pub fn key(&self) -> ResourceKey {
        self.manifest.key()
    }

    /// Returns the owning application name, if labeled.
    pub fn application(&self) -> Option<&str> {
        self.manifest.application()
    }

    /// Reads the last-applied spec recorded on the resource.
    pub fn last_applied(&self) -> Option<Value> {
        self.manifest.last_applied()
    }

    /// Readiness heuristic over the status document. A resource with no
    /// readiness signal counts as healthy.
    pub fn is_healthy(&self) -> bool {
        if let Some(ready) = self.status.get("ready").and_then(Value::as_bool) {
            return ready;
        }
        if let (Some(want), Some(have)) = (
            self.manifest.spec.get("replicas").and_then(Value::as_i64),
            self.status.get("readyReplicas").and_then(Value::as_i64),
        ) {
            return have >= want;
        }
        true
    }
}
