//! Abstract cluster API: the single external surface the engine mutates.
//!
//! The core depends only on this contract, never on a concrete cluster
//! implementation. Apply uses server-side merge-patch semantics: object
//! values merge recursively, explicit nulls remove fields.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::resource::{LiveResource, Manifest, ResourceKey};

pub mod memory;

pub use memory::{InMemoryCluster, InjectedFailure};

/// Event emitted when a cluster resource changes.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A resource was created or updated.
    Applied { resource: LiveResource },
    /// A resource was deleted.
    Deleted { key: ResourceKey },
}

/// Declarative-resource API of a destination cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists resources, optionally filtered by an exact label match.
    async fn list(&self, label: Option<(&str, &str)>) -> Result<Vec<LiveResource>>;

    /// Reads a single resource by identity.
    async fn get(&self, key: &ResourceKey) -> Result<Option<LiveResource>>;

    /// Applies a manifest with server-side merge-patch semantics and
    /// returns the resulting live resource.
    async fn apply(&self, manifest: Manifest) -> Result<LiveResource>;

    /// Deletes a resource. Deleting an absent resource is a no-op.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    /// Subscribes to the change event stream.
    fn watch(&self) -> broadcast::Receiver<ClusterEvent>;
}
