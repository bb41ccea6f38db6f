//! Declarative reconciliation engine: continuously converges live
//! cluster state toward versioned desired state.
//!
//! An [`Application`] binds a manifest source (repository, revision,
//! path) to a destination namespace. The [`ReconcileController`] runs
//! one serialized loop per application: fetch and render the desired
//! manifests, observe live state, diff with a three-way merge, then
//! execute the resulting plan wave by wave with bounded parallelism.
//! The [`SyncScheduler`] drives the loop from poll ticks, source
//! change events, and drift signals.

pub mod app;
pub mod cluster;
pub mod controller;
pub mod diff;
pub mod error;
pub mod observer;
pub mod planner;
pub mod resource;
pub mod scheduler;
pub mod source;

pub use app::{
    Application, ApplicationSpec, ApplicationStatus, Destination, HealthStatus, SyncPolicy,
    SyncStatus,
};
pub use cluster::{ClusterApi, ClusterEvent, InMemoryCluster, InjectedFailure};
pub use controller::{ApplicationState, ReconcileController, ReconcileReason};
pub use diff::{diff, merge_patch, three_way_patch, OperationKind, SkipReason, SyncOperation};
pub use error::{ConvergeError, Result};
pub use observer::{ClusterObserver, DriftSignal, LiveSnapshot};
pub use planner::{
    plan, CancelFlag, ExecutionPlan, OperationAction, OperationOutcome, PlannerConfig, SyncPlanner,
    SyncResult, Wave,
};
pub use resource::{LiveResource, Manifest, ManifestSet, ObjectMeta, ResourceKey};
pub use scheduler::SyncScheduler;
pub use source::{DirSource, ManifestSource, SourceChangeEvent, SourceWatcher};
