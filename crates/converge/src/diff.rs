//! Diff engine: pure comparison of desired manifests against live state.
//!
//! Comparison covers the `spec` document only. Server-populated state
//! (the live `status`, bookkeeping annotations) never participates.
//! Updates carry a minimal three-way merge patch computed against the
//! last-applied spec recorded on the live resource, so fields owned by
//! other controllers are left untouched.

use serde_json::Value;

use crate::app::SyncPolicy;
use crate::observer::LiveSnapshot;
use crate::resource::{Manifest, ManifestSet, ResourceKey};

/// Why a resource was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No semantic difference between desired and live.
    InSync,
    /// Live resource absent from desired, left alone because prune is off.
    Unmanaged,
}

/// What to do for one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Create,
    Update { patch: Value },
    Delete,
    Skip { reason: SkipReason },
}

/// One resource-level operation within a reconciliation pass.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub key: ResourceKey,
    pub wave: i64,
    pub kind: OperationKind,
    /// The desired manifest, absent for Delete and unmanaged Skip.
    pub desired: Option<Manifest>,
}

impl SyncOperation {
    /// Whether the operation mutates the cluster.
    pub fn is_actionable(&self) -> bool {
        !matches!(self.kind, OperationKind::Skip { .. })
    }

    pub fn is_in_sync(&self) -> bool {
        matches!(
            self.kind,
            OperationKind::Skip {
                reason: SkipReason::InSync
            }
        )
    }
}

/// Compares a desired manifest set against a live snapshot.
///
/// Emits Create for desired-only resources, Update (with a minimal patch)
/// where specs diverge, Delete for live-only resources when prune is
/// enabled, and Skip otherwise. Operations come out in desired-set order
/// followed by live-only keys in sorted order, so output is deterministic.
pub fn diff(desired: &ManifestSet, live: &LiveSnapshot, policy: &SyncPolicy) -> Vec<SyncOperation> {
    let desired_index = desired.index();
    let mut operations = Vec::with_capacity(desired.len());

    for manifest in &desired.manifests {
        let key = manifest.key();
        let wave = manifest.sync_wave();
        let kind = match live.resources.get(&key) {
            None => OperationKind::Create,
            Some(live_resource) => {
                let last_applied = live_resource.last_applied();
                match three_way_patch(
                    &manifest.spec,
                    last_applied.as_ref(),
                    &live_resource.manifest.spec,
                ) {
                    Some(patch) => OperationKind::Update { patch },
                    None => OperationKind::Skip {
                        reason: SkipReason::InSync,
                    },
                }
            }
        };
        operations.push(SyncOperation {
            key,
            wave,
            kind,
            desired: Some(manifest.clone()),
        });
    }

    let mut extra: Vec<_> = live
        .resources
        .iter()
        .filter(|(key, _)| !desired_index.contains_key(*key))
        .collect();
    extra.sort_by(|a, b| a.0.cmp(b.0));

    for (key, live_resource) in extra {
        let wave = live_resource.manifest.sync_wave();
        let kind = if policy.prune {
            OperationKind::Delete
        } else {
            log::warn!(
                "Resource {} is live but absent from desired state (prune disabled, leaving it)",
                key
            );
            OperationKind::Skip {
                reason: SkipReason::Unmanaged,
            }
        };
        operations.push(SyncOperation {
            key: key.clone(),
            wave,
            kind,
            desired: None,
        });
    }

    operations
}

/// Computes a minimal merge patch turning `live` into `desired`,
/// consulting `last_applied` to decide which fields this engine manages.
///
/// Fields present in `last_applied` but dropped from `desired` become
/// explicit nulls (removals). Fields present only in `live` — added by
/// other controllers — are never touched. Returns `None` when nothing
/// needs to change.
pub fn three_way_patch(
    desired: &Value,
    last_applied: Option<&Value>,
    live: &Value,
) -> Option<Value> {
    match (desired, live) {
        (Value::Object(desired_map), Value::Object(live_map)) => {
            let last_map = last_applied.and_then(Value::as_object);
            let mut patch = serde_json::Map::new();

            for (field, desired_value) in desired_map {
                match live_map.get(field) {
                    None => {
                        patch.insert(field.clone(), desired_value.clone());
                    }
                    Some(live_value) => {
                        let last_value = last_map.and_then(|m| m.get(field));
                        if let Some(sub) = three_way_patch(desired_value, last_value, live_value) {
                            patch.insert(field.clone(), sub);
                        }
                    }
                }
            }

            if let Some(last_map) = last_map {
                for field in last_map.keys() {
                    if !desired_map.contains_key(field) && live_map.contains_key(field) {
                        patch.insert(field.clone(), Value::Null);
                    }
                }
            }

            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ => {
            if desired == live {
                None
            } else {
                Some(desired.clone())
            }
        }
    }
}

/// Applies an RFC 7386 merge patch in place: objects merge recursively,
/// nulls remove fields, everything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let map = target.as_object_mut().expect("target coerced to object");
            for (field, value) in entries {
                if value.is_null() {
                    map.remove(field);
                } else {
                    merge_patch(map.entry(field.clone()).or_insert(Value::Null), value);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::LiveSnapshot;
    use crate::resource::LiveResource;
    use serde_json::json;
    use std::collections::HashMap;

    fn deployment(name: &str, replicas: i64) -> Manifest {
        Manifest::new("Deployment", "default", name, json!({"replicas": replicas}))
    }

    fn live_from(manifests: Vec<Manifest>) -> LiveSnapshot {
        let mut resources = HashMap::new();
        for mut manifest in manifests {
            let spec = manifest.spec.clone();
            manifest.set_last_applied(&spec);
            resources.insert(
                manifest.key(),
                LiveResource {
                    manifest,
                    status: json!({}),
                },
            );
        }
        LiveSnapshot::fresh(resources)
    }

    fn set(manifests: Vec<Manifest>) -> ManifestSet {
        ManifestSet::new("rev1", manifests).unwrap()
    }

    #[test]
    fn test_create_for_every_missing_resource_never_delete() {
        let desired = set(vec![deployment("a", 1), deployment("b", 2)]);
        let live = LiveSnapshot::empty();

        let ops = diff(&desired, &live, &SyncPolicy::default());
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.kind == OperationKind::Create));
    }

    #[test]
    fn test_diff_is_idempotent_when_in_sync() {
        let desired = set(vec![deployment("a", 2)]);
        let live = live_from(vec![deployment("a", 2)]);

        let ops = diff(&desired, &live, &SyncPolicy::default());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_in_sync());

        // A second run over the same pair stays all-Skip.
        let again = diff(&desired, &live, &SyncPolicy::default());
        assert!(again.iter().all(|op| op.is_in_sync()));
    }

    #[test]
    fn test_update_carries_minimal_patch() {
        let desired = set(vec![deployment("a", 2)]);
        let live = live_from(vec![deployment("a", 5)]);

        let ops = diff(&desired, &live, &SyncPolicy::default());
        match &ops[0].kind {
            OperationKind::Update { patch } => assert_eq!(patch, &json!({"replicas": 2})),
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_prune_disabled_emits_skip_not_delete() {
        let desired = set(vec![]);
        let live = live_from(vec![deployment("orphan", 1)]);

        let ops = diff(&desired, &live, &SyncPolicy::default());
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].kind,
            OperationKind::Skip {
                reason: SkipReason::Unmanaged
            }
        );
    }

    #[test]
    fn test_prune_enabled_emits_exactly_one_delete_per_orphan() {
        let desired = set(vec![deployment("kept", 1)]);
        let live = live_from(vec![deployment("kept", 1), deployment("orphan", 1)]);

        let policy = SyncPolicy {
            prune: true,
            ..Default::default()
        };
        let ops = diff(&desired, &live, &policy);
        let deletes: Vec<_> = ops
            .iter()
            .filter(|op| op.kind == OperationKind::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].key.name, "orphan");
    }

    #[test]
    fn test_three_way_preserves_foreign_fields() {
        // A field added by another controller, unknown to last-applied,
        // must not appear in the patch.
        let desired = json!({"replicas": 2});
        let last = json!({"replicas": 2});
        let live = json!({"replicas": 2, "injectedSidecar": true});

        assert_eq!(three_way_patch(&desired, Some(&last), &live), None);
    }

    #[test]
    fn test_three_way_removes_dropped_managed_fields() {
        let desired = json!({"replicas": 2});
        let last = json!({"replicas": 2, "image": "nginx:1.26"});
        let live = json!({"replicas": 2, "image": "nginx:1.26"});

        let patch = three_way_patch(&desired, Some(&last), &live).unwrap();
        assert_eq!(patch, json!({"image": null}));
    }

    #[test]
    fn test_three_way_nested_objects() {
        let desired = json!({"template": {"image": "nginx:1.27", "port": 80}});
        let last = json!({"template": {"image": "nginx:1.26", "port": 80}});
        let live = json!({"template": {"image": "nginx:1.26", "port": 80, "uid": "abc"}});

        let patch = three_way_patch(&desired, Some(&last), &live).unwrap();
        assert_eq!(patch, json!({"template": {"image": "nginx:1.27"}}));
    }

    #[test]
    fn test_three_way_without_last_applied_overwrites_differences_only() {
        let desired = json!({"replicas": 2});
        let live = json!({"replicas": 5, "other": 1});

        let patch = three_way_patch(&desired, None, &live).unwrap();
        assert_eq!(patch, json!({"replicas": 2}));
    }

    #[test]
    fn test_merge_patch_round_trip() {
        let mut live = json!({"replicas": 5, "other": 1, "nested": {"a": 1, "b": 2}});
        merge_patch(
            &mut live,
            &json!({"replicas": 2, "nested": {"b": null, "c": 3}}),
        );
        assert_eq!(
            live,
            json!({"replicas": 2, "other": 1, "nested": {"a": 1, "c": 3}})
        );
    }

    #[test]
    fn test_wave_carried_from_annotation() {
        let desired = set(vec![
            deployment("a", 1).with_sync_wave(1),
            deployment("b", 1),
        ]);
        let ops = diff(&desired, &LiveSnapshot::empty(), &SyncPolicy::default());
        assert_eq!(ops[0].wave, 1);
        assert_eq!(ops[1].wave, 0);
    }
}
