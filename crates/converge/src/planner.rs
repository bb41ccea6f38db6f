//! Sync planner: turns diff operations into an execution plan and
//! drives it against the cluster, wave by wave.
//!
//! Waves run strictly in sequence; operations within a wave run
//! concurrently up to a bounded fan-out. A wave that still fails after
//! bounded retries halts the pass (fail-fast, no rollback — the fix is
//! a corrective commit). Cancellation is honored at wave boundaries
//! only, never mid-apply of a single resource.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::app::SyncPolicy;
use crate::cluster::ClusterApi;
use crate::diff::{OperationKind, SkipReason, SyncOperation};
use crate::error::{ConvergeError, Result};
use crate::resource::ResourceKey;

/// Maximum apply attempts per operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between attempts.
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
/// Default apply fan-out within a wave.
const DEFAULT_MAX_PARALLEL: usize = 4;

/// Cooperative cancellation flag for an in-flight pass.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One wave of an execution plan.
#[derive(Debug, Clone)]
pub struct Wave {
    pub number: i64,
    pub operations: Vec<SyncOperation>,
}

/// Wave-ordered execution plan plus the skips reported alongside it.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    pub skipped: Vec<SyncOperation>,
}

impl ExecutionPlan {
    /// True when nothing would mutate the cluster.
    pub fn is_noop(&self) -> bool {
        self.waves.is_empty()
    }
}

/// Groups operations by sync wave and orders them for execution.
///
/// Within a wave, Create/Update run before Delete (replacements exist
/// before dependents are torn down); ties break deterministically by
/// resource kind then name.
pub fn plan(operations: Vec<SyncOperation>, policy: &SyncPolicy) -> ExecutionPlan {
    let mut skipped = Vec::new();
    let mut by_wave: BTreeMap<i64, Vec<SyncOperation>> = BTreeMap::new();

    for operation in operations {
        match operation.kind {
            OperationKind::Skip { .. } => skipped.push(operation),
            OperationKind::Delete if !policy.prune => skipped.push(operation),
            _ => by_wave.entry(operation.wave).or_default().push(operation),
        }
    }

    let waves = by_wave
        .into_iter()
        .map(|(number, mut operations)| {
            operations.sort_by(|a, b| {
                phase_rank(&a.kind)
                    .cmp(&phase_rank(&b.kind))
                    .then_with(|| a.key.kind.cmp(&b.key.kind))
                    .then_with(|| a.key.name.cmp(&b.key.name))
            });
            Wave { number, operations }
        })
        .collect();

    ExecutionPlan { waves, skipped }
}

fn phase_rank(kind: &OperationKind) -> u8 {
    match kind {
        OperationKind::Create | OperationKind::Update { .. } => 0,
        OperationKind::Delete => 1,
        OperationKind::Skip { .. } => 2,
    }
}

/// What happened to one resource during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationAction {
    Created,
    Updated,
    Deleted,
    Skipped,
    Failed,
}

/// Per-resource outcome of an executed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub key: ResourceKey,
    pub wave: i64,
    pub action: OperationAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of applying one execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Revision the plan was computed from.
    pub revision: String,
    /// Per-resource outcomes, including skips.
    pub outcomes: Vec<OperationOutcome>,
    /// True when the pass was cancelled at a wave boundary.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn succeeded(&self) -> bool {
        !self.cancelled
            && self
                .outcomes
                .iter()
                .all(|outcome| outcome.action != OperationAction::Failed)
    }

    /// First failure message, if any.
    pub fn failure_message(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.action == OperationAction::Failed)
            .and_then(|outcome| outcome.message.as_deref())
    }
}

/// Planner configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    /// Upper bound on concurrent applies within one wave.
    pub max_parallel: usize,
    /// Attempts per operation before the wave is marked failed.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

/// Drives execution plans to completion against a cluster. The planner
/// is the only component that mutates the cluster.
pub struct SyncPlanner {
    cluster: Arc<dyn ClusterApi>,
    config: PlannerConfig,
}

impl SyncPlanner {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: PlannerConfig) -> Self {
        assert!(config.max_parallel > 0, "max_parallel must be > 0");
        assert!(config.max_attempts > 0, "max_attempts must be > 0");
        Self { cluster, config }
    }

    /// Applies the plan wave by wave and reports the result.
    pub async fn execute(
        &self,
        application: &str,
        revision: &str,
        plan: &ExecutionPlan,
        cancel: &CancelFlag,
    ) -> SyncResult {
        let started_at = Utc::now();
        let mut outcomes: Vec<OperationOutcome> = plan
            .skipped
            .iter()
            .map(|operation| OperationOutcome {
                key: operation.key.clone(),
                wave: operation.wave,
                action: OperationAction::Skipped,
                message: skip_message(operation),
            })
            .collect();
        let mut cancelled = false;

        for wave in &plan.waves {
            if cancel.is_cancelled() {
                log::info!(
                    "Sync for '{}' cancelled before wave {}",
                    application,
                    wave.number
                );
                cancelled = true;
                break;
            }

            log::info!(
                "Applying wave {} for '{}' ({} operations)",
                wave.number,
                application,
                wave.operations.len()
            );

            // Collected eagerly rather than mapped lazily inside the
            // stream: a borrowing closure there trips a rustc
            // "implementation of `Send` is not general enough" false
            // positive (rust-lang/rust#102211) once the enclosing
            // future is spawned. Async fn futures do no work until
            // polled, so applies still start under buffer_unordered.
            let apply_futures: Vec<_> = wave
                .operations
                .iter()
                .map(|operation| self.apply_with_retry(application, operation))
                .collect();
            let wave_outcomes: Vec<OperationOutcome> = stream::iter(apply_futures)
                .buffer_unordered(self.config.max_parallel)
                .collect()
                .await;

            let wave_failed = wave_outcomes
                .iter()
                .any(|outcome| outcome.action == OperationAction::Failed);
            outcomes.extend(wave_outcomes);

            if wave_failed {
                log::error!(
                    "Wave {} for '{}' failed, halting subsequent waves",
                    wave.number,
                    application
                );
                break;
            }
        }

        SyncResult {
            revision: revision.to_string(),
            outcomes,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn apply_with_retry(
        &self,
        application: &str,
        operation: &SyncOperation,
    ) -> OperationOutcome {
        let mut last_error: Option<ConvergeError> = None;

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = self.config.retry_base_delay * (1 << (attempt - 1));
                log::info!(
                    "Retrying {} (attempt {}/{}) after {:?}",
                    operation.key,
                    attempt + 1,
                    self.config.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.apply_once(application, operation).await {
                Ok(action) => {
                    return OperationOutcome {
                        key: operation.key.clone(),
                        wave: operation.wave,
                        action,
                        message: None,
                    };
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    log::warn!("Apply of {} failed with retryable error: {}", operation.key, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "apply failed after all retries".to_string());
        OperationOutcome {
            key: operation.key.clone(),
            wave: operation.wave,
            action: OperationAction::Failed,
            message: Some(message),
        }
    }

    async fn apply_once(
        &self,
        application: &str,
        operation: &SyncOperation,
    ) -> Result<OperationAction> {
        match &operation.kind {
            OperationKind::Create | OperationKind::Update { .. } => {
                let desired = operation.desired.as_ref().ok_or_else(|| {
                    ConvergeError::Config(format!(
                        "operation on {} carries no desired manifest",
                        operation.key
                    ))
                })?;

                let mut manifest = desired.clone();
                manifest.set_application(application);
                manifest.set_last_applied(&desired.spec);
                let action = match &operation.kind {
                    OperationKind::Update { patch } => {
                        // Minimal patch; last-applied still records the full spec.
                        manifest.spec = patch.clone();
                        OperationAction::Updated
                    }
                    _ => OperationAction::Created,
                };
                self.cluster.apply(manifest).await?;
                Ok(action)
            }
            OperationKind::Delete => {
                self.cluster.delete(&operation.key).await?;
                Ok(OperationAction::Deleted)
            }
            OperationKind::Skip { .. } => Ok(OperationAction::Skipped),
        }
    }
}

fn skip_message(operation: &SyncOperation) -> Option<String> {
    match operation.kind {
        OperationKind::Skip {
            reason: SkipReason::Unmanaged,
        } => Some("resource out of sync but unmanaged (prune disabled)".to_string()),
        OperationKind::Delete => Some("prune disabled".to_string()),
        _ => None,
    }
}
