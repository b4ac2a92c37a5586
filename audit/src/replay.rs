//! Replay: re-run the calculation behind a snapshot and compare hashes.
//!
//! A replay never writes to the snapshot. A mismatch or an indeterminate run
//! is a value in [`ReplayOutcome`], not an error; errors are reserved for
//! "could not even look at the snapshot" (forbidden, not found).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mrv_access::context::{SessionContext, SnapshotId};
use mrv_kernel::hash::{ContentHash, HashDomain};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::snapshot::{ReplayDescriptor, SnapshotManager};

/// Freshly derived bundles, before volatile-key stripping.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeOutput {
    pub input: serde_json::Value,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("dataset {dataset} is unavailable")]
    DatasetUnavailable { dataset: String },
    #[error("calculation failed: {detail}")]
    Failed { detail: String },
}

/// External calculation engine.
///
/// Given identical dataset content, config, factor set and methodology it
/// must return byte-identical bundles (after volatile keys are stripped).
#[async_trait]
pub trait CalculationEngine: Send + Sync {
    async fn compute(&self, replay: &ReplayDescriptor) -> Result<ComputeOutput, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndeterminateReason {
    Timeout { after: Duration },
    DatasetUnavailable { dataset: String },
    EngineFailed { detail: String },
}

impl From<EngineError> for IndeterminateReason {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::DatasetUnavailable { dataset } => Self::DatasetUnavailable { dataset },
            EngineError::Failed { detail } => Self::EngineFailed { detail },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplayOutcome {
    Completed {
        input_hash_match: bool,
        result_hash_match: bool,
        recomputed_input_hash: ContentHash,
        recomputed_result_hash: ContentHash,
    },
    /// No hash evidence either way.
    Indeterminate { reason: IndeterminateReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayVerdict {
    Match,
    Mismatch,
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub snapshot_id: SnapshotId,
    pub expected_input_hash: ContentHash,
    pub expected_result_hash: ContentHash,
    pub outcome: ReplayOutcome,
}

impl ReplayReport {
    #[must_use]
    pub fn verdict(&self) -> ReplayVerdict {
        match &self.outcome {
            ReplayOutcome::Completed {
                input_hash_match: true,
                result_hash_match: true,
                ..
            } => ReplayVerdict::Match,
            ReplayOutcome::Completed { .. } => ReplayVerdict::Mismatch,
            ReplayOutcome::Indeterminate { .. } => ReplayVerdict::Indeterminate,
        }
    }
}

pub struct ReplayEngine {
    snapshots: Arc<SnapshotManager>,
    engine: Arc<dyn CalculationEngine>,
    timeout: Duration,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    #[must_use]
    pub fn new(
        snapshots: Arc<SnapshotManager>,
        engine: Arc<dyn CalculationEngine>,
        config: &AuditConfig,
    ) -> Self {
        Self {
            snapshots,
            engine,
            timeout: config.replay_timeout(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Re-run the calculation recorded in snapshot `id` and compare the
    /// recomputed bundle hashes to the sealed ones.
    ///
    /// Engine output that cannot be canonicalized carries no hash evidence
    /// and is reported as [`IndeterminateReason::EngineFailed`].
    ///
    /// # Errors
    ///
    /// `Forbidden` / `NotFound` from the snapshot read.
    pub async fn replay(
        &self,
        ctx: &SessionContext,
        id: SnapshotId,
    ) -> Result<ReplayReport, AuditError> {
        let snapshot = self.snapshots.get(ctx, id)?;
        let expected_input_hash = snapshot.input_hash().clone();
        let expected_result_hash = snapshot.result_hash().clone();

        let compute = self.engine.compute(&snapshot.replay);
        let outcome = match tokio::time::timeout(self.timeout, compute).await {
            Err(_) => ReplayOutcome::Indeterminate {
                reason: IndeterminateReason::Timeout {
                    after: self.timeout,
                },
            },
            Ok(Err(err)) => ReplayOutcome::Indeterminate { reason: err.into() },
            Ok(Ok(output)) => {
                self.compare(&output, &expected_input_hash, &expected_result_hash)
            }
        };

        let report = ReplayReport {
            snapshot_id: id,
            expected_input_hash,
            expected_result_hash,
            outcome,
        };
        match report.verdict() {
            ReplayVerdict::Match => {
                info!(tenant = %ctx.tenant_id, snapshot_id = %id, "replay matched");
            }
            ReplayVerdict::Mismatch => warn!(
                tenant = %ctx.tenant_id,
                snapshot_id = %id,
                outcome = ?report.outcome,
                "replay mismatch"
            ),
            ReplayVerdict::Indeterminate => warn!(
                tenant = %ctx.tenant_id,
                snapshot_id = %id,
                outcome = ?report.outcome,
                "replay indeterminate"
            ),
        }
        Ok(report)
    }

    fn compare(
        &self,
        output: &ComputeOutput,
        expected_input_hash: &ContentHash,
        expected_result_hash: &ContentHash,
    ) -> ReplayOutcome {
        let sealed = self
            .snapshots
            .seal(HashDomain::InputBundle, &output.input)
            .and_then(|input| {
                let result = self.snapshots.seal(HashDomain::ResultBundle, &output.result)?;
                Ok((input, result))
            });
        match sealed {
            Ok((input, result)) => ReplayOutcome::Completed {
                input_hash_match: &input.hash == expected_input_hash,
                result_hash_match: &result.hash == expected_result_hash,
                recomputed_input_hash: input.hash,
                recomputed_result_hash: result.hash,
            },
            Err(err) => ReplayOutcome::Indeterminate {
                reason: IndeterminateReason::EngineFailed {
                    detail: format!("engine output is not canonicalizable: {err}"),
                },
            },
        }
    }
}
