//! Error types for snapshots, replay and evidence packs.

use mrv_access::context::SnapshotId;
use mrv_access::error::{AccessError, DenyReason, GuardViolation, StoreError};
use mrv_kernel::bundle::BundleError;

/// Errors from the snapshot manager and the operations built on it.
///
/// Replay mismatches and indeterminate replays are not errors; they are
/// values of [`crate::replay::ReplayOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("forbidden: {reason}")]
    Forbidden { reason: DenyReason },
    /// Write attempted on a locked snapshot.
    #[error("snapshot {snapshot_id} is immutable: {detail}")]
    ImmutableViolation { snapshot_id: String, detail: String },
    #[error("snapshot {snapshot_id} not found")]
    NotFound { snapshot_id: SnapshotId },
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error(transparent)]
    Access(AccessError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AuditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Guard { violation, .. } => match violation {
                GuardViolation::TenantMismatch {
                    caller_tenant,
                    row_tenant,
                } => Self::Forbidden {
                    reason: DenyReason::TenantMismatch {
                        caller_tenant,
                        row_tenant,
                    },
                },
                GuardViolation::Immutable { id, detail } => Self::ImmutableViolation {
                    snapshot_id: id,
                    detail,
                },
            },
            other => Self::Store(other),
        }
    }
}

impl From<AccessError> for AuditError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Forbidden { reason } => Self::Forbidden { reason },
            AccessError::Store(store) => store.into(),
            other => Self::Access(other),
        }
    }
}

/// Evidence pack assembly or verification failure. Any of these aborts the
/// whole build; no partial pack is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    #[error("invalid artifact path {path:?}: {detail}")]
    InvalidPath { path: String, detail: String },
    #[error("duplicate artifact path {path:?}")]
    DuplicatePath { path: String },
    /// One artifact path is a directory prefix of another.
    #[error("artifact path {path:?} conflicts with {existing:?}")]
    PathConflict { path: String, existing: String },
    #[error("artifact provider {provider} failed: {detail}")]
    Provider { provider: String, detail: String },
    #[error("canonical JSON error: {detail}")]
    Canon { detail: String },
    #[error("manifest error: {detail}")]
    Manifest { detail: String },
    #[error("file {path:?} hash mismatch: manifest {declared}, content {recomputed}")]
    FileHashMismatch {
        path: String,
        declared: String,
        recomputed: String,
    },
    #[error("file {path:?} is not listed in the manifest")]
    UndeclaredFile { path: String },
    #[error("file {path:?} is listed in the manifest but missing")]
    MissingFile { path: String },
    #[error("pack is unsigned but a signing key was supplied")]
    MissingSignature,
    #[error("signature key id {found:?} does not match {expected:?}")]
    KeyIdMismatch { expected: String, found: String },
    #[error("signature does not verify")]
    BadSignature,
}
