//! Error types for the access layer.

use serde::{Deserialize, Serialize};

use crate::context::{FacilityId, RecordId, SessionContext, TenantId};
use crate::entity::EntityType;

/// Why a request was refused. Recorded verbatim in the access audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// Row belongs to another tenant. Applies to admins too.
    TenantMismatch {
        caller_tenant: TenantId,
        row_tenant: TenantId,
    },
    /// Caller holds no active scope on the owning facility.
    NoActiveScope { facility: FacilityId },
    /// Operation requires the admin role.
    AdminRequired,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TenantMismatch {
                caller_tenant,
                row_tenant,
            } => write!(f, "tenant mismatch (caller {caller_tenant}, row {row_tenant})"),
            Self::NoActiveScope { facility } => write!(f, "no active scope on facility {facility}"),
            Self::AdminRequired => f.write_str("admin role required"),
        }
    }
}

/// Rejection raised by a write interceptor on a [`crate::store::GuardedTable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardViolation {
    #[error("row tenant {row_tenant} differs from session tenant {caller_tenant}")]
    TenantMismatch {
        caller_tenant: TenantId,
        row_tenant: TenantId,
    },
    /// The row is sealed; no field may change and it may not be deleted.
    #[error("row {id} is immutable: {detail}")]
    Immutable { id: String, detail: String },
}

/// Errors surfaced by the guarded storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no row {id} in {table}")]
    NotFound { table: &'static str, id: String },
    #[error("row {id} already exists in {table}")]
    DuplicateId { table: &'static str, id: String },
    #[error("{table} lock poisoned")]
    Poisoned { table: &'static str },
    #[error("{table} entry could not be encoded: {detail}")]
    Encoding { table: &'static str, detail: String },
    /// Stored data fails its integrity check.
    #[error("{table} is corrupt: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("{guard} rejected write to {table}: {violation}")]
    Guard {
        table: &'static str,
        guard: &'static str,
        violation: GuardViolation,
    },
}

/// Errors returned by the scope resolver and the policy enforcement point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// Never converted to an empty result on single-row operations.
    #[error("forbidden: {reason}")]
    Forbidden { reason: DenyReason },
    /// Ownership table is wrong or an entity type is unknown. Fatal.
    #[error("access configuration error: {detail}")]
    Configuration { detail: String },
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: RecordId },
    /// A parent reference points at no row.
    #[error("{entity_type} {id} references missing {parent_type} {parent_id}")]
    DanglingReference {
        entity_type: EntityType,
        id: RecordId,
        parent_type: EntityType,
        parent_id: RecordId,
    },
    /// The row is still named as parent by another row and cannot be
    /// deleted.
    #[error("{entity_type} {id} is still referenced by {child_type} {child_id}")]
    StillReferenced {
        entity_type: EntityType,
        id: RecordId,
        child_type: EntityType,
        child_id: RecordId,
    },
    /// Row shape does not fit the ownership path of its entity type.
    #[error("malformed {entity_type} row: {detail}")]
    MalformedRow {
        entity_type: EntityType,
        detail: String,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Guard {
                violation:
                    GuardViolation::TenantMismatch {
                        caller_tenant,
                        row_tenant,
                    },
                ..
            } => Self::Forbidden {
                reason: DenyReason::TenantMismatch {
                    caller_tenant,
                    row_tenant,
                },
            },
            other => Self::Store(other),
        }
    }
}

impl AccessError {
    /// The deny reason when this is a `Forbidden` error.
    #[must_use]
    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Forbidden { reason } => Some(reason),
            _ => None,
        }
    }
}

/// `Forbidden` with [`DenyReason::AdminRequired`] unless `ctx` is an admin.
pub(crate) fn require_admin(ctx: &SessionContext) -> Result<(), AccessError> {
    if ctx.is_admin() {
        Ok(())
    } else {
        Err(AccessError::Forbidden {
            reason: DenyReason::AdminRequired,
        })
    }
}
