//! Scope resolver: maps a row to its owning facility and checks the caller's
//! scope on it.
//!
//! Resolution follows the static ownership table in [`crate::entity`]. Every
//! parent hop goes through the guarded tables, so a chain that crosses into
//! another tenant fails with `Forbidden` rather than resolving.

use std::sync::Arc;

use crate::context::{FacilityId, RecordId, SessionContext};
use crate::entity::{EntityRow, EntityStore, EntityType, OwnershipPath, MAX_OWNERSHIP_HOPS};
use crate::error::{AccessError, DenyReason, StoreError};
use crate::scope_store::ScopeStore;

/// Where a row sits in the ownership graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Facility(FacilityId),
    /// Nullable facility reference left empty.
    Unattributed,
    /// Tenant isolation only.
    TenantWide,
}

/// Scope decision for a non-admin caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    Permit,
    Deny(DenyReason),
}

#[derive(Debug, Clone)]
pub struct ScopeResolver {
    scopes: Arc<ScopeStore>,
    entities: Arc<EntityStore>,
}

impl ScopeResolver {
    #[must_use]
    pub fn new(scopes: Arc<ScopeStore>, entities: Arc<EntityStore>) -> Self {
        Self { scopes, entities }
    }

    /// `CanAccess(caller, entity_type, id)`.
    ///
    /// The row is read through its guarded table first, so another tenant's
    /// row is `Forbidden` for every caller. Admins are then permitted
    /// without a scope lookup. This query is not audited; the enforcement
    /// point records its own decisions.
    ///
    /// # Errors
    ///
    /// `Forbidden` on tenant mismatch, `NotFound`, or a resolution error.
    pub fn can_access(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        id: RecordId,
    ) -> Result<bool, AccessError> {
        let row = fetch(&self.entities, ctx, entity_type, id)?;
        if ctx.is_admin() {
            return Ok(true);
        }
        Ok(self.check_row(ctx, &row)? == ScopeDecision::Permit)
    }

    /// Walk `row` up its ownership path.
    ///
    /// # Errors
    ///
    /// [`AccessError::Configuration`] when the walk exceeds
    /// [`MAX_OWNERSHIP_HOPS`] or reaches a row of the wrong type,
    /// [`AccessError::DanglingReference`] when a parent is missing, and
    /// [`AccessError::MalformedRow`] when an ownership column is absent.
    pub fn resolve_owner(
        &self,
        ctx: &SessionContext,
        row: &EntityRow,
    ) -> Result<Ownership, AccessError> {
        let mut hops = 0;
        let mut parent_row: Option<EntityRow> = None;
        loop {
            let current = parent_row.as_ref().unwrap_or(row);
            match current.entity_type.ownership() {
                OwnershipPath::SelfFacility | OwnershipPath::Facility => {
                    return current.facility_id.map(Ownership::Facility).ok_or_else(|| {
                        AccessError::MalformedRow {
                            entity_type: current.entity_type,
                            detail: "facility_id is required".into(),
                        }
                    });
                }
                OwnershipPath::NullableFacility => {
                    return Ok(current
                        .facility_id
                        .map_or(Ownership::Unattributed, Ownership::Facility));
                }
                OwnershipPath::TenantOnly => return Ok(Ownership::TenantWide),
                OwnershipPath::Parent(parent_type) => {
                    hops += 1;
                    if hops > MAX_OWNERSHIP_HOPS {
                        return Err(AccessError::Configuration {
                            detail: format!(
                                "{} ownership chain exceeds {MAX_OWNERSHIP_HOPS} hops",
                                row.entity_type
                            ),
                        });
                    }
                    let next = self.parent_of(ctx, current, parent_type)?;
                    parent_row = Some(next);
                }
            }
        }
    }

    fn parent_of(
        &self,
        ctx: &SessionContext,
        child: &EntityRow,
        parent_type: EntityType,
    ) -> Result<EntityRow, AccessError> {
        let parent_id = child.parent_id.ok_or_else(|| AccessError::MalformedRow {
            entity_type: child.entity_type,
            detail: "parent_id is required".into(),
        })?;
        let parent = match self.entities.table(parent_type)?.get(ctx, parent_id) {
            Ok(parent) => parent,
            Err(StoreError::NotFound { .. }) => {
                return Err(AccessError::DanglingReference {
                    entity_type: child.entity_type,
                    id: child.id,
                    parent_type,
                    parent_id,
                })
            }
            Err(other) => return Err(other.into()),
        };
        if parent.entity_type != parent_type {
            return Err(AccessError::Configuration {
                detail: format!(
                    "{parent_type} table holds a {} row ({parent_id})",
                    parent.entity_type
                ),
            });
        }
        Ok(parent)
    }

    /// Scope check for a non-admin caller. Does not look at roles.
    ///
    /// # Errors
    ///
    /// Any resolution error from [`Self::resolve_owner`].
    pub fn check_row(
        &self,
        ctx: &SessionContext,
        row: &EntityRow,
    ) -> Result<ScopeDecision, AccessError> {
        match self.resolve_owner(ctx, row)? {
            Ownership::Facility(facility) => {
                if self.scopes.is_active(ctx.tenant_id, ctx.user_id, facility)? {
                    Ok(ScopeDecision::Permit)
                } else {
                    Ok(ScopeDecision::Deny(DenyReason::NoActiveScope { facility }))
                }
            }
            Ownership::Unattributed | Ownership::TenantWide => Ok(ScopeDecision::Permit),
        }
    }

    /// Referential checks for a row about to be written, applied to every
    /// caller including admins: shape, facility tenant, parent existence.
    ///
    /// # Errors
    ///
    /// `MalformedRow`, `Forbidden` for a facility of another tenant,
    /// `DanglingReference` for a missing parent.
    pub fn validate_row(&self, ctx: &SessionContext, row: &EntityRow) -> Result<(), AccessError> {
        row.check_shape()?;
        if let Some(facility) = row.facility_id {
            match self.scopes.facility_tenant(facility)? {
                Some(tenant) if tenant == ctx.tenant_id => {}
                Some(row_tenant) => {
                    return Err(AccessError::Forbidden {
                        reason: DenyReason::TenantMismatch {
                            caller_tenant: ctx.tenant_id,
                            row_tenant,
                        },
                    })
                }
                None => {
                    return Err(StoreError::NotFound {
                        table: "facility",
                        id: facility.to_string(),
                    }
                    .into())
                }
            }
        }
        if let OwnershipPath::Parent(parent_type) = row.entity_type.ownership() {
            self.parent_of(ctx, row, parent_type)?;
        }
        Ok(())
    }
}

/// Read one row through its guarded table, mapping a missing row to
/// [`AccessError::NotFound`].
pub(crate) fn fetch(
    entities: &EntityStore,
    ctx: &SessionContext,
    entity_type: EntityType,
    id: RecordId,
) -> Result<EntityRow, AccessError> {
    match entities.table(entity_type)?.get(ctx, id) {
        Ok(row) => Ok(row),
        Err(StoreError::NotFound { .. }) => Err(AccessError::NotFound { entity_type, id }),
        Err(other) => Err(other.into()),
    }
}
