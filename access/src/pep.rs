//! Policy enforcement point.
//!
//! Wraps every read and write on the scoped entity tables. Checks run in a
//! fixed order:
//!
//! 1. tenant match, unconditional (admins included);
//! 2. admin bypass, an explicit early return that is logged under its own
//!    target and recorded as [`AccessDecision::AdminBypass`];
//! 3. facility scope via [`ScopeResolver::check_row`].
//!
//! Single-row operations fail with `Forbidden`; only [`PolicyEnforcementPoint::list`]
//! filters.
//!
//! Parent rows are delete-restricted: a row that any child row still names
//! as its parent cannot be deleted. Writes on any type that takes part in a
//! parent link hold [`EntityStore::structure_lock`], so a child insert and a
//! parent delete never interleave.

use std::sync::{Arc, MutexGuard};

use tracing::{debug, info, warn};

use crate::audit_log::{AccessAuditLog, AccessDecision, AccessOp};
use crate::context::{FacilityId, RecordId, SessionContext};
use crate::entity::{EntityRow, EntityStore, EntityType, OwnershipPath};
use crate::error::{AccessError, DenyReason};
use crate::resolver::{fetch, ScopeDecision, ScopeResolver};
use crate::scope_store::ScopeStore;
use crate::store::Change;

/// Target used for admin-bypass events.
pub const ADMIN_BYPASS_TARGET: &str = "mrv_access::admin_bypass";

/// A row to insert. Tenant and id are assigned by the enforcement point.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDraft {
    pub entity_type: EntityType,
    pub facility_id: Option<FacilityId>,
    pub parent_id: Option<RecordId>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct PolicyEnforcementPoint {
    resolver: ScopeResolver,
    entities: Arc<EntityStore>,
    audit: Arc<AccessAuditLog>,
}

impl PolicyEnforcementPoint {
    #[must_use]
    pub fn new(scopes: Arc<ScopeStore>, entities: Arc<EntityStore>) -> Self {
        Self {
            resolver: ScopeResolver::new(scopes, Arc::clone(&entities)),
            entities,
            audit: Arc::new(AccessAuditLog::new()),
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    #[must_use]
    pub fn audit_log(&self) -> &AccessAuditLog {
        &self.audit
    }

    fn deny(
        &self,
        ctx: &SessionContext,
        op: AccessOp,
        entity_type: EntityType,
        entity_id: Option<RecordId>,
        reason: DenyReason,
    ) -> AccessError {
        warn!(
            tenant = %ctx.tenant_id,
            user = %ctx.user_id,
            ?op,
            entity_type = %entity_type,
            entity_id = ?entity_id,
            %reason,
            "access denied"
        );
        if let Err(err) = self.audit.record(
            ctx,
            op,
            entity_type,
            entity_id,
            AccessDecision::Denied {
                reason: reason.clone(),
            },
        ) {
            return err.into();
        }
        AccessError::Forbidden { reason }
    }

    /// Audit a tenant mismatch raised by the storage guard.
    fn audited<T>(
        &self,
        ctx: &SessionContext,
        op: AccessOp,
        entity_type: EntityType,
        entity_id: Option<RecordId>,
        result: Result<T, AccessError>,
    ) -> Result<T, AccessError> {
        match result {
            Err(AccessError::Forbidden {
                reason: reason @ DenyReason::TenantMismatch { .. },
            }) => Err(self.deny(ctx, op, entity_type, entity_id, reason)),
            other => other,
        }
    }

    fn authorize(
        &self,
        ctx: &SessionContext,
        op: AccessOp,
        row: &EntityRow,
    ) -> Result<(), AccessError> {
        if row.tenant_id != ctx.tenant_id {
            return Err(self.deny(
                ctx,
                op,
                row.entity_type,
                Some(row.id),
                DenyReason::TenantMismatch {
                    caller_tenant: ctx.tenant_id,
                    row_tenant: row.tenant_id,
                },
            ));
        }

        if ctx.is_admin() {
            info!(
                target: ADMIN_BYPASS_TARGET,
                tenant = %ctx.tenant_id,
                user = %ctx.user_id,
                ?op,
                entity_type = %row.entity_type,
                entity_id = %row.id,
                "admin bypass"
            );
            self.audit.record(
                ctx,
                op,
                row.entity_type,
                Some(row.id),
                AccessDecision::AdminBypass,
            )?;
            return Ok(());
        }

        match self.resolver.check_row(ctx, row)? {
            ScopeDecision::Permit => {
                debug!(
                    tenant = %ctx.tenant_id,
                    user = %ctx.user_id,
                    ?op,
                    entity_type = %row.entity_type,
                    entity_id = %row.id,
                    "access allowed"
                );
                self.audit.record(
                    ctx,
                    op,
                    row.entity_type,
                    Some(row.id),
                    AccessDecision::Allowed,
                )?;
                Ok(())
            }
            ScopeDecision::Deny(reason) => {
                Err(self.deny(ctx, op, row.entity_type, Some(row.id), reason))
            }
        }
    }

    /// Structure lock for writes on a type that is a parent or a child.
    fn link_lock(
        &self,
        entity_type: EntityType,
    ) -> Result<Option<MutexGuard<'_, ()>>, AccessError> {
        let linked = matches!(entity_type.ownership(), OwnershipPath::Parent(_))
            || entity_type.children().next().is_some();
        if linked {
            Ok(Some(self.entities.structure_lock()?))
        } else {
            Ok(None)
        }
    }

    /// Audited `CanAccess`. `Forbidden` from the scope check becomes `false`;
    /// a tenant mismatch stays an error.
    ///
    /// # Errors
    ///
    /// Tenant mismatch, `NotFound`, or a resolution error.
    pub fn can_access(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        id: RecordId,
    ) -> Result<bool, AccessError> {
        let row = self.audited(
            ctx,
            AccessOp::Check,
            entity_type,
            Some(id),
            fetch(&self.entities, ctx, entity_type, id),
        )?;
        match self.authorize(ctx, AccessOp::Check, &row) {
            Ok(()) => Ok(true),
            Err(AccessError::Forbidden {
                reason: DenyReason::NoActiveScope { .. },
            }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// # Errors
    ///
    /// `Forbidden`, `NotFound`, or a resolution error.
    pub fn read(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        id: RecordId,
    ) -> Result<EntityRow, AccessError> {
        let row = self.audited(
            ctx,
            AccessOp::Read,
            entity_type,
            Some(id),
            fetch(&self.entities, ctx, entity_type, id),
        )?;
        self.authorize(ctx, AccessOp::Read, &row)?;
        Ok(row)
    }

    /// Insert a row owned by the caller's tenant. The caller must be able to
    /// access the row being created.
    ///
    /// # Errors
    ///
    /// `MalformedRow`, `DanglingReference`, `Forbidden`, or a store error.
    pub fn insert(
        &self,
        ctx: &SessionContext,
        draft: EntityDraft,
    ) -> Result<RecordId, AccessError> {
        let _links = self.link_lock(draft.entity_type)?;
        let row = EntityRow {
            id: RecordId::new_v4(),
            entity_type: draft.entity_type,
            tenant_id: ctx.tenant_id,
            facility_id: draft.facility_id,
            parent_id: draft.parent_id,
            data: draft.data,
        };
        let validated = self.resolver.validate_row(ctx, &row);
        self.audited(ctx, AccessOp::Insert, row.entity_type, Some(row.id), validated)?;
        self.authorize(ctx, AccessOp::Insert, &row)?;
        let id = row.id;
        self.entities.table(row.entity_type)?.insert(ctx, id, row)?;
        Ok(id)
    }

    /// Read-modify-write one row. `edit` sees a copy of the current row.
    /// Access is checked on the row before and after the edit, inside the
    /// table's write lock.
    ///
    /// # Errors
    ///
    /// `Forbidden` when either side fails, `MalformedRow` when the edit
    /// changes `id` or `entity_type`, or a store error.
    pub fn update<F>(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        id: RecordId,
        edit: F,
    ) -> Result<EntityRow, AccessError>
    where
        F: FnOnce(&mut EntityRow),
    {
        let _links = self.link_lock(entity_type)?;
        self.audited(
            ctx,
            AccessOp::Update,
            entity_type,
            Some(id),
            fetch(&self.entities, ctx, entity_type, id),
        )?;
        self.entities
            .table(entity_type)?
            .update(ctx, id, |current: &EntityRow| {
                self.authorize(ctx, AccessOp::Update, current)?;
                let mut next = current.clone();
                edit(&mut next);
                if next.id != current.id || next.entity_type != current.entity_type {
                    return Err(AccessError::MalformedRow {
                        entity_type,
                        detail: "id and entity_type are immutable".into(),
                    });
                }
                let validated = self.resolver.validate_row(ctx, &next);
                self.audited(ctx, AccessOp::Update, entity_type, Some(id), validated)?;
                self.authorize(ctx, AccessOp::Update, &next)?;
                Ok(Change::Replace(next))
            })
    }

    /// Delete one row. A row still referenced by a child row is refused.
    ///
    /// # Errors
    ///
    /// `Forbidden`, `NotFound`, `StillReferenced`, or a store error.
    pub fn delete(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        id: RecordId,
    ) -> Result<(), AccessError> {
        let _links = self.link_lock(entity_type)?;
        self.audited(
            ctx,
            AccessOp::Delete,
            entity_type,
            Some(id),
            fetch(&self.entities, ctx, entity_type, id),
        )?;
        self.entities
            .table(entity_type)?
            .delete(ctx, id, |current: &EntityRow| {
                self.authorize(ctx, AccessOp::Delete, current)?;
                match self.entities.first_child(ctx, entity_type, id)? {
                    Some(child) => {
                        warn!(
                            tenant = %ctx.tenant_id,
                            entity_type = %entity_type,
                            entity_id = %id,
                            child_type = %child.entity_type,
                            child_id = %child.id,
                            "delete refused, row is still referenced"
                        );
                        Err(AccessError::StillReferenced {
                            entity_type,
                            id,
                            child_type: child.entity_type,
                            child_id: child.id,
                        })
                    }
                    None => Ok(()),
                }
            })?;
        Ok(())
    }

    /// Rows of `entity_type` the caller may see, in id order. Rows of other
    /// tenants are never returned; out-of-scope rows are filtered out, and
    /// so are rows whose parent chain no longer resolves.
    ///
    /// # Errors
    ///
    /// A configuration or store error aborts the listing.
    pub fn list(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
    ) -> Result<Vec<EntityRow>, AccessError> {
        let rows = self.entities.table(entity_type)?.scan(ctx)?;
        if ctx.is_admin() {
            info!(
                target: ADMIN_BYPASS_TARGET,
                tenant = %ctx.tenant_id,
                user = %ctx.user_id,
                entity_type = %entity_type,
                rows = rows.len(),
                "admin bypass on list"
            );
            self.audit
                .record(ctx, AccessOp::List, entity_type, None, AccessDecision::AdminBypass)?;
            return Ok(rows.into_iter().map(|(_, row)| row).collect());
        }
        let mut visible = Vec::with_capacity(rows.len());
        for (_, row) in rows {
            match self.resolver.check_row(ctx, &row) {
                Ok(ScopeDecision::Permit) => visible.push(row),
                Ok(ScopeDecision::Deny(_)) => {}
                Err(AccessError::DanglingReference { parent_id, .. }) => {
                    warn!(
                        tenant = %ctx.tenant_id,
                        entity_type = %entity_type,
                        entity_id = %row.id,
                        %parent_id,
                        "unresolvable row left out of listing"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        self.audit
            .record(ctx, AccessOp::List, entity_type, None, AccessDecision::Allowed)?;
        Ok(visible)
    }
}
