//! User to facility scope assignments.
//!
//! Rows are soft-disabled on revoke and never deleted, so the history of who
//! held which scope survives. Only an admin of the same tenant may change
//! them. Reads are unrestricted inside the crate; the resolver is the only
//! consumer that makes access decisions from them.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::{FacilityId, SessionContext, TenantId, UserId};
use crate::error::{require_admin, AccessError, DenyReason, StoreError};

const TABLE: &str = "user_facility_scope";

/// What a scoped user may do on a facility. Carried for UI visibility;
/// access decisions only look at `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeRole {
    Viewer,
    Editor,
    Verifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityScope {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub facility_id: FacilityId,
    pub scope_role: ScopeRole,
    pub active: bool,
}

type ScopeKey = (TenantId, UserId, FacilityId);

/// Facility registry plus the `UserFacilityScope` relation.
#[derive(Debug, Default)]
pub struct ScopeStore {
    facilities: RwLock<BTreeMap<FacilityId, TenantId>>,
    scopes: RwLock<BTreeMap<ScopeKey, FacilityScope>>,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Poisoned { table: TABLE }
}

impl ScopeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a facility for the caller's tenant.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the caller is an admin; `DuplicateId` if the id is
    /// already registered.
    pub fn register_facility(
        &self,
        admin: &SessionContext,
        facility: FacilityId,
    ) -> Result<(), AccessError> {
        require_admin(admin)?;
        let mut facilities = self.facilities.write().map_err(poisoned)?;
        if facilities.contains_key(&facility) {
            return Err(StoreError::DuplicateId {
                table: "facility",
                id: facility.to_string(),
            }
            .into());
        }
        facilities.insert(facility, admin.tenant_id);
        Ok(())
    }

    /// Tenant that owns `facility`, if registered.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`].
    pub fn facility_tenant(&self, facility: FacilityId) -> Result<Option<TenantId>, StoreError> {
        Ok(self.facilities.read().map_err(poisoned)?.get(&facility).copied())
    }

    fn check_facility(
        &self,
        ctx: &SessionContext,
        facility: FacilityId,
    ) -> Result<(), AccessError> {
        match self.facility_tenant(facility)? {
            Some(tenant) if tenant == ctx.tenant_id => Ok(()),
            Some(row_tenant) => Err(AccessError::Forbidden {
                reason: DenyReason::TenantMismatch {
                    caller_tenant: ctx.tenant_id,
                    row_tenant,
                },
            }),
            None => Err(StoreError::NotFound {
                table: "facility",
                id: facility.to_string(),
            }
            .into()),
        }
    }

    /// Grant (or re-activate) a scope. Upserts the role.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the caller is an admin of the facility's tenant.
    pub fn grant(
        &self,
        admin: &SessionContext,
        user: UserId,
        facility: FacilityId,
        scope_role: ScopeRole,
    ) -> Result<(), AccessError> {
        require_admin(admin)?;
        self.check_facility(admin, facility)?;
        let mut scopes = self.scopes.write().map_err(poisoned)?;
        scopes.insert(
            (admin.tenant_id, user, facility),
            FacilityScope {
                tenant_id: admin.tenant_id,
                user_id: user,
                facility_id: facility,
                scope_role,
                active: true,
            },
        );
        info!(
            tenant = %admin.tenant_id,
            admin = %admin.user_id,
            user = %user,
            facility = %facility,
            ?scope_role,
            "facility scope granted"
        );
        Ok(())
    }

    /// Soft-disable a scope. The row stays.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the caller is an admin; `NotFound` if no such row.
    pub fn revoke(
        &self,
        admin: &SessionContext,
        user: UserId,
        facility: FacilityId,
    ) -> Result<(), AccessError> {
        require_admin(admin)?;
        let mut scopes = self.scopes.write().map_err(poisoned)?;
        let row = scopes
            .get_mut(&(admin.tenant_id, user, facility))
            .ok_or_else(|| StoreError::NotFound {
                table: TABLE,
                id: format!("{user}/{facility}"),
            })?;
        row.active = false;
        info!(
            tenant = %admin.tenant_id,
            admin = %admin.user_id,
            user = %user,
            facility = %facility,
            "facility scope revoked"
        );
        Ok(())
    }

    /// True iff an active scope row exists for the triple.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`].
    pub fn is_active(
        &self,
        tenant: TenantId,
        user: UserId,
        facility: FacilityId,
    ) -> Result<bool, StoreError> {
        let scopes = self.scopes.read().map_err(poisoned)?;
        Ok(scopes
            .get(&(tenant, user, facility))
            .is_some_and(|row| row.active))
    }

    /// Active scopes of one user, ordered by facility id.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`].
    pub fn scopes_for(
        &self,
        tenant: TenantId,
        user: UserId,
    ) -> Result<Vec<FacilityScope>, StoreError> {
        let scopes = self.scopes.read().map_err(poisoned)?;
        Ok(scopes
            .values()
            .filter(|row| row.tenant_id == tenant && row.user_id == user && row.active)
            .cloned()
            .collect())
    }

    /// Every scope row of the caller's tenant, including revoked ones.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the caller is an admin.
    pub fn history(&self, admin: &SessionContext) -> Result<Vec<FacilityScope>, AccessError> {
        require_admin(admin)?;
        let scopes = self.scopes.read().map_err(poisoned)?;
        Ok(scopes
            .values()
            .filter(|row| row.tenant_id == admin.tenant_id)
            .cloned()
            .collect())
    }
}
