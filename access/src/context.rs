//! Session context and identifier newtypes.
//!
//! Every scoped operation receives a [`SessionContext`]. It is the only
//! source of authorization truth: tenant, user and roles are never read from
//! a row payload.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role string that marks a caller as administrator.
pub const ADMIN_ROLE: &str = "admin";

macro_rules! define_ids {
    ($( $(#[$meta:meta])* $name:ident ),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            #[derive(Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// Fresh random identifier.
                #[must_use]
                pub fn new_v4() -> Self {
                    Self(Uuid::new_v4())
                }

                #[must_use]
                pub const fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                #[must_use]
                pub const fn as_uuid(&self) -> &Uuid {
                    &self.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    self.0.fmt(f)
                }
            }
        )+
    };
}

define_ids! {
    /// Customer organization; the isolation boundary.
    TenantId,
    UserId,
    /// Site owned by a tenant; the unit of scope below the tenant.
    FacilityId,
    /// Row identifier for scoped entity tables.
    RecordId,
    /// Calculation snapshot identifier.
    SnapshotId,
}

/// Ambient caller identity carried by every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub roles: BTreeSet<String>,
}

impl SessionContext {
    #[must_use]
    pub fn new<I, S>(tenant_id: TenantId, user_id: UserId, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant_id,
            user_id,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// True when the role set contains [`ADMIN_ROLE`].
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_ROLE)
    }
}
