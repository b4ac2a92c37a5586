//! Entity types and their ownership paths.
//!
//! The ownership table is static: every entity type declares how a row of
//! that type reaches its owning facility. The resolver never inspects
//! foreign keys at runtime. The table is acyclic and every chain ends at a
//! facility-bearing type within [`MAX_OWNERSHIP_HOPS`] parent hops.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::context::{FacilityId, RecordId, TenantId};
use crate::context::SessionContext;
use crate::error::{AccessError, StoreError};
use crate::store::{GuardedTable, TenantOwned};

/// Upper bound on parent hops walked by the resolver.
pub const MAX_OWNERSHIP_HOPS: usize = 4;

/// Visibility policy for compliance-check rows.
///
/// Compliance checks are aggregate, tenant-level results. They stay
/// tenant-isolated but are not facility-scoped. Switching this constant to
/// [`ComplianceCheckVisibility::FacilityScoped`] routes them through their
/// `facility_id` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceCheckVisibility {
    TenantWide,
    FacilityScoped,
}

pub const COMPLIANCE_CHECK_VISIBILITY: ComplianceCheckVisibility =
    ComplianceCheckVisibility::TenantWide;

/// How a row of a given type reaches its owning facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipPath {
    /// The row is a facility; its `facility_id` names itself.
    SelfFacility,
    /// The row carries a required `facility_id`.
    Facility,
    /// The row carries an optional `facility_id`. Unattributed rows are
    /// tenant-level and visible to every user of the tenant.
    NullableFacility,
    /// The row's `parent_id` points at a row of the given type.
    Parent(EntityType),
    /// Tenant isolation only; no facility scope applies.
    TenantOnly,
}

macro_rules! define_entity_types {
    ($( $variant:ident => $name:literal, $path:expr; )+) => {
        /// Every scoped entity type known to the access layer.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum EntityType {
            $( $variant, )+
        }

        impl EntityType {
            /// All entity types in declaration order.
            pub const ALL: &[EntityType] = &[ $( Self::$variant, )+ ];

            /// Table name of this entity type.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )+
                }
            }

            /// The declared ownership path.
            #[must_use]
            pub const fn ownership(self) -> OwnershipPath {
                match self {
                    $( Self::$variant => $path, )+
                }
            }
        }

        impl FromStr for EntityType {
            type Err = AccessError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $name => Ok(Self::$variant), )+
                    other => Err(AccessError::Configuration {
                        detail: format!("unknown entity type {other:?}"),
                    }),
                }
            }
        }
    };
}

define_entity_types! {
    Facility => "facility", OwnershipPath::SelfFacility;
    ActivityRecord => "activity_record", OwnershipPath::Facility;
    FuelActivity => "fuel_activity", OwnershipPath::Parent(EntityType::ActivityRecord);
    ElectricityActivity => "electricity_activity",
        OwnershipPath::Parent(EntityType::ActivityRecord);
    ProcessActivity => "process_activity", OwnershipPath::Parent(EntityType::ActivityRecord);
    CalculationRun => "calculation_run", OwnershipPath::Facility;
    MonitoringPlan => "monitoring_plan", OwnershipPath::Facility;
    VerificationCase => "verification_case", OwnershipPath::Facility;
    VerificationFinding => "verification_finding",
        OwnershipPath::Parent(EntityType::VerificationCase);
    CorrectiveAction => "corrective_action", OwnershipPath::Parent(EntityType::VerificationFinding);
    Scenario => "scenario", OwnershipPath::Facility;
    ScenarioAssumption => "scenario_assumption", OwnershipPath::Parent(EntityType::Scenario);
    ReportLine => "report_line", OwnershipPath::NullableFacility;
    ComplianceCheck => "compliance_check", compliance_check_path();
}

const fn compliance_check_path() -> OwnershipPath {
    match COMPLIANCE_CHECK_VISIBILITY {
        ComplianceCheckVisibility::TenantWide => OwnershipPath::TenantOnly,
        ComplianceCheckVisibility::FacilityScoped => OwnershipPath::Facility,
    }
}

impl EntityType {
    /// Types whose rows name a row of this type as their parent.
    pub fn children(self) -> impl Iterator<Item = EntityType> {
        EntityType::ALL
            .iter()
            .copied()
            .filter(move |ty| ty.ownership() == OwnershipPath::Parent(self))
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a scoped entity table.
///
/// `tenant_id` is stamped from the session on insert and checked by the
/// storage guard on every access. `facility_id` and `parent_id` are the
/// ownership columns; which one is required depends on the type's
/// [`OwnershipPath`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub tenant_id: TenantId,
    pub facility_id: Option<FacilityId>,
    pub parent_id: Option<RecordId>,
    pub data: serde_json::Value,
}

impl TenantOwned for EntityRow {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl EntityRow {
    /// Check that the ownership columns fit the type's path.
    ///
    /// # Errors
    ///
    /// [`AccessError::MalformedRow`] naming the offending column.
    pub fn check_shape(&self) -> Result<(), AccessError> {
        let malformed = |detail: &str| AccessError::MalformedRow {
            entity_type: self.entity_type,
            detail: detail.to_string(),
        };
        match self.entity_type.ownership() {
            OwnershipPath::SelfFacility | OwnershipPath::Facility => {
                if self.facility_id.is_none() {
                    return Err(malformed("facility_id is required"));
                }
                if self.parent_id.is_some() {
                    return Err(malformed("parent_id is not allowed"));
                }
            }
            OwnershipPath::Parent(_) => {
                if self.parent_id.is_none() {
                    return Err(malformed("parent_id is required"));
                }
            }
            OwnershipPath::NullableFacility | OwnershipPath::TenantOnly => {
                if self.parent_id.is_some() {
                    return Err(malformed("parent_id is not allowed"));
                }
            }
        }
        Ok(())
    }
}

/// One guarded table per entity type.
///
/// Writes on a type that takes part in a parent link, as parent or child,
/// hold the structure lock for their whole check-then-write sequence. It is
/// always taken before any table lock.
#[derive(Debug)]
pub struct EntityStore {
    tables: BTreeMap<EntityType, GuardedTable<RecordId, EntityRow>>,
    structure: Mutex<()>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: EntityType::ALL
                .iter()
                .map(|ty| (*ty, GuardedTable::new(ty.as_str())))
                .collect(),
            structure: Mutex::new(()),
        }
    }

    /// Serialize parent-link changes across tables.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`].
    pub fn structure_lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.structure.lock().map_err(|_| StoreError::Poisoned {
            table: "entity_structure",
        })
    }

    /// First row of the session tenant whose `parent_id` is `id`, across
    /// every child type of `parent_type`.
    ///
    /// # Errors
    ///
    /// A store error from any child table.
    pub fn first_child(
        &self,
        ctx: &SessionContext,
        parent_type: EntityType,
        id: RecordId,
    ) -> Result<Option<EntityRow>, AccessError> {
        for child_type in parent_type.children() {
            let found = self
                .table(child_type)?
                .find(ctx, |row| row.parent_id == Some(id))?;
            if let Some((_, row)) = found {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// The table holding rows of `entity_type`.
    ///
    /// # Errors
    ///
    /// [`AccessError::Configuration`] if no table is registered for the type.
    pub fn table(
        &self,
        entity_type: EntityType,
    ) -> Result<&GuardedTable<RecordId, EntityRow>, AccessError> {
        self.tables
            .get(&entity_type)
            .ok_or_else(|| AccessError::Configuration {
                detail: format!("no table registered for {entity_type}"),
            })
    }
}

/// Number of parent hops from `entity_type` to a facility-bearing type.
#[must_use]
pub fn chain_depth(entity_type: EntityType) -> usize {
    let mut depth = 0;
    let mut current = entity_type;
    while let OwnershipPath::Parent(parent) = current.ownership() {
        depth += 1;
        if depth > EntityType::ALL.len() {
            break;
        }
        current = parent;
    }
    depth
}
