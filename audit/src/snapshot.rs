//! Calculation snapshots: sealed input/result bundle pairs.
//!
//! # State machine
//!
//! `unlocked → locked`. Locked is terminal. The transition is taken under
//! the snapshot table's write lock, and [`SnapshotLockGuard`] checks every
//! later update or delete against the row's current `locked` flag inside
//! that same lock. A write racing a lock either lands before the lock or is
//! rejected; it never lands on a locked row.

use mrv_access::context::{FacilityId, SessionContext, SnapshotId, TenantId, UserId};
use mrv_access::error::GuardViolation;
use mrv_access::store::{Change, GuardedTable, TenantOwned, WriteGuard, WriteOp};
use mrv_kernel::bundle::{BundleError, CanonicalBundle};
use mrv_kernel::canon::{canonical_json_bytes, strip_keys};
use mrv_kernel::hash::{canonical_hash, ContentHash, HashDomain};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AuditConfig;
use crate::error::AuditError;

/// A dataset the calculation read, by name and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub name: String,
    pub location: String,
}

/// Everything needed to re-run the calculation behind a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayDescriptor {
    pub dataset_refs: Vec<DatasetRef>,
    pub config: serde_json::Value,
    pub factor_set_version: String,
    pub methodology: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub tenant_id: TenantId,
    pub facility_id: Option<FacilityId>,
    pub engine_version: String,
    pub replay: ReplayDescriptor,
    pub input_bundle: CanonicalBundle,
    pub result_bundle: CanonicalBundle,
    pub previous_snapshot_hash: Option<ContentHash>,
    pub shared_with_client: bool,
    pub locked: bool,
    pub locked_by: Option<UserId>,
}

impl TenantOwned for Snapshot {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

#[derive(Serialize)]
struct SealedFields<'a> {
    id: SnapshotId,
    tenant_id: TenantId,
    facility_id: Option<FacilityId>,
    engine_version: &'a str,
    replay: &'a ReplayDescriptor,
    input_hash: &'a ContentHash,
    result_hash: &'a ContentHash,
    previous_snapshot_hash: Option<&'a ContentHash>,
}

impl Snapshot {
    #[must_use]
    pub fn input_hash(&self) -> &ContentHash {
        &self.input_bundle.hash
    }

    #[must_use]
    pub fn result_hash(&self) -> &ContentHash {
        &self.result_bundle.hash
    }

    /// Canonical JSON of the sealed fields. Excludes the mutable flags
    /// (`locked`, `locked_by`, `shared_with_client`) and the bundle bytes,
    /// which are covered by their hashes.
    ///
    /// # Errors
    ///
    /// [`BundleError::Canon`] if the replay config holds an unrepresentable
    /// number.
    pub fn record_bytes(&self) -> Result<Vec<u8>, BundleError> {
        let sealed = SealedFields {
            id: self.id,
            tenant_id: self.tenant_id,
            facility_id: self.facility_id,
            engine_version: &self.engine_version,
            replay: &self.replay,
            input_hash: self.input_hash(),
            result_hash: self.result_hash(),
            previous_snapshot_hash: self.previous_snapshot_hash.as_ref(),
        };
        let value = serde_json::to_value(&sealed).map_err(|e| BundleError::NotJson {
            detail: e.to_string(),
        })?;
        Ok(canonical_json_bytes(&value)?)
    }

    /// Hash of [`Self::record_bytes`]; feeds the next snapshot's
    /// `previous_snapshot_hash`.
    ///
    /// # Errors
    ///
    /// See [`Self::record_bytes`].
    pub fn record_hash(&self) -> Result<ContentHash, BundleError> {
        Ok(canonical_hash(
            HashDomain::SnapshotRecord,
            &self.record_bytes()?,
        ))
    }

    /// Re-check both bundles against their stored hashes.
    ///
    /// # Errors
    ///
    /// The first [`BundleError`] found.
    pub fn verify_bundles(&self) -> Result<(), BundleError> {
        self.input_bundle.verify(HashDomain::InputBundle)?;
        self.result_bundle.verify(HashDomain::ResultBundle)
    }
}

/// Storage-level immutability for locked snapshots.
///
/// Rejects any update or delete whose current row is locked. Unlocking is
/// therefore impossible: it would be an update of a locked row.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotLockGuard;

impl WriteGuard<Snapshot> for SnapshotLockGuard {
    fn name(&self) -> &'static str {
        "snapshot_lock"
    }

    fn check_write(
        &self,
        _ctx: &SessionContext,
        op: WriteOp<'_, Snapshot>,
    ) -> Result<(), GuardViolation> {
        match op {
            WriteOp::Insert { .. } => Ok(()),
            WriteOp::Update { current, .. } if current.locked => Err(GuardViolation::Immutable {
                id: current.id.to_string(),
                detail: "update of locked snapshot".into(),
            }),
            WriteOp::Delete { current } if current.locked => Err(GuardViolation::Immutable {
                id: current.id.to_string(),
                detail: "delete of locked snapshot".into(),
            }),
            WriteOp::Update { .. } | WriteOp::Delete { .. } => Ok(()),
        }
    }
}

/// Input to [`SnapshotManager::create_snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    pub facility_id: Option<FacilityId>,
    pub engine_version: String,
    pub replay: ReplayDescriptor,
    pub input: serde_json::Value,
    pub result: serde_json::Value,
    pub previous_snapshot_hash: Option<ContentHash>,
    pub lock_after_create: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    AlreadyLocked,
}

#[derive(Debug)]
pub struct SnapshotManager {
    table: GuardedTable<SnapshotId, Snapshot>,
    volatile_keys: Vec<String>,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            table: GuardedTable::new("calculation_snapshot").with_guard(SnapshotLockGuard),
            volatile_keys: config.volatile_keys(),
        }
    }

    #[must_use]
    pub fn volatile_keys(&self) -> &[String] {
        &self.volatile_keys
    }

    /// Canonicalize a bundle the way snapshots seal it: volatile keys
    /// stripped, then hashed under `domain`.
    ///
    /// # Errors
    ///
    /// [`BundleError::Canon`].
    pub fn seal(
        &self,
        domain: HashDomain,
        value: &serde_json::Value,
    ) -> Result<CanonicalBundle, BundleError> {
        CanonicalBundle::from_value(domain, &strip_keys(value, &self.volatile_keys))
    }

    /// # Errors
    ///
    /// [`AuditError::Bundle`] if a bundle cannot be canonicalized.
    pub fn create_snapshot(
        &self,
        ctx: &SessionContext,
        request: SnapshotRequest,
    ) -> Result<Snapshot, AuditError> {
        let input_bundle = self.seal(HashDomain::InputBundle, &request.input)?;
        let result_bundle = self.seal(HashDomain::ResultBundle, &request.result)?;
        let snapshot = Snapshot {
            id: SnapshotId::new_v4(),
            tenant_id: ctx.tenant_id,
            facility_id: request.facility_id,
            engine_version: request.engine_version,
            replay: request.replay,
            input_bundle,
            result_bundle,
            previous_snapshot_hash: request.previous_snapshot_hash,
            shared_with_client: false,
            locked: request.lock_after_create,
            locked_by: request.lock_after_create.then_some(ctx.user_id),
        };
        self.table.insert(ctx, snapshot.id, snapshot.clone())?;
        info!(
            tenant = %ctx.tenant_id,
            user = %ctx.user_id,
            snapshot_id = %snapshot.id,
            input_hash = %snapshot.input_hash(),
            result_hash = %snapshot.result_hash(),
            locked = snapshot.locked,
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Idempotent lock. Concurrent callers all see `locked = true` afterwards;
    /// exactly one of them gets [`LockOutcome::Locked`].
    ///
    /// # Errors
    ///
    /// `Forbidden`, `NotFound`.
    pub fn lock(&self, ctx: &SessionContext, id: SnapshotId) -> Result<LockOutcome, AuditError> {
        let mut outcome = LockOutcome::AlreadyLocked;
        self.table
            .update(ctx, id, |current: &Snapshot| -> Result<_, AuditError> {
                if current.locked {
                    return Ok(Change::Keep);
                }
                outcome = LockOutcome::Locked;
                Ok(Change::Replace(Snapshot {
                    locked: true,
                    locked_by: Some(ctx.user_id),
                    ..current.clone()
                }))
            })
            .map_err(|e| not_found(e, id))?;
        match outcome {
            LockOutcome::Locked => info!(
                tenant = %ctx.tenant_id,
                user = %ctx.user_id,
                snapshot_id = %id,
                "snapshot locked"
            ),
            LockOutcome::AlreadyLocked => debug!(snapshot_id = %id, "snapshot already locked"),
        }
        Ok(outcome)
    }

    fn modify<F>(
        &self,
        ctx: &SessionContext,
        id: SnapshotId,
        edit: F,
    ) -> Result<Snapshot, AuditError>
    where
        F: FnOnce(&mut Snapshot),
    {
        self.table
            .update(ctx, id, |current: &Snapshot| -> Result<_, AuditError> {
                let mut next = current.clone();
                edit(&mut next);
                Ok(Change::Replace(next))
            })
            .map_err(|e| not_found(e, id))
    }

    /// # Errors
    ///
    /// [`AuditError::ImmutableViolation`] when locked.
    pub fn set_shared_with_client(
        &self,
        ctx: &SessionContext,
        id: SnapshotId,
        shared: bool,
    ) -> Result<Snapshot, AuditError> {
        self.modify(ctx, id, |s| s.shared_with_client = shared)
    }

    /// # Errors
    ///
    /// [`AuditError::ImmutableViolation`] when locked.
    pub fn update_engine_version(
        &self,
        ctx: &SessionContext,
        id: SnapshotId,
        engine_version: &str,
    ) -> Result<Snapshot, AuditError> {
        self.modify(ctx, id, |s| s.engine_version = engine_version.to_string())
    }

    /// Store-level update used by administrative tooling. Goes through the
    /// same guards as every other write.
    ///
    /// # Errors
    ///
    /// [`AuditError::ImmutableViolation`] when locked.
    pub fn replace(
        &self,
        ctx: &SessionContext,
        id: SnapshotId,
        edit: impl FnOnce(&mut Snapshot),
    ) -> Result<Snapshot, AuditError> {
        self.modify(ctx, id, edit)
    }

    /// # Errors
    ///
    /// [`AuditError::ImmutableViolation`] when locked.
    pub fn delete(&self, ctx: &SessionContext, id: SnapshotId) -> Result<(), AuditError> {
        self.table
            .delete(ctx, id, |_: &Snapshot| Ok::<_, AuditError>(()))
            .map_err(|e| not_found(e, id))?;
        info!(tenant = %ctx.tenant_id, snapshot_id = %id, "snapshot deleted");
        Ok(())
    }

    /// # Errors
    ///
    /// `Forbidden` for another tenant's snapshot, `NotFound`.
    pub fn get(&self, ctx: &SessionContext, id: SnapshotId) -> Result<Snapshot, AuditError> {
        self.table
            .get(ctx, id)
            .map_err(|e| not_found(AuditError::from(e), id))
    }

    /// The caller's tenant's snapshots, ordered by id.
    ///
    /// # Errors
    ///
    /// [`AuditError::Store`] on a poisoned table.
    pub fn list(&self, ctx: &SessionContext) -> Result<Vec<Snapshot>, AuditError> {
        Ok(self
            .table
            .scan(ctx)?
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .collect())
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(&AuditConfig::default())
    }
}

fn not_found(err: AuditError, id: SnapshotId) -> AuditError {
    match err {
        AuditError::Store(mrv_access::error::StoreError::NotFound { .. }) => {
            AuditError::NotFound { snapshot_id: id }
        }
        other => other,
    }
}
