//! Append-only, hash-chained log of access decisions.
//!
//! Each entry commits to the previous entry's hash, so removing or editing
//! an entry breaks [`AccessAuditLog::verify_chain`]. Entries carry a sequence
//! number rather than a wall-clock stamp.
//!
//! The log is bounded. Once it holds `capacity` entries the oldest entry is
//! evicted and its hash becomes the chain anchor, so the retained suffix
//! still verifies. Reads are tenant-scoped and admin-only.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mrv_kernel::canon::canonical_json_bytes;
use mrv_kernel::hash::{canonical_hash, ContentHash, HashDomain};
use serde::{Deserialize, Serialize};

use crate::context::{RecordId, SessionContext, TenantId, UserId};
use crate::entity::EntityType;
use crate::error::{require_admin, AccessError, DenyReason, StoreError};

const TABLE: &str = "access_audit_log";

/// Entries retained by [`AccessAuditLog::new`].
pub const DEFAULT_AUDIT_LOG_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOp {
    Read,
    Insert,
    Update,
    Delete,
    List,
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    /// Scope check skipped because the caller holds the admin role.
    AdminBypass,
    Denied { reason: DenyReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAuditEntry {
    pub seq: u64,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub op: AccessOp,
    pub entity_type: EntityType,
    pub entity_id: Option<RecordId>,
    pub decision: AccessDecision,
    pub prev_hash: Option<ContentHash>,
    pub entry_hash: ContentHash,
}

#[derive(Serialize)]
struct EntryBody<'a> {
    seq: u64,
    tenant_id: TenantId,
    user_id: UserId,
    op: AccessOp,
    entity_type: EntityType,
    entity_id: Option<RecordId>,
    decision: &'a AccessDecision,
    prev_hash: Option<&'a ContentHash>,
}

impl AccessAuditEntry {
    fn body(&self) -> EntryBody<'_> {
        EntryBody {
            seq: self.seq,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            op: self.op,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            decision: &self.decision,
            prev_hash: self.prev_hash.as_ref(),
        }
    }
}

fn hash_body(body: &EntryBody<'_>) -> Result<ContentHash, StoreError> {
    let encoding = |detail: String| StoreError::Encoding {
        table: TABLE,
        detail,
    };
    let value = serde_json::to_value(body).map_err(|e| encoding(e.to_string()))?;
    let bytes = canonical_json_bytes(&value).map_err(|e| encoding(e.to_string()))?;
    Ok(canonical_hash(HashDomain::AccessAuditEntry, &bytes))
}

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<AccessAuditEntry>,
    /// Hash of the last evicted entry.
    anchor: Option<ContentHash>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct AccessAuditLog {
    state: Mutex<LogState>,
    capacity: usize,
}

impl Default for AccessAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_LOG_CAPACITY)
    }

    /// A log retaining at most `capacity` entries (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>, StoreError> {
        self.state
            .lock()
            .map_err(|_: PoisonError<_>| StoreError::Poisoned { table: TABLE })
    }

    /// Append one decision and return its entry hash.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`] or [`StoreError::Encoding`].
    pub fn record(
        &self,
        ctx: &SessionContext,
        op: AccessOp,
        entity_type: EntityType,
        entity_id: Option<RecordId>,
        decision: AccessDecision,
    ) -> Result<ContentHash, StoreError> {
        let mut state = self.lock()?;
        let prev_hash = state
            .entries
            .back()
            .map(|e| e.entry_hash.clone())
            .or_else(|| state.anchor.clone());
        let seq = state.next_seq;
        let body = EntryBody {
            seq,
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            op,
            entity_type,
            entity_id,
            decision: &decision,
            prev_hash: prev_hash.as_ref(),
        };
        let entry_hash = hash_body(&body)?;
        if state.entries.len() == self.capacity {
            let evicted = state.entries.pop_front().map(|e| e.entry_hash);
            state.anchor = evicted;
        }
        state.entries.push_back(AccessAuditEntry {
            seq,
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            op,
            entity_type,
            entity_id,
            decision,
            prev_hash,
            entry_hash: entry_hash.clone(),
        });
        state.next_seq += 1;
        Ok(entry_hash)
    }

    /// Retained entries of the caller's tenant, in append order.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the caller is an admin, or a poisoned log.
    pub fn entries(&self, admin: &SessionContext) -> Result<Vec<AccessAuditEntry>, AccessError> {
        require_admin(admin)?;
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.tenant_id == admin.tenant_id)
            .cloned()
            .collect())
    }

    /// Admin-bypass entries of the caller's tenant.
    ///
    /// # Errors
    ///
    /// As [`Self::entries`].
    pub fn admin_bypasses(
        &self,
        admin: &SessionContext,
    ) -> Result<Vec<AccessAuditEntry>, AccessError> {
        Ok(self
            .entries(admin)?
            .into_iter()
            .filter(|e| e.decision == AccessDecision::AdminBypass)
            .collect())
    }

    /// Recompute every retained entry hash and check the chain links,
    /// starting from the eviction anchor.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] naming the first broken entry.
    pub fn verify_chain(&self) -> Result<(), StoreError> {
        let state = self.lock()?;
        let first_seq = state.next_seq - state.entries.len() as u64;
        let mut prev = state.anchor.as_ref();
        for (offset, entry) in (0_u64..).zip(state.entries.iter()) {
            let seq = first_seq + offset;
            let corrupt = |detail: &str| StoreError::Corrupt {
                table: TABLE,
                detail: format!("entry {seq}: {detail}"),
            };
            if entry.seq != seq {
                return Err(corrupt("sequence gap"));
            }
            if entry.prev_hash.as_ref() != prev {
                return Err(corrupt("prev_hash does not match preceding entry"));
            }
            if hash_body(&entry.body())? != entry.entry_hash {
                return Err(corrupt("entry_hash mismatch"));
            }
            prev = Some(&entry.entry_hash);
        }
        Ok(())
    }
}
