//! Guarded storage boundary.
//!
//! A [`GuardedTable`] is the only handle to a table's rows. Every write runs
//! its [`WriteGuard`] chain while the table's write lock is held, so guards
//! always see the row as it is at the moment of the write, never a copy read
//! earlier. [`TenantIsolationGuard`] is installed on every table and cannot
//! be removed. There is no unguarded accessor.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::context::{SessionContext, TenantId};
use crate::error::{GuardViolation, StoreError};

/// A row that belongs to exactly one tenant.
pub trait TenantOwned {
    fn tenant_id(&self) -> TenantId;
}

/// A write as seen by a guard.
#[derive(Debug)]
pub enum WriteOp<'a, R> {
    Insert { next: &'a R },
    Update { current: &'a R, next: &'a R },
    Delete { current: &'a R },
}

impl<R> Clone for WriteOp<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for WriteOp<'_, R> {}

impl<R> WriteOp<'_, R> {
    /// The row as it is stored before the write, if any.
    #[must_use]
    pub fn current(&self) -> Option<&R> {
        match self {
            Self::Insert { .. } => None,
            Self::Update { current, .. } | Self::Delete { current } => Some(current),
        }
    }

    /// The row as it will be stored after the write, if any.
    #[must_use]
    pub fn next(&self) -> Option<&R> {
        match self {
            Self::Insert { next } | Self::Update { next, .. } => Some(next),
            Self::Delete { .. } => None,
        }
    }
}

/// Write interceptor. Runs inside the table's write lock.
pub trait WriteGuard<R>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reject a read of `row`. Most guards only care about writes.
    ///
    /// # Errors
    ///
    /// Returns the violation that blocks the read.
    fn check_read(&self, _ctx: &SessionContext, _row: &R) -> Result<(), GuardViolation> {
        Ok(())
    }

    /// Reject a write.
    ///
    /// # Errors
    ///
    /// Returns the violation that blocks the write.
    fn check_write(&self, ctx: &SessionContext, op: WriteOp<'_, R>) -> Result<(), GuardViolation>;
}

/// Rejects any row whose tenant differs from the session tenant, both
/// before and after the write. Admin role grants no exception.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantIsolationGuard;

impl TenantIsolationGuard {
    fn check_row<R: TenantOwned>(ctx: &SessionContext, row: &R) -> Result<(), GuardViolation> {
        let row_tenant = row.tenant_id();
        if row_tenant == ctx.tenant_id {
            Ok(())
        } else {
            Err(GuardViolation::TenantMismatch {
                caller_tenant: ctx.tenant_id,
                row_tenant,
            })
        }
    }
}

impl<R: TenantOwned> WriteGuard<R> for TenantIsolationGuard {
    fn name(&self) -> &'static str {
        "tenant_isolation"
    }

    fn check_read(&self, ctx: &SessionContext, row: &R) -> Result<(), GuardViolation> {
        Self::check_row(ctx, row)
    }

    fn check_write(&self, ctx: &SessionContext, op: WriteOp<'_, R>) -> Result<(), GuardViolation> {
        if let Some(current) = op.current() {
            Self::check_row(ctx, current)?;
        }
        if let Some(next) = op.next() {
            Self::check_row(ctx, next)?;
        }
        Ok(())
    }
}

/// Outcome of a read-modify-write closure passed to [`GuardedTable::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<R> {
    /// Store this row in place of the current one.
    Replace(R),
    /// Leave the row untouched. Guards are not consulted.
    Keep,
}

/// A tenant-isolated, guard-checked table keyed by `K`.
pub struct GuardedTable<K, R> {
    name: &'static str,
    rows: RwLock<BTreeMap<K, R>>,
    guards: Vec<Box<dyn WriteGuard<R>>>,
}

impl<K, R> std::fmt::Debug for GuardedTable<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedTable")
            .field("name", &self.name)
            .field(
                "guards",
                &self.guards.iter().map(|g| g.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl<K, R> GuardedTable<K, R>
where
    K: Ord + Copy + std::fmt::Display,
    R: TenantOwned + Clone + 'static,
{
    /// Empty table with [`TenantIsolationGuard`] installed.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: RwLock::new(BTreeMap::new()),
            guards: vec![Box::new(TenantIsolationGuard)],
        }
    }

    /// Append a guard. Guards run in installation order.
    #[must_use]
    pub fn with_guard(mut self, guard: impl WriteGuard<R> + 'static) -> Self {
        self.guards.push(Box::new(guard));
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn poisoned<T>(&self, _: PoisonError<T>) -> StoreError {
        StoreError::Poisoned { table: self.name }
    }

    fn not_found(&self, id: K) -> StoreError {
        StoreError::NotFound {
            table: self.name,
            id: id.to_string(),
        }
    }

    fn run_read_guards(&self, ctx: &SessionContext, row: &R) -> Result<(), StoreError> {
        for guard in &self.guards {
            guard
                .check_read(ctx, row)
                .map_err(|violation| StoreError::Guard {
                    table: self.name,
                    guard: guard.name(),
                    violation,
                })?;
        }
        Ok(())
    }

    fn run_write_guards(&self, ctx: &SessionContext, op: WriteOp<'_, R>) -> Result<(), StoreError> {
        for guard in &self.guards {
            guard
                .check_write(ctx, op)
                .map_err(|violation| StoreError::Guard {
                    table: self.name,
                    guard: guard.name(),
                    violation,
                })?;
        }
        Ok(())
    }

    /// Fetch one row.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], or [`StoreError::Guard`] when a guard
    /// rejects the read (another tenant's row).
    pub fn get(&self, ctx: &SessionContext, id: K) -> Result<R, StoreError> {
        let rows = self.rows.read().map_err(|e| self.poisoned(e))?;
        let row = rows.get(&id).ok_or_else(|| self.not_found(id))?;
        self.run_read_guards(ctx, row)?;
        Ok(row.clone())
    }

    /// All rows of the session tenant that pass the read guards, in key order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`].
    pub fn scan(&self, ctx: &SessionContext) -> Result<Vec<(K, R)>, StoreError> {
        let rows = self.rows.read().map_err(|e| self.poisoned(e))?;
        Ok(rows
            .iter()
            .filter(|(_, row)| self.run_read_guards(ctx, row).is_ok())
            .map(|(id, row)| (*id, row.clone()))
            .collect())
    }

    /// First row of the session tenant matching `pred`, in key order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Poisoned`].
    pub fn find<P>(
        &self,
        ctx: &SessionContext,
        mut pred: P,
    ) -> Result<Option<(K, R)>, StoreError>
    where
        P: FnMut(&R) -> bool,
    {
        let rows = self.rows.read().map_err(|e| self.poisoned(e))?;
        Ok(rows
            .iter()
            .find(|(_, row)| self.run_read_guards(ctx, row).is_ok() && pred(row))
            .map(|(id, row)| (*id, row.clone())))
    }

    /// Insert a new row.
    ///
    /// Guards run first. An id held by another tenant's row fails its read
    /// guards, so only the owning tenant ever sees `DuplicateId`.
    ///
    /// # Errors
    ///
    /// A guard rejection, or [`StoreError::DuplicateId`] if `id` is taken.
    pub fn insert(&self, ctx: &SessionContext, id: K, row: R) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(|e| self.poisoned(e))?;
        self.run_write_guards(ctx, WriteOp::Insert { next: &row })?;
        if let Some(existing) = rows.get(&id) {
            self.run_read_guards(ctx, existing)?;
            return Err(StoreError::DuplicateId {
                table: self.name,
                id: id.to_string(),
            });
        }
        rows.insert(id, row);
        Ok(())
    }

    /// Read-modify-write one row under the write lock.
    ///
    /// `change` sees the current row and decides the next one. Its error
    /// aborts the write. Returns the row as stored afterwards.
    ///
    /// # Errors
    ///
    /// Whatever `change` returns, or a [`StoreError`] converted into `E`.
    pub fn update<E, F>(&self, ctx: &SessionContext, id: K, change: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: FnOnce(&R) -> Result<Change<R>, E>,
    {
        let mut rows = self.rows.write().map_err(|e| self.poisoned(e))?;
        let current = rows.get(&id).ok_or_else(|| self.not_found(id))?;
        self.run_read_guards(ctx, current)?;
        let next = match change(current)? {
            Change::Keep => return Ok(current.clone()),
            Change::Replace(next) => next,
        };
        self.run_write_guards(
            ctx,
            WriteOp::Update {
                current,
                next: &next,
            },
        )?;
        rows.insert(id, next.clone());
        Ok(next)
    }

    /// Delete one row under the write lock after `check` approves it.
    ///
    /// # Errors
    ///
    /// Whatever `check` returns, or a [`StoreError`] converted into `E`.
    pub fn delete<E, F>(&self, ctx: &SessionContext, id: K, check: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: FnOnce(&R) -> Result<(), E>,
    {
        let mut rows = self.rows.write().map_err(|e| self.poisoned(e))?;
        let current = rows.get(&id).ok_or_else(|| self.not_found(id))?;
        self.run_read_guards(ctx, current)?;
        check(current)?;
        self.run_write_guards(ctx, WriteOp::Delete { current })?;
        rows.remove(&id).ok_or_else(|| self.not_found(id).into())
    }
}
