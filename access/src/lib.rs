//! MRV Access: tenant isolation and facility-scoped authorization.
//!
//! # API Surface
//!
//! - [`pep::PolicyEnforcementPoint`] -- every read and write on scoped tables
//! - [`resolver::ScopeResolver`] -- row to facility resolution, scope checks
//! - [`scope_store::ScopeStore`] -- user to facility assignments
//! - [`store::GuardedTable`] -- storage boundary with write interceptors
//! - [`audit_log::AccessAuditLog`] -- hash-chained decision log
//!
//! # Module Dependency Direction
//!
//! `context` ← `error` ← `store` ← `entity` ← `scope_store` ← `resolver` ← `pep`
//!
//! `audit_log` depends on `context`, `entity` and the kernel hash.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit_log;
pub mod context;
pub mod entity;
pub mod error;
pub mod pep;
pub mod resolver;
pub mod scope_store;
pub mod store;
