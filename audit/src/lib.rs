//! MRV Audit: sealed calculation snapshots, replay, and evidence packs.
//!
//! # API Surface
//!
//! - [`snapshot::SnapshotManager`] -- create, lock, read snapshots; locked is terminal
//! - [`replay::ReplayEngine`] -- re-run a snapshot's calculation, compare hashes
//! - [`evidence::EvidencePackBuilder`] / [`evidence::verify_pack`] -- manifest + signature
//! - [`pack_dir::write_pack_dir`] / [`pack_dir::read_pack_dir`] -- write-once on-disk packs
//! - [`config::AuditConfig`] -- timeouts, signing key, volatile keys
//!
//! # Module Dependency Direction
//!
//! `config` ← `error` ← `snapshot` ← {`replay`, `evidence`} ; `evidence` ← `pack_dir`
//!
//! Snapshot rows live behind `mrv_access::store::GuardedTable`, so tenant
//! isolation and lock immutability hold for every caller of this crate.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod evidence;
pub mod pack_dir;
pub mod replay;
pub mod snapshot;
