//! MRV Kernel: the deterministic core of the audit-integrity layer.
//!
//! # API Surface
//!
//! - [`canon::canonical_json_bytes`] -- the one canonical serialization
//! - [`hash::canonical_hash`] -- domain-separated SHA-256 over canonical bytes
//! - [`bundle::CanonicalBundle`] -- sealed input/result bundle (bytes + hash)
//!
//! # Module Dependency Direction
//!
//! `hash_domain` ← `hash` ← `canon` ← `bundle`
//!
//! One-way only. Nothing in this crate touches storage, time, or the
//! environment.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bundle;
pub mod canon;
pub mod hash;
pub mod hash_domain;
