//! Typed domain separators for canonical hashing.
//!
//! Every production hash computation selects a domain via [`HashDomain`].
//! This module is the single authority for domain-separator byte strings.
//! Adding a new domain is a single change here: the enum, `as_bytes()`,
//! `ALL`, and `Display` are all generated from the same macro invocation.

/// Declares `HashDomain` enum, `as_bytes()`, `ALL`, and `Display` from one list.
macro_rules! define_hash_domains {
    (
        $(
            $(#[$meta:meta])*
            $variant:ident => $bytes:expr
        ),+ $(,)?
    ) => {
        /// Typed domain separator for [`super::hash::canonical_hash`].
        ///
        /// Every variant maps to a unique, null-terminated byte string used as
        /// a SHA-256 prefix.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HashDomain {
            $(
                $(#[$meta])*
                $variant,
            )+
        }

        impl HashDomain {
            /// The raw domain-separator bytes (null-terminated).
            #[must_use]
            pub const fn as_bytes(&self) -> &'static [u8] {
                match self {
                    $( Self::$variant => $bytes, )+
                }
            }

            /// All domain variants in declaration order.
            pub const ALL: &[HashDomain] = &[
                $( Self::$variant, )+
            ];
        }

        impl core::fmt::Display for HashDomain {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $( Self::$variant => write!(f, stringify!($variant)), )+
                }
            }
        }
    };
}

define_hash_domains! {
    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Canonical input bundle (datasets, config, factor set, methodology).
    InputBundle => b"MRV::INPUT_BUNDLE::V1\0",

    /// Canonical result bundle produced by the calculation engine.
    ResultBundle => b"MRV::RESULT_BUNDLE::V1\0",

    /// Sealed snapshot record (used for `previous_snapshot_hash` chaining).
    SnapshotRecord => b"MRV::SNAPSHOT_RECORD::V1\0",

    // -----------------------------------------------------------------------
    // Evidence packs
    // -----------------------------------------------------------------------

    /// Per-file content hash inside an evidence pack.
    EvidenceArtifact => b"MRV::EVIDENCE_ARTIFACT::V1\0",

    /// Evidence manifest hash (the payload the signature commits to).
    EvidenceManifest => b"MRV::EVIDENCE_MANIFEST::V1\0",

    // -----------------------------------------------------------------------
    // Access layer
    // -----------------------------------------------------------------------

    /// Access audit log entry chaining.
    AccessAuditEntry => b"MRV::ACCESS_AUDIT_ENTRY::V1\0",
}
