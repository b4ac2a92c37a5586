//! Evidence packs: every artifact tied to one snapshot, a manifest of their
//! hashes, and an optional HMAC signature over the manifest.
//!
//! # Layout
//!
//! ```text
//! manifest.json        canonical JSON, see PackManifest
//! signature.json       present only when a signing key is configured
//! input_bundle.json    the snapshot's sealed input bytes
//! result_bundle.json   the snapshot's sealed result bytes
//! snapshot.json        canonical JSON of the snapshot record
//! <provider paths>     reports, supporting documents
//! ```
//!
//! A build either yields a complete [`EvidencePack`] or an error. Nothing is
//! written anywhere until [`crate::pack_dir::write_pack_dir`] is called with
//! a finished pack.

use std::collections::BTreeMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use mrv_access::context::{SessionContext, SnapshotId, TenantId};
use mrv_kernel::canon::canonical_json_bytes;
use mrv_kernel::hash::{canonical_hash, ContentHash, HashDomain};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

use crate::config::{AuditConfig, SigningKey};
use crate::error::{AuditError, PackError};
use crate::snapshot::{Snapshot, SnapshotManager};

type HmacSha256 = Hmac<Sha256>;

pub const MANIFEST_PATH: &str = "manifest.json";
pub const SIGNATURE_PATH: &str = "signature.json";
pub const INPUT_BUNDLE_PATH: &str = "input_bundle.json";
pub const RESULT_BUNDLE_PATH: &str = "result_bundle.json";
pub const SNAPSHOT_PATH: &str = "snapshot.json";
pub const SCHEMA_VERSION: &str = "evidence_pack.v1";
pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";

/// One file destined for a pack, addressed by its relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceArtifact {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl EvidenceArtifact {
    #[must_use]
    pub fn new(path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }
}

/// Source of report and document artifacts for a snapshot.
pub trait ArtifactProvider: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Any error aborts the whole pack build.
    fn collect(&self, snapshot: &Snapshot) -> Result<Vec<EvidenceArtifact>, PackError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackManifest {
    pub files: BTreeMap<String, ContentHash>,
    pub input_hash: ContentHash,
    pub result_hash: ContentHash,
    pub schema_version: String,
    pub snapshot_id: SnapshotId,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackSignature {
    pub algorithm: String,
    pub key_id: String,
    pub manifest_hash: ContentHash,
    pub signature_hex: String,
}

/// A complete, in-memory evidence pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidencePack {
    pub manifest_bytes: Vec<u8>,
    pub signature_bytes: Option<Vec<u8>>,
    /// Artifact files by relative path, excluding manifest and signature.
    pub files: BTreeMap<String, Vec<u8>>,
}

impl EvidencePack {
    /// # Errors
    ///
    /// [`PackError::Manifest`] if the manifest bytes do not parse.
    pub fn manifest(&self) -> Result<PackManifest, PackError> {
        serde_json::from_slice(&self.manifest_bytes).map_err(|e| PackError::Manifest {
            detail: e.to_string(),
        })
    }

    #[must_use]
    pub fn manifest_hash(&self) -> ContentHash {
        canonical_hash(HashDomain::EvidenceManifest, &self.manifest_bytes)
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signature_bytes.is_some()
    }

    /// Every file of the pack, manifest and signature included, by path.
    pub fn all_files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        std::iter::once((MANIFEST_PATH, self.manifest_bytes.as_slice()))
            .chain(
                self.signature_bytes
                    .as_deref()
                    .map(|bytes| (SIGNATURE_PATH, bytes)),
            )
            .chain(self.files.iter().map(|(p, b)| (p.as_str(), b.as_slice())))
    }
}

/// Reject anything that is not a plain relative path inside the pack.
///
/// # Errors
///
/// [`PackError::InvalidPath`].
pub fn validate_artifact_path(path: &str) -> Result<(), PackError> {
    let invalid = |detail: &str| {
        Err(PackError::InvalidPath {
            path: path.to_string(),
            detail: detail.to_string(),
        })
    };
    if path.is_empty() {
        return invalid("empty");
    }
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return invalid("must be a relative path with '/' separators");
    }
    for component in path.split('/') {
        match component {
            "" => return invalid("empty component"),
            "." | ".." => return invalid("dot component"),
            c if c.starts_with('.') => return invalid("hidden component"),
            _ => {}
        }
    }
    let top = path.split('/').next().unwrap_or(path);
    if top == MANIFEST_PATH || top == SIGNATURE_PATH {
        return invalid("reserved name");
    }
    Ok(())
}

/// True when `path` lies inside directory `dir`.
fn nested_under(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn canonical(value: &impl Serialize) -> Result<Vec<u8>, PackError> {
    let value = serde_json::to_value(value).map_err(|e| PackError::Canon {
        detail: e.to_string(),
    })?;
    canonical_json_bytes(&value).map_err(|e| PackError::Canon {
        detail: e.to_string(),
    })
}

fn mac(key: &SigningKey, manifest_bytes: &[u8]) -> Result<HmacSha256, PackError> {
    let mut mac = HmacSha256::new_from_slice(key.secret()).map_err(|e| PackError::Manifest {
        detail: format!("invalid signing key: {e}"),
    })?;
    mac.update(manifest_bytes);
    Ok(mac)
}

fn sign(key: &SigningKey, manifest_bytes: &[u8]) -> Result<Vec<u8>, PackError> {
    let signature = PackSignature {
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        key_id: key.key_id().to_string(),
        manifest_hash: canonical_hash(HashDomain::EvidenceManifest, manifest_bytes),
        signature_hex: hex::encode(mac(key, manifest_bytes)?.finalize().into_bytes()),
    };
    canonical(&signature)
}

pub struct EvidencePackBuilder {
    snapshots: Arc<SnapshotManager>,
    providers: Vec<Arc<dyn ArtifactProvider>>,
    signing_key: Option<SigningKey>,
}

impl std::fmt::Debug for EvidencePackBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidencePackBuilder")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .field("signing_key", &self.signing_key)
            .finish_non_exhaustive()
    }
}

impl EvidencePackBuilder {
    #[must_use]
    pub fn new(snapshots: Arc<SnapshotManager>, config: &AuditConfig) -> Self {
        Self {
            snapshots,
            providers: Vec::new(),
            signing_key: config.signing_key().cloned(),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ArtifactProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    fn collect(&self, snapshot: &Snapshot) -> Result<BTreeMap<String, Vec<u8>>, PackError> {
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut add = |artifact: EvidenceArtifact| -> Result<(), PackError> {
            validate_artifact_path(&artifact.path)?;
            if files.contains_key(&artifact.path) {
                return Err(PackError::DuplicatePath {
                    path: artifact.path,
                });
            }
            let conflict = files.keys().find(|existing| {
                nested_under(&artifact.path, existing) || nested_under(existing, &artifact.path)
            });
            if let Some(existing) = conflict {
                return Err(PackError::PathConflict {
                    existing: existing.clone(),
                    path: artifact.path,
                });
            }
            files.insert(artifact.path, artifact.bytes);
            Ok(())
        };

        add(EvidenceArtifact::new(
            INPUT_BUNDLE_PATH,
            snapshot.input_bundle.bytes.clone(),
        ))?;
        add(EvidenceArtifact::new(
            RESULT_BUNDLE_PATH,
            snapshot.result_bundle.bytes.clone(),
        ))?;
        add(EvidenceArtifact::new(SNAPSHOT_PATH, canonical(snapshot)?))?;

        for provider in &self.providers {
            let artifacts = provider.collect(snapshot).map_err(|e| match e {
                err @ PackError::Provider { .. } => err,
                other => PackError::Provider {
                    provider: provider.name().to_string(),
                    detail: other.to_string(),
                },
            })?;
            for artifact in artifacts {
                add(artifact)?;
            }
        }
        Ok(files)
    }

    /// Assemble the pack for snapshot `id`.
    ///
    /// # Errors
    ///
    /// `Forbidden` / `NotFound` from the snapshot read,
    /// [`AuditError::Bundle`] if the sealed bundles no longer verify, and
    /// [`AuditError::Pack`] for any artifact or hashing failure.
    pub fn build_pack(
        &self,
        ctx: &SessionContext,
        id: SnapshotId,
    ) -> Result<EvidencePack, AuditError> {
        let snapshot = self.snapshots.get(ctx, id)?;
        snapshot.verify_bundles()?;
        let files = self.collect(&snapshot)?;

        let manifest = PackManifest {
            files: files
                .iter()
                .map(|(path, bytes)| {
                    (
                        path.clone(),
                        canonical_hash(HashDomain::EvidenceArtifact, bytes),
                    )
                })
                .collect(),
            input_hash: snapshot.input_hash().clone(),
            result_hash: snapshot.result_hash().clone(),
            schema_version: SCHEMA_VERSION.to_string(),
            snapshot_id: snapshot.id,
            tenant_id: snapshot.tenant_id,
        };
        let manifest_bytes = canonical(&manifest)?;
        let signature_bytes = self
            .signing_key
            .as_ref()
            .map(|key| sign(key, &manifest_bytes))
            .transpose()?;

        let pack = EvidencePack {
            manifest_bytes,
            signature_bytes,
            files,
        };
        info!(
            tenant = %ctx.tenant_id,
            user = %ctx.user_id,
            snapshot_id = %id,
            files = pack.files.len(),
            signed = pack.is_signed(),
            manifest_hash = %pack.manifest_hash(),
            "evidence pack built"
        );
        Ok(pack)
    }
}

fn verify_signature(pack: &EvidencePack, key: &SigningKey) -> Result<(), PackError> {
    let bytes = pack
        .signature_bytes
        .as_deref()
        .ok_or(PackError::MissingSignature)?;
    let signature: PackSignature =
        serde_json::from_slice(bytes).map_err(|_| PackError::BadSignature)?;
    if signature.algorithm != SIGNATURE_ALGORITHM {
        return Err(PackError::BadSignature);
    }
    if signature.key_id != key.key_id() {
        return Err(PackError::KeyIdMismatch {
            expected: key.key_id().to_string(),
            found: signature.key_id,
        });
    }
    if signature.manifest_hash != pack.manifest_hash() {
        return Err(PackError::BadSignature);
    }
    let raw = hex::decode(&signature.signature_hex).map_err(|_| PackError::BadSignature)?;
    mac(key, &pack.manifest_bytes)?
        .verify_slice(&raw)
        .map_err(|_| PackError::BadSignature)
}

/// Recompute every hash in `pack` and, when `key` is given, check the
/// signature. A signed pack verified without a key has its files and
/// manifest checked but not its signature.
///
/// # Errors
///
/// The first [`PackError`] found.
pub fn verify_pack(
    pack: &EvidencePack,
    key: Option<&SigningKey>,
) -> Result<PackManifest, PackError> {
    let manifest = pack.manifest()?;
    if canonical(&manifest)? != pack.manifest_bytes {
        return Err(PackError::Manifest {
            detail: "manifest bytes are not canonical".into(),
        });
    }
    if manifest.schema_version != SCHEMA_VERSION {
        return Err(PackError::Manifest {
            detail: format!("unsupported schema_version {:?}", manifest.schema_version),
        });
    }

    for (path, declared) in &manifest.files {
        let bytes = pack.files.get(path).ok_or_else(|| PackError::MissingFile {
            path: path.clone(),
        })?;
        let recomputed = canonical_hash(HashDomain::EvidenceArtifact, bytes);
        if &recomputed != declared {
            return Err(PackError::FileHashMismatch {
                path: path.clone(),
                declared: declared.to_string(),
                recomputed: recomputed.to_string(),
            });
        }
    }
    if let Some(path) = pack.files.keys().find(|p| !manifest.files.contains_key(*p)) {
        return Err(PackError::UndeclaredFile { path: path.clone() });
    }

    for (path, domain, declared) in [
        (INPUT_BUNDLE_PATH, HashDomain::InputBundle, &manifest.input_hash),
        (RESULT_BUNDLE_PATH, HashDomain::ResultBundle, &manifest.result_hash),
    ] {
        let bytes = pack.files.get(path).ok_or_else(|| PackError::MissingFile {
            path: path.to_string(),
        })?;
        let recomputed = canonical_hash(domain, bytes);
        if &recomputed != declared {
            return Err(PackError::FileHashMismatch {
                path: path.to_string(),
                declared: declared.to_string(),
                recomputed: recomputed.to_string(),
            });
        }
    }

    if let Some(key) = key {
        verify_signature(pack, key)?;
    }
    Ok(manifest)
}
