//! Evidence pack lock tests: build, persist, reload, verify.
//!
//! - A built pack written to disk reads back byte-identical.
//! - A failing artifact provider leaves nothing on disk.
//! - Extra, missing, or altered files fail the read.
//! - Unsigned packs are valid without a key and invalid against one.

use std::sync::Arc;
use std::time::Duration;

use lock_tests::{seal_snapshot, LedgerEngine, TenantWorld};
use mrv_audit::config::{AuditConfig, SigningKey};
use mrv_audit::error::{AuditError, PackError};
use mrv_audit::evidence::{
    verify_pack, ArtifactProvider, EvidenceArtifact, EvidencePackBuilder, INPUT_BUNDLE_PATH,
    MANIFEST_PATH, RESULT_BUNDLE_PATH, SIGNATURE_PATH, SNAPSHOT_PATH,
};
use mrv_audit::pack_dir::{read_pack_dir, verify_pack_dir, write_pack_dir, PackDirError};
use mrv_audit::snapshot::Snapshot;
use mrv_kernel::hash::{canonical_hash, HashDomain};

struct Reports;

impl ArtifactProvider for Reports {
    fn name(&self) -> &str {
        "reports"
    }

    fn collect(&self, snapshot: &Snapshot) -> Result<Vec<EvidenceArtifact>, PackError> {
        Ok(vec![
            EvidenceArtifact::new(
                "reports/cbam_declaration.xml",
                format!("<declaration snapshot=\"{}\"/>", snapshot.id).into_bytes(),
            ),
            EvidenceArtifact::new("reports/summary.pdf", b"%PDF-1.7 summary".to_vec()),
        ])
    }
}

struct Documents {
    fail: bool,
}

impl ArtifactProvider for Documents {
    fn name(&self) -> &str {
        "documents"
    }

    fn collect(&self, _snapshot: &Snapshot) -> Result<Vec<EvidenceArtifact>, PackError> {
        if self.fail {
            return Err(PackError::MissingFile {
                path: "documents/fuel_invoice_2025_03.pdf".into(),
            });
        }
        Ok(vec![EvidenceArtifact::new(
            "documents/fuel_invoice_2025_03.pdf",
            b"%PDF-1.4 invoice".to_vec(),
        )])
    }
}

fn key() -> SigningKey {
    SigningKey::new("kms-2026-q1", b"pre-shared evidence key".to_vec())
}

async fn sealed(config: AuditConfig) -> (TenantWorld, Snapshot) {
    let world = TenantWorld::new(config);
    let engine = LedgerEngine::new(Duration::ZERO);
    let snapshot = seal_snapshot(&world, &world.consultant, &engine, true).await;
    (world, snapshot)
}

fn builder(world: &TenantWorld, documents_fail: bool) -> EvidencePackBuilder {
    EvidencePackBuilder::new(Arc::clone(&world.snapshots), &world.config)
        .with_provider(Arc::new(Reports))
        .with_provider(Arc::new(Documents {
            fail: documents_fail,
        }))
}

#[tokio::test]
async fn signed_pack_roundtrips_through_disk() {
    let (world, snapshot) = sealed(AuditConfig {
        signing_key: Some(key()),
        ..AuditConfig::default()
    })
    .await;
    let pack = builder(&world, false).build_pack(&world.consultant, snapshot.id).unwrap();
    assert!(pack.is_signed());

    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join(format!("evidence_{}", snapshot.id));
    write_pack_dir(&pack, &dir).unwrap();

    for path in [
        MANIFEST_PATH,
        SIGNATURE_PATH,
        INPUT_BUNDLE_PATH,
        RESULT_BUNDLE_PATH,
        SNAPSHOT_PATH,
        "reports/cbam_declaration.xml",
        "documents/fuel_invoice_2025_03.pdf",
    ] {
        assert!(dir.join(path).is_file(), "missing {path}");
    }
    assert_eq!(read_pack_dir(&dir).unwrap(), pack);

    let manifest = verify_pack_dir(&dir, Some(&key())).unwrap();
    assert_eq!(&manifest.input_hash, snapshot.input_hash());
    assert_eq!(&manifest.result_hash, snapshot.result_hash());
    assert_eq!(manifest.files.len(), 6);
    assert_eq!(
        manifest.files["reports/summary.pdf"],
        canonical_hash(HashDomain::EvidenceArtifact, b"%PDF-1.7 summary")
    );
    assert_eq!(
        std::fs::read(dir.join(INPUT_BUNDLE_PATH)).unwrap(),
        snapshot.input_bundle.bytes
    );
}

#[tokio::test]
async fn provider_failure_persists_nothing() {
    let (world, snapshot) = sealed(AuditConfig::default()).await;
    let err = builder(&world, true)
        .build_pack(&world.consultant, snapshot.id)
        .unwrap_err();
    assert!(matches!(
        err,
        AuditError::Pack(PackError::Provider { ref provider, .. }) if provider == "documents"
    ));
    let root = tempfile::tempdir().unwrap();
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn packs_are_write_once() {
    let (world, snapshot) = sealed(AuditConfig::default()).await;
    let pack = builder(&world, false).build_pack(&world.consultant, snapshot.id).unwrap();
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("pack");
    write_pack_dir(&pack, &dir).unwrap();
    assert!(matches!(
        write_pack_dir(&pack, &dir),
        Err(PackDirError::AlreadyExists { .. })
    ));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn disk_tampering_fails_closed() {
    let (world, snapshot) = sealed(AuditConfig {
        signing_key: Some(key()),
        ..AuditConfig::default()
    })
    .await;
    let pack = builder(&world, false).build_pack(&world.consultant, snapshot.id).unwrap();
    let root = tempfile::tempdir().unwrap();

    let extra = root.path().join("extra");
    write_pack_dir(&pack, &extra).unwrap();
    std::fs::write(extra.join("documents/unlisted.pdf"), b"%PDF").unwrap();
    assert!(matches!(
        read_pack_dir(&extra),
        Err(PackDirError::Pack(PackError::UndeclaredFile { .. }))
    ));

    let missing = root.path().join("missing");
    write_pack_dir(&pack, &missing).unwrap();
    std::fs::remove_file(missing.join("reports/summary.pdf")).unwrap();
    assert!(matches!(
        read_pack_dir(&missing),
        Err(PackDirError::Pack(PackError::MissingFile { .. }))
    ));

    let altered = root.path().join("altered");
    write_pack_dir(&pack, &altered).unwrap();
    std::fs::write(altered.join("reports/summary.pdf"), b"%PDF-1.7 edited").unwrap();
    assert!(matches!(
        read_pack_dir(&altered),
        Err(PackDirError::Pack(PackError::FileHashMismatch { .. }))
    ));

    let resigned = root.path().join("resigned");
    write_pack_dir(&pack, &resigned).unwrap();
    let forged = SigningKey::new("kms-2026-q1", b"guessed key".to_vec());
    assert!(verify_pack_dir(&resigned, Some(&forged)).is_err());
    std::fs::remove_file(resigned.join(SIGNATURE_PATH)).unwrap();
    read_pack_dir(&resigned).unwrap();
    assert_eq!(
        verify_pack_dir(&resigned, Some(&key())),
        Err(PackDirError::Pack(PackError::MissingSignature))
    );
}

#[tokio::test]
async fn unsigned_configuration_is_not_an_error() {
    let (world, snapshot) = sealed(AuditConfig::default()).await;
    let pack = builder(&world, false).build_pack(&world.consultant, snapshot.id).unwrap();
    assert!(!pack.is_signed());
    verify_pack(&pack, None).unwrap();
    assert_eq!(
        verify_pack(&pack, Some(&key())),
        Err(PackError::MissingSignature)
    );
}

#[tokio::test]
async fn rebuilding_yields_identical_manifest() {
    let (world, snapshot) = sealed(AuditConfig {
        signing_key: Some(key()),
        ..AuditConfig::default()
    })
    .await;
    let first = builder(&world, false).build_pack(&world.consultant, snapshot.id).unwrap();
    let second = builder(&world, false).build_pack(&world.admin, snapshot.id).unwrap();
    assert_eq!(first.manifest_bytes, second.manifest_bytes);
    assert_eq!(first.signature_bytes, second.signature_bytes);
    assert_eq!(first.manifest_hash(), second.manifest_hash());
}
