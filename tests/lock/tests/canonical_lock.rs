//! Canonical form and hash domain lock tests.
//!
//! Golden bytes and digests are pinned here so any drift in key ordering,
//! number formatting, string escaping, or domain prefixes fails loudly.

use std::collections::BTreeSet;
use std::path::Path;

use mrv_audit::config::AuditConfig;
use mrv_audit::snapshot::SnapshotManager;
use mrv_kernel::bundle::CanonicalBundle;
use mrv_kernel::canon::canonical_json_bytes;
use mrv_kernel::hash::{canonical_hash, HashDomain};
use proptest::prelude::*;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const GOLDEN_CANONICAL: &str =
    r#"{"facility":"İzmit","factor":2.02,"nested":{"a":true,"b":[1,2.5]},"note":null,"qty":1000}"#;
const GOLDEN_INPUT_HASH: &str =
    "sha256:f552a5936c456eb792d085e6b7f89482f166a146163ca82bf13df6f29615a05b";
const GOLDEN_RESULT_HASH: &str =
    "sha256:6754005bde1a00626dd97ec94a3322b7c0b35c38d888d6590f1c61d06eeb8b96";
const GOLDEN_EMPTY_INPUT_HASH: &str =
    "sha256:f94ec66a36f232487b323d2a513538cbfb947fb756a86b22980ccbc73ecfb5b2";
const GOLDEN_ARTIFACT_HASH: &str =
    "sha256:ab7f289c7fda61e87fe2618005f516f32b83fad71d01231cb9e418e6d4de7db2";

fn golden_value() -> Value {
    serde_json::from_str(
        r#"{ "qty": 1000, "note": null,
             "nested": { "b": [1, 2.50], "a": true },
             "factor": 2.0200000000000000177, "facility": "İzmit" }"#,
    )
    .unwrap()
}

#[test]
fn golden_canonical_bytes() {
    let bytes = canonical_json_bytes(&golden_value()).unwrap();
    assert_eq!(std::str::from_utf8(&bytes).unwrap(), GOLDEN_CANONICAL);
}

#[test]
fn golden_bundle_hashes() {
    let input = CanonicalBundle::from_value(HashDomain::InputBundle, &golden_value()).unwrap();
    let result = CanonicalBundle::from_value(HashDomain::ResultBundle, &golden_value()).unwrap();
    assert_eq!(input.hash.as_str(), GOLDEN_INPUT_HASH);
    assert_eq!(result.hash.as_str(), GOLDEN_RESULT_HASH);
    assert_eq!(input.bytes, result.bytes);
    assert_ne!(input.hash, result.hash);
    assert_eq!(
        CanonicalBundle::from_value(HashDomain::InputBundle, &json!({}))
            .unwrap()
            .hash
            .as_str(),
        GOLDEN_EMPTY_INPUT_HASH
    );
    assert_eq!(
        canonical_hash(HashDomain::EvidenceArtifact, b"<cbam/>").as_str(),
        GOLDEN_ARTIFACT_HASH
    );
}

/// The digest is plain SHA-256 over `domain || bytes`, reproducible with any
/// SHA-256 tool.
#[test]
fn hash_is_sha256_of_prefix_and_bytes() {
    let bytes = canonical_json_bytes(&golden_value()).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(b"MRV::INPUT_BUNDLE::V1\0");
    hasher.update(&bytes);
    let expected = format!("sha256:{}", hex::encode(hasher.finalize()));
    assert_eq!(canonical_hash(HashDomain::InputBundle, &bytes).as_str(), expected);
}

#[test]
fn null_member_and_absent_member_hash_differently() {
    let with_null = json!({"qty": 10, "unit": null});
    let absent = json!({"qty": 10});
    let a = CanonicalBundle::from_value(HashDomain::InputBundle, &with_null).unwrap();
    let b = CanonicalBundle::from_value(HashDomain::InputBundle, &absent).unwrap();
    assert_eq!(a.bytes, br#"{"qty":10,"unit":null}"#);
    assert_eq!(b.bytes, br#"{"qty":10}"#);
    assert_ne!(a.hash, b.hash);

    // Deterministic either way: the same shape always gives the same hash.
    let reordered = json!({"unit": null, "qty": 10});
    let again = CanonicalBundle::from_value(HashDomain::InputBundle, &reordered).unwrap();
    assert_eq!(a, again);
}

#[test]
fn volatile_stamps_never_reach_the_hash() {
    let snapshots = SnapshotManager::new(&AuditConfig::default());
    let morning = json!({"rows": [{"qty": 1, "created_at": "09:00"}], "generated_at": "09:00"});
    let evening = json!({"rows": [{"qty": 1, "created_at": "21:00"}], "generated_at": "21:00"});
    let a = snapshots.seal(HashDomain::InputBundle, &morning).unwrap();
    let b = snapshots.seal(HashDomain::InputBundle, &evening).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.bytes, br#"{"rows":[{"qty":1}]}"#);
}

#[test]
fn float_noise_below_twelve_digits_is_absorbed() {
    let a = canonical_json_bytes(&json!({"v": 0.1 + 0.2})).unwrap();
    let b = canonical_json_bytes(&json!({"v": 0.3})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, br#"{"v":0.3}"#);
    assert_eq!(
        canonical_json_bytes(&json!([1.0, -0.0, 1e3])).unwrap(),
        b"[1,0,1000]"
    );
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        (-1.0e9_f64..1.0e9).prop_map(Value::from),
        "[a-zA-Z0-9 çğışöü]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn reversed_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.reverse();
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), reversed_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(reversed_keys).collect()),
        other => other.clone(),
    }
}

proptest! {
    #[test]
    fn bundle_hash_ignores_key_order(value in arb_value()) {
        let a = CanonicalBundle::from_value(HashDomain::ResultBundle, &value).unwrap();
        let reversed = reversed_keys(&value);
        let b = CanonicalBundle::from_value(HashDomain::ResultBundle, &reversed).unwrap();
        prop_assert_eq!(&a, &b);
        a.verify(HashDomain::ResultBundle).unwrap();
    }

    #[test]
    fn canonical_bytes_are_a_fixed_point(value in arb_value()) {
        let once = canonical_json_bytes(&value).unwrap();
        let reparsed: Value = serde_json::from_slice(&once).unwrap();
        prop_assert_eq!(canonical_json_bytes(&reparsed).unwrap(), once);
    }
}

// ---------------------------------------------------------------------------
// Hash domain governance
// ---------------------------------------------------------------------------

#[test]
fn hash_domain_canonical_set() {
    let names: Vec<String> = HashDomain::ALL.iter().map(ToString::to_string).collect();
    assert_eq!(
        names,
        vec![
            "InputBundle",
            "ResultBundle",
            "SnapshotRecord",
            "EvidenceArtifact",
            "EvidenceManifest",
            "AccessAuditEntry",
        ],
        "if you added a domain, add it here too"
    );
}

#[test]
fn hash_domain_bytes_unique_terminated_and_prefixed() {
    let mut seen = BTreeSet::new();
    for domain in HashDomain::ALL {
        let bytes = domain.as_bytes();
        assert!(seen.insert(bytes), "duplicate domain bytes: {domain}");
        assert!(bytes.starts_with(b"MRV::"), "{domain} does not start with MRV::");
        assert!(bytes.ends_with(b"::V1\0"), "{domain} does not end with ::V1\\0");
        assert_eq!(
            bytes.iter().filter(|b| **b == 0).count(),
            1,
            "{domain} has an interior null"
        );
    }
}

/// The only production file allowed to spell out a domain literal is
/// `hash_domain.rs`.
#[test]
fn no_raw_domain_literals_outside_authority() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let mut violations = Vec::new();
    for crate_dir in ["kernel/src", "access/src", "audit/src"] {
        for path in rust_files(&root.join(crate_dir)) {
            if path.file_name().and_then(|n| n.to_str()) == Some("hash_domain.rs") {
                continue;
            }
            let content = std::fs::read_to_string(&path).unwrap();
            let production = content.split("#[cfg(test)]").next().unwrap_or_default();
            for (i, line) in production.lines().enumerate() {
                if line.contains("b\"MRV::") && !line.trim_start().starts_with("//") {
                    violations.push(format!("{}:{}", path.display(), i + 1));
                }
            }
        }
    }
    assert!(violations.is_empty(), "raw domain literals: {violations:?}");
}

fn rust_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap().flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(rust_files(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            out.push(path);
        }
    }
    out
}
