//! End-to-end scenarios: record, sign, tamper, verify.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use epi::{
    Container, ContainerError, FileKeyStore, KeyStore, MemoryKeyStore, RecordOptions, SignError,
    Signer, TrustLevel, VerificationStatus, VerifyError, record, sign, verify,
};
use serde_json::json;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Records the three-step trade scenario to `dir/trade.epi`.
fn record_trade(dir: &TempDir, keys: &MemoryKeyStore, auto_sign: bool) -> PathBuf {
    let path = dir.path().join("trade.epi");
    let options = RecordOptions {
        goal: Some("Execute a risk-checked trade".into()),
        notes: Some("scenario".into()),
        metadata_tags: vec!["finance".into(), "demo".into()],
        auto_sign,
        ..RecordOptions::new("Trade")
    };

    let mut session = record(&path, options, keys).unwrap();
    session
        .log_step(
            "market.analysis",
            json!({ "symbol": "AAPL", "price": 178.25, "trend": "up" }),
        )
        .unwrap();
    session
        .log_step(
            "risk.assessment",
            json!({ "exposure": 0.02, "approved": true }),
        )
        .unwrap();
    session
        .log_step(
            "trade.execution",
            json!({ "side": "buy", "quantity": 500, "order_id": "ORD-1" }),
        )
        .unwrap();
    session.close().unwrap();
    path
}

/// Rewrites the archive at `path`, passing each entry through `edit`.
///
/// `edit` returns the replacement bytes, or `None` to drop the entry.
fn rewrite_entries(
    path: &Path,
    method: CompressionMethod,
    mut edit: impl FnMut(&str, Vec<u8>) -> Option<Vec<u8>>,
) {
    let mut entries = Vec::new();
    {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            entries.push((entry.name().to_string(), bytes));
        }
    }

    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, bytes) in entries {
        if let Some(bytes) = edit(&name, bytes) {
            zip.start_file(name, options).unwrap();
            zip.write_all(&bytes).unwrap();
        }
    }
    zip.finish().unwrap();
}

#[test]
fn signed_trade_verifies_with_high_trust() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::SignedValid);
    assert_eq!(report.trust_level(), TrustLevel::High);

    let manifest = Container::open(&path).unwrap().into_manifest();
    assert_eq!(manifest.content_digest.len(), 64);
    assert_eq!(manifest.step_count, 3);

    let signature = manifest.signature.unwrap();
    let encoded = signature.strip_prefix("ed25519:default:").unwrap();
    assert_eq!(STANDARD.decode(encoded).unwrap().len(), 64);
}

#[test]
fn verifying_twice_is_stable() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    let first = verify(&path, &keys).unwrap();
    let second = verify(&path, &keys).unwrap();

    assert_eq!(first.status, VerificationStatus::SignedValid);
    assert_eq!(first, second);
}

#[test]
fn appended_step_is_tampered() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, mut bytes| {
        if name == "steps.jsonl" {
            bytes.extend_from_slice(
                br#"{"index":999,"kind":"malicious","timestamp":"2024-01-01T00:00:00Z","content":"string"}"#,
            );
            bytes.push(b'\n');
        }
        Some(bytes)
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Tampered);
    assert_eq!(report.mismatched_files, ["steps.jsonl"]);
    assert_ne!(report.digest, report.expected_digest);
}

#[test]
fn mutated_byte_is_tampered_even_when_unsigned() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, false);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        if name == "steps.jsonl" {
            let text = String::from_utf8(bytes).unwrap();
            Some(text.replace("500", "900").into_bytes())
        } else {
            Some(bytes)
        }
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Tampered);
}

#[test]
fn environment_edit_is_tampered() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        if name == "environment.json" {
            let mut env: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            env["os"] = json!("plan9");
            Some(serde_json::to_vec(&env).unwrap())
        } else {
            Some(bytes)
        }
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Tampered);
    assert_eq!(report.mismatched_files, ["environment.json"]);
}

#[test]
fn unsigned_round_trip_is_unsigned() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, false);

    let report = verify(&path, &keys).unwrap();

    assert_eq!(report.status, VerificationStatus::Unsigned);
    assert_eq!(report.trust_level(), TrustLevel::Unverified);
}

#[test]
fn round_trip_preserves_steps_and_metadata() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = dir.path().join("round.epi");
    let options = RecordOptions {
        auto_sign: false,
        metadata_tags: vec!["a".into()],
        ..RecordOptions::new("Round trip")
    };

    let mut session = record(&path, options, &keys).unwrap();
    session
        .log_step("llm.request", json!({ "prompt": "hi", "nested": { "z": 1, "a": [1, 2] } }))
        .unwrap();
    session
        .log_step("llm.response", json!({ "text": "héllo \"world\"" }))
        .unwrap();
    let recorded = session.steps().to_vec();
    let workflow_id = session.workflow_id();
    session.close().unwrap();

    let mut container = Container::open(&path).unwrap();
    assert_eq!(container.steps().unwrap(), recorded);
    let manifest = container.manifest();
    assert_eq!(manifest.workflow_id, workflow_id);
    assert_eq!(manifest.workflow_name.as_deref(), Some("Round trip"));
    assert_eq!(manifest.metadata_tags, ["a"]);
    assert!(manifest.signature.is_none());
    assert_eq!(
        container.entry_names()[..2],
        ["mimetype".to_string(), "manifest.json".to_string()]
    );
}

#[test]
fn rezipping_keeps_signature_valid() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Stored, |_, bytes| Some(bytes));

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::SignedValid);
}

#[test]
fn deferred_sign_then_verify() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, false);
    let signer = Signer::new(&keys).with_auto_generate(true);

    let outcome = sign(&path, "auditor", &signer).unwrap();

    assert!(outcome.signature.starts_with("ed25519:auditor:"));
    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::SignedValid);
    assert_eq!(report.signer_key_id.as_deref(), Some("auditor"));

    let viewer = Container::open(&path).unwrap().viewer().unwrap().unwrap();
    assert!(viewer.contains("Signed: ed25519:auditor"));

    let err = sign(&path, "auditor", &signer).unwrap_err();
    assert!(matches!(err, SignError::AlreadySigned { .. }));
}

#[test]
fn deferred_sign_refuses_tampered_content() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, false);
    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        if name == "steps.jsonl" {
            Some(bytes[..bytes.len() - 1].to_vec())
        } else {
            Some(bytes)
        }
    });

    let err = sign(&path, "default", &Signer::new(&keys).with_auto_generate(true)).unwrap_err();

    assert!(matches!(err, SignError::DigestMismatch { .. }));
    assert!(!Container::open(&path).unwrap().manifest().is_signed());
}

#[test]
fn deferred_sign_without_key() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, false);

    let err = sign(&path, "missing", &Signer::new(&keys)).unwrap_err();
    assert!(matches!(err, SignError::KeyNotFound { .. }));
}

#[test]
fn artifact_edit_is_tampered() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = dir.path().join("artifacts.epi");

    let mut session = record(&path, RecordOptions::new("Artifacts"), &keys).unwrap();
    session.log_step("report", json!({ "file": "summary.csv" })).unwrap();
    session
        .attach_artifact("summary.csv", "symbol,qty\nAAPL,500\n")
        .unwrap();
    session.close().unwrap();
    assert_eq!(
        verify(&path, &keys).unwrap().status,
        VerificationStatus::SignedValid
    );

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        if name == "artifacts/summary.csv" {
            Some(b"symbol,qty\nAAPL,5000\n".to_vec())
        } else {
            Some(bytes)
        }
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Tampered);
    assert_eq!(report.mismatched_files, ["artifacts/summary.csv"]);
}

#[test]
fn viewer_edit_does_not_affect_trust() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        if name == "viewer.html" {
            Some(b"<p>edited</p>".to_vec())
        } else {
            Some(bytes)
        }
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::SignedValid);
}

#[test]
fn missing_steps_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        (name != "steps.jsonl").then_some(bytes)
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Corrupt);
}

#[test]
fn missing_manifest_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        (name != "manifest.json").then_some(bytes)
    });

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Corrupt);
}

#[test]
fn flipped_byte_in_compressed_steps_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    let (start, len) = {
        let mut archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let entry = archive.by_name("steps.jsonl").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
        (entry.data_start(), entry.compressed_size())
    };
    let mut bytes = fs::read(&path).unwrap();
    let at = usize::try_from(start + len / 2).unwrap();
    bytes[at] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Corrupt);
}

#[test]
fn truncated_archive_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let report = verify(&path, &keys).unwrap();
    assert_eq!(report.status, VerificationStatus::Corrupt);
}

#[test]
fn float_content_survives_the_archive() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = dir.path().join("floats.epi");

    let mut session = record(&path, RecordOptions::new("Floats"), &keys).unwrap();
    session
        .log_step("model.output", json!({ "x": 1.0715660391465826e-75, "p": 0.1 }))
        .unwrap();
    let logged = session.steps().to_vec();
    session.close().unwrap();

    let steps = Container::open(&path).unwrap().steps().unwrap();
    assert_eq!(steps, logged);
    assert_eq!(steps[0].content["x"].as_f64(), Some(1.0715660391465826e-75));
    assert_eq!(
        verify(&path, &keys).unwrap().status,
        VerificationStatus::SignedValid
    );
}

#[test]
fn unknown_spec_version_is_format_mismatch() {
    let dir = TempDir::new().unwrap();
    let keys = MemoryKeyStore::new();
    let path = record_trade(&dir, &keys, true);

    rewrite_entries(&path, CompressionMethod::Deflated, |name, bytes| {
        if name == "manifest.json" {
            let mut manifest: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            manifest["spec_version"] = json!("9.9");
            Some(serde_json::to_vec(&manifest).unwrap())
        } else {
            Some(bytes)
        }
    });

    let err = verify(&path, &keys).unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Container(ContainerError::FormatMismatch { .. })
    ));
}

#[test]
fn file_key_store_signs_and_public_keys_verify() {
    let dir = TempDir::new().unwrap();
    let signing_keys = FileKeyStore::new(dir.path().join("keys"));
    let path = dir.path().join("trade.epi");

    let mut session = record(&path, RecordOptions::new("File keys"), &signing_keys).unwrap();
    session.log_step("tick", json!({ "n": 1 })).unwrap();
    session.close().unwrap();
    assert_eq!(signing_keys.list().unwrap(), ["default"]);

    // An auditor holds only the public half.
    let audit_dir = dir.path().join("audit");
    fs::create_dir(&audit_dir).unwrap();
    fs::copy(
        dir.path().join("keys/default.pub"),
        audit_dir.join("default.pub"),
    )
    .unwrap();
    let audit_keys = FileKeyStore::new(&audit_dir);

    let report = verify(&path, &audit_keys).unwrap();
    assert_eq!(report.status, VerificationStatus::SignedValid);
}
