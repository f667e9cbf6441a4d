//! Tests for the certificate authority.

use std::fs;

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use super::*;

fn authority_in(dir: &tempfile::TempDir, instance: &str) -> CertificateAuthority {
    CertificateAuthority::new(
        dir.path().join("authority"),
        dir.path().join("instances").join(instance),
    )
}

fn pem_blocks(pem: &str) -> usize {
    pem.matches("BEGIN CERTIFICATE").count()
}

fn leaf_common_name(chain_pem: &str) -> String {
    let (_, pem) = parse_x509_pem(chain_pem.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap()
        .to_string()
}

#[test]
fn ensure_chain_writes_full_chain_and_key() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");

    let paths = ca.ensure_chain("01P09A391800001", &[]).unwrap();

    let chain = fs::read_to_string(&paths.cert).unwrap();
    let key = fs::read_to_string(&paths.key).unwrap();
    assert_eq!(pem_blocks(&chain), 2, "leaf followed by authority");
    assert!(key.contains("BEGIN PRIVATE KEY"));
    assert_eq!(leaf_common_name(&chain), "01P09A391800001");
    assert!(ca.authority_cert_path().exists());
}

#[test]
fn ensure_chain_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");

    let first = ca.ensure_chain("SERIAL1", &[]).unwrap();
    let cert_mtime = fs::metadata(&first.cert).unwrap().modified().unwrap();
    let key_mtime = fs::metadata(&first.key).unwrap().modified().unwrap();
    let content = fs::read_to_string(&first.cert).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    let second = ca.ensure_chain("SERIAL1", &[]).unwrap();

    assert_eq!(first, second);
    assert_eq!(fs::metadata(&second.cert).unwrap().modified().unwrap(), cert_mtime);
    assert_eq!(fs::metadata(&second.key).unwrap().modified().unwrap(), key_mtime);
    assert_eq!(fs::read_to_string(&second.cert).unwrap(), content);
}

#[test]
fn cached_leaf_is_reused_even_for_another_serial() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");

    let paths = ca.ensure_chain("SERIAL1", &[]).unwrap();
    ca.ensure_chain("SERIAL2", &[]).unwrap();

    let chain = fs::read_to_string(&paths.cert).unwrap();
    assert_eq!(leaf_common_name(&chain), "SERIAL1");
    assert!(!ca.leaf_matches("SERIAL2", &[]));
}

#[test]
fn invalidate_then_ensure_reissues() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");

    let paths = ca.ensure_chain("SERIAL1", &[]).unwrap();
    ca.invalidate_leaf().unwrap();
    assert!(!paths.cert.exists());
    assert!(ca.leaf_metadata().is_none());

    ca.ensure_chain("SERIAL2", &[]).unwrap();
    let chain = fs::read_to_string(&paths.cert).unwrap();
    assert_eq!(leaf_common_name(&chain), "SERIAL2");
    assert!(ca.leaf_matches("SERIAL2", &[]));
}

#[test]
fn invalidate_without_leaf_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    authority_in(&dir, "a").invalidate_leaf().unwrap();
}

#[test]
fn instances_share_one_authority() {
    let dir = tempfile::tempdir().unwrap();
    let a = authority_in(&dir, "a");
    let b = authority_in(&dir, "b");

    let chain_a = fs::read_to_string(a.ensure_chain("A", &[]).unwrap().cert).unwrap();
    let chain_b = fs::read_to_string(b.ensure_chain("B", &[]).unwrap().cert).unwrap();
    let authority = fs::read_to_string(a.authority_cert_path()).unwrap();

    assert!(chain_a.ends_with(&authority));
    assert!(chain_b.ends_with(&authority));
    assert_ne!(chain_a, chain_b);
}

#[test]
fn authority_near_expiry_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");
    let authority_dir = dir.path().join("authority");
    fs::create_dir_all(&authority_dir).unwrap();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(10);
    let key = KeyPair::generate().unwrap();
    let expiring = params.self_signed(&key).unwrap().pem();
    fs::write(authority_dir.join("ca.pem"), &expiring).unwrap();
    fs::write(authority_dir.join("ca-key.pem"), key.serialize_pem()).unwrap();

    invalidate_authority_cache();
    let fresh = ca.regenerate_authority_if_needed().unwrap();

    assert_ne!(fresh, expiring);
    assert_eq!(fs::read_to_string(authority_dir.join("ca.pem")).unwrap(), fresh);
}

#[test]
fn healthy_authority_is_loaded_not_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");

    let first = ca.regenerate_authority_if_needed().unwrap();
    invalidate_authority_cache();
    let second = ca.regenerate_authority_if_needed().unwrap();

    assert_eq!(first, second);
}

#[test]
fn corrupt_authority_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");
    let authority_dir = dir.path().join("authority");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::write(authority_dir.join("ca.pem"), "garbage").unwrap();
    fs::write(authority_dir.join("ca-key.pem"), "garbage").unwrap();

    invalidate_authority_cache();
    let pem = ca.regenerate_authority_if_needed().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
}

#[test]
fn subject_alt_names_cover_dial_targets() {
    let names = subject_alt_names(
        "SERIAL9",
        &["10.0.0.100".to_string(), "10.0.0.100".to_string(), " ".to_string()],
    );

    for expected in ["localhost", DEVICE_HOSTNAME, "SERIAL9", "127.0.0.1", "10.0.0.100"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}: {names:?}");
    }
    assert_eq!(names.iter().filter(|n| *n == "10.0.0.100").count(), 1);
    assert!(names.iter().all(|n| !n.is_empty()));
}

#[test]
fn leaf_metadata_records_extra_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");
    let extra = vec!["10.0.0.100".to_string()];

    ca.issue_leaf("SERIAL1", &extra).unwrap();

    let meta = ca.leaf_metadata().unwrap();
    assert_eq!(meta.serial, "SERIAL1");
    assert_eq!(meta.extra_addresses, extra);
    assert!(meta.generated_at_secs > 0);
    assert!(ca.leaf_matches("SERIAL1", &extra));
    assert!(!ca.leaf_matches("SERIAL1", &[]));
}

#[test]
fn chain_keys_are_ecdsa() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");

    let paths = ca.ensure_chain("SERIAL1", &[]).unwrap();

    let chain = fs::read(&paths.cert).unwrap();
    let mut count = 0;
    for pem in Pem::iter_from_buffer(&chain) {
        let pem = pem.unwrap();
        let cert = pem.parse_x509().unwrap();
        let key = cert.public_key().parsed().unwrap();
        assert!(matches!(key, PublicKey::EC(_)), "{}", cert.subject());
        count += 1;
    }
    assert_eq!(count, 2);
}

#[cfg(unix)]
#[test]
fn key_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let ca = authority_in(&dir, "a");
    let paths = ca.ensure_chain("SERIAL1", &[]).unwrap();

    for path in [paths.key, dir.path().join("authority").join("ca-key.pem")] {
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "{} should be 0600", path.display());
    }
}
