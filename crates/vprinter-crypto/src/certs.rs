//! Authority and leaf certificate issuance.
//!
//! The authority lives at a shared path and is reused by every virtual
//! printer instance; leaf material lives in a per-instance directory.
//!
//! ```text
//! <authority_dir>/ca.pem          authority certificate
//! <authority_dir>/ca-key.pem      authority key (0600)
//! <leaf_dir>/server.pem           leaf + authority (full chain)
//! <leaf_dir>/server-key.pem       leaf key (0600)
//! <leaf_dir>/leaf.json            serial + embedded addresses
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::SystemTime;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::CertError;

/// Authority validity (20 years).
pub const AUTHORITY_VALIDITY_DAYS: i64 = 20 * 365;

/// Leaf validity (10 years).
pub const LEAF_VALIDITY_DAYS: i64 = 10 * 365;

/// Regenerate the authority when it expires within this many days.
pub const RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Generic authority name; deliberately not a vendor name.
pub const AUTHORITY_COMMON_NAME: &str = "VPrinter Local Authority";

/// Hostname alias slicers may dial instead of an IP address.
pub const DEVICE_HOSTNAME: &str = "bblp.local";

const CA_CERT_FILENAME: &str = "ca.pem";
const CA_KEY_FILENAME: &str = "ca-key.pem";
const LEAF_CERT_FILENAME: &str = "server.pem";
const LEAF_KEY_FILENAME: &str = "server-key.pem";
/// Leaf metadata filename.
pub const METADATA_FILENAME: &str = "leaf.json";

/// Paths to a certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// Leaf followed by the authority, PEM.
    pub cert: PathBuf,
    /// Leaf private key, PEM.
    pub key: PathBuf,
}

/// What the cached leaf was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafMetadata {
    pub serial: String,
    /// Caller-supplied extra addresses embedded as alternative names.
    pub extra_addresses: Vec<String>,
    pub generated_at_secs: u64,
}

/// Loaded authority material.
#[derive(Clone)]
struct Authority {
    dir: PathBuf,
    cert_pem: String,
    key_pem: String,
    not_after_secs: i64,
}

/// Process-wide authority cache.
///
/// The lock also serialises generation so two instances starting at once
/// cannot both write a fresh authority.
static AUTHORITY: LazyLock<Mutex<Option<Authority>>> = LazyLock::new(|| Mutex::new(None));

/// Drop the cached authority so the next request reloads it from disk.
pub fn invalidate_authority_cache() {
    *AUTHORITY.lock().unwrap_or_else(PoisonError::into_inner) = None;
}

/// Issues and persists the certificate chain for one virtual printer.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    authority_dir: PathBuf,
    leaf_dir: PathBuf,
}

impl CertificateAuthority {
    pub fn new(authority_dir: impl Into<PathBuf>, leaf_dir: impl Into<PathBuf>) -> Self {
        Self {
            authority_dir: authority_dir.into(),
            leaf_dir: leaf_dir.into(),
        }
    }

    /// Where the leaf chain and key are (or will be) written.
    pub fn leaf_paths(&self) -> CertPaths {
        CertPaths {
            cert: self.leaf_dir.join(LEAF_CERT_FILENAME),
            key: self.leaf_dir.join(LEAF_KEY_FILENAME),
        }
    }

    /// Path of the shared authority certificate.
    pub fn authority_cert_path(&self) -> PathBuf {
        self.authority_dir.join(CA_CERT_FILENAME)
    }

    /// Return a usable chain, issuing a leaf only if none is cached.
    ///
    /// A cached leaf is reused unconditionally; callers invalidate it when
    /// the serial or the advertised addresses change.
    pub fn ensure_chain(&self, serial: &str, extra: &[String]) -> Result<CertPaths, CertError> {
        let paths = self.leaf_paths();
        if paths.cert.exists() && paths.key.exists() {
            debug!(cert = %paths.cert.display(), "Reusing cached leaf certificate");
            return Ok(paths);
        }
        self.issue_leaf(serial, extra)
    }

    /// Delete the cached leaf so the next `ensure_chain` issues a new one.
    pub fn invalidate_leaf(&self) -> Result<(), CertError> {
        let paths = self.leaf_paths();
        for path in [
            paths.cert,
            paths.key,
            self.leaf_dir.join(METADATA_FILENAME),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CertError::io(&path, e)),
            }
        }
        info!(leaf_dir = %self.leaf_dir.display(), "Leaf certificate invalidated");
        Ok(())
    }

    /// Metadata of the cached leaf, `None` if absent or unreadable.
    pub fn leaf_metadata(&self) -> Option<LeafMetadata> {
        let content = fs::read_to_string(self.leaf_dir.join(METADATA_FILENAME)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Whether the cached leaf was issued for exactly this serial and addresses.
    pub fn leaf_matches(&self, serial: &str, extra: &[String]) -> bool {
        self.leaf_metadata()
            .is_some_and(|m| m.serial == serial && m.extra_addresses == dedup(extra.to_vec()))
    }

    /// Load the authority from disk, or generate and persist a fresh one if it
    /// is absent, unreadable, or within the renewal window.
    ///
    /// Returns the authority certificate PEM.
    pub fn regenerate_authority_if_needed(&self) -> Result<String, CertError> {
        Ok(self.authority()?.cert_pem)
    }

    fn authority(&self) -> Result<Authority, CertError> {
        let mut cache = AUTHORITY.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(cached) = cache.as_ref() {
            if cached.dir == self.authority_dir
                && !expires_within(cached.not_after_secs, RENEWAL_THRESHOLD_DAYS)
            {
                return Ok(cached.clone());
            }
        }

        let authority = match self.load_authority() {
            Ok(loaded) if !expires_within(loaded.not_after_secs, RENEWAL_THRESHOLD_DAYS) => loaded,
            Ok(_) => {
                info!("Authority certificate expires within {RENEWAL_THRESHOLD_DAYS} days, regenerating");
                self.generate_authority()?
            }
            Err(e) => {
                if self.authority_cert_path().exists() {
                    warn!(error = %e, "Existing authority unusable, regenerating");
                }
                self.generate_authority()?
            }
        };

        *cache = Some(authority.clone());
        Ok(authority)
    }

    fn load_authority(&self) -> Result<Authority, CertError> {
        let cert_path = self.authority_dir.join(CA_CERT_FILENAME);
        let key_path = self.authority_dir.join(CA_KEY_FILENAME);
        let cert_pem = fs::read_to_string(&cert_path).map_err(|e| CertError::io(&cert_path, e))?;
        let key_pem = fs::read_to_string(&key_path).map_err(|e| CertError::io(&key_path, e))?;

        // Reject a mismatched or corrupt key now rather than at signing time.
        KeyPair::from_pem(&key_pem)?;
        let not_after_secs = not_after_secs(&cert_pem)?;

        Ok(Authority {
            dir: self.authority_dir.clone(),
            cert_pem,
            key_pem,
            not_after_secs,
        })
    }

    /// Generate and persist a self-signed authority.
    ///
    /// Authority and leaf keys are ECDSA P-256, not RSA-2048: rcgen's ring
    /// backend can only generate ECDSA and Ed25519 keys. Slicer TLS clients
    /// accept either key type.
    fn generate_authority(&self) -> Result<Authority, CertError> {
        fs::create_dir_all(&self.authority_dir)
            .map_err(|e| CertError::io(&self.authority_dir, e))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, AUTHORITY_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "VPrinter");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(AUTHORITY_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        write_private(&self.authority_dir.join(CA_KEY_FILENAME), &key_pem)?;
        write_private(&self.authority_dir.join(CA_CERT_FILENAME), &cert_pem)?;

        info!(
            authority_dir = %self.authority_dir.display(),
            "Authority certificate generated"
        );

        Ok(Authority {
            dir: self.authority_dir.clone(),
            not_after_secs: not_after_secs(&cert_pem)?,
            cert_pem,
            key_pem,
        })
    }

    /// Issue a fresh leaf for `serial`, overwriting any cached one.
    pub fn issue_leaf(&self, serial: &str, extra: &[String]) -> Result<CertPaths, CertError> {
        let authority = self.authority()?;
        fs::create_dir_all(&self.leaf_dir).map_err(|e| CertError::io(&self.leaf_dir, e))?;

        let names = subject_alt_names(serial, extra);
        let mut params = CertificateParams::new(names.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, serial);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let issuer =
            Issuer::from_ca_cert_pem(&authority.cert_pem, KeyPair::from_pem(&authority.key_pem)?)?;
        // ECDSA P-256, same as the authority.
        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &issuer)?;

        let paths = self.leaf_paths();
        write_private(&paths.key, &leaf_key.serialize_pem())?;
        let mut chain = leaf.pem();
        if !chain.ends_with('\n') {
            chain.push('\n');
        }
        chain.push_str(&authority.cert_pem);
        write_private(&paths.cert, &chain)?;

        let metadata = LeafMetadata {
            serial: serial.to_string(),
            extra_addresses: dedup(extra.to_vec()),
            generated_at_secs: unix_now(),
        };
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| CertError::Generation(format!("Failed to serialize leaf metadata: {e}")))?;
        let meta_path = self.leaf_dir.join(METADATA_FILENAME);
        fs::write(&meta_path, json).map_err(|e| CertError::io(&meta_path, e))?;

        info!(
            serial = %serial,
            names = ?names,
            cert = %paths.cert.display(),
            "Leaf certificate issued"
        );
        Ok(paths)
    }
}

/// Alternative names for a leaf: every name a slicer might dial.
pub fn subject_alt_names(serial: &str, extra: &[String]) -> Vec<String> {
    let mut names = vec![
        "localhost".to_string(),
        DEVICE_HOSTNAME.to_string(),
        serial.to_string(),
    ];
    if let Some(lan) = vprinter_core::net::local_lan_address() {
        names.push(lan.to_string());
    }
    names.push("127.0.0.1".to_string());
    names.extend(extra.iter().map(|a| a.trim().to_string()));
    dedup(names)
}

/// Drop blanks and repeats, keeping first-seen order.
fn dedup(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

fn not_after_secs(cert_pem: &str) -> Result<i64, CertError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CertError::Parse(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertError::Parse(e.to_string()))?;
    Ok(cert.validity().not_after.timestamp())
}

fn expires_within(not_after_secs: i64, days: i64) -> bool {
    let now = i64::try_from(unix_now()).unwrap_or(i64::MAX);
    now.saturating_add(days * 86_400) >= not_after_secs
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Write a file readable by the owner only.
fn write_private(path: &Path, content: &str) -> Result<(), CertError> {
    fs::write(path, content).map_err(|e| CertError::io(path, e))?;
    restrict_permissions(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), CertError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| CertError::io(path, e))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn restrict_permissions(_path: &Path) -> Result<(), CertError> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[path = "certs_tests.rs"]
mod tests;
