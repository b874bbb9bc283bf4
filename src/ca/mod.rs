//! Root certificate authority for TLS interception.
//!
//! The proxy forges per-host leaf certificates signed by a locally trusted
//! root. This module owns the root: it loads the certificate and private key
//! from the configured directory, or generates and persists a fresh pair on
//! first run. The private key never leaves the process; only the certificate
//! is exposed for installation into client trust stores.
//!
//! Layout under `ca_root_path`:
//! - `spyglass-ca.crt` — root certificate, PEM
//! - `spyglass-ca.key` — root private key, PEM, mode 0600
//!
//! A directory containing one file but not the other is rejected rather than
//! silently regenerated, so a stale certificate can never be trusted against
//! a replaced key.

pub mod store;

pub use store::CertStore;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::error::CaError;

const CA_CERT_FILENAME: &str = "spyglass-ca.crt";
const CA_KEY_FILENAME: &str = "spyglass-ca.key";

/// Root CA validity: ten years.
const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Leaf validity: backdated one hour, valid for one year. The root outlives
/// every leaf it signs by construction.
const LEAF_BACKDATE_HOURS: i64 = 1;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The root certificate authority.
///
/// Holds the signing issuer in memory along with the PEM/DER forms of the
/// root certificate for export.
pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// A freshly minted leaf: certificate chain (leaf first, root last) plus the
/// leaf private key, both DER.
pub struct IssuedLeaf {
    /// Leaf certificate followed by the root certificate.
    pub chain: Vec<CertificateDer<'static>>,
    /// PKCS#8 private key for the leaf.
    pub key_der: Vec<u8>,
}

impl CertAuthority {
    /// Loads the root from `ca_dir`, generating and persisting a new one if
    /// the directory holds no CA material yet.
    pub fn load_or_generate(ca_dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let ca_dir = ca_dir.as_ref();
        let cert_path = ca_dir.join(CA_CERT_FILENAME);
        let key_path = ca_dir.join(CA_KEY_FILENAME);

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => Self::load(&cert_path, &key_path),
            (false, false) => {
                let (ca, key_pem) = Self::generate()?;
                fs::create_dir_all(ca_dir)?;
                fs::write(&cert_path, &ca.cert_pem)?;
                write_restricted_file(&key_path, &key_pem)?;
                info!("generated new root CA at {:?}", cert_path);
                Ok(ca)
            }
            _ => Err(CaError::InvalidLayout(format!(
                "{} and {} must both exist or both be absent",
                cert_path.display(),
                key_path.display()
            ))),
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Parse("no certificate in CA PEM".to_string()))?
            .map_err(|e| CaError::Parse(e.to_string()))?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        debug!("loaded root CA from {:?}", cert_path);

        Ok(Self {
            issuer,
            cert_pem,
            cert_der,
        })
    }

    fn generate() -> Result<(Self, String), CaError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "spyglass Root CA".to_string());
        dn.push(DnType::OrganizationName, "spyglass".to_string());
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(LEAF_BACKDATE_HOURS);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .clone()
            .self_signed(&key_pair)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;

        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        let issuer = Issuer::new(params, key_pair);

        Ok((
            Self {
                issuer,
                cert_pem,
                cert_der,
            },
            key_pem,
        ))
    }

    /// The root certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The root certificate in DER form.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Mints a leaf for `host` signed by this root.
    ///
    /// `host` must be bare (no port). CN is the host; the SAN is an IP entry
    /// when the host parses as an address, a DNS entry otherwise. Serial
    /// numbers are 128 random bits.
    pub fn issue_leaf(&self, host: &str) -> Result<IssuedLeaf, CaError> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.to_string());
        params.distinguished_name = dn;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params.subject_alt_names.push(SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::CertGeneration(format!("invalid DNS name '{host}'")))?,
            ));
        }

        let serial: [u8; 16] = rand::random();
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(LEAF_BACKDATE_HOURS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Ok(IssuedLeaf {
            chain: vec![cert.der().clone(), self.cert_der.clone()],
            key_der: leaf_key.serialize_der(),
        })
    }
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAuthority").finish_non_exhaustive()
    }
}

/// Paths to the CA material under a given directory.
pub fn ca_file_paths(ca_dir: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let dir = ca_dir.as_ref();
    (dir.join(CA_CERT_FILENAME), dir.join(CA_KEY_FILENAME))
}

#[cfg(unix)]
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
