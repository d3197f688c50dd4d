//! Certificate authority store
//!
//! Owns the self-signed root used to sign per-host leaves. The key pair is
//! generated once and persisted under `~/.proxyMan/cert/`; later starts
//! load it back. The SHA-1 fingerprint of the DER certificate and the
//! random e-mail SAN identify this CA in OS trust stores.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "ca.crt";
const CA_KEY_FILENAME: &str = "ca.key";

/// Root key strength. Leaves use [`LEAF_KEY_BITS`].
const CA_KEY_BITS: usize = 4096;
pub(crate) const LEAF_KEY_BITS: usize = 2048;

const CA_COMMON_NAME: &str = "ProxyMan";
const CA_VALIDITY_DAYS: i64 = 3650;
const CA_SERIAL: u64 = 2023;

/// Errors raised while loading or generating CA material. All of these are
/// fatal at startup.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),

    #[error("failed to build certificate: {0}")]
    CertGeneration(String),

    #[error("failed to parse certificate material: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The process CA: issuer handle plus the identity data trust-store
/// integration needs.
pub struct CaStore {
    cert_dir: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: Vec<u8>,
    sha1_fingerprint: String,
    email: String,
}

impl std::fmt::Debug for CaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaStore")
            .field("cert_dir", &self.cert_dir)
            .field("sha1_fingerprint", &self.sha1_fingerprint)
            .field("email", &self.email)
            .finish()
    }
}

impl CaStore {
    /// Loads the CA from `cert_dir`, generating and persisting a fresh one
    /// if no certificate exists yet.
    pub fn initialize(cert_dir: impl AsRef<Path>) -> Result<Self, CertError> {
        Self::initialize_with_key_bits(cert_dir, CA_KEY_BITS)
    }

    /// Like [`initialize`](Self::initialize) with a custom root key size.
    /// Smaller keys keep unoptimized test builds fast.
    pub fn initialize_with_key_bits(
        cert_dir: impl AsRef<Path>,
        key_bits: usize,
    ) -> Result<Self, CertError> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cert_dir)?;

        let cert_path = cert_dir.join(CA_CERT_FILENAME);
        if !cert_path.exists() {
            info!(dir = %cert_dir.display(), "generating new CA");
            generate_ca(&cert_dir, key_bits)?;
        }
        Self::load(cert_dir)
    }

    fn load(cert_dir: PathBuf) -> Result<Self, CertError> {
        let cert_pem = fs::read_to_string(cert_dir.join(CA_CERT_FILENAME))?;
        let key_pem = fs::read_to_string(cert_dir.join(CA_KEY_FILENAME))?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CertError::Parse(e.to_string()))?;

        let cert_der = pem_to_der(&cert_pem)?;
        let sha1_fingerprint = hex::encode(Sha1::digest(&cert_der));

        // The e-mail SAN written at generation time distinguishes this CA
        // from any other ProxyMan install in trust-store lookups.
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CertError::Parse(e.to_string()))?;
        let email = params
            .subject_alt_names
            .iter()
            .find_map(|san| match san {
                SanType::Rfc822Name(name) => Some(name.as_str().to_string()),
                _ => None,
            })
            .unwrap_or_default();

        info!(fingerprint = %sha1_fingerprint, "CA loaded");

        Ok(Self {
            cert_dir,
            issuer,
            cert_pem,
            cert_der,
            sha1_fingerprint,
            email,
        })
    }

    /// Issuer handle used to sign leaf certificates.
    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    /// Lowercase hex SHA-1 of the DER-encoded CA certificate.
    pub fn sha1_fingerprint(&self) -> &str {
        &self.sha1_fingerprint
    }

    /// The random e-mail SAN minted at generation time.
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(CA_CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(CA_KEY_FILENAME)
    }

    pub fn cert_exists(&self) -> bool {
        self.cert_path().exists()
    }

    /// Removes the persisted key pair from disk. The in-memory CA keeps
    /// working until the process exits; the next start regenerates.
    pub fn uninstall(&self) -> Result<(), CertError> {
        for path in [self.cert_path(), self.key_path()] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        info!(dir = %self.cert_dir.display(), "CA files removed");
        Ok(())
    }
}

fn generate_ca(cert_dir: &Path, key_bits: usize) -> Result<(), CertError> {
    let email = random_email();

    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, key_bits)
        .map_err(|e| CertError::KeyGeneration(e.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertError::KeyGeneration(e.to_string()))?;
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Parse(e.to_string()))?;

    let mut params =
        CertificateParams::new(Vec::new()).map_err(|e| CertError::CertGeneration(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_COMMON_NAME);
    params.subject_alt_names.push(SanType::Rfc822Name(
        Ia5String::try_from(email.clone()).map_err(|e| CertError::CertGeneration(e.to_string()))?,
    ));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.serial_number = Some(SerialNumber::from(CA_SERIAL));
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::CertGeneration(e.to_string()))?;

    let cert_path = cert_dir.join(CA_CERT_FILENAME);
    let key_path = cert_dir.join(CA_KEY_FILENAME);
    fs::write(&cert_path, cert.pem())?;
    fs::write(&key_path, key_pair.serialize_pem())?;
    set_file_mode(&cert_path)?;
    set_file_mode(&key_path)?;

    info!(dir = %cert_dir.display(), email = %email, "CA generated");
    Ok(())
}

/// Both files are persisted world-readable (0644) so trust-store tooling
/// can pick up the certificate without privilege tricks.
#[cfg(unix)]
fn set_file_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Extracts the DER payload of the first certificate block in a PEM file.
fn pem_to_der(cert_pem: &str) -> Result<Vec<u8>, CertError> {
    let mut reader = std::io::BufReader::new(cert_pem.as_bytes());
    let first = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| CertError::Parse("no certificate block in PEM".into()))?
        .map(|der| der.to_vec())
        .map_err(CertError::Io);
    first
}

fn random_email() -> String {
    let random: [u8; 8] = rand::random();
    format!("proxyman-{}@localhost", hex::encode(random))
}
