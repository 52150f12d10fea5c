//! Local certificate authority.
//!
//! One RSA key pair is generated per bootstrap. It self-signs the root
//! certificate and is also the key of the leaf certificate presented by the
//! proxy, so the trust bundle carries a single private key file.

pub mod bundle;
pub mod trust;

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

/// Validity of both the root and the leaf.
pub const VALIDITY_DAYS: i64 = 3650;
pub const DEFAULT_KEY_BITS: usize = 2048;
const MIN_KEY_BITS: usize = 2048;
const MAX_KEY_BITS: usize = 8192;
const SERIAL_BYTES: usize = 16;
const ORGANIZATION: &str = "Login Helper";

pub struct CertificateAuthority {
    validity: Duration,
    private_key: RsaPrivateKey,
    key_pair: KeyPair,
    root: Option<Certificate>,
    leaf: Option<Certificate>,
}

impl CertificateAuthority {
    /// Generates the RSA key pair the authority signs with.
    pub fn generate(bits: usize) -> Result<Self> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(Error::Crypto(format!(
                "RSA modulus of {bits} bits is outside {MIN_KEY_BITS}..={MAX_KEY_BITS}"
            )));
        }

        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| Error::Crypto(format!("generate RSA key: {e}")))?;
        let pkcs8 = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("encode RSA key: {e}")))?;
        let key_pair = KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)
            .map_err(|e| Error::Crypto(format!("load RSA key for signing: {e}")))?;

        Ok(Self {
            validity: Duration::days(VALIDITY_DAYS),
            private_key,
            key_pair,
            root: None,
            leaf: None,
        })
    }

    pub fn root(&self) -> Option<&Certificate> {
        self.root.as_ref()
    }

    pub fn leaf(&self) -> Option<&Certificate> {
        self.leaf.as_ref()
    }

    /// Self-signs the CA certificate, valid from now for the fixed window.
    pub fn issue_root(&mut self) -> Result<&Certificate> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());
        params.distinguished_name = subject(Some(ORGANIZATION));
        self.set_validity(&mut params);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyCertSign,
        ];

        let root = params.self_signed(&self.key_pair)?;
        Ok(self.root.insert(root))
    }

    /// Issues a certificate whose SAN list is exactly `hostnames`, signed by
    /// the root. [`issue_root`](Self::issue_root) must have run first.
    pub fn issue_leaf<I, S>(&mut self, hostnames: I) -> Result<&Certificate>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| Error::CertificateBuild("root certificate has not been issued".into()))?;

        let names: Vec<String> = hostnames
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if names.is_empty() {
            return Err(Error::CertificateBuild(
                "leaf certificate needs at least one hostname".into(),
            ));
        }

        let mut params = CertificateParams::new(names)?;
        params.serial_number = Some(random_serial());
        params.distinguished_name = subject(None);
        self.set_validity(&mut params);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let leaf = params.signed_by(&self.key_pair, root, &self.key_pair)?;
        Ok(self.leaf.insert(leaf))
    }

    pub fn export_certificate(path: &Path, cert: &Certificate) -> Result<()> {
        let block = pem::Pem::new("CERTIFICATE", cert.der().to_vec());
        write_atomic(path, pem::encode(&block).as_bytes())
    }

    /// Writes the key as a PKCS#1 `RSA PRIVATE KEY` block.
    pub fn export_key(&self, path: &Path) -> Result<()> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .map_err(|e| Error::Crypto(format!("encode PKCS#1 key: {e}")))?;
        let block = pem::Pem::new("RSA PRIVATE KEY", der.as_bytes().to_vec());
        write_atomic(path, pem::encode(&block).as_bytes())
    }

    fn set_validity(&self, params: &mut CertificateParams) {
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + self.validity;
    }
}

fn subject(common_name: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, ORGANIZATION);
    if let Some(cn) = common_name {
        dn.push(DnType::CommonName, cn);
    }
    dn
}

// Serials are drawn independently; root/leaf collisions are not checked.
fn random_serial() -> SerialNumber {
    let bytes: [u8; SERIAL_BYTES] = rand::thread_rng().r#gen();
    SerialNumber::from(bytes.to_vec())
}

/// Writes into a temporary sibling and renames it over `path`, so readers
/// never observe a partially written file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("create directory {}", dir.display()), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("create temporary file in {}", dir.display()), e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("write {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("rename into {}", path.display()), e.error))?;
    Ok(())
}
