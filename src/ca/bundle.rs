//! The trust bundle: root certificate, leaf certificate and private key,
//! persisted together and regenerated together.

use std::path::{Path, PathBuf};

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use tracing::{info, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::public_key::PublicKey;

use super::trust::TrustStoreInstaller;
use super::{CertificateAuthority, DEFAULT_KEY_BITS};
use crate::error::{Error, Result};

pub const ROOT_CERT_FILE: &str = "idv_ca.pem";
pub const LEAF_CERT_FILE: &str = "idv_cert.pem";
pub const KEY_FILE: &str = "idv_key.pem";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    pub root_cert: PathBuf,
    pub leaf_cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    /// All three files existed and matched.
    Present,
    /// The triple was issued anew and the root installed.
    Regenerated,
}

impl TrustBundle {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            root_cert: dir.join(ROOT_CERT_FILE),
            leaf_cert: dir.join(LEAF_CERT_FILE),
            key: dir.join(KEY_FILE),
        }
    }

    pub fn is_present(&self) -> bool {
        self.files().iter().all(|path| path.is_file())
    }

    /// Checks that the leaf is signed by the root, that the key belongs to
    /// the leaf and that `hostname` is among the leaf's names.
    pub fn verify(&self, hostname: &str) -> Result<()> {
        let root_pem = read(&self.root_cert)?;
        let leaf_pem = read(&self.leaf_cert)?;
        let key_pem = String::from_utf8(read(&self.key)?)
            .map_err(|_| Error::Bundle(format!("{} is not UTF-8", self.key.display())))?;

        let (_, root_block) = parse_x509_pem(&root_pem)
            .map_err(|e| Error::Bundle(format!("{}: {e}", self.root_cert.display())))?;
        let (_, leaf_block) = parse_x509_pem(&leaf_pem)
            .map_err(|e| Error::Bundle(format!("{}: {e}", self.leaf_cert.display())))?;
        let root = root_block
            .parse_x509()
            .map_err(|e| Error::Bundle(format!("{}: {e}", self.root_cert.display())))?;
        let leaf = leaf_block
            .parse_x509()
            .map_err(|e| Error::Bundle(format!("{}: {e}", self.leaf_cert.display())))?;

        if !root.is_ca() {
            return Err(Error::Bundle("root certificate is not a CA".into()));
        }
        if leaf.issuer().as_raw() != root.subject().as_raw() {
            return Err(Error::Bundle("leaf was not issued by the root".into()));
        }
        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| Error::Bundle(format!("leaf signature does not verify: {e}")))?;

        let names_host = leaf
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .any(|name| matches!(name, GeneralName::DNSName(dns) if dns.eq_ignore_ascii_case(hostname)))
            })
            .unwrap_or(false);
        if !names_host {
            return Err(Error::Bundle(format!("leaf does not cover {hostname}")));
        }

        let key = RsaPrivateKey::from_pkcs1_pem(&key_pem)
            .map_err(|e| Error::Bundle(format!("{}: {e}", self.key.display())))?;
        let leaf_modulus = match leaf.public_key().parsed() {
            Ok(PublicKey::RSA(rsa)) => trim_leading_zeros(rsa.modulus).to_vec(),
            _ => return Err(Error::Bundle("leaf does not carry an RSA key".into())),
        };
        if key.n().to_bytes_be() != leaf_modulus {
            return Err(Error::Bundle("private key does not match the leaf".into()));
        }
        Ok(())
    }

    /// Makes sure a consistent bundle for `hostname` exists, issuing and
    /// installing a fresh one when any file is missing or mismatched.
    pub fn ensure(
        &self,
        hostname: &str,
        installer: &dyn TrustStoreInstaller,
    ) -> Result<BundleStatus> {
        if self.is_present() {
            match self.verify(hostname) {
                Ok(()) => {
                    info!(dir = %self.root_cert.display(), "trust bundle present");
                    return Ok(BundleStatus::Present);
                }
                Err(e) => warn!("regenerating trust bundle: {e}"),
            }
        } else {
            info!("trust bundle missing, generating");
        }

        self.generate(hostname)?;
        if let Err(e) = installer.install(&self.root_cert) {
            self.remove();
            return Err(e);
        }
        Ok(BundleStatus::Regenerated)
    }

    fn generate(&self, hostname: &str) -> Result<()> {
        let mut ca = CertificateAuthority::generate(DEFAULT_KEY_BITS)?;
        ca.issue_root()?;
        ca.issue_leaf([hostname])?;

        let (Some(root), Some(leaf)) = (ca.root(), ca.leaf()) else {
            return Err(Error::CertificateBuild("issued certificates went missing".into()));
        };
        CertificateAuthority::export_certificate(&self.root_cert, root)?;
        CertificateAuthority::export_certificate(&self.leaf_cert, leaf)?;
        ca.export_key(&self.key)?;
        info!(host = hostname, "trust bundle written");
        Ok(())
    }

    /// Deletes whichever of the three files exist.
    pub fn remove(&self) {
        for path in self.files() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "could not remove: {e}"),
            }
        }
    }

    fn files(&self) -> [&Path; 3] {
        [&self.root_cert, &self.leaf_cert, &self.key]
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::io(format!("read {}", path.display()), e))
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
