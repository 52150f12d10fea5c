//! Installing the root certificate into the operating system trust store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use crate::error::{Error, Result};

const LINUX_ANCHOR_DIR: &str = "/usr/local/share/ca-certificates";
const LINUX_ANCHOR_NAME: &str = "idv-login-ca.crt";
const MACOS_SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Adds a root certificate file to the set of roots the OS trusts.
pub trait TrustStoreInstaller: Send + Sync {
    fn name(&self) -> &'static str;

    fn install(&self, cert_path: &Path) -> Result<()>;
}

/// Runs `program args.. <cert_path>` and treats a non-zero exit as failure.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    name: &'static str,
    program: String,
    args: Vec<String>,
}

impl CommandInstaller {
    pub fn new(name: &'static str, program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name,
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// `certutil -addstore -f Root <file>`
    pub fn certutil() -> Self {
        Self::new("certutil", "certutil", &["-addstore", "-f", "Root"])
    }

    /// `security add-trusted-cert` into the System keychain.
    pub fn keychain() -> Self {
        Self::new(
            "security",
            "security",
            &[
                "add-trusted-cert",
                "-d",
                "-r",
                "trustRoot",
                "-k",
                MACOS_SYSTEM_KEYCHAIN,
            ],
        )
    }
}

impl TrustStoreInstaller for CommandInstaller {
    fn name(&self) -> &'static str {
        self.name
    }

    fn install(&self, cert_path: &Path) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(cert_path)
            .status()
            .map_err(|e| Error::TrustInstall {
                installer: self.name,
                message: format!("could not run {}: {e}", self.program),
            })?;
        if !status.success() {
            return Err(Error::TrustInstall {
                installer: self.name,
                message: format!("{} exited with {status}", self.program),
            });
        }
        info!(installer = self.name, path = %cert_path.display(), "root certificate installed");
        Ok(())
    }
}

/// Debian-style anchor directory plus `update-ca-certificates`. Hosts
/// without that mechanism get a warning instead of a failure.
#[derive(Debug, Clone)]
pub struct CaCertificatesInstaller {
    anchor: PathBuf,
}

impl Default for CaCertificatesInstaller {
    fn default() -> Self {
        Self {
            anchor: Path::new(LINUX_ANCHOR_DIR).join(LINUX_ANCHOR_NAME),
        }
    }
}

impl TrustStoreInstaller for CaCertificatesInstaller {
    fn name(&self) -> &'static str {
        "update-ca-certificates"
    }

    fn install(&self, cert_path: &Path) -> Result<()> {
        let anchor_dir = self.anchor.parent().unwrap_or_else(|| Path::new(LINUX_ANCHOR_DIR));
        if !anchor_dir.is_dir() {
            warn!(
                dir = %anchor_dir.display(),
                "no system CA anchor directory, trust {} manually",
                cert_path.display()
            );
            return Ok(());
        }

        std::fs::copy(cert_path, &self.anchor).map_err(|e| Error::TrustInstall {
            installer: self.name(),
            message: format!("copy to {}: {e}", self.anchor.display()),
        })?;

        match Command::new("update-ca-certificates").status() {
            Ok(status) if status.success() => {
                info!(anchor = %self.anchor.display(), "root certificate installed");
                Ok(())
            }
            Ok(status) => Err(Error::TrustInstall {
                installer: self.name(),
                message: format!("update-ca-certificates exited with {status}"),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("update-ca-certificates not found, trust {} manually", cert_path.display());
                Ok(())
            }
            Err(e) => Err(Error::TrustInstall {
                installer: self.name(),
                message: e.to_string(),
            }),
        }
    }
}

/// For platforms with no OS-level store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstaller;

impl TrustStoreInstaller for NoopInstaller {
    fn name(&self) -> &'static str {
        "none"
    }

    fn install(&self, cert_path: &Path) -> Result<()> {
        warn!(
            "no trust store mechanism on this platform, trust {} manually",
            cert_path.display()
        );
        Ok(())
    }
}

pub fn platform_installer() -> Box<dyn TrustStoreInstaller> {
    if cfg!(target_os = "windows") {
        Box::new(CommandInstaller::certutil())
    } else if cfg!(target_os = "macos") {
        Box::new(CommandInstaller::keychain())
    } else if cfg!(target_os = "linux") {
        Box::new(CaCertificatesInstaller::default())
    } else {
        Box::new(NoopInstaller)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_success() {
        let installer = CommandInstaller::new("true", "true", &[]);
        installer.install(Path::new("/dev/null")).unwrap();
    }

    #[test]
    fn non_zero_exit_is_trust_install_error() {
        let installer = CommandInstaller::new("false", "false", &[]);
        let err = installer.install(Path::new("/dev/null")).unwrap_err();
        assert!(matches!(err, Error::TrustInstall { installer: "false", .. }));
    }

    #[test]
    fn missing_program_is_trust_install_error() {
        let installer = CommandInstaller::new("missing", "idv-login-no-such-binary", &[]);
        assert!(installer.install(Path::new("/dev/null")).is_err());
    }

    #[test]
    fn missing_anchor_dir_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CaCertificatesInstaller {
            anchor: dir.path().join("absent").join("ca.crt"),
        };
        installer.install(Path::new("/dev/null")).unwrap();
    }
}
