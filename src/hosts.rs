//! The local redirect: a `127.0.0.1 <host>` line in the system hosts file.

use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn system() -> Self {
        let path = if cfg!(windows) {
            let root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".into());
            Path::new(&root).join(r"System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self { path }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        OpenOptions::new().append(true).open(&self.path).is_ok()
    }

    /// True when some line maps `host` to the loopback address.
    pub fn has_redirect(&self, host: &str) -> Result<bool> {
        Ok(self
            .read()?
            .lines()
            .filter_map(parse_line)
            .any(|(ip, names)| ip == LOOPBACK && names.iter().any(|n| n.eq_ignore_ascii_case(host))))
    }

    pub fn add_redirect(&self, host: &str) -> Result<()> {
        if self.has_redirect(host)? {
            return Ok(());
        }
        let mut text = self.read()?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("{LOOPBACK} {host}\n"));
        self.write(&text)?;
        info!(host, path = %self.path.display(), "hosts redirect added");
        Ok(())
    }

    /// Drops `host` from every loopback line; lines left without names go.
    pub fn remove_redirect(&self, host: &str) -> Result<()> {
        let text = self.read()?;
        let mut changed = false;
        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            match parse_line(line) {
                Some((ip, names))
                    if ip == LOOPBACK && names.iter().any(|n| n.eq_ignore_ascii_case(host)) =>
                {
                    changed = true;
                    let rest: Vec<&str> = names
                        .into_iter()
                        .filter(|n| !n.eq_ignore_ascii_case(host))
                        .collect();
                    if !rest.is_empty() {
                        out.push_str(&format!("{ip} {}\n", rest.join(" ")));
                    }
                }
                _ => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        if changed {
            self.write(&out)?;
            info!(host, path = %self.path.display(), "hosts redirect removed");
        }
        Ok(())
    }

    fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Hosts(format!("read {}: {e}", self.path.display())))
    }

    fn write(&self, text: &str) -> Result<()> {
        std::fs::write(&self.path, text).map_err(|e| {
            Error::Hosts(format!(
                "write {} (run elevated or allow it in antivirus): {e}",
                self.path.display()
            ))
        })
    }
}

/// A redirect that follows the proxy: added when it starts, taken out when it
/// stops. A line that was already in the file is left alone.
#[derive(Debug)]
pub struct ManagedRedirect {
    hosts: HostsFile,
    host: String,
    owned: bool,
}

impl ManagedRedirect {
    pub fn new(hosts: HostsFile, host: impl Into<String>) -> Self {
        Self {
            hosts,
            host: host.into(),
            owned: false,
        }
    }

    pub fn hosts(&self) -> &HostsFile {
        &self.hosts
    }

    pub fn engage(&mut self) -> Result<()> {
        if self.owned || self.hosts.has_redirect(&self.host)? {
            return Ok(());
        }
        self.hosts.add_redirect(&self.host)?;
        self.owned = true;
        Ok(())
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.owned {
            return Ok(());
        }
        self.hosts.remove_redirect(&self.host)?;
        self.owned = false;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(IpAddr, Vec<&str>)> {
    let content = line.split('#').next().unwrap_or_default();
    let mut fields = content.split_whitespace();
    let ip = fields.next()?.parse().ok()?;
    Some((ip, fields.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts_with(content: &str) -> (tempfile::TempDir, HostsFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, content).unwrap();
        (dir, HostsFile::at(path))
    }

    #[test]
    fn add_then_remove_restores_other_entries() {
        let (_dir, hosts) = hosts_with("# comment\n127.0.0.1 localhost\n10.0.0.1 db");
        assert!(!hosts.has_redirect("example.com").unwrap());

        hosts.add_redirect("example.com").unwrap();
        hosts.add_redirect("example.com").unwrap();
        assert!(hosts.has_redirect("example.com").unwrap());
        let text = std::fs::read_to_string(hosts.path()).unwrap();
        assert_eq!(text.matches("example.com").count(), 1);

        hosts.remove_redirect("example.com").unwrap();
        assert!(!hosts.has_redirect("example.com").unwrap());
        assert_eq!(
            std::fs::read_to_string(hosts.path()).unwrap(),
            "# comment\n127.0.0.1 localhost\n10.0.0.1 db\n"
        );
    }

    #[test]
    fn other_addresses_are_not_redirects() {
        let (_dir, hosts) = hosts_with("10.0.0.1 example.com\n#127.0.0.1 example.com\n");
        assert!(!hosts.has_redirect("example.com").unwrap());
    }

    #[test]
    fn managed_redirect_toggles_its_own_line() {
        let (_dir, hosts) = hosts_with("10.0.0.1 db\n");
        let mut redirect = ManagedRedirect::new(hosts.clone(), "example.com");

        redirect.engage().unwrap();
        redirect.engage().unwrap();
        assert!(hosts.has_redirect("example.com").unwrap());

        redirect.release().unwrap();
        assert!(!hosts.has_redirect("example.com").unwrap());
        redirect.release().unwrap();

        redirect.engage().unwrap();
        assert!(hosts.has_redirect("example.com").unwrap());
        assert_eq!(std::fs::read_to_string(hosts.path()).unwrap().matches("example.com").count(), 1);
    }

    #[test]
    fn managed_redirect_keeps_existing_line() {
        let (_dir, hosts) = hosts_with("127.0.0.1 example.com\n");
        let mut redirect = ManagedRedirect::new(hosts.clone(), "example.com");

        redirect.engage().unwrap();
        redirect.release().unwrap();
        assert!(hosts.has_redirect("example.com").unwrap());
    }

    #[test]
    fn removal_keeps_aliases_on_shared_lines() {
        let (_dir, hosts) = hosts_with("127.0.0.1 localhost example.com\n");
        hosts.remove_redirect("example.com").unwrap();
        assert_eq!(std::fs::read_to_string(hosts.path()).unwrap(), "127.0.0.1 localhost\n");
    }
}
