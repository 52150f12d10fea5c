use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use idv_login::ca::bundle::{BundleStatus, TrustBundle};
use idv_login::ca::trust::platform_installer;
use idv_login::config::{DEFAULT_CONFIG_PATH, Settings};
use idv_login::hosts::{HostsFile, ManagedRedirect};
use idv_login::lifecycle::{Coordinator, ProxyOptions};
use idv_login::logging;
use idv_login::resolver::UpstreamResolver;

#[derive(Parser)]
#[command(name = "idv-login", version, about = "Local TLS interception proxy for the login host")]
struct Cli {
    /// Path of the settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Redirect the host, bootstrap certificates and run the proxy
    Run {
        /// Leave the hosts file alone
        #[arg(long)]
        no_hosts: bool,
    },
    /// Generate and install the certificate bundle
    Init {
        /// Regenerate even when a valid bundle exists
        #[arg(long)]
        force: bool,
    },
    /// Print the real upstream address of the host
    Resolve,
    /// Manage the hosts-file redirect
    Hosts {
        #[command(subcommand)]
        action: HostsAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum HostsAction {
    /// Add `127.0.0.1 <host>`
    Add,
    /// Remove the redirect line
    Remove,
    /// Report whether the redirect is in place
    Status,
}

/// Lines accepted on stdin while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Start,
    Stop,
    Restart,
    Quit,
}

impl Control {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Control::Start),
            "stop" => Some(Control::Stop),
            "restart" => Some(Control::Restart),
            "quit" | "exit" => Some(Control::Quit),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let workdir = enter_program_dir(&mut cli.config);
    let (settings, created) = Settings::load_or_create(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _guard = logging::init(settings.debug, &settings.paths.log_dir)?;
    match workdir {
        Ok(dir) => info!(dir = %dir.display(), "working directory"),
        Err(e) => warn!("staying in the launch directory: {e}"),
    }
    if created {
        info!(path = %cli.config.display(), "wrote default settings");
    }

    match cli.command {
        Commands::Run { no_hosts } => run(&settings, !no_hosts).await,
        Commands::Init { force } => bootstrap(&settings, force).await.map(drop),
        Commands::Resolve => {
            let resolver = UpstreamResolver::from_settings(&settings).await?;
            let ip = resolver
                .resolve(&settings.host)
                .await
                .with_context(|| format!("resolving {}", settings.host))?;
            println!("{ip}");
            Ok(())
        }
        Commands::Hosts { action } => hosts(&settings.host, action),
    }
}

/// Settings, certificates and logs live next to the executable. A relative
/// `--config` keeps meaning the path it had at launch.
fn enter_program_dir(config: &mut PathBuf) -> std::io::Result<PathBuf> {
    if config.is_relative() && config.as_os_str() != DEFAULT_CONFIG_PATH {
        *config = std::env::current_dir()?.join(&*config);
    }
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| std::io::Error::other("executable has no parent directory"))?;
    std::env::set_current_dir(dir)?;
    Ok(dir.to_path_buf())
}

async fn run(settings: &Settings, manage_hosts: bool) -> Result<()> {
    let bundle = bootstrap(settings, false).await?;

    let resolver = UpstreamResolver::from_settings(settings).await?;
    let upstream = resolver.resolve_or(&settings.host, settings.default_ip).await;
    let mut coordinator = Coordinator::new(ProxyOptions::from_settings(settings, upstream), bundle);
    if manage_hosts {
        let hosts = HostsFile::system();
        if !hosts.is_writable() {
            warn!(path = %hosts.path().display(), "hosts file is not writable, run with elevated rights");
        }
        coordinator = coordinator.with_redirect(ManagedRedirect::new(hosts, settings.host.clone()));
    }

    if let Err(e) = coordinator.start().await {
        error!("proxy failed to start: {e}");
    }
    println!("commands: start | stop | restart | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let control = tokio::select! {
            _ = tokio::signal::ctrl_c() => Control::Quit,
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => match Control::parse(&line) {
                    Some(control) => control,
                    None => {
                        if !line.trim().is_empty() {
                            warn!(command = line.trim(), "unknown command");
                        }
                        continue;
                    }
                },
                None => Control::Quit,
            },
        };

        let result = match control {
            Control::Start => coordinator.start().await,
            Control::Stop => coordinator.stop().await,
            Control::Restart => coordinator.restart().await,
            Control::Quit => break,
        };
        if let Err(e) = result {
            error!(?control, "{e}");
        }
        info!(state = ?coordinator.state(), "proxy state");
    }

    coordinator.stop().await.context("stopping proxy")?;
    Ok(())
}

/// Key generation is CPU bound, so the bundle is built off the runtime threads.
async fn bootstrap(settings: &Settings, force: bool) -> Result<TrustBundle> {
    let bundle = TrustBundle::in_dir(&settings.paths.bundle_dir);
    if force {
        bundle.remove();
    }

    let host = settings.host.clone();
    let worker = bundle.clone();
    let status = tokio::task::spawn_blocking(move || {
        let installer = platform_installer();
        info!(installer = installer.name(), "trust store");
        worker.ensure(&host, installer.as_ref())
    })
    .await
    .context("certificate worker")?
    .context("preparing certificate bundle")?;

    if status == BundleStatus::Regenerated {
        info!(dir = %display_dir(&settings.paths.bundle_dir), "new certificate authority installed");
    }
    Ok(bundle)
}

fn hosts(host: &str, action: HostsAction) -> Result<()> {
    let hosts = HostsFile::system();
    match action {
        HostsAction::Add => hosts.add_redirect(host)?,
        HostsAction::Remove => hosts.remove_redirect(host)?,
        HostsAction::Status => {
            let state = if hosts.has_redirect(host)? { "redirected" } else { "not redirected" };
            println!("{host}: {state} ({})", hosts.path().display());
        }
    }
    Ok(())
}

fn display_dir(dir: &Path) -> String {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf()).display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_lines_are_case_insensitive() {
        assert_eq!(Control::parse(" Restart \n"), Some(Control::Restart));
        assert_eq!(Control::parse("exit"), Some(Control::Quit));
        assert_eq!(Control::parse("reload"), None);
    }

    #[test]
    fn explicit_relative_config_is_anchored_at_launch_dir() {
        let launch = std::env::current_dir().unwrap();
        let mut config = PathBuf::from("conf/idv.toml");
        let dir = enter_program_dir(&mut config).unwrap();

        assert_eq!(config, launch.join("conf/idv.toml"));
        assert_eq!(std::env::current_dir().unwrap(), dir);
        std::env::set_current_dir(launch).unwrap();
    }

    #[test]
    fn cli_accepts_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["idv-login", "run", "--no-hosts", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(cli.command, Commands::Run { no_hosts: true }));
    }
}
