//! Start/stop coordination of the proxy.
//!
//! `Stopped → Starting → Running → Stopping → Stopped`. Starting runs the
//! pre-flight checks and binds the listener; any failure drops back to
//! `Stopped` with nothing left running. Restart is `stop` then `start`
//! under one lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use crate::ca::bundle::TrustBundle;
use crate::config::Settings;
use crate::error::{Error, PreflightError, Result};
use crate::hosts::ManagedRedirect;
use crate::proxy::{self, Forwarder, ServerHandle};

/// Slack on top of the drain window for the server task to report back.
const JOIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub target_host: String,
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    pub drain_timeout: Duration,
}

impl ProxyOptions {
    pub fn from_settings(settings: &Settings, upstream_ip: IpAddr) -> Self {
        Self {
            target_host: settings.host.clone(),
            listen: settings.proxy.listen_addr(),
            upstream: SocketAddr::new(upstream_ip, settings.proxy.upstream_port),
            drain_timeout: settings.proxy.drain_timeout(),
        }
    }
}

/// The target host must currently resolve, via the OS resolver, to loopback.
pub async fn check_redirect(host: &str) -> std::result::Result<(), PreflightError> {
    let lookup = |source| PreflightError::Lookup {
        host: host.to_owned(),
        source,
    };
    let resolved = tokio::net::lookup_host((host, 0))
        .await
        .map_err(lookup)?
        .next()
        .ok_or_else(|| lookup(std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses")))?
        .ip();

    if !resolved.is_loopback() {
        return Err(PreflightError::RedirectMismatch {
            host: host.to_owned(),
            resolved,
        });
    }
    Ok(())
}

/// Bind-and-close probe of the listening address, with the same address
/// reuse the real listener gets so lingering closed connections do not count.
pub fn check_port(addr: SocketAddr) -> std::result::Result<(), PreflightError> {
    let in_use = |source| PreflightError::PortInUse { addr, source };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(in_use)?;
    #[cfg(unix)]
    socket.set_reuseaddr(true).map_err(in_use)?;
    socket.bind(addr).map_err(in_use)
}

pub struct Coordinator {
    options: ProxyOptions,
    bundle: TrustBundle,
    state: watch::Sender<ServerState>,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    handle: Option<ServerHandle>,
    redirect: Option<ManagedRedirect>,
}

impl Coordinator {
    pub fn new(options: ProxyOptions, bundle: TrustBundle) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            options,
            bundle,
            state,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Puts the hosts redirect in place on every start and takes it out on
    /// every stop.
    pub fn with_redirect(self, redirect: ManagedRedirect) -> Self {
        Self {
            slot: Mutex::new(Slot {
                handle: None,
                redirect: Some(redirect),
            }),
            ..self
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Address of the listener while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.lock().await.handle.as_ref().map(ServerHandle::local_addr)
    }

    /// Starts the proxy. A no-op when it is already running.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.start_locked(&mut slot).await
    }

    /// Stops the proxy, waiting at most the drain timeout for in-flight
    /// requests. A no-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let result = self.stop_locked(&mut slot).await;
        release(&mut slot);
        result
    }

    /// Stop then start. A drain that times out is logged and the start still
    /// goes ahead; the redirect stays in place throughout.
    pub async fn restart(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Err(e) = self.stop_locked(&mut slot).await {
            warn!("restarting after unclean stop: {e}");
        }
        self.start_locked(&mut slot).await
    }

    async fn start_locked(&self, slot: &mut Slot) -> Result<()> {
        if slot.handle.is_some() {
            warn!("proxy already running");
            return Ok(());
        }

        self.state.send_replace(ServerState::Starting);
        let launched = match slot.redirect.as_mut().map(ManagedRedirect::engage) {
            Some(Err(e)) => Err(e),
            _ => self.launch().await,
        };
        match launched {
            Ok(handle) => {
                slot.handle = Some(handle);
                self.state.send_replace(ServerState::Running);
                Ok(())
            }
            Err(e) => {
                release(slot);
                self.state.send_replace(ServerState::Stopped);
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, slot: &mut Slot) -> Result<()> {
        let Some(handle) = slot.handle.take() else {
            return Ok(());
        };

        self.state.send_replace(ServerState::Stopping);
        info!("stopping proxy");
        let drain = self.options.drain_timeout;
        let result = match tokio::time::timeout(drain + JOIN_GRACE, handle.stop()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ShutdownTimeout(drain)),
        };
        self.state.send_replace(ServerState::Stopped);
        result
    }

    async fn launch(&self) -> Result<ServerHandle> {
        let host = &self.options.target_host;
        check_redirect(host).await?;
        check_port(self.options.listen)?;

        let tls = proxy::tls::server_config(&self.bundle)?;
        let forwarder = Arc::new(Forwarder::new(host.clone(), self.options.upstream)?);
        let listener = TcpListener::bind(self.options.listen)
            .await
            .map_err(|source| PreflightError::PortInUse {
                addr: self.options.listen,
                source,
            })?;

        info!(host, upstream = %self.options.upstream, "starting proxy");
        proxy::server::spawn(
            listener,
            tls,
            proxy::router(forwarder),
            self.options.drain_timeout,
        )
    }
}

fn release(slot: &mut Slot) {
    if let Some(redirect) = slot.redirect.as_mut() {
        if let Err(e) = redirect.release() {
            error!("could not remove hosts redirect: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_check_detects_bound_port() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        assert!(matches!(check_port(addr), Err(PreflightError::PortInUse { .. })));

        drop(holder);
        check_port(addr).unwrap();
    }

    #[tokio::test]
    async fn loopback_literal_passes_redirect_check() {
        check_redirect("127.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn foreign_address_fails_redirect_check() {
        let err = check_redirect("192.0.2.10").await.unwrap_err();
        assert!(matches!(err, PreflightError::RedirectMismatch { .. }));
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let options = ProxyOptions {
            target_host: "localhost".into(),
            listen: "127.0.0.1:0".parse().unwrap(),
            upstream: "127.0.0.1:443".parse().unwrap(),
            drain_timeout: Duration::from_secs(1),
        };
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(options, TrustBundle::in_dir(dir.path()));

        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();
        assert_eq!(coordinator.state(), ServerState::Stopped);
    }
}
