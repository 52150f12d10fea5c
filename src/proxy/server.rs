//! TLS listener with one task per connection and a bounded drain on stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A running listener. Dropping the handle without [`stop`](Self::stop)
/// also stops the server, since the stop channel closes.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the accept loop. The channel holds one request; a second
    /// request while one is pending is dropped.
    pub fn request_stop(&self) -> bool {
        self.stop.try_send(()).is_ok()
    }

    /// Requests a stop and waits for the drain to finish or time out.
    pub async fn stop(self) -> Result<()> {
        self.request_stop();
        self.task
            .await
            .map_err(|e| Error::io("proxy task", std::io::Error::other(e)))?
    }
}

/// Serves `router` over TLS on an already bound listener.
pub fn spawn(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    router: Router,
    drain_timeout: Duration,
) -> Result<ServerHandle> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::io("listener address", e))?;
    let (stop, stop_rx) = mpsc::channel(1);
    let acceptor = TlsAcceptor::from(tls);
    let task = tokio::spawn(serve(listener, acceptor, router, stop_rx, drain_timeout));
    info!(%local_addr, "proxy listening");
    Ok(ServerHandle {
        local_addr,
        stop,
        task,
    })
}

async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    mut stop_rx: mpsc::Receiver<()>,
    drain_timeout: Duration,
) -> Result<()> {
    let connections = TaskTracker::new();
    let shutdown = CancellationToken::new();

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(connection(
                        stream,
                        peer,
                        acceptor.clone(),
                        router.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    info!(in_flight = connections.len(), timeout = ?drain_timeout, "proxy draining");
    shutdown.cancel();
    connections.close();

    match tokio::time::timeout(drain_timeout, connections.wait()).await {
        Ok(()) => {
            info!("proxy stopped");
            Ok(())
        }
        Err(_) => {
            let err = Error::ShutdownTimeout(drain_timeout);
            error!(abandoned = connections.len(), "{err}");
            Err(err)
        }
    }
}

async fn connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    let tls = tokio::select! {
        accepted = acceptor.accept(stream) => match accepted {
            Ok(tls) => tls,
            Err(e) => {
                debug!(%peer, "TLS handshake failed: {e}");
                return;
            }
        },
        _ = shutdown.cancelled() => return,
    };

    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        router.clone().call(request)
    });
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);

    let cancelled = shutdown.cancelled();
    tokio::pin!(cancelled);
    let mut draining = false;
    loop {
        tokio::select! {
            served = conn.as_mut() => {
                if let Err(e) = served {
                    debug!(%peer, "connection closed with error: {e}");
                }
                break;
            }
            _ = &mut cancelled, if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
