//! Socket transports for the diagnostic proxy.
//!
//! [`SocketProxy`] implements [`DiagnosticProxy`] over TCP and Unix domain
//! sockets: it listens on the front-end endpoint for the target runtime,
//! dials the back-end endpoint for each accepted connection, and hands the
//! pair back for pumping. Connect timeouts map onto the two recovery
//! categories the runner distinguishes (front-end/runtime vs back-end).
//!
//! A back-end Unix endpoint may point at a *directory* of diagnostic
//! sockets; the transport resolves it to the most recently modified entry
//! and caches the choice. `reset()` drops the cache so the next dial can
//! bind to a refreshed socket — the recovery action taken when the back
//! end is presumed dead.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, ProxyError, Result};
use crate::pipeline::StopToken;
use crate::proxy::{BoxedDuplex, ConnectedProxy, DiagnosticProxy};

/// Network endpoint of one proxy leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProxyEndpoint {
    /// TCP address, e.g. `127.0.0.1:9000`.
    Tcp { addr: String },
    /// Unix domain socket path, or a directory of candidate sockets.
    #[cfg(unix)]
    Unix { path: PathBuf },
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { addr } => write!(f, "tcp:{addr}"),
            #[cfg(unix)]
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Transport configuration for a [`SocketProxy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTransportConfig {
    /// Where the target runtime connects (listened on).
    pub frontend: ProxyEndpoint,
    /// Where tooling is reached (dialed per pairing).
    pub backend: ProxyEndpoint,
    /// How long to wait for a runtime connection per accept.
    pub frontend_timeout: Duration,
    /// How long to wait for the back-end dial.
    pub backend_timeout: Duration,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<BoxedDuplex> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "runtime connected");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("runtime connected on unix socket");
                Ok(Box::new(stream))
            }
        }
    }
}

/// TCP/Unix-socket diagnostic proxy transport.
pub struct SocketProxy {
    config: ProxyTransportConfig,
    listener: Mutex<Option<Listener>>,
    /// Cached back-end resolution; cleared by `reset()`.
    resolved_backend: StdMutex<Option<ProxyEndpoint>>,
    bound_addr: StdMutex<Option<std::net::SocketAddr>>,
    next_id: AtomicU64,
}

impl SocketProxy {
    /// Create an unstarted transport.
    #[must_use]
    pub fn new(config: ProxyTransportConfig) -> Self {
        Self {
            config,
            listener: Mutex::new(None),
            resolved_backend: StdMutex::new(None),
            bound_addr: StdMutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Locally bound TCP address, once started (useful with port 0).
    #[must_use]
    pub fn frontend_addr(&self) -> Option<std::net::SocketAddr> {
        *self.bound_addr.lock().expect("addr lock")
    }

    fn resolve_backend(&self) -> Result<ProxyEndpoint> {
        let mut cache = self.resolved_backend.lock().expect("backend lock");
        if let Some(resolved) = cache.as_ref() {
            return Ok(resolved.clone());
        }
        let resolved = match &self.config.backend {
            ProxyEndpoint::Tcp { addr } => ProxyEndpoint::Tcp { addr: addr.clone() },
            #[cfg(unix)]
            ProxyEndpoint::Unix { path } => ProxyEndpoint::Unix {
                path: resolve_socket_path(path)?,
            },
        };
        *cache = Some(resolved.clone());
        Ok(resolved)
    }

    async fn dial_backend(&self) -> std::result::Result<BoxedDuplex, ProxyError> {
        let target = self
            .resolve_backend()
            .map_err(|e| ProxyError::Accept(e.to_string()))?;
        let endpoint = target.to_string();
        let dial = async {
            match &target {
                ProxyEndpoint::Tcp { addr } => TcpStream::connect(addr)
                    .await
                    .map(|s| Box::new(s) as BoxedDuplex),
                #[cfg(unix)]
                ProxyEndpoint::Unix { path } => UnixStream::connect(path)
                    .await
                    .map(|s| Box::new(s) as BoxedDuplex),
            }
        };
        match timeout(self.config.backend_timeout, dial).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(error)) => Err(ProxyError::Io(format!("{endpoint}: {error}"))),
            Err(_) => Err(ProxyError::BackendTimeout { endpoint }),
        }
    }
}

impl DiagnosticProxy for SocketProxy {
    async fn start(&self) -> Result<()> {
        let listener = match &self.config.frontend {
            ProxyEndpoint::Tcp { addr } => {
                let listener = TcpListener::bind(addr).await?;
                *self.bound_addr.lock().expect("addr lock") = listener.local_addr().ok();
                Listener::Tcp(listener)
            }
            #[cfg(unix)]
            ProxyEndpoint::Unix { path } => {
                // A stale socket file from a previous run blocks the bind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                Listener::Unix(UnixListener::bind(path)?)
            }
        };
        *self.listener.lock().await = Some(listener);
        info!(frontend = %self.config.frontend, backend = %self.config.backend, "proxy transport listening");
        Ok(())
    }

    async fn connect_proxy(
        &self,
        token: StopToken,
    ) -> std::result::Result<ConnectedProxy, ProxyError> {
        let guard = self.listener.lock().await;
        let listener = guard
            .as_ref()
            .ok_or_else(|| ProxyError::Accept("transport not started".to_string()))?;

        let frontend = tokio::select! {
            accepted = timeout(self.config.frontend_timeout, listener.accept()) => {
                match accepted {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(error)) => return Err(ProxyError::Io(error.to_string())),
                    Err(_) => {
                        return Err(ProxyError::FrontendTimeout {
                            endpoint: self.config.frontend.to_string(),
                        })
                    }
                }
            }
            () = token.stopped() => return Err(ProxyError::Cancelled),
        };

        let backend = self.dial_backend().await?;
        Ok(ConnectedProxy::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            frontend,
            backend,
        ))
    }

    async fn reset(&self) -> Result<()> {
        self.resolved_backend.lock().expect("backend lock").take();
        info!(backend = %self.config.backend, "backend endpoint resolution reset");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.listener.lock().await.take();
        #[cfg(unix)]
        if let ProxyEndpoint::Unix { path } = &self.config.frontend {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

/// Resolve a configured Unix endpoint to a concrete socket path.
///
/// A directory resolves to its most recently modified entry (runtimes drop
/// one socket per process into a shared diagnostics directory).
#[cfg(unix)]
fn resolve_socket_path(configured: &Path) -> Result<PathBuf> {
    if !configured.is_dir() {
        return Ok(configured.to_path_buf());
    }
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(configured)? {
        let entry = entry?;
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().is_none_or(|(when, _)| modified > *when) {
            newest = Some((modified, entry.path()));
        }
    }
    newest.map(|(_, path)| path).ok_or_else(|| {
        Error::Session(format!(
            "no diagnostic sockets in {}",
            configured.display()
        ))
    })
}
