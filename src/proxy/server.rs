//! Proxy listener and connection handling
//!
//! One task per accepted connection. Plain requests forward directly;
//! CONNECT hijacks the stream, sniffs the first tunneled byte and either
//! terminates TLS with a minted leaf or speaks plaintext HTTP inside the
//! tunnel. The listener itself is restartable at runtime through
//! [`ProxyController`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cert::LeafError;
use crate::proxy::forward::{empty_body, handle_intercepted, ProxyBody};
use crate::proxy::rewind::{Rewind, TLS_HANDSHAKE_BYTE};
use crate::proxy::ProxyContext;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Leaf(#[from] LeafError),

    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
}

/// Handle to one running listener.
struct ListenerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct ControllerState {
    host: String,
    port: u16,
    running: bool,
    last_error: Option<String>,
}

/// Starts, restarts and reports on the proxy listener.
pub struct ProxyController {
    ctx: ProxyContext,
    handle: Mutex<Option<ListenerHandle>>,
    state: Mutex<ControllerState>,
}

impl ProxyController {
    pub fn new(ctx: ProxyContext) -> Self {
        Self {
            ctx,
            handle: Mutex::new(None),
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// (Re)starts the listener on `host:port`, stopping any previous one
    /// first so the same address can be reused.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ProxyError> {
        let previous = self.handle.lock().take();
        if let Some(previous) = previous {
            let _ = previous.shutdown_tx.send(());
            info!("stopping previous proxy listener");
            let _ = previous.task.await;
        }

        let addr = format!("{host}:{port}");
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(addr = %addr, error = %source, "failed to bind proxy listener");
                let mut state = self.state.lock();
                state.running = false;
                state.last_error = Some(source.to_string());
                return Err(ProxyError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "proxy listener started");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(accept_loop(listener, self.ctx.clone(), shutdown_rx));

        *self.handle.lock() = Some(ListenerHandle { shutdown_tx, task });
        {
            let mut state = self.state.lock();
            state.host = host.to_string();
            state.port = local_addr.port();
            state.running = true;
            state.last_error = None;
        }
        Ok(local_addr)
    }

    /// `(running, host, port, last bind error)`.
    pub fn status(&self) -> (bool, String, u16, Option<String>) {
        let state = self.state.lock();
        (
            state.running,
            state.host.clone(),
            state.port,
            state.last_error.clone(),
        )
    }

    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(());
            let _ = handle.task.await;
        }
        self.state.lock().running = false;
    }
}

impl std::fmt::Debug for ProxyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProxyController")
            .field("host", &state.host)
            .field("port", &state.port)
            .field("running", &state.running)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ProxyContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("proxy listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, ctx).await;
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: ProxyContext) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { proxy_service(req, ctx).await }
    });

    if let Err(err) = http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!(error = %err, "client connection ended");
    }
}

/// Entry service on the proxy listener: CONNECT becomes a tunnel,
/// everything else is a direct absolute-form proxy request.
async fn proxy_service(
    req: Request<Incoming>,
    ctx: ProxyContext,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() != Method::CONNECT {
        return handle_intercepted(req, "http", None, &ctx).await;
    }

    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        warn!(uri = %req.uri(), "CONNECT without authority");
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(response);
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(err) = serve_tunnel(upgraded, authority.clone(), ctx).await {
                    debug!(host = %authority, error = %err, "tunnel closed");
                }
            }
            Err(err) => warn!(host = %authority, error = %err, "CONNECT upgrade failed"),
        }
    });

    // The 200 releases the client to start the tunneled protocol.
    Ok(Response::new(empty_body()))
}

/// Sniffs the first tunneled byte and serves the tunnel as either
/// intercepted TLS or plaintext HTTP.
async fn serve_tunnel(upgraded: Upgraded, authority: String, ctx: ProxyContext) -> Result<(), ProxyError> {
    let (first, rewound) = Rewind::sniff(TokioIo::new(upgraded)).await?;

    if first != TLS_HANDSHAKE_BYTE {
        debug!(host = %authority, "plaintext detected inside tunnel");
        return serve_inner(TokioIo::new(rewound), "http", authority, ctx).await;
    }

    // Leaf minting failures close the connection before any handshake.
    let leaf = ctx.leaf_cache.get(&authority).await?;
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let tls_stream = acceptor
        .accept(rewound)
        .await
        .map_err(|err| ProxyError::TlsHandshake(err.to_string()))?;
    debug!(host = %authority, "TLS handshake complete");

    serve_inner(TokioIo::new(tls_stream), "https", authority, ctx).await
}

/// Serves HTTP/1.1 requests arriving inside an established tunnel.
async fn serve_inner<I>(
    io: I,
    scheme: &'static str,
    authority: String,
    ctx: ProxyContext,
) -> Result<(), ProxyError>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let authority: Arc<str> = authority.into();
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        let authority = Arc::clone(&authority);
        async move { handle_intercepted(req, scheme, Some(authority.as_ref()), &ctx).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await?;
    Ok(())
}
