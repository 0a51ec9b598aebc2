//! Server manager
//!
//! One listener per configured server. The handler stack, outermost first:
//! request tag log, HTTP→HTTPS redirect for auto-redirect domains, max-body
//! enforcement, then the gateway pipeline. HTTPS listeners hand their
//! connections to the TLS manager (static SNI resolution or per-SNI ACME
//! acquisition) before serving. Lifecycle: `start` launches each listener
//! under its own task, `stop` drains gracefully for 30 seconds then closes
//! hard, `restart` composes the two.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::context::RequestCtx;
use crate::proxy::Gateway;
use crate::tls::{AcmeHook, TlsManager};

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(30);
const CHALLENGE_PORT: u16 = 80;

struct ServerInstance {
    config: ServerConfig,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ChallengeServer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns every listener and the ACME port-80 choreography.
pub struct ServerManager {
    config: Arc<Config>,
    gateway: Arc<Gateway>,
    tls: Arc<TlsManager>,
    servers: Mutex<HashMap<String, Arc<ServerInstance>>>,
    /// The port-80 listener stopped for an ACME acquisition, restored after
    stopped_http80: Mutex<Option<ServerConfig>>,
    challenge_server: Mutex<Option<ChallengeServer>>,
}

impl ServerManager {
    pub fn new(config: Arc<Config>, gateway: Arc<Gateway>, tls: Arc<TlsManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            gateway,
            tls: Arc::clone(&tls),
            servers: Mutex::new(HashMap::new()),
            stopped_http80: Mutex::new(None),
            challenge_server: Mutex::new(None),
        });

        let before: AcmeHook = {
            let manager = Arc::clone(&manager);
            Arc::new(move || {
                let manager = Arc::clone(&manager);
                async move { manager.before_auto_cert().await }.boxed()
            })
        };
        let after: AcmeHook = {
            let manager = Arc::clone(&manager);
            Arc::new(move || {
                let manager = Arc::clone(&manager);
                async move { manager.after_auto_cert().await }.boxed()
            })
        };
        tls.register_before_auto_cert(before);
        tls.register_after_auto_cert(after);

        manager
    }

    /// Start every enabled listener. A listener that fails to bind is logged
    /// and skipped; the others proceed.
    pub async fn start(&self) -> anyhow::Result<()> {
        let enabled: Vec<ServerConfig> = self
            .config
            .servers
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            anyhow::bail!("no enabled server configuration");
        }

        info!(count = enabled.len(), "starting server instances");
        for server in enabled {
            if let Err(e) = self.start_server(server.clone()).await {
                error!(server = %server.name, error = %e, "failed to start server");
                continue;
            }
            info!(server = %server.name, address = %format!("{}:{}", server.host, server.port), "server started");
        }

        if self.servers.lock().is_empty() {
            anyhow::bail!("no servers started successfully");
        }
        Ok(())
    }

    async fn start_server(&self, server: ServerConfig) -> anyhow::Result<()> {
        let addr = format!("{}:{}", server.host, server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind listener {addr}"))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ListenerState {
            server: server.clone(),
            gateway: Arc::clone(&self.gateway),
            tls: Arc::clone(&self.tls),
            is_tls: server.protocol == "https",
            auto_tls: server.tls.as_ref().is_some_and(|t| t.auto_tls),
        });

        let name = server.name.clone();
        let task = tokio::spawn(accept_loop(listener, state, shutdown_rx, name.clone()));

        self.servers.lock().insert(
            name,
            Arc::new(ServerInstance {
                config: server,
                shutdown: shutdown_tx,
                task,
            }),
        );
        Ok(())
    }

    /// Graceful stop: signal every listener, give in-flight connections the
    /// drain window, then abort what is left.
    pub async fn stop(&self) {
        let servers: Vec<Arc<ServerInstance>> = self.servers.lock().drain().map(|(_, v)| v).collect();
        info!(count = servers.len(), "stopping server instances");

        for server in &servers {
            let _ = server.shutdown.send(true);
        }
        for server in servers {
            let name = server.config.name.clone();
            match Arc::try_unwrap(server) {
                Ok(instance) => {
                    let mut task = instance.task;
                    if tokio::time::timeout(GRACEFUL_SHUTDOWN, &mut task)
                        .await
                        .is_err()
                    {
                        warn!(server = %name, "graceful shutdown timed out, closing hard");
                        task.abort();
                    }
                }
                Err(shared) => {
                    shared.task.abort();
                }
            }
        }
        info!("all servers stopped");
    }

    pub async fn restart(&self) -> anyhow::Result<()> {
        self.stop().await;
        self.start().await
    }

    pub fn running_servers(&self) -> Vec<String> {
        self.servers.lock().keys().cloned().collect()
    }

    fn stop_instance(&self, name: &str) -> Option<ServerConfig> {
        let instance = self.servers.lock().remove(name)?;
        let _ = instance.shutdown.send(true);
        Some(instance.config.clone())
    }

    // ── ACME hooks ───────────────────────────────────────────────

    /// Free port 80 and bring up the temporary challenge server.
    async fn before_auto_cert(&self) -> anyhow::Result<()> {
        let http80 = {
            let servers = self.servers.lock();
            servers
                .values()
                .find(|s| s.config.protocol == "http" && s.config.port == CHALLENGE_PORT)
                .map(|s| s.config.name.clone())
        };
        if let Some(name) = http80 {
            info!(server = %name, "freeing port 80 for the ACME challenge");
            if let Some(config) = self.stop_instance(&name) {
                *self.stopped_http80.lock() = Some(config);
            }
        }

        let acme = self
            .tls
            .acme()
            .context("ACME hooks invoked without an ACME service")?;
        let router = acme.challenge_router();
        let listener = TcpListener::bind(("0.0.0.0", CHALLENGE_PORT))
            .await
            .context("bind ACME challenge listener on port 80")?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "challenge server error");
            }
        });
        *self.challenge_server.lock() = Some(ChallengeServer {
            shutdown: shutdown_tx,
            task,
        });
        info!("temporary ACME challenge server started");
        Ok(())
    }

    /// Stop the challenge server and restore the original port-80 listener.
    async fn after_auto_cert(&self) -> anyhow::Result<()> {
        let challenge = self.challenge_server.lock().take();
        if let Some(challenge) = challenge {
            let _ = challenge.shutdown.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), challenge.task).await;
            info!("temporary ACME challenge server closed");
        }

        let stopped = self.stopped_http80.lock().take();
        if let Some(config) = stopped {
            info!(server = %config.name, "restoring original port 80 server");
            if let Err(e) = self.start_server(config).await {
                error!(error = %e, "failed to restore port 80 server");
            }
        }
        Ok(())
    }
}

// ── per-listener serving ─────────────────────────────────────────

struct ListenerState {
    server: ServerConfig,
    gateway: Arc<Gateway>,
    tls: Arc<TlsManager>,
    is_tls: bool,
    auto_tls: bool,
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
    name: String,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => {
                debug!(server = %name, "listener shutting down");
                return;
            }
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(server = %name, error = %e, "accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, remote, state).await {
                debug!(error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    state: Arc<ListenerState>,
) -> anyhow::Result<()> {
    if !state.is_tls {
        return serve_io(TokioIo::new(stream), remote, state).await;
    }

    if state.auto_tls {
        // Lazy accept: read the ClientHello, acquire the certificate for its
        // SNI (singleflight + hooks), then finish the handshake.
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor.await.context("read ClientHello")?;
        let sni = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .context("ClientHello carries no SNI name")?;
        let cert = state.tls.auto_certificate(&sni).await?;
        let config = state.tls.auto_server_config(cert, state.server.use_http2);
        let tls_stream = start.into_stream(config).await.context("TLS handshake")?;
        return serve_io(TokioIo::new(tls_stream), remote, state).await;
    }

    let config = state.tls.static_server_config(state.server.use_http2);
    let acceptor = tokio_rustls::TlsAcceptor::from(config);
    let tls_stream = acceptor.accept(stream).await.context("TLS handshake")?;
    serve_io(TokioIo::new(tls_stream), remote, state).await
}

async fn serve_io<I>(io: I, remote: SocketAddr, state: Arc<ListenerState>) -> anyhow::Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(state, remote, request).await }
    });

    // use_http2 advertises both protocols (including h2c on plain listeners);
    // otherwise the listener stays HTTP/1.1 only.
    let builder = auto::Builder::new(TokioExecutor::new());
    builder
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("serve connection: {e}"))
}

/// The wrapped handler: redirect, body limit, then the gateway pipeline.
async fn handle_request(
    state: Arc<ListenerState>,
    remote: SocketAddr,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let server = &state.server;
    let host = request_host(&request);
    debug!(server = %server.name, host = %host, method = %request.method(), path = %request.uri().path(), "request");

    // HTTP→HTTPS redirect for domains marked auto-redirect. Backend-tagged
    // internal calls are exempt.
    if server.protocol == "http" {
        let backend_header = &state.gateway.config.proxy_header.backend_header;
        let internal = request.headers().get(backend_header.as_str()).is_some();
        if !internal {
            if let Some(response) = redirect_response(server, &host, &request) {
                return Ok(response);
            }
        }
    }

    // Pre-check Content-Length before touching the body stream.
    let max_body = server.max_request_body;
    if max_body > 0 {
        if let Some(length) = request
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > max_body {
                warn!(host = %host, length, limit = max_body, "request body over limit");
                return Ok(too_large_response());
            }
        }
    }

    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    // Stream guard for bodies without a declared length.
    let body = if max_body > 0 {
        match Limited::new(body, max_body as usize).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return Ok(too_large_response()),
        }
    } else {
        match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        }
    };

    let mut ctx = RequestCtx::new(parts.method, host, path, query, parts.headers, Some(remote));
    let response = state.gateway.handle(&mut ctx, body).await;
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Full::new(body)))
}

fn request_host(request: &Request<Incoming>) -> String {
    if let Some(authority) = request.uri().authority() {
        return authority.to_string();
    }
    request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// 301 to the https origin when the host matches an auto-redirect domain,
/// with HSTS when configured.
fn redirect_response(
    server: &ServerConfig,
    host: &str,
    request: &Request<Incoming>,
) -> Option<Response<Full<Bytes>>> {
    let bare_host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);

    for domain_config in &server.domains {
        if !domain_config.auto_redirect {
            continue;
        }
        let matched = domain_config.domains.iter().any(|configured| {
            bare_host == configured
                || (configured.starts_with("*.") && bare_host.ends_with(&configured[1..]))
        });
        if !matched {
            continue;
        }

        let target = format!(
            "https://{}{}",
            host,
            request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        debug!(host = %host, target = %target, "redirecting to https");

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
        if let Ok(location) = HeaderValue::try_from(target) {
            response.headers_mut().insert(http::header::LOCATION, location);
        }
        if domain_config.hsts_max_age > 0 {
            let mut hsts = format!("max-age={}", domain_config.hsts_max_age);
            if domain_config.hsts_subdomains {
                hsts.push_str("; includeSubDomains");
            }
            if domain_config.hsts_preload {
                hsts.push_str("; preload");
            }
            if let Ok(value) = HeaderValue::try_from(hsts) {
                response
                    .headers_mut()
                    .insert("strict-transport-security", value);
            }
        }
        return Some(response);
    }
    None
}

fn too_large_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Request entity too large")));
    *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
    response
        .headers_mut()
        .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    response
}
