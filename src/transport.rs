//! Upstream transports
//!
//! One round-trip capability, two implementations selected by config: the
//! standard transport keeps a per-host keep-alive pool, the fast transport
//! opens a fresh connection per request with explicit read/write timeouts.
//! A `grpc`-schemed upstream never reaches either: the dispatching wrapper
//! hands it to the gRPC bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::Config;
use crate::context::{RequestCtx, Upstream, UpstreamScheme};
use crate::grpc_proxy::GrpcProxy;

/// Headers that are connection-scoped and never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One upstream exchange: request in, buffered response out.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn round_trip(&self, ctx: &RequestCtx, body: Bytes) -> anyhow::Result<Response<Bytes>>;
}

/// Builds the configured transport.
pub fn build_transport(config: &Config) -> Arc<dyn Transport> {
    match config.proxy.transport.as_str() {
        "fast" => Arc::new(FastTransport::new(config)),
        _ => Arc::new(StandardTransport::new(config)),
    }
}

fn upstream_of(ctx: &RequestCtx) -> anyhow::Result<&Upstream> {
    ctx.upstream
        .as_ref()
        .ok_or_else(|| anyhow!("request has no resolved upstream"))
}

fn upstream_uri(upstream: &Upstream) -> anyhow::Result<Uri> {
    let target = format!("http://{}{}", upstream.authority(), upstream.path);
    target
        .parse::<Uri>()
        .with_context(|| format!("invalid upstream uri {target}"))
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

async fn collect_response(
    response: Response<hyper::body::Incoming>,
) -> anyhow::Result<Response<Bytes>> {
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .context("read upstream response body")?
        .to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

// ── standard (pooled) ────────────────────────────────────────────

/// Keep-alive pooled client. Connections idle out on the configured timer,
/// each host keeps at most `max_idle_per_host` spares, and a per-host
/// semaphore caps in-flight requests at `max_conns_per_host`.
pub struct StandardTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    limiters: DashMap<String, Arc<Semaphore>>,
    max_conns_per_host: usize,
}

impl StandardTransport {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.proxy.idle_conn_timeout))
            .pool_max_idle_per_host(config.proxy.max_idle_per_host)
            .build_http();
        Self {
            client,
            limiters: DashMap::new(),
            max_conns_per_host: config.proxy.max_conns_per_host.max(1),
        }
    }

    /// Take a connection slot for the host, waiting when the cap is reached.
    async fn acquire_permit(&self, authority: &str) -> anyhow::Result<OwnedSemaphorePermit> {
        let limiter = self
            .limiters
            .entry(authority.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_host)))
            .clone();
        limiter
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("failed to acquire connection permit: {e}"))
    }
}

#[async_trait]
impl Transport for StandardTransport {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn round_trip(&self, ctx: &RequestCtx, body: Bytes) -> anyhow::Result<Response<Bytes>> {
        let upstream = upstream_of(ctx)?;
        let uri = upstream_uri(upstream)?;

        // Held for the whole exchange; dropping it frees the host slot.
        let _permit = self.acquire_permit(&upstream.authority()).await?;

        let mut builder = Request::builder().method(ctx.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in ctx.headers.iter() {
                if is_hop_by_hop(name.as_str()) || name == http::header::HOST {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            // The client-facing host travels in Host so upstream virtual
            // hosting keeps working.
            if let Ok(host) = HeaderValue::try_from(ctx.host.as_str()) {
                headers.insert(http::header::HOST, host);
            }
        }

        let request = builder
            .body(Full::new(body))
            .context("build upstream request")?;

        debug!(target = %upstream.authority(), "standard transport round-trip");
        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("upstream request to {}", upstream.authority()))?;
        collect_response(response).await
    }
}

// ── fast (single-shot) ───────────────────────────────────────────

/// Single-shot client: fresh TCP connection and HTTP/1.1 handshake per
/// request, explicit connect/read timeouts, no pooled state to contend on.
pub struct FastTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
    forward_host_header: String,
}

impl FastTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            forward_host_header: config.proxy_header.frontend_host_header.clone(),
        }
    }
}

#[async_trait]
impl Transport for FastTransport {
    fn name(&self) -> &'static str {
        "fast"
    }

    async fn round_trip(&self, ctx: &RequestCtx, body: Bytes) -> anyhow::Result<Response<Bytes>> {
        let upstream = upstream_of(ctx)?;
        let authority = upstream.authority();

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| anyhow!("connect timeout to {authority}"))?
            .with_context(|| format!("connect to {authority}"))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("http1 handshake")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "fast transport connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(ctx.method.clone())
            .uri(upstream.path.clone());
        if let Some(headers) = builder.headers_mut() {
            // Headers travel verbatim except the address-derived pair.
            for (name, value) in ctx.headers.iter() {
                if is_hop_by_hop(name.as_str())
                    || name == http::header::HOST
                    || name.as_str().eq_ignore_ascii_case("x-forwarded-for")
                {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            // Host names the resolved upstream; the original client host
            // rides in the forward-host header for reconstruction.
            if let Ok(host) = HeaderValue::try_from(authority.as_str()) {
                headers.insert(http::header::HOST, host);
            }
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(self.forward_host_header.as_str()),
                HeaderValue::try_from(ctx.host.as_str()),
            ) {
                headers.insert(name, value);
            }
        }

        let request = builder
            .body(Full::new(body))
            .context("build upstream request")?;

        debug!(target = %authority, "fast transport round-trip");
        let response = tokio::time::timeout(self.io_timeout, sender.send_request(request))
            .await
            .map_err(|_| anyhow!("read timeout from {authority}"))?
            .with_context(|| format!("upstream request to {authority}"))?;

        tokio::time::timeout(self.io_timeout, collect_response(response))
            .await
            .map_err(|_| anyhow!("body read timeout from {authority}"))?
    }
}

// ── dispatching wrapper ──────────────────────────────────────────

/// Routes `grpc`-schemed upstreams to the bridge, everything else to the
/// configured HTTP transport.
pub struct GatewayTransport {
    inner: Arc<dyn Transport>,
    grpc: Option<Arc<GrpcProxy>>,
}

impl GatewayTransport {
    pub fn new(inner: Arc<dyn Transport>, grpc: Option<Arc<GrpcProxy>>) -> Self {
        Self { inner, grpc }
    }

    pub fn inner_name(&self) -> &'static str {
        self.inner.name()
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn round_trip(&self, ctx: &RequestCtx, body: Bytes) -> anyhow::Result<Response<Bytes>> {
        let is_grpc = ctx
            .upstream
            .as_ref()
            .is_some_and(|u| u.scheme == UpstreamScheme::Grpc);
        if is_grpc {
            let Some(grpc) = &self.grpc else {
                return Ok(service_unavailable());
            };
            return Ok(grpc.handle(ctx, body).await);
        }
        self.inner.round_trip(ctx, body).await
    }
}

fn service_unavailable() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = http::StatusCode::SERVICE_UNAVAILABLE;
    response
}
