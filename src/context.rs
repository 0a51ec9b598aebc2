//! Per-request pipeline state
//!
//! The gateway decorates every request with a [`RequestCtx`]: the original
//! host, mutable headers, the resolved upstream, and the sentinel chosen when
//! a stage rejects the request. Sentinels are request-local state; they never
//! travel on the wire, so an upstream can never observe or forge one.

use std::net::SocketAddr;

use http::{HeaderMap, Method};

/// Terminal pipeline outcomes. The error handler maps each value to the
/// user-visible response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// Circuit breaker is open for the host → 504, empty body
    BucketLimit,
    /// Flow control rejected the request → 429, Forbidden page
    ReqLimit,
    /// Host not in the domain allow-list → 403, Forbidden page
    DomainNotAllow,
    /// Resolution or upstream failure → 502, Unavailable page
    BackendError,
}

/// Where a resolved request is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    /// Diverted to the gRPC bridge instead of the HTTP pool
    Grpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Frontend,
    Backend,
}

/// Resolver output: the concrete upstream for one request.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    /// Path to request upstream, already rewritten when a rule asked for it
    pub path: String,
    /// Logical service name the request was proxied to
    pub service: String,
    pub kind: ServiceKind,
}

impl Upstream {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Mutable per-request record carried through the pipeline.
///
/// The client-visible host is captured once and never rewritten; upstream
/// addressing lives in [`Upstream`].
#[derive(Debug)]
pub struct RequestCtx {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub remote: Option<SocketAddr>,
    pub sentinel: Option<Sentinel>,
    pub upstream: Option<Upstream>,
    pub trace_id: Option<String>,
}

impl RequestCtx {
    pub fn new(
        method: Method,
        host: impl Into<String>,
        path: impl Into<String>,
        query: Option<String>,
        headers: HeaderMap,
        remote: Option<SocketAddr>,
    ) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            query,
            headers,
            remote,
            sentinel: None,
            upstream: None,
            trace_id: None,
        }
    }

    /// Path plus query, the form sent upstream.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name),
            http::HeaderValue::try_from(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    /// Tag the request with a terminal outcome. The first sentinel wins;
    /// later stages must not overwrite an earlier verdict.
    pub fn set_sentinel(&mut self, sentinel: Sentinel) {
        if self.sentinel.is_none() {
            self.sentinel = Some(sentinel);
        }
    }

    /// Host matching loopback forms is an internal call.
    pub fn is_internal_host(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }
}
