//! Pre-handler chain
//!
//! Inbound checks that run before routing, in registration order. The first
//! handler to reject tags the request with its sentinel and stops the chain;
//! the director then fast-fails the request into the error handler.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::context::{RequestCtx, Sentinel};
use crate::flow_control::FlowController;
use crate::runtime::TopologyHandle;

/// One inbound check.
pub trait PreHandler: Send + Sync {
    fn enabled(&self) -> bool;
    fn name(&self) -> &'static str;
    /// Inspect (and possibly mutate) the request. `Err` carries the sentinel
    /// the error handler should render.
    fn handle(&self, ctx: &mut RequestCtx) -> Result<(), Sentinel>;
}

/// Registration-ordered chain.
#[derive(Default)]
pub struct PreHandlerChain {
    handlers: Vec<Box<dyn PreHandler>>,
}

impl PreHandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: Box<dyn PreHandler>) {
        self.handlers.push(handler);
    }

    /// Run enabled handlers in order. On the first rejection the sentinel is
    /// written into the context and returned.
    pub fn run(&self, ctx: &mut RequestCtx) -> Option<Sentinel> {
        for handler in &self.handlers {
            if !handler.enabled() {
                continue;
            }
            if let Err(sentinel) = handler.handle(ctx) {
                debug!(handler = handler.name(), host = %ctx.host, "pre-handler rejected request");
                ctx.set_sentinel(sentinel);
                return Some(sentinel);
            }
        }
        None
    }

    /// Build the standard chain: sanitizer, domain check, rate limiter,
    /// image protection, in that order.
    pub fn standard(
        config: &Config,
        topology: Arc<TopologyHandle>,
        flow: Arc<FlowController>,
    ) -> Self {
        let mut chain = Self::new();
        chain.add(Box::new(HeaderSanitizer::new(config)));
        chain.add(Box::new(PreCheckDomains::new(config, topology)));
        chain.add(Box::new(RateLimitHandler::new(config, flow)));
        chain.add(Box::new(ImageProtect::new(config)));
        chain
    }
}

// ── header sanitizer ─────────────────────────────────────────────

/// Hop-forged and identity headers stripped before the request is routed.
const DENY_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "forwarded",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-amzn-trace-id",
    "x-request-id",
    "cf-connecting-ip",
];

/// Strips sensitive or spoofable inbound headers.
///
/// The deny-list is derived at construction: any name that collides with a
/// configured proxy header is kept, and because the sanitizer is the first
/// pre-handler it always runs before the director or transport write their
/// own outbound values, so those are never stripped.
pub struct HeaderSanitizer {
    enabled: bool,
    deny: Vec<String>,
}

impl HeaderSanitizer {
    pub fn new(config: &Config) -> Self {
        let keep: HashSet<String> = [
            config.proxy_header.trace_id.to_ascii_lowercase(),
            config.proxy_header.frontend_host_header.to_ascii_lowercase(),
            config.proxy_header.backend_header.to_ascii_lowercase(),
            config.proxy_header.proxy_app.to_ascii_lowercase(),
            config.pxy_frontend.internal_flag.to_ascii_lowercase(),
        ]
        .into_iter()
        .collect();

        let deny = DENY_HEADERS
            .iter()
            .map(|h| (*h).to_string())
            .filter(|h| !keep.contains(h))
            .collect();

        Self {
            enabled: config.middleware.sanitizer.enabled,
            deny,
        }
    }
}

impl PreHandler for HeaderSanitizer {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "header-sanitizer"
    }

    fn handle(&self, ctx: &mut RequestCtx) -> Result<(), Sentinel> {
        for name in &self.deny {
            ctx.headers.remove(name.as_str());
        }
        Ok(())
    }
}

// ── domain allow-list ────────────────────────────────────────────

/// Rejects hosts that are not part of the current topology.
pub struct PreCheckDomains {
    enabled: bool,
    topology: Arc<TopologyHandle>,
}

impl PreCheckDomains {
    pub fn new(config: &Config, topology: Arc<TopologyHandle>) -> Self {
        Self {
            enabled: config.middleware.domain_check.enabled,
            topology,
        }
    }
}

impl PreHandler for PreCheckDomains {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "precheck-domains"
    }

    fn handle(&self, ctx: &mut RequestCtx) -> Result<(), Sentinel> {
        if ctx.host.is_empty() || ctx.is_internal_host() {
            return Ok(());
        }
        if self.topology.snapshot().service_map(&ctx.host).is_some() {
            return Ok(());
        }
        Err(Sentinel::DomainNotAllow)
    }
}

// ── rate limit ───────────────────────────────────────────────────

/// Bridges the flow controller into the chain.
pub struct RateLimitHandler {
    enabled: bool,
    flow: Arc<FlowController>,
}

impl RateLimitHandler {
    pub fn new(config: &Config, flow: Arc<FlowController>) -> Self {
        Self {
            enabled: config.features.flow_control.enabled,
            flow,
        }
    }
}

impl PreHandler for RateLimitHandler {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "rate-limiter"
    }

    fn handle(&self, ctx: &mut RequestCtx) -> Result<(), Sentinel> {
        let verdict = self.flow.check(&ctx.host, &ctx.headers, ctx.remote);
        if !verdict.allowed {
            debug!(
                host = %ctx.host,
                rule = %verdict.rule_name,
                reason = %verdict.reason,
                "client has been rate limited"
            );
            return Err(Sentinel::ReqLimit);
        }
        Ok(())
    }
}

// ── image referer protection ─────────────────────────────────────

/// Referer guard for image requests against pure backend services.
///
/// Requests whose `Content-Type` names a protected image type must carry a
/// `Referer` whose host is on the allow-list; everything else passes.
pub struct ImageProtect {
    enabled: bool,
    mime: Vec<String>,
    allow: Vec<String>,
}

impl ImageProtect {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.middleware.image_protect.enabled,
            mime: config.security.image_protect.image_type.clone(),
            allow: config.security.image_protect.allow_referer.clone(),
        }
    }

    fn referer_host(referer: &str) -> Option<String> {
        let rest = referer
            .strip_prefix("https://")
            .or_else(|| referer.strip_prefix("http://"))?;
        let host = rest.split(['/', '?', '#']).next()?;
        let host = host.split(':').next()?;
        (!host.is_empty()).then(|| host.to_string())
    }
}

impl PreHandler for ImageProtect {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "image-protect"
    }

    fn handle(&self, ctx: &mut RequestCtx) -> Result<(), Sentinel> {
        let content_type = ctx.header("content-type").unwrap_or("");
        let base_type = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if base_type.is_empty() || !self.mime.iter().any(|m| m == &base_type) {
            return Ok(());
        }

        let referer = ctx.header("referer").unwrap_or("");
        let host = Self::referer_host(referer).unwrap_or_default();
        if self.allow.iter().any(|a| a == &host) {
            return Ok(());
        }
        Err(Sentinel::DomainNotAllow)
    }
}
