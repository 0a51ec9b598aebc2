//! Response modifier chain
//!
//! Modifiers rewrite the upstream response before it is returned to the
//! client. The chain applies enabled modifiers in registration order; a
//! modifier error aborts the chain and surfaces to the proxy engine.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Response};
use rand::RngCore;
use tracing::debug;

use crate::config::Config;
use crate::context::{RequestCtx, ServiceKind};

/// A named response rewrite unit.
#[async_trait]
pub trait Modifier: Send + Sync {
    fn enabled(&self) -> bool;
    fn name(&self) -> &'static str;
    async fn apply(&self, ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()>;
    /// Re-read configuration. Default: nothing to update.
    fn update_config(&self, _config: &Config) {}
}

/// Registration-ordered chain.
#[derive(Default)]
pub struct ModifierChain {
    modifiers: Vec<Box<dyn Modifier>>,
}

impl ModifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, modifier: Box<dyn Modifier>) {
        self.modifiers.push(modifier);
    }

    pub async fn apply(
        &self,
        ctx: &RequestCtx,
        response: &mut Response<Bytes>,
    ) -> anyhow::Result<()> {
        for modifier in &self.modifiers {
            if !modifier.enabled() {
                continue;
            }
            modifier.apply(ctx, response).await?;
        }
        Ok(())
    }

    pub fn update_config(&self, config: &Config) {
        for modifier in &self.modifiers {
            modifier.update_config(config);
        }
        debug!("all modifier configurations updated");
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modifiers.iter().map(|m| m.name()).collect()
    }
}

// ── trace id ─────────────────────────────────────────────────────

/// `YYYYMMDDhhmmss-<12 hex>`, e.g. `20250111150430-a1b2c3d4e5f6`.
pub fn generate_trace_id() -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let mut random = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut random);
    let hex: String = random.iter().map(|b| format!("{b:02x}")).collect();
    format!("{timestamp}-{hex}")
}

/// Echoes the request trace id onto the response, generating one when the
/// request arrived without it.
pub struct TraceModifier {
    enabled: bool,
    header: String,
}

impl TraceModifier {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.middleware.trace.enabled,
            header: config.middleware.trace.trace_id.clone(),
        }
    }
}

#[async_trait]
impl Modifier for TraceModifier {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "trace-id"
    }

    async fn apply(&self, ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        let trace_id = match ctx.header(&self.header) {
            Some(existing) if !existing.is_empty() => existing.to_string(),
            _ => ctx.trace_id.clone().unwrap_or_else(generate_trace_id),
        };
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(self.header.as_str()),
            HeaderValue::try_from(trace_id),
        ) {
            response.headers_mut().insert(name, value);
        }
        Ok(())
    }
}

// ── secure headers ───────────────────────────────────────────────

pub struct SecureHeaderModifier {
    enabled: bool,
    xss: bool,
    iframe: bool,
    hsts: bool,
    hsts_subdomain: bool,
    hsts_preload: bool,
    same_site: bool,
}

impl SecureHeaderModifier {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.features.secure_header,
            xss: config.security.xss_protection,
            iframe: config.security.iframe_protection,
            hsts: config.security.hsts,
            hsts_subdomain: config.security.hsts_subdomain,
            hsts_preload: config.security.hsts_preload,
            same_site: config.security.same_site,
        }
    }
}

#[async_trait]
impl Modifier for SecureHeaderModifier {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "secure-header"
    }

    async fn apply(&self, _ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        let headers = response.headers_mut();
        headers.insert(
            "x-content-type-options",
            HeaderValue::from_static("nosniff"),
        );
        if self.xss {
            headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
        }
        if self.iframe {
            headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        }
        if self.hsts {
            let mut hsts = "max-age=31536000;".to_string();
            if self.hsts_subdomain {
                hsts.push_str("includeSubDomains;");
            }
            if self.hsts_preload {
                hsts.push_str("preload");
            }
            if let Ok(value) = HeaderValue::try_from(hsts) {
                headers.insert("strict-transport-security", value);
            }
        }
        if self.same_site {
            headers.insert(
                "set-cookie",
                HeaderValue::from_static("SameSite=Strict; Path=/; Secure; HttpOnly"),
            );
        }
        headers.insert(
            "referrer-policy",
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        Ok(())
    }
}

// ── cache control ────────────────────────────────────────────────

/// Backend responses without an explicit `Cache-Control` get `no-cache`.
pub struct NoCacheModifier {
    enabled: bool,
}

impl NoCacheModifier {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.features.no_cache,
        }
    }
}

#[async_trait]
impl Modifier for NoCacheModifier {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "no-cache"
    }

    async fn apply(&self, ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        if response.headers().contains_key("cache-control") {
            return Ok(());
        }
        let is_backend = ctx
            .upstream
            .as_ref()
            .is_some_and(|u| u.kind == ServiceKind::Backend);
        if is_backend {
            response
                .headers_mut()
                .insert("cache-control", HeaderValue::from_static("no-cache"));
        }
        Ok(())
    }
}

// ── custom headers ───────────────────────────────────────────────

/// Injects configured constant headers unless the upstream already set them.
pub struct CustomHeaderModifier {
    headers: Vec<(String, String)>,
}

impl CustomHeaderModifier {
    pub fn new(config: &Config) -> Self {
        Self {
            headers: config
                .custom_header
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl Modifier for CustomHeaderModifier {
    fn enabled(&self) -> bool {
        !self.headers.is_empty()
    }

    fn name(&self) -> &'static str {
        "custom-header"
    }

    async fn apply(&self, _ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        for (key, value) in &self.headers {
            let Ok(name) = http::header::HeaderName::try_from(key.as_str()) else {
                continue;
            };
            if response.headers().contains_key(&name) {
                continue;
            }
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                response.headers_mut().insert(name, value);
            }
        }
        Ok(())
    }
}

// ── cors ─────────────────────────────────────────────────────────

pub struct CorsModifier {
    enabled: bool,
    origins: String,
    methods: String,
    headers: String,
}

const DEFAULT_ORIGINS: &str = "*";
const DEFAULT_METHODS: &str = "GET,HEAD,POST,PUT,PATCH,DELETE";
const DEFAULT_HEADERS: &str = "Content-Type,Origin,Authorization";

impl CorsModifier {
    pub fn new(config: &Config) -> Self {
        let cors = &config.middleware.cors;
        let join = |list: &[String], default: &str| {
            if list.is_empty() {
                default.to_string()
            } else {
                list.join(",")
            }
        };
        Self {
            enabled: cors.enabled,
            origins: join(&cors.origin, DEFAULT_ORIGINS),
            methods: join(&cors.method, DEFAULT_METHODS),
            headers: join(&cors.header, DEFAULT_HEADERS),
        }
    }
}

#[async_trait]
impl Modifier for CorsModifier {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &'static str {
        "cors"
    }

    async fn apply(&self, _ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::try_from(self.origins.as_str()) {
            headers.insert("access-control-allow-origin", v);
        }
        if let Ok(v) = HeaderValue::try_from(self.methods.as_str()) {
            headers.insert("access-control-allow-methods", v);
        }
        if let Ok(v) = HeaderValue::try_from(self.headers.as_str()) {
            headers.insert("access-control-allow-headers", v);
        }
        headers.insert(
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Upstream, UpstreamScheme};
    use http::{HeaderMap, Method};

    fn ctx() -> RequestCtx {
        RequestCtx::new(Method::GET, "a.example", "/", None, HeaderMap::new(), None)
    }

    fn response() -> Response<Bytes> {
        Response::builder().status(200).body(Bytes::new()).unwrap()
    }

    fn backend_upstream() -> Upstream {
        Upstream {
            scheme: UpstreamScheme::Http,
            host: "127.0.0.1".to_string(),
            port: 9001,
            path: "/".to_string(),
            service: "svc".to_string(),
            kind: ServiceKind::Backend,
        }
    }

    #[test]
    fn test_trace_id_format() {
        let id = generate_trace_id();
        let (ts, hex) = id.split_once('-').unwrap();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_trace_modifier_echoes_request_id() {
        let mut config = Config::default();
        config.middleware.trace.enabled = true;
        let modifier = TraceModifier::new(&config);

        let mut ctx = ctx();
        ctx.set_header("X-Trace-Id", "20250101000000-abcdefabcdef");
        let mut response = response();
        modifier.apply(&ctx, &mut response).await.unwrap();
        assert_eq!(
            response.headers().get("x-trace-id").unwrap(),
            "20250101000000-abcdefabcdef"
        );
    }

    #[tokio::test]
    async fn test_trace_modifier_generates_when_missing() {
        let config = Config::default();
        let modifier = TraceModifier::new(&config);
        let mut response = response();
        modifier.apply(&ctx(), &mut response).await.unwrap();
        let value = response.headers().get("x-trace-id").unwrap();
        assert_eq!(value.to_str().unwrap().len(), 14 + 1 + 12);
    }

    #[tokio::test]
    async fn test_secure_headers_full_set() {
        let mut config = Config::default();
        config.features.secure_header = true;
        config.security.xss_protection = true;
        config.security.iframe_protection = true;
        config.security.hsts = true;
        config.security.hsts_subdomain = true;
        config.security.hsts_preload = true;
        let modifier = SecureHeaderModifier::new(&config);

        let mut response = response();
        modifier.apply(&ctx(), &mut response).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            headers.get("strict-transport-security").unwrap(),
            "max-age=31536000;includeSubDomains;preload"
        );
        assert_eq!(
            headers.get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
    }

    #[tokio::test]
    async fn test_no_cache_only_tags_backend_responses() {
        let mut config = Config::default();
        config.features.no_cache = true;
        let modifier = NoCacheModifier::new(&config);

        // Frontend-bound request: untouched.
        let mut response1 = response();
        modifier.apply(&ctx(), &mut response1).await.unwrap();
        assert!(response1.headers().get("cache-control").is_none());

        // Backend-bound request: tagged.
        let mut ctx = ctx();
        ctx.upstream = Some(backend_upstream());
        let mut response2 = response();
        modifier.apply(&ctx, &mut response2).await.unwrap();
        assert_eq!(response2.headers().get("cache-control").unwrap(), "no-cache");

        // Upstream-set Cache-Control wins.
        let mut response3 = response();
        response3
            .headers_mut()
            .insert("cache-control", HeaderValue::from_static("max-age=60"));
        modifier.apply(&ctx, &mut response3).await.unwrap();
        assert_eq!(
            response3.headers().get("cache-control").unwrap(),
            "max-age=60"
        );
    }

    #[tokio::test]
    async fn test_custom_header_does_not_override() {
        let mut config = Config::default();
        config
            .custom_header
            .insert("X-Powered-By".to_string(), "hamburger".to_string());
        let modifier = CustomHeaderModifier::new(&config);
        assert!(modifier.enabled());

        let mut response1 = response();
        response1
            .headers_mut()
            .insert("x-powered-by", HeaderValue::from_static("upstream"));
        modifier.apply(&ctx(), &mut response1).await.unwrap();
        assert_eq!(response1.headers().get("x-powered-by").unwrap(), "upstream");

        let mut response2 = response();
        modifier.apply(&ctx(), &mut response2).await.unwrap();
        assert_eq!(response2.headers().get("x-powered-by").unwrap(), "hamburger");
    }

    #[tokio::test]
    async fn test_cors_defaults() {
        let mut config = Config::default();
        config.middleware.cors.enabled = true;
        let modifier = CorsModifier::new(&config);

        let mut response = response();
        modifier.apply(&ctx(), &mut response).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "GET,HEAD,POST,PUT,PATCH,DELETE"
        );
        assert_eq!(
            headers.get("access-control-allow-headers").unwrap(),
            "Content-Type,Origin,Authorization"
        );
        assert_eq!(
            headers.get("access-control-allow-credentials").unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order_and_skips_disabled() {
        let mut config = Config::default();
        config.middleware.cors.enabled = true;
        config.features.secure_header = false;

        let mut chain = ModifierChain::new();
        chain.add(Box::new(SecureHeaderModifier::new(&config)));
        chain.add(Box::new(CorsModifier::new(&config)));

        let mut response = response();
        chain.apply(&ctx(), &mut response).await.unwrap();
        // Disabled secure-header contributed nothing, enabled cors did.
        assert!(response.headers().get("x-content-type-options").is_none());
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_some());
    }
}
