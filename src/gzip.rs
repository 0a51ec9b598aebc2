//! Gzip response modifier
//!
//! Compresses eligible upstream responses. Small payloads are compressed
//! inline with pooled scratch buffers; payloads above the async threshold go
//! through a bounded worker pool with a short acquire timeout (falling back
//! to inline) and a hard job timeout (falling back to the original body).
//!
//! The optional compression cache is keyed by `length + first byte + last
//! byte`, a deliberately weak fingerprint that is best-effort, not
//! content-addressed. It can only ever serve a stale entry for two bodies
//! that collide on all three values within the TTL; hits on bit-identical
//! bodies are exact.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{HeaderValue, Response};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::{Config, GzipConfig};
use crate::context::RequestCtx;
use crate::modifier::Modifier;

/// How long to wait for a worker slot before compressing inline.
const WORKER_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);
/// Hard cap on one async compression job.
const ASYNC_JOB_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry {
    data: Bytes,
    created: Instant,
}

/// Reusable scratch buffers for the inline compression path.
struct BufferPool {
    buffers: parking_lot::Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Vec<u8> {
        self.buffers.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < 32 {
            buffers.push(buf);
        }
    }
}

#[derive(Debug, Default)]
pub struct GzipStats {
    pub total_requests: AtomicU64,
    pub compressed: AtomicU64,
    pub cache_hits: AtomicU64,
}

pub struct GzipModifier {
    config: GzipConfig,
    buffers: Arc<BufferPool>,
    workers: Arc<Semaphore>,
    cache: Arc<DashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    stats: Arc<GzipStats>,
}

impl GzipModifier {
    pub fn new(config: &Config) -> Self {
        let gzip = config.features.gzip.clone();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let cache_ttl = Duration::from_secs(gzip.cache_ttl.max(1));
        Self {
            config: gzip,
            buffers: Arc::new(BufferPool::new()),
            workers: Arc::new(Semaphore::new(workers)),
            cache: Arc::new(DashMap::new()),
            cache_ttl,
            stats: Arc::new(GzipStats::default()),
        }
    }

    /// Expired-entry sweeper. Call once from an async context.
    pub fn spawn_cache_sweeper(&self) {
        if !self.config.cache_enabled {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let ttl = self.cache_ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.retain(|_, entry| entry.created.elapsed() < ttl);
            }
        });
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.total_requests.load(Ordering::Relaxed),
            self.stats.compressed.load(Ordering::Relaxed),
            self.stats.cache_hits.load(Ordering::Relaxed),
        )
    }

    fn client_accepts_gzip(ctx: &RequestCtx) -> bool {
        ctx.header("accept-encoding")
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false)
    }

    fn mime_allowed(&self, response: &Response<Bytes>) -> bool {
        let Some(content_type) = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let main_type = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .split('/')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        self.config.types.iter().any(|t| t == &main_type)
    }

    fn should_compress(&self, ctx: &RequestCtx, response: &Response<Bytes>) -> bool {
        if !self.config.enabled || !Self::client_accepts_gzip(ctx) {
            return false;
        }
        let already_encoded = response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if already_encoded {
            return false;
        }
        if !self.mime_allowed(response) {
            return false;
        }
        // Content-Length when present, else buffered body length.
        let size = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(|| response.body().len());
        size >= self.config.threshold
    }

    fn cache_key(data: &[u8]) -> String {
        // Weak content fingerprint; see module docs.
        format!("{}_{}_{}", data.len(), data[0], data[data.len() - 1])
    }

    fn cache_get(&self, data: &[u8]) -> Option<Bytes> {
        if !self.config.cache_enabled {
            return None;
        }
        let key = Self::cache_key(data);
        if let Some(entry) = self.cache.get(&key) {
            if entry.created.elapsed() < self.cache_ttl {
                return Some(entry.data.clone());
            }
            drop(entry);
            self.cache.remove(&key);
        }
        None
    }

    fn cache_put(&self, original: &[u8], compressed: Bytes) {
        if !self.config.cache_enabled {
            return;
        }
        self.cache.insert(
            Self::cache_key(original),
            CacheEntry {
                data: compressed,
                created: Instant::now(),
            },
        );
    }

    fn compress_inline(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let buf = self.buffers.get();
        let mut encoder = GzEncoder::new(buf, Compression::new(self.config.level));
        encoder.write_all(data)?;
        let buf = encoder.finish()?;
        let out = buf.clone();
        self.buffers.put(buf);
        Ok(out)
    }

    async fn compress_async(&self, data: Bytes) -> Option<Vec<u8>> {
        // Worker slot or bust: after a short wait, compress inline instead.
        let permit = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                match tokio::time::timeout(
                    WORKER_ACQUIRE_TIMEOUT,
                    self.workers.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => permit,
                    _ => return self.compress_inline(&data).ok(),
                }
            }
        };

        let level = self.config.level;
        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
            encoder.write_all(&data)?;
            Ok::<Vec<u8>, std::io::Error>(encoder.finish()?)
        });

        match tokio::time::timeout(ASYNC_JOB_TIMEOUT, job).await {
            Ok(Ok(Ok(compressed))) => Some(compressed),
            // Timeout or worker failure: the original body surfaces unchanged.
            _ => None,
        }
    }

    fn apply_compressed(response: &mut Response<Bytes>, compressed: Bytes) {
        let length = compressed.len();
        *response.body_mut() = compressed;
        let headers = response.headers_mut();
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert(
            "content-length",
            HeaderValue::from_str(&length.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert("vary", HeaderValue::from_static("Accept-Encoding"));
    }
}

#[async_trait]
impl Modifier for GzipModifier {
    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    async fn apply(&self, ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        if !self.should_compress(ctx, response) {
            return Ok(());
        }
        let original = response.body().clone();
        if original.is_empty() || original.len() < self.config.threshold {
            return Ok(());
        }

        if let Some(cached) = self.cache_get(&original) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            Self::apply_compressed(response, cached);
            return Ok(());
        }

        let compressed = if original.len() > self.config.async_threshold {
            self.compress_async(original.clone()).await
        } else {
            match self.compress_inline(&original) {
                Ok(compressed) => Some(compressed),
                Err(e) => {
                    // Compression failures never fail the request.
                    debug!(error = %e, "gzip compression failed, passing through");
                    None
                }
            }
        };

        let Some(compressed) = compressed else {
            return Ok(());
        };
        if compressed.len() >= original.len() {
            debug!(
                original = original.len(),
                compressed = compressed.len(),
                "compression did not shrink payload, passing through"
            );
            return Ok(());
        }

        let compressed = Bytes::from(compressed);
        self.cache_put(&original, compressed.clone());
        self.stats.compressed.fetch_add(1, Ordering::Relaxed);
        Self::apply_compressed(response, compressed);
        Ok(())
    }

    fn update_config(&self, _config: &Config) {
        // Level/types changes require a restart; the encoder pool is sized
        // to the configured level at construction.
    }
}

#[async_trait]
impl Modifier for Arc<GzipModifier> {
    fn enabled(&self) -> bool {
        (**self).enabled()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn apply(&self, ctx: &RequestCtx, response: &mut Response<Bytes>) -> anyhow::Result<()> {
        (**self).apply(ctx, response).await
    }

    fn update_config(&self, config: &Config) {
        (**self).update_config(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use std::io::Read;

    fn gzip_config() -> Config {
        let mut config = Config::default();
        config.features.gzip.enabled = true;
        config.features.gzip.threshold = 64;
        config
    }

    fn ctx_accepting_gzip() -> RequestCtx {
        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", "gzip, deflate".parse().unwrap());
        RequestCtx::new(Method::GET, "a.example", "/", None, headers, None)
    }

    fn html_response(size: usize) -> Response<Bytes> {
        let body: Bytes = "x".repeat(size).into();
        Response::builder()
            .status(200)
            .header("content-type", "text/html; charset=utf-8")
            .header("content-length", body.len().to_string())
            .body(body)
            .unwrap()
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_compresses_eligible_response() {
        let modifier = GzipModifier::new(&gzip_config());
        let mut response = html_response(4096);
        modifier
            .apply(&ctx_accepting_gzip(), &mut response)
            .await
            .unwrap();

        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");
        assert_eq!(response.headers().get("vary").unwrap(), "Accept-Encoding");
        assert!(response.body().len() < 4096);
        assert_eq!(
            response.headers().get("content-length").unwrap(),
            &response.body().len().to_string()
        );
        assert_eq!(gunzip(response.body()), "x".repeat(4096).into_bytes());
    }

    #[tokio::test]
    async fn test_below_threshold_passes_through() {
        let modifier = GzipModifier::new(&gzip_config());
        let mut response = html_response(10);
        modifier
            .apply(&ctx_accepting_gzip(), &mut response)
            .await
            .unwrap();
        assert!(response.headers().get("content-encoding").is_none());
        assert_eq!(response.body().len(), 10);
    }

    #[tokio::test]
    async fn test_client_without_gzip_passes_through() {
        let modifier = GzipModifier::new(&gzip_config());
        let mut ctx = ctx_accepting_gzip();
        ctx.headers.remove("accept-encoding");
        let mut response = html_response(4096);
        let before = response.body().clone();
        modifier.apply(&ctx, &mut response).await.unwrap();
        assert_eq!(response.body(), &before);
        assert!(response.headers().get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_mime_filter_rejects_binary() {
        let modifier = GzipModifier::new(&gzip_config());
        let body: Bytes = vec![0u8; 4096].into();
        let mut response = Response::builder()
            .status(200)
            .header("content-type", "image/png")
            .body(body.clone())
            .unwrap();
        modifier
            .apply(&ctx_accepting_gzip(), &mut response)
            .await
            .unwrap();
        // Pass-through must be byte-identical.
        assert_eq!(response.body(), &body);
        assert!(response.headers().get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_already_encoded_untouched() {
        let modifier = GzipModifier::new(&gzip_config());
        let mut response = html_response(4096);
        response
            .headers_mut()
            .insert("content-encoding", HeaderValue::from_static("br"));
        let before = response.body().clone();
        modifier
            .apply(&ctx_accepting_gzip(), &mut response)
            .await
            .unwrap();
        assert_eq!(response.body(), &before);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "br");
    }

    #[tokio::test]
    async fn test_cache_hit_on_identical_body() {
        let modifier = GzipModifier::new(&gzip_config());
        let mut first = html_response(8192);
        modifier
            .apply(&ctx_accepting_gzip(), &mut first)
            .await
            .unwrap();

        let mut second = html_response(8192);
        modifier
            .apply(&ctx_accepting_gzip(), &mut second)
            .await
            .unwrap();

        let (_, _, cache_hits) = modifier.stats();
        assert!(cache_hits >= 1);
        assert_eq!(first.body(), second.body());
        // A cached entry still decodes to the exact original.
        assert_eq!(gunzip(second.body()), "x".repeat(8192).into_bytes());
    }

    #[tokio::test]
    async fn test_async_path_for_large_payload() {
        let mut config = gzip_config();
        config.features.gzip.async_threshold = 1024;
        let modifier = GzipModifier::new(&config);

        let mut response = html_response(50 * 1024);
        modifier
            .apply(&ctx_accepting_gzip(), &mut response)
            .await
            .unwrap();
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");
        assert!(response.body().len() < 50 * 1024);
        assert_eq!(gunzip(response.body()), "x".repeat(50 * 1024).into_bytes());
    }

    #[tokio::test]
    async fn test_incompressible_payload_passes_through() {
        let mut config = gzip_config();
        config.features.gzip.cache_enabled = false;
        let modifier = GzipModifier::new(&config);

        // Random bytes do not shrink under gzip.
        let body: Bytes = (0..4096)
            .map(|_| rand::random::<u8>())
            .collect::<Vec<u8>>()
            .into();
        let mut response = Response::builder()
            .status(200)
            .header("content-type", "text/plain")
            .body(body.clone())
            .unwrap();
        modifier
            .apply(&ctx_accepting_gzip(), &mut response)
            .await
            .unwrap();
        assert_eq!(response.body(), &body);
        assert!(response.headers().get("content-encoding").is_none());
    }
}
