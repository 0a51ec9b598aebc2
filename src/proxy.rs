//! Reverse-proxy engine
//!
//! Composes the per-request pipeline: director (trace, stats, pre-handlers,
//! breaker, resolver) → transport → modifier chain → client. Failures detour
//! to the error handler, which renders by sentinel and feeds the circuit
//! breaker on backend errors.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Response;
use tracing::{debug, warn};

use crate::balancer::BalancerCache;
use crate::breaker::Breaker;
use crate::config::Config;
use crate::context::{RequestCtx, Sentinel, ServiceKind, Upstream, UpstreamScheme};
use crate::error_page::ErrorPages;
use crate::flow_control::{client_ip, FlowController};
use crate::grpc_proxy::GrpcProxy;
use crate::gzip::GzipModifier;
use crate::modifier::{
    generate_trace_id, CorsModifier, CustomHeaderModifier, ModifierChain, NoCacheModifier,
    SecureHeaderModifier, TraceModifier,
};
use crate::prehandler::PreHandlerChain;
use crate::resolver::Resolver;
use crate::runtime::{AppRegistry, TopologyHandle};
use crate::stat::{Counter, GeoLookup, Stats};
use crate::transport::{build_transport, GatewayTransport, Transport};

/// Deadline on the upstream send/receive of one proxied request.
const UPSTREAM_DEADLINE: Duration = Duration::from_secs(25);

/// The assembled request pipeline. Built once at startup and shared by every
/// listener; all cross-request state lives in the referenced components.
pub struct Gateway {
    pub config: Arc<Config>,
    pub topology: Arc<TopologyHandle>,
    pub breaker: Arc<Breaker>,
    pub flow: Arc<FlowController>,
    pub stats: Arc<Stats>,
    prehandlers: PreHandlerChain,
    resolver: Resolver,
    modifiers: ModifierChain,
    transport: GatewayTransport,
    grpc: Option<Arc<GrpcProxy>>,
    gzip: Arc<GzipModifier>,
    error_pages: ErrorPages,
    trace_header: String,
    debug_timing: bool,
}

impl Gateway {
    /// Wire the whole pipeline from configuration. External collaborators
    /// (app registry, geo lookup) are injected.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<dyn AppRegistry>,
        geo: Arc<dyn GeoLookup>,
    ) -> Arc<Self> {
        let topology = TopologyHandle::new(&config, registry);
        let balancers = Arc::new(BalancerCache::new());
        let breaker = Arc::new(Breaker::new(
            config.features.breaker.bucket,
            config.features.breaker.max_error,
            Duration::from_secs(config.features.breaker.reset.max(1)),
        ));
        let flow = Arc::new(FlowController::new(&config.features.flow_control));
        let stats = Arc::new(Stats::new(config.stat.enable_stat, geo));

        let prehandlers =
            PreHandlerChain::standard(&config, Arc::clone(&topology), Arc::clone(&flow));
        let resolver = Resolver::new(&config, balancers);

        // Modifier registration order is the application order.
        let gzip = Arc::new(GzipModifier::new(&config));
        let mut modifiers = ModifierChain::new();
        modifiers.add(Box::new(TraceModifier::new(&config)));
        modifiers.add(Box::new(SecureHeaderModifier::new(&config)));
        modifiers.add(Box::new(NoCacheModifier::new(&config)));
        modifiers.add(Box::new(CustomHeaderModifier::new(&config)));
        modifiers.add(Box::new(Arc::clone(&gzip)));
        modifiers.add(Box::new(CorsModifier::new(&config)));

        let grpc = config
            .features
            .grpc_proxy
            .enabled
            .then(|| Arc::new(GrpcProxy::new(&config.features.grpc_proxy)));
        let transport = GatewayTransport::new(build_transport(&config), grpc.clone());

        let error_pages = ErrorPages::new(config.security.strict_mode);
        let trace_header = config.middleware.trace.trace_id.clone();
        let debug_timing = config.debug;

        Arc::new(Self {
            config,
            topology,
            breaker,
            flow,
            stats,
            prehandlers,
            resolver,
            modifiers,
            transport,
            grpc,
            gzip,
            error_pages,
            trace_header,
            debug_timing,
        })
    }

    /// Launch the breaker reset ticker, limiter sweeper, gzip cache sweeper
    /// and topology syncer.
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.breaker.start_reset_task();
        self.flow.start_sweeper();
        self.gzip.spawn_cache_sweeper();
        self.topology.start_syncer(Duration::from_secs(
            self.config.syncer.job_sync_domain_ports,
        ));
    }

    /// Serve one request end to end.
    pub async fn handle(&self, ctx: &mut RequestCtx, body: Bytes) -> Response<Bytes> {
        self.stats.add(Counter::Total);
        self.stats.add_domain(&ctx.host);
        self.stats
            .add_geo(&client_ip(&ctx.headers, ctx.remote));

        self.direct(ctx);
        if ctx.sentinel.is_some() {
            return self.error_response(ctx);
        }

        let result =
            tokio::time::timeout(UPSTREAM_DEADLINE, self.transport.round_trip(ctx, body)).await;
        let mut response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(host = %ctx.host, error = %e, "upstream round-trip failed");
                ctx.set_sentinel(Sentinel::BackendError);
                return self.error_response(ctx);
            }
            Err(_) => {
                warn!(host = %ctx.host, "upstream deadline exceeded");
                ctx.set_sentinel(Sentinel::BackendError);
                return self.error_response(ctx);
            }
        };

        match ctx.upstream.as_ref().map(|u| u.kind) {
            Some(ServiceKind::Backend) => self.stats.add(Counter::Api),
            Some(ServiceKind::Frontend) => self.stats.add(Counter::Static),
            None => {}
        }

        if let Err(e) = self.apply_modifiers(ctx, &mut response).await {
            warn!(host = %ctx.host, error = %e, "modifier chain failed");
            ctx.set_sentinel(Sentinel::BackendError);
            return self.error_response(ctx);
        }

        response
    }

    /// The director: decorate the outbound request, run pre-handlers, check
    /// the breaker, then resolve the upstream.
    fn direct(&self, ctx: &mut RequestCtx) {
        // Every request carries a trace id from here on.
        match ctx.header(&self.trace_header) {
            Some(existing) if !existing.is_empty() => {
                ctx.trace_id = Some(existing.to_string());
            }
            _ => {
                let trace_id = generate_trace_id();
                let header = self.trace_header.clone();
                ctx.set_header(&header, &trace_id);
                ctx.trace_id = Some(trace_id);
            }
        }
        debug!(host = %ctx.host, trace_id = ?ctx.trace_id, "directing request");

        // Bridge requests skip routing: the transport diverts on the scheme.
        if let Some(grpc) = &self.grpc {
            if grpc.is_grpc_request(ctx) {
                debug!("detected gRPC bridge request");
                ctx.upstream = Some(Upstream {
                    scheme: UpstreamScheme::Grpc,
                    host: String::new(),
                    port: 0,
                    path: ctx.path.clone(),
                    service: "grpc-bridge".to_string(),
                    kind: ServiceKind::Backend,
                });
                return;
            }
        }

        if self.prehandlers.run(ctx).is_some() {
            return;
        }

        if !self.breaker.allow(&ctx.host) {
            ctx.set_sentinel(Sentinel::BucketLimit);
            return;
        }

        let topology = self.topology.snapshot();
        self.resolver.parse(ctx, &topology);
    }

    async fn apply_modifiers(
        &self,
        ctx: &RequestCtx,
        response: &mut Response<Bytes>,
    ) -> anyhow::Result<()> {
        if self.debug_timing {
            let start = std::time::Instant::now();
            let result = self.modifiers.apply(ctx, response).await;
            debug!(elapsed = ?start.elapsed(), "modifier chain timing");
            return result;
        }
        self.modifiers.apply(ctx, response).await
    }

    /// Terminal error path: count the failure, feed the breaker on backend
    /// errors, render by sentinel.
    fn error_response(&self, ctx: &RequestCtx) -> Response<Bytes> {
        self.stats.add(Counter::Fail);
        let sentinel = ctx.sentinel.unwrap_or(Sentinel::BackendError);
        if sentinel == Sentinel::BackendError {
            self.breaker.record_failure(&ctx.host);
        }
        debug!(host = %ctx.host, ?sentinel, "rendering error response");
        self.error_pages.render(sentinel, &ctx.headers)
    }
}
