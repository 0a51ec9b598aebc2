//! Request resolution
//!
//! Turns `(request, topology snapshot)` into a concrete upstream. A domain
//! maps to a frontend service, a backend service, or both; when both are
//! present the per-domain API rules decide, and a request matching no rule
//! falls back to the frontend (the SPA + API pattern).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::balancer::BalancerCache;
use crate::config::Config;
use crate::context::{RequestCtx, Sentinel, ServiceKind, Upstream, UpstreamScheme};
use crate::runtime::Topology;

/// Backends resolve to loopback; the gateway and its services share a host.
pub const STATIC_HOST: &str = "127.0.0.1";

/// One API forwarding rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub api: String,
    pub rewrite: String,
    pub use_rewrite: bool,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    HostEmpty,
    DomainsMapEmpty,
    DomainPortsEmpty,
    UnknownPath,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostEmpty => write!(f, "host is empty"),
            Self::DomainsMapEmpty => write!(f, "domains map is empty"),
            Self::DomainPortsEmpty => write!(f, "domains port is empty"),
            Self::UnknownPath => write!(f, "unknown path"),
        }
    }
}

/// Rule table keyed by frontend service name. Rules keep registration order;
/// the first prefix match wins.
pub struct Ruler {
    rules_by_frontend: HashMap<String, Vec<Rule>>,
}

impl Ruler {
    pub fn new(config: &Config) -> Self {
        let mut rules_by_frontend = HashMap::new();
        for server in &config.pxy_frontend.servers {
            let rules: Vec<Rule> = server
                .backends
                .iter()
                .map(|b| Rule {
                    api: b.api.clone(),
                    rewrite: b.rewrite.clone(),
                    use_rewrite: b.use_rewrite,
                    backend: b.service.clone(),
                })
                .collect();
            rules_by_frontend.insert(server.name.clone(), rules);
        }
        Self { rules_by_frontend }
    }

    fn rules_for(&self, frontend: &str) -> &[Rule] {
        self.rules_by_frontend
            .get(frontend)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Resolves requests against a topology snapshot.
pub struct Resolver {
    ruler: Ruler,
    balancers: Arc<BalancerCache>,
    frontend_host: String,
    frontend_port: u16,
    internal_flag: String,
    backend_header: String,
    proxy_app_header: String,
    forward_host_header: String,
}

impl Resolver {
    pub fn new(config: &Config, balancers: Arc<BalancerCache>) -> Self {
        Self {
            ruler: Ruler::new(config),
            balancers,
            frontend_host: config.pxy_frontend.host.clone(),
            frontend_port: config.pxy_frontend.port,
            internal_flag: config.pxy_frontend.internal_flag.clone(),
            backend_header: config.proxy_header.backend_header.clone(),
            proxy_app_header: config.proxy_header.proxy_app.clone(),
            forward_host_header: config.proxy_header.frontend_host_header.clone(),
        }
    }

    /// Resolve the request and decorate the context. On success the upstream
    /// is stored in the context and returned; on failure the backend-error
    /// sentinel is set and `None` returned.
    pub fn parse(&self, ctx: &mut RequestCtx, topology: &Topology) -> Option<Upstream> {
        match self.decide(ctx, topology) {
            Ok(upstream) => {
                debug!(
                    host = %ctx.host,
                    service = %upstream.service,
                    target = %upstream.authority(),
                    path = %upstream.path,
                    "resolved request"
                );
                // The upstream reconstructs virtual hosting from this header;
                // the client-visible host itself is never rewritten.
                let host = ctx.host.clone();
                let forward_header = self.forward_host_header.clone();
                ctx.set_header(&forward_header, &host);
                ctx.upstream = Some(upstream.clone());
                Some(upstream)
            }
            Err(e) => {
                debug!(host = %ctx.host, error = %e, "resolve failed");
                ctx.set_sentinel(Sentinel::BackendError);
                None
            }
        }
    }

    fn decide(&self, ctx: &mut RequestCtx, topology: &Topology) -> Result<Upstream, ResolveError> {
        if ctx.host.is_empty() {
            return Err(ResolveError::HostEmpty);
        }
        // Internal loopback calls bypass domain routing; there is nothing to
        // resolve them against.
        if ctx.is_internal_host() {
            return Err(ResolveError::UnknownPath);
        }

        let service_map = topology
            .service_map(&ctx.host)
            .ok_or(ResolveError::DomainsMapEmpty)?
            .clone();

        if !service_map.frontend.is_empty() && service_map.backend.is_empty() {
            return Ok(self.frontend_upstream(ctx, &service_map.frontend));
        }

        if service_map.frontend.is_empty() && !service_map.backend.is_empty() {
            return self.backend_upstream(
                ctx,
                topology,
                &service_map.backend,
                ctx.path_and_query(),
            );
        }

        // Both defined: consult the API rules, fall back to the frontend.
        let rules = self.ruler.rules_for(&service_map.frontend);
        if let Some(rule) = first_match(rules, &ctx.path) {
            let rule = rule.clone();
            let target_path = rewrite_path(&ctx.path, &rule);
            let target = match &ctx.query {
                Some(q) => format!("{target_path}?{q}"),
                None => target_path,
            };
            return self.backend_upstream(ctx, topology, &rule.backend, target);
        }
        if !service_map.frontend.is_empty() {
            return Ok(self.frontend_upstream(ctx, &service_map.frontend));
        }
        Err(ResolveError::UnknownPath)
    }

    fn frontend_upstream(&self, ctx: &mut RequestCtx, frontend: &str) -> Upstream {
        let flag = self.internal_flag.clone();
        ctx.set_header(&flag, frontend);
        Upstream {
            scheme: UpstreamScheme::Http,
            host: self.frontend_host.clone(),
            port: self.frontend_port,
            path: ctx.path_and_query(),
            service: frontend.to_string(),
            kind: ServiceKind::Frontend,
        }
    }

    fn backend_upstream(
        &self,
        ctx: &mut RequestCtx,
        topology: &Topology,
        service: &str,
        path: String,
    ) -> Result<Upstream, ResolveError> {
        let ports = topology
            .ports_for(&ctx.host)
            .ok_or(ResolveError::DomainPortsEmpty)?;
        let port = self
            .balancers
            .pick(ports)
            .ok_or(ResolveError::DomainPortsEmpty)?;

        let backend_header = self.backend_header.clone();
        let proxy_app = self.proxy_app_header.clone();
        ctx.set_header(&backend_header, "1");
        ctx.set_header(&proxy_app, service);

        Ok(Upstream {
            scheme: UpstreamScheme::Http,
            host: STATIC_HOST.to_string(),
            port,
            path,
            service: service.to_string(),
            kind: ServiceKind::Backend,
        })
    }
}

/// First rule (registration order) whose API prefix matches the path.
fn first_match<'a>(rules: &'a [Rule], path: &str) -> Option<&'a Rule> {
    rules
        .iter()
        .filter(|r| !r.api.is_empty() && !r.backend.is_empty())
        .find(|r| path.starts_with(&r.api))
}

fn rewrite_path(path: &str, rule: &Rule) -> String {
    if rule.use_rewrite && path.starts_with(&rule.api) {
        return format!("{}{}", rule.rewrite, &path[rule.api.len()..]);
    }
    path.to_string()
}
