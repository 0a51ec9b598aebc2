//! Hamburger - HTTP reverse proxy / API gateway
//!
//! A gateway that:
//! - Terminates HTTP/1.1 and HTTP/2 (h2c included) with TLS and ACME
//! - Classifies requests by Host and path against a service topology
//! - Forwards to backends picked by a cached round-robin balancer
//! - Enforces rate limits and per-host circuit breaking on the way in
//! - Rewrites responses (gzip, CORS, trace, secure and custom headers)
//! - Bridges JSON-over-HTTP calls to whitelisted gRPC upstreams

pub mod acme;
pub mod balancer;
pub mod breaker;
pub mod config;
pub mod context;
pub mod error_page;
pub mod flow_control;
pub mod grpc_proxy;
pub mod gzip;
pub mod modifier;
pub mod prehandler;
pub mod proxy;
pub mod resolver;
pub mod runtime;
pub mod server;
pub mod stat;
pub mod structure;
pub mod tls;
pub mod transport;

// Re-export commonly used types
pub use balancer::{BalancerCache, RoundRobin};
pub use breaker::Breaker;
pub use config::Config;
pub use context::{RequestCtx, Sentinel, Upstream};
pub use flow_control::FlowController;
pub use proxy::Gateway;
pub use resolver::Resolver;
pub use runtime::{AppRegistry, FileRegistry, StaticRegistry, Topology, TopologyHandle};
pub use server::ServerManager;
pub use stat::{GeoLookup, NoGeo, Stats};
pub use tls::TlsManager;
pub use transport::Transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
