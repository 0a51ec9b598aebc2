//! Traffic statistics
//!
//! Lock-free counters updated on the request path and read by the external
//! stats server through a snapshot getter. Totals are plain 64-bit atomics;
//! per-domain and per-country histograms are sharded maps of atomic
//! counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::structure::ShardedMap;

/// Counter classes tracked by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Every request entering the pipeline
    Total,
    /// Requests routed to a backend service
    Api,
    /// Requests routed to the static frontend
    Static,
    /// Requests ending in the error handler
    Fail,
}

/// Country resolution for the geo histogram. The embedded MMDB reader is an
/// external collaborator; the gateway only needs this seam.
pub trait GeoLookup: Send + Sync {
    /// ISO country code for an IP, or `None` when unknown.
    fn country(&self, ip: &str) -> Option<String>;
}

/// Lookup that never resolves, used when no geo database is wired in.
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn country(&self, _ip: &str) -> Option<String> {
        None
    }
}

pub struct Stats {
    enabled: bool,
    total: AtomicU64,
    api: AtomicU64,
    static_: AtomicU64,
    fail: AtomicU64,
    domains: ShardedMap<Arc<AtomicU64>>,
    countries: ShardedMap<Arc<AtomicU64>>,
    geo: Arc<dyn GeoLookup>,
}

impl Stats {
    pub fn new(enabled: bool, geo: Arc<dyn GeoLookup>) -> Self {
        Self {
            enabled,
            total: AtomicU64::new(0),
            api: AtomicU64::new(0),
            static_: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            domains: ShardedMap::new(),
            countries: ShardedMap::new(),
            geo,
        }
    }

    pub fn add(&self, counter: Counter) {
        if !self.enabled {
            return;
        }
        let cell = match counter {
            Counter::Total => &self.total,
            Counter::Api => &self.api,
            Counter::Static => &self.static_,
            Counter::Fail => &self.fail,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_domain(&self, domain: &str) {
        if !self.enabled || domain.is_empty() {
            return;
        }
        self.domains
            .get_or_insert_with(domain, || Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_geo(&self, ip: &str) {
        if !self.enabled {
            return;
        }
        if let Some(country) = self.geo.country(ip) {
            self.countries
                .get_or_insert_with(&country, || Arc::new(AtomicU64::new(0)))
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Total => self.total.load(Ordering::Relaxed),
            Counter::Api => self.api.load(Ordering::Relaxed),
            Counter::Static => self.static_.load(Ordering::Relaxed),
            Counter::Fail => self.fail.load(Ordering::Relaxed),
        }
    }

    /// Read-only snapshot for the stats server.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut domains = Vec::new();
        self.domains.range(|domain, count| {
            domains.push((domain.to_string(), count.load(Ordering::Relaxed)));
            true
        });
        let mut countries = Vec::new();
        self.countries.range(|country, count| {
            countries.push((country.to_string(), count.load(Ordering::Relaxed)));
            true
        });
        StatsSnapshot {
            total: self.get(Counter::Total),
            api: self.get(Counter::Api),
            static_requests: self.get(Counter::Static),
            fail: self.get(Counter::Fail),
            domains,
            countries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub api: u64,
    pub static_requests: u64,
    pub fail: u64,
    pub domains: Vec<(String, u64)>,
    pub countries: Vec<(String, u64)>,
}
