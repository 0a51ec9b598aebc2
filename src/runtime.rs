//! Runtime routing tables
//!
//! The resolver reads a single immutable [`Topology`] snapshot per request:
//! domain → service pair, frontend name → domain, and domain → backend port
//! list. Refreshes build a complete new snapshot and swap it atomically, so
//! in-flight requests always see a coherent triple. Background syncers
//! re-read the domain map and the app registry on configurable cadences,
//! with a jittered start so a fleet does not refresh in lockstep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Which logical services a domain maps to. Empty string = absent, matching
/// the on-disk domain-map format.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceMap {
    #[serde(default)]
    pub frontend: String,
    #[serde(default)]
    pub backend: String,
}

/// One application known to the registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppRecord {
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub random_port: bool,
}

/// Source of backend port assignments. The production implementation reads
/// the MongoDB `microservice` collection; that collaborator lives outside
/// this crate, so callers hand in whatever implementation they have.
pub trait AppRegistry: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<AppRecord>>;
}

/// Fixed in-memory registry, used by tests and single-node deployments.
pub struct StaticRegistry {
    records: Vec<AppRecord>,
}

impl StaticRegistry {
    pub fn new(records: Vec<AppRecord>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl AppRegistry for StaticRegistry {
    fn load(&self) -> anyhow::Result<Vec<AppRecord>> {
        Ok(self.records.clone())
    }
}

/// Registry backed by a JSON file holding an array of [`AppRecord`].
pub struct FileRegistry {
    path: String,
}

impl FileRegistry {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl AppRegistry for FileRegistry {
    fn load(&self) -> anyhow::Result<Vec<AppRecord>> {
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Immutable routing snapshot.
#[derive(Debug, Default)]
pub struct Topology {
    /// domain → services
    pub domains: HashMap<String, ServiceMap>,
    /// frontend service name → domain (reverse lookup for rule building)
    pub frontends: HashMap<String, String>,
    /// domain → ordered backend ports on localhost
    pub ports: HashMap<String, Vec<u16>>,
    /// Monotonic refresh counter
    pub version: u64,
}

impl Topology {
    pub fn service_map(&self, domain: &str) -> Option<&ServiceMap> {
        self.domains.get(domain)
    }

    pub fn ports_for(&self, domain: &str) -> Option<&Vec<u16>> {
        self.ports.get(domain)
    }

    pub fn domain_of_frontend(&self, frontend: &str) -> Option<&String> {
        self.frontends.get(frontend)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.keys().cloned().collect()
    }
}

/// Shared handle publishing topology snapshots.
pub struct TopologyHandle {
    inner: ArcSwap<Topology>,
    domain_map_path: String,
    registry: Arc<dyn AppRegistry>,
}

impl TopologyHandle {
    pub fn new(config: &Config, registry: Arc<dyn AppRegistry>) -> Arc<Self> {
        let handle = Arc::new(Self {
            inner: ArcSwap::from_pointee(Topology::default()),
            domain_map_path: config.domain_map.clone(),
            registry,
        });
        handle.refresh();
        handle
    }

    /// The current snapshot. Requests capture this once and use it for every
    /// lookup they perform.
    pub fn snapshot(&self) -> Arc<Topology> {
        self.inner.load_full()
    }

    /// Rebuild both halves of the topology and swap the snapshot.
    pub fn refresh(&self) {
        let old = self.inner.load();
        let (domains, frontends) = self.load_domain_map();
        let ports = self.load_ports();
        let fresh = Topology {
            domains,
            frontends,
            ports,
            version: old.version + 1,
        };
        info!(
            version = fresh.version,
            domains = fresh.domains.len(),
            port_entries = fresh.ports.len(),
            "topology refreshed"
        );
        self.inner.store(Arc::new(fresh));
    }

    /// Replace the snapshot wholesale. Used by tests to pin a topology.
    pub fn install(&self, mut topology: Topology) {
        topology.version = self.inner.load().version + 1;
        self.inner.store(Arc::new(topology));
    }

    fn load_domain_map(&self) -> (HashMap<String, ServiceMap>, HashMap<String, String>) {
        if self.domain_map_path.is_empty() {
            return (HashMap::new(), HashMap::new());
        }
        let raw = match std::fs::read_to_string(&self.domain_map_path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.domain_map_path, error = %e, "domain map unreadable, keeping empty map");
                return (HashMap::new(), HashMap::new());
            }
        };
        let domains: HashMap<String, ServiceMap> = match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.domain_map_path, error = %e, "domain map unparsable, keeping empty map");
                return (HashMap::new(), HashMap::new());
            }
        };
        let frontends = domains
            .iter()
            .filter(|(_, sm)| !sm.frontend.is_empty())
            .map(|(domain, sm)| (sm.frontend.clone(), domain.clone()))
            .collect();
        (domains, frontends)
    }

    fn load_ports(&self) -> HashMap<String, Vec<u16>> {
        let records = match self.registry.load() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "app registry load failed, keeping empty port map");
                return HashMap::new();
            }
        };
        let mut ports = HashMap::new();
        for record in records {
            debug!(app = %record.name, domain = %record.domain, ports = ?record.ports, "registry app");
            if !record.domain.is_empty() && !record.ports.is_empty() {
                ports.insert(record.domain, record.ports);
            }
        }
        ports
    }

    /// Periodic refresh task. The first run waits the cadence plus a random
    /// jitter; early requests resolve against the snapshot built at startup.
    pub fn start_syncer(self: &Arc<Self>, cadence: Duration) {
        if cadence.is_zero() {
            return;
        }
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..5_000));
            tokio::time::sleep(jitter).await;
            let mut ticker = tokio::time::interval(cadence);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handle.refresh();
            }
        });
    }
}
