//! Round-robin backend port selection
//!
//! A balancer instance owns an atomic counter over a fixed port list.
//! Instances are cached by the concatenated port list so an unchanged
//! topology refresh keeps reusing the same counter and round-robin fairness
//! carries across requests. Selection never blocks and, after the instance
//! exists, never allocates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::structure::ShardedMap;

/// Round-robin picker over an ordered port list.
///
/// Duplicate ports are legal and act as round-robin weights.
pub struct RoundRobin {
    ports: Vec<u16>,
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new(ports: Vec<u16>) -> Self {
        Self {
            ports,
            counter: AtomicU64::new(0),
        }
    }

    /// Pick the next port. Single-port lists bypass the counter entirely.
    pub fn pick(&self) -> u16 {
        if self.ports.len() == 1 {
            return self.ports[0];
        }
        // Index-then-increment: a fresh list starts at its first entry.
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize % self.ports.len();
        self.ports[idx]
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

/// Cache of balancer instances keyed by the joined port list.
pub struct BalancerCache {
    cache: ShardedMap<Arc<RoundRobin>>,
}

impl Default for BalancerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancerCache {
    pub fn new() -> Self {
        Self {
            cache: ShardedMap::new(),
        }
    }

    /// Get or create the balancer for a port list. Returns `None` for an
    /// empty list: the topology invariant says every routed domain has at
    /// least one port, so an empty list means the caller resolved a domain
    /// that does not participate in backend routing.
    pub fn balancer(&self, ports: &[u16]) -> Option<Arc<RoundRobin>> {
        if ports.is_empty() {
            return None;
        }
        let key = cache_key(ports);
        Some(
            self.cache
                .get_or_insert_with(&key, || Arc::new(RoundRobin::new(ports.to_vec()))),
        )
    }

    /// Pick one port for the list, going through the shared cached counter.
    pub fn pick(&self, ports: &[u16]) -> Option<u16> {
        self.balancer(ports).map(|b| b.pick())
    }

    pub fn cached_instances(&self) -> usize {
        self.cache.len()
    }
}

fn cache_key(ports: &[u16]) -> String {
    let mut key = String::with_capacity(ports.len() * 6);
    for port in ports {
        key.push_str(&port.to_string());
        key.push('|');
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_round_robin_distribution() {
        let rr = RoundRobin::new(vec![9001, 9002, 9003]);
        let mut counts: HashMap<u16, usize> = HashMap::new();
        let n = 300;
        for _ in 0..n {
            *counts.entry(rr.pick()).or_default() += 1;
        }
        // Over N picks from K ports, every port lands between floor(N/K)
        // and ceil(N/K) times.
        for port in [9001, 9002, 9003] {
            assert_eq!(counts[&port], n / 3, "port {port} unevenly selected");
        }
    }

    #[test]
    fn test_round_robin_sequence() {
        let rr = RoundRobin::new(vec![9001, 9002, 9003]);
        assert_eq!(rr.pick(), 9001);
        assert_eq!(rr.pick(), 9002);
        assert_eq!(rr.pick(), 9003);
        assert_eq!(rr.pick(), 9001);
    }

    #[test]
    fn test_single_port_bypasses_counter() {
        let rr = RoundRobin::new(vec![8080]);
        for _ in 0..10 {
            assert_eq!(rr.pick(), 8080);
        }
        assert_eq!(rr.counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_duplicate_ports_weight_selection() {
        let rr = RoundRobin::new(vec![9001, 9001, 9002]);
        let mut counts: HashMap<u16, usize> = HashMap::new();
        for _ in 0..300 {
            *counts.entry(rr.pick()).or_default() += 1;
        }
        assert_eq!(counts[&9001], 200);
        assert_eq!(counts[&9002], 100);
    }

    #[test]
    fn test_cache_reuses_instance_for_same_list() {
        let cache = BalancerCache::new();
        let a = cache.balancer(&[1, 2, 3]).unwrap();
        let b = cache.balancer(&[1, 2, 3]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.cached_instances(), 1);

        // Fairness is preserved across lookups because the counter is shared.
        assert_eq!(a.pick(), 1);
        assert_eq!(b.pick(), 2);
        assert_eq!(a.pick(), 3);
        assert_eq!(b.pick(), 1);
    }

    #[test]
    fn test_cache_distinguishes_lists() {
        let cache = BalancerCache::new();
        cache.balancer(&[1, 2]).unwrap();
        cache.balancer(&[12]).unwrap();
        // "1|2|" and "12|" must not collide.
        assert_eq!(cache.cached_instances(), 2);
    }

    #[test]
    fn test_empty_list_rejected() {
        let cache = BalancerCache::new();
        assert!(cache.balancer(&[]).is_none());
        assert!(cache.pick(&[]).is_none());
    }
}
