//! The server pool and its selection strategies.
//!
//! The pool owns the per-server circuit breakers:
//! removing a server destroys its breaker
//! in the same critical section,
//! so no counters outlive their endpoint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::info;

use dicomnet_ul::pdu::UserIdentity;

use crate::breaker::CircuitBreaker;

/// Identifier of a server within its pool.
pub type ServerId = u64;

/// Transport security options for a server.
///
/// Only the configuration hook is defined here;
/// wrapping the transport is left to the integration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsOptions {
    /// server name for certificate verification,
    /// defaulting to the host name
    pub server_name: Option<String>,
}

/// A storage destination within the pool.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    pub called_ae_title: String,
    pub priority: i32,
    pub weight: f64,
    pub enabled: bool,
    pub max_pdu_length: u32,
    /// per-operation time budget for this server
    pub timeout: Option<Duration>,
    pub user_identity: Option<UserIdentity>,
    pub tls: Option<TlsOptions>,
}

/// The input for adding a server to a pool.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub called_ae_title: String,
    pub priority: i32,
    pub weight: f64,
    pub enabled: bool,
    pub max_pdu_length: u32,
    pub timeout: Option<Duration>,
    pub user_identity: Option<UserIdentity>,
    pub tls: Option<TlsOptions>,
}

impl ServerSpec {
    /// A plain destination with default negotiation parameters.
    pub fn new(host: impl Into<String>, port: u16, called_ae_title: impl Into<String>) -> Self {
        ServerSpec {
            host: host.into(),
            port,
            called_ae_title: called_ae_title.into(),
            priority: 0,
            weight: 1.0,
            enabled: true,
            max_pdu_length: dicomnet_ul::pdu::DEFAULT_MAX_PDU,
            timeout: None,
            user_identity: None,
            tls: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// How the pool picks the next candidate server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// cyclic order over the enabled servers
    RoundRobin,
    /// highest priority wins, ties broken by insertion order
    #[default]
    Priority,
    /// smooth weighted round robin, deterministic across calls
    WeightedRoundRobin,
    /// uniformly random among the enabled servers
    Random,
    /// random, weighted by the configured weights
    RandomWeighted,
    /// like `Priority`; used where failover is the expectation
    Failover,
}

#[derive(Debug)]
struct ServerSlot {
    entry: ServerEntry,
    current_weight: f64,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Debug)]
struct PoolInner {
    servers: Vec<ServerSlot>,
    round_robin_index: usize,
    next_id: ServerId,
}

/// A pool of storage destinations
/// with per-server circuit breakers.
///
/// All mutable state, including the smooth weighted round robin
/// weights and the breakers, lives behind one mutex.
#[derive(Debug)]
pub struct ServerPool {
    inner: Mutex<PoolInner>,
    strategy: SelectionStrategy,
    breaker_threshold: u32,
    breaker_reset_timeout: Duration,
}

impl ServerPool {
    pub fn new(
        strategy: SelectionStrategy,
        breaker_threshold: u32,
        breaker_reset_timeout: Duration,
    ) -> Self {
        ServerPool {
            inner: Mutex::new(PoolInner {
                servers: Vec::new(),
                round_robin_index: 0,
                next_id: 1,
            }),
            strategy,
            breaker_threshold,
            breaker_reset_timeout,
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Add a server, creating its circuit breaker.
    pub fn add(&self, spec: ServerSpec) -> ServerId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        info!(
            host = %spec.host,
            port = spec.port,
            called_ae_title = %spec.called_ae_title,
            id,
            "adding server to pool"
        );
        inner.servers.push(ServerSlot {
            entry: ServerEntry {
                id,
                host: spec.host,
                port: spec.port,
                called_ae_title: spec.called_ae_title,
                priority: spec.priority,
                // weights must stay positive for the weighted strategies
                weight: if spec.weight > 0.0 { spec.weight } else { 1.0 },
                enabled: spec.enabled,
                max_pdu_length: spec.max_pdu_length,
                timeout: spec.timeout,
                user_identity: spec.user_identity,
                tls: spec.tls,
            },
            current_weight: 0.0,
            breaker: Arc::new(CircuitBreaker::new(
                self.breaker_threshold,
                self.breaker_reset_timeout,
            )),
        });
        id
    }

    /// Remove a server; its circuit breaker goes with it.
    pub fn remove(&self, id: ServerId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.servers.len();
        inner.servers.retain(|slot| slot.entry.id != id);
        inner.servers.len() != before
    }

    /// Enable or disable a server without removing it.
    pub fn set_enabled(&self, id: ServerId, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.servers.iter_mut().find(|slot| slot.entry.id == id) {
            Some(slot) => {
                slot.entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all entries, in insertion order.
    pub fn entries(&self) -> Vec<ServerEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.servers.iter().map(|slot| slot.entry.clone()).collect()
    }

    /// The circuit breaker of the given server, if it is in the pool.
    pub fn breaker(&self, id: ServerId) -> Option<Arc<CircuitBreaker>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .servers
            .iter()
            .find(|slot| slot.entry.id == id)
            .map(|slot| Arc::clone(&slot.breaker))
    }

    /// Number of enabled servers.
    pub fn enabled_len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.servers.iter().filter(|slot| slot.entry.enabled).count()
    }

    /// Pick the next candidate among the enabled servers
    /// not yet excluded,
    /// together with its circuit breaker.
    pub fn select(&self, exclude: &HashSet<ServerId>) -> Option<(ServerEntry, Arc<CircuitBreaker>)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let candidates: Vec<usize> = inner
            .servers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.enabled && !exclude.contains(&slot.entry.id))
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let position = inner.round_robin_index % candidates.len();
                inner.round_robin_index = inner.round_robin_index.wrapping_add(1);
                candidates[position]
            }
            SelectionStrategy::Priority | SelectionStrategy::Failover => candidates
                .iter()
                .copied()
                // ties go to the earliest inserted server
                .max_by_key(|&index| {
                    (inner.servers[index].entry.priority, std::cmp::Reverse(index))
                })
                .unwrap_or(candidates[0]),
            SelectionStrategy::WeightedRoundRobin => {
                let total_weight: f64 = candidates
                    .iter()
                    .map(|&index| inner.servers[index].entry.weight)
                    .sum();
                for &index in &candidates {
                    let slot = &mut inner.servers[index];
                    slot.current_weight += slot.entry.weight;
                }
                let best = candidates
                    .iter()
                    .copied()
                    .max_by(|&a, &b| {
                        inner.servers[a]
                            .current_weight
                            .total_cmp(&inner.servers[b].current_weight)
                    })
                    .unwrap_or(candidates[0]);
                inner.servers[best].current_weight -= total_weight;
                best
            }
            SelectionStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
            SelectionStrategy::RandomWeighted => {
                let total_weight: f64 = candidates
                    .iter()
                    .map(|&index| inner.servers[index].entry.weight)
                    .sum();
                let mut point = rand::thread_rng().gen_range(0.0..total_weight);
                let mut picked = candidates[candidates.len() - 1];
                for &index in &candidates {
                    let weight = inner.servers[index].entry.weight;
                    if point < weight {
                        picked = index;
                        break;
                    }
                    point -= weight;
                }
                picked
            }
        };

        let slot = &inner.servers[chosen];
        Some((slot.entry.clone(), Arc::clone(&slot.breaker)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(strategy: SelectionStrategy, specs: Vec<ServerSpec>) -> ServerPool {
        let pool = ServerPool::new(strategy, 5, Duration::from_secs(30));
        for spec in specs {
            pool.add(spec);
        }
        pool
    }

    fn pick_names(pool: &ServerPool, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| {
                let (entry, _) = pool.select(&HashSet::new()).unwrap();
                entry.called_ae_title
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_deterministically() {
        let pool = pool_with(
            SelectionStrategy::RoundRobin,
            vec![
                ServerSpec::new("a", 104, "A"),
                ServerSpec::new("b", 104, "B"),
                ServerSpec::new("c", 104, "C"),
            ],
        );
        assert_eq!(pick_names(&pool, 6), vec!["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn round_robin_skips_disabled_servers() {
        let pool = ServerPool::new(SelectionStrategy::RoundRobin, 5, Duration::from_secs(30));
        pool.add(ServerSpec::new("a", 104, "A"));
        let b = pool.add(ServerSpec::new("b", 104, "B"));
        pool.add(ServerSpec::new("c", 104, "C"));
        pool.set_enabled(b, false);
        assert_eq!(pool.enabled_len(), 2);
        assert_eq!(pick_names(&pool, 4), vec!["A", "C", "A", "C"]);
    }

    #[test]
    fn priority_prefers_highest_and_then_insertion_order() {
        let pool = pool_with(
            SelectionStrategy::Priority,
            vec![
                ServerSpec::new("a", 104, "A").priority(5),
                ServerSpec::new("b", 104, "B").priority(10),
                ServerSpec::new("c", 104, "C").priority(10),
            ],
        );
        // B wins: highest priority, inserted before C
        let (entry, _) = pool.select(&HashSet::new()).unwrap();
        assert_eq!(entry.called_ae_title, "B");

        // excluding B falls over to C, then to A
        let mut exclude = HashSet::new();
        exclude.insert(entry.id);
        let (entry, _) = pool.select(&exclude).unwrap();
        assert_eq!(entry.called_ae_title, "C");
        exclude.insert(entry.id);
        let (entry, _) = pool.select(&exclude).unwrap();
        assert_eq!(entry.called_ae_title, "A");
        exclude.insert(entry.id);
        assert!(pool.select(&exclude).is_none());
    }

    #[test]
    fn smooth_weighted_round_robin_matches_weights_over_a_window() {
        let pool = pool_with(
            SelectionStrategy::WeightedRoundRobin,
            vec![
                ServerSpec::new("a", 104, "A").weight(5.0),
                ServerSpec::new("b", 104, "B").weight(1.0),
                ServerSpec::new("c", 104, "C").weight(1.0),
            ],
        );

        // over each window of total-weight picks,
        // every server appears exactly weight times
        for _ in 0..3 {
            let window = pick_names(&pool, 7);
            assert_eq!(window.iter().filter(|name| *name == "A").count(), 5);
            assert_eq!(window.iter().filter(|name| *name == "B").count(), 1);
            assert_eq!(window.iter().filter(|name| *name == "C").count(), 1);
        }

        // and the smooth variant spreads the heavy server out
        let window = pick_names(&pool, 7);
        assert_ne!(window[..5], ["A", "A", "A", "A", "A"]);
    }

    #[test]
    fn random_strategies_only_pick_enabled_candidates() {
        let pool = ServerPool::new(SelectionStrategy::Random, 5, Duration::from_secs(30));
        pool.add(ServerSpec::new("a", 104, "A"));
        let b = pool.add(ServerSpec::new("b", 104, "B"));
        pool.set_enabled(b, false);

        for _ in 0..32 {
            let (entry, _) = pool.select(&HashSet::new()).unwrap();
            assert_eq!(entry.called_ae_title, "A");
        }

        let pool = ServerPool::new(
            SelectionStrategy::RandomWeighted,
            5,
            Duration::from_secs(30),
        );
        pool.add(ServerSpec::new("a", 104, "A").weight(3.0));
        pool.add(ServerSpec::new("b", 104, "B").weight(1.0));
        for _ in 0..32 {
            let (entry, _) = pool.select(&HashSet::new()).unwrap();
            assert!(["A", "B"].contains(&entry.called_ae_title.as_str()));
        }
    }

    #[test]
    fn removing_a_server_destroys_its_breaker() {
        let pool = ServerPool::new(SelectionStrategy::Priority, 5, Duration::from_secs(30));
        let id = pool.add(ServerSpec::new("a", 104, "A"));
        let breaker = pool.breaker(id).unwrap();
        breaker.trip();

        assert!(pool.remove(id));
        assert!(pool.breaker(id).is_none());
        assert!(pool.select(&HashSet::new()).is_none());

        // a re-added server starts with a fresh breaker
        let id = pool.add(ServerSpec::new("a", 104, "A"));
        assert!(!pool.breaker(id).unwrap().is_open());
    }
}
