//! Weighted random selection over the upstreams of one domain.
//!
//! A [`WeightedRandom`] snapshot is never mutated. `add` and `del` build a
//! new snapshot, so a reader holding an old one keeps a consistent (if
//! stale) view. Selection draws from a table in which every upstream
//! appears `weight` times, giving O(1) picks at O(total weight) memory.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::upstream::Upstream;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("balancer has no upstreams")]
    Empty,

    #[error("failed to read random source: {0}")]
    Entropy(#[from] rand::Error),
}

/// Immutable, non-empty set of upstreams plus its selection table.
#[derive(Debug)]
pub struct WeightedRandom {
    upstreams: BTreeMap<String, Arc<Upstream>>,
    total: u64,
    table: Vec<Arc<Upstream>>,
}

impl WeightedRandom {
    /// Build a snapshot from a non-empty upstream map.
    fn rehash(upstreams: BTreeMap<String, Arc<Upstream>>) -> Self {
        let total = upstreams.values().map(|u| u.weight).sum();
        let mut table = Vec::with_capacity(total as usize);
        for upstream in upstreams.values() {
            for _ in 0..upstream.weight {
                table.push(Arc::clone(upstream));
            }
        }

        log::info!(
            "balancer.rehash count={} weight={}",
            upstreams.len(),
            total
        );

        WeightedRandom {
            upstreams,
            total,
            table,
        }
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.upstreams.contains_key(id)
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.values()
    }

    /// The flattened selection table.
    pub fn table(&self) -> &[Arc<Upstream>] {
        &self.table
    }

    /// Pick an upstream using 8 big-endian bytes drawn from `rng`.
    pub fn select_with<R: RngCore + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Arc<Upstream>, BalancerError> {
        let mut buf = [0u8; 8];
        rng.try_fill_bytes(&mut buf)?;
        let index = u64::from_be_bytes(buf) % self.total;
        Ok(Arc::clone(&self.table[index as usize]))
    }
}

/// Balancer state for one domain: either empty or a weighted snapshot.
#[derive(Clone, Debug, Default)]
pub enum Balancer {
    #[default]
    Empty,
    Weighted(Arc<WeightedRandom>),
}

impl Balancer {
    pub fn is_empty(&self) -> bool {
        matches!(self, Balancer::Empty)
    }

    pub fn len(&self) -> usize {
        match self {
            Balancer::Empty => 0,
            Balancer::Weighted(weighted) => weighted.len(),
        }
    }

    pub fn total_weight(&self) -> u64 {
        match self {
            Balancer::Empty => 0,
            Balancer::Weighted(weighted) => weighted.total_weight(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        match self {
            Balancer::Empty => false,
            Balancer::Weighted(weighted) => weighted.contains(id),
        }
    }

    /// Whether both values are the same snapshot.
    pub fn same_snapshot(&self, other: &Balancer) -> bool {
        match (self, other) {
            (Balancer::Empty, Balancer::Empty) => true,
            (Balancer::Weighted(a), Balancer::Weighted(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Balancer with `upstream` included.
    ///
    /// An id that is already present leaves the balancer unchanged, even
    /// when the new upstream carries a different weight.
    pub fn add(&self, upstream: Upstream) -> Balancer {
        let mut upstreams = match self {
            Balancer::Empty => BTreeMap::new(),
            Balancer::Weighted(weighted) => {
                if weighted.contains(&upstream.id) {
                    return self.clone();
                }
                weighted.upstreams.clone()
            }
        };

        log::info!(
            "upstream.add id={} endpoint={} weight={}",
            upstream.id,
            upstream.endpoint,
            upstream.weight
        );
        upstreams.insert(upstream.id.clone(), Arc::new(upstream));
        Balancer::Weighted(Arc::new(WeightedRandom::rehash(upstreams)))
    }

    /// Balancer without the upstream `id`; `Empty` once nothing is left.
    pub fn del(&self, id: &str) -> Balancer {
        let Balancer::Weighted(weighted) = self else {
            return Balancer::Empty;
        };
        if !weighted.contains(id) {
            return self.clone();
        }

        let mut upstreams = weighted.upstreams.clone();
        if let Some(removed) = upstreams.remove(id) {
            log::info!(
                "upstream.del id={} endpoint={} weight={}",
                removed.id,
                removed.endpoint,
                removed.weight
            );
        }

        if upstreams.is_empty() {
            return Balancer::Empty;
        }
        Balancer::Weighted(Arc::new(WeightedRandom::rehash(upstreams)))
    }

    /// Pick an upstream from the operating system's random source.
    pub fn select(&self) -> Result<Arc<Upstream>, BalancerError> {
        self.select_with(&mut OsRng)
    }

    pub fn select_with<R: RngCore + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Arc<Upstream>, BalancerError> {
        match self {
            Balancer::Empty => Err(BalancerError::Empty),
            Balancer::Weighted(weighted) => weighted.select_with(rng),
        }
    }
}
