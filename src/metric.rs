use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Outcome counters for one domain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub requests: u64,
    pub statuses: HashMap<u16, u64>,
    /// Requests that failed while talking to the upstream.
    pub upstream_errors: u64,
    pub elapsed: Duration,
}

impl DomainStats {
    pub fn count(&self, status: u16) -> u64 {
        self.statuses.get(&status).copied().unwrap_or(0)
    }
}

/// In-memory per-domain request outcomes.
#[derive(Default)]
pub struct Metrics {
    domains: Mutex<HashMap<String, DomainStats>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request.
    pub fn record(&self, domain: &str, status: u16, elapsed: Duration, upstream_error: bool) {
        let mut guard = self.domains.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = guard.entry(domain.to_string()).or_default();
        stats.requests += 1;
        *stats.statuses.entry(status).or_insert(0) += 1;
        stats.elapsed += elapsed;
        if upstream_error {
            stats.upstream_errors += 1;
        }
    }

    /// Snapshot counters for a domain. Unknown domains are all zero.
    pub fn snapshot(&self, domain: &str) -> DomainStats {
        self.domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }
}
