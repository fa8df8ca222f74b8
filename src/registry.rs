//! Domain to balancer mapping shared by the proxy and the synchronizer.
//!
//! Reads load the current map through `ArcSwap` and never wait on a lock.
//! Writers serialize on `mutation`, build a new map holding the new
//! balancer snapshot and publish it with a single store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use service_tags::{RouteTags, domain_tag};
use thiserror::Error;

use crate::balancer::{Balancer, BalancerError};
use crate::directory::ServiceRegistration;
use crate::upstream::Upstream;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no upstreams for host '{0}'")]
    UnknownDomain(String),

    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

impl RouteError {
    /// HTTP status returned to the client.
    pub fn status(&self) -> u16 {
        match self {
            RouteError::UnknownDomain(_) | RouteError::Balancer(BalancerError::Empty) => 404,
            RouteError::Balancer(BalancerError::Entropy(_)) => 500,
        }
    }
}

type Domains = HashMap<String, Balancer>;

/// `host` without a trailing `:port`. IPv6 literals keep their brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Every routed domain and its current balancer.
///
/// A domain is present only while its balancer has upstreams.
#[derive(Default)]
pub struct DomainRegistry {
    domains: ArcSwap<Domains>,
    mutation: Mutex<()>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balancer currently installed for `domain`.
    pub fn get(&self, domain: &str) -> Option<Balancer> {
        self.domains.load().get(domain).cloned()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.load().contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.domains.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.load().is_empty()
    }

    /// Sorted list of routed domains.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.load().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Domain key serving `host`.
    ///
    /// The exact value wins; otherwise the value without its `:port`
    /// suffix is tried. Returns `host` unchanged when neither is routed.
    pub fn match_host<'a>(&self, host: &'a str) -> &'a str {
        let domains = self.domains.load();
        if domains.contains_key(host) {
            return host;
        }
        let bare = strip_port(host);
        if bare != host && domains.contains_key(bare) {
            return bare;
        }
        host
    }

    /// Select the upstream that should serve a request for `host`.
    pub fn route(&self, host: &str) -> Result<Arc<Upstream>, RouteError> {
        let balancer = self
            .get(host)
            .ok_or_else(|| RouteError::UnknownDomain(host.to_string()))?;
        Ok(balancer.select()?)
    }

    /// Include a registered instance in its domain's balancer.
    ///
    /// Services without a domain tag are ignored.
    pub fn add(&self, service: &ServiceRegistration) {
        let route = RouteTags::parse(&service.tags);
        let Some(domain) = route.domain.clone() else {
            return;
        };

        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.domains.load_full();
        let balancer = match current.get(&domain) {
            Some(balancer) => balancer.clone(),
            None => {
                log::info!(
                    "service.add domain={} service={} ns={}",
                    domain,
                    service.service_name,
                    service.namespace
                );
                Balancer::Empty
            }
        };

        let next = balancer.add(Upstream::with_route(service, route));
        if next.same_snapshot(&balancer) {
            return;
        }

        let mut domains = Domains::clone(&current);
        domains.insert(domain, next);
        self.domains.store(Arc::new(domains));
    }

    /// Remove a deregistered instance, dropping the domain once empty.
    pub fn del(&self, service: &ServiceRegistration) {
        let Some(domain) = domain_tag(&service.tags) else {
            return;
        };

        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.domains.load_full();
        let Some(balancer) = current.get(domain) else {
            return;
        };

        let next = balancer.del(&service.id);
        if next.same_snapshot(balancer) {
            return;
        }

        let mut domains = Domains::clone(&current);
        if next.is_empty() {
            log::info!(
                "service.remove domain={} service={} ns={}",
                domain,
                service.service_name,
                service.namespace
            );
            domains.remove(domain);
        } else {
            domains.insert(domain.to_string(), next);
        }
        self.domains.store(Arc::new(domains));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn service(id: &str, tags: &[&str]) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            service_name: "web".to_string(),
            namespace: "default".to_string(),
            job_id: "web".to_string(),
            alloc_id: format!("alloc-{id}"),
            address: "127.0.0.1".to_string(),
            port: 9000,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn unknown_domain_is_not_found() {
        let registry = DomainRegistry::new();
        let err = registry.route("foo.test").unwrap_err();
        assert!(matches!(err, RouteError::UnknownDomain(_)));
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn service_without_domain_tag_is_ignored() {
        let registry = DomainRegistry::new();
        registry.add(&service("s1", &["nimby-weight:3"]));
        assert!(registry.is_empty());

        registry.del(&service("s1", &["nimby-weight:3"]));
        assert!(registry.is_empty());
    }

    #[test]
    fn single_instance_receives_all_traffic() {
        let registry = DomainRegistry::new();
        registry.add(&service("s1", &["nimby-domain:demo.test", "nimby-weight:2"]));

        for _ in 0..20 {
            assert_eq!(registry.route("demo.test").unwrap().id, "s1");
        }

        registry.add(&service("s2", &["nimby-domain:demo.test"]));
        let balancer = registry.get("demo.test").unwrap();
        assert_eq!(balancer.len(), 2);
        assert_eq!(balancer.total_weight(), 3);
    }

    #[test]
    fn domains_are_isolated() {
        let registry = DomainRegistry::new();
        registry.add(&service("a", &["nimby-domain:a.test"]));
        registry.add(&service("b", &["nimby-domain:b.test"]));

        assert_eq!(registry.domains(), vec!["a.test", "b.test"]);
        assert_eq!(registry.route("a.test").unwrap().id, "a");
        assert_eq!(registry.route("b.test").unwrap().id, "b");
    }

    #[test]
    fn re_registration_is_noop() {
        let registry = DomainRegistry::new();
        let s1 = service("s1", &["nimby-domain:demo.test", "nimby-weight:2"]);
        registry.add(&s1);
        let before = registry.get("demo.test").unwrap();

        registry.add(&s1);
        registry.add(&service("s1", &["nimby-domain:demo.test", "nimby-weight:50"]));

        let after = registry.get("demo.test").unwrap();
        assert!(after.same_snapshot(&before));
        assert_eq!(after.len(), 1);
        assert_eq!(after.total_weight(), 2);
    }

    #[test]
    fn last_deregistration_removes_domain() {
        let registry = DomainRegistry::new();
        let s1 = service("s1", &["nimby-domain:demo.test"]);
        let s2 = service("s2", &["nimby-domain:demo.test"]);
        registry.add(&s1);
        registry.add(&s2);

        registry.del(&s1);
        assert!(registry.contains("demo.test"));
        assert_eq!(registry.route("demo.test").unwrap().id, "s2");

        registry.del(&s2);
        assert!(!registry.contains("demo.test"));
        assert_eq!(registry.route("demo.test").unwrap_err().status(), 404);
    }

    #[test]
    fn deregistering_unknown_id_changes_nothing() {
        let registry = DomainRegistry::new();
        registry.add(&service("s1", &["nimby-domain:demo.test"]));
        let before = registry.get("demo.test").unwrap();

        registry.del(&service("ghost", &["nimby-domain:demo.test"]));
        registry.del(&service("ghost", &["nimby-domain:other.test"]));

        assert!(registry.get("demo.test").unwrap().same_snapshot(&before));
        assert_eq!(registry.domains(), vec!["demo.test"]);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let registry = DomainRegistry::new();
        let s1 = service("s1", &["nimby-domain:demo.test"]);
        registry.add(&s1);

        let held = registry.get("demo.test").unwrap();
        registry.del(&s1);

        assert!(!registry.contains("demo.test"));
        assert_eq!(held.select().unwrap().id, "s1");
    }

    #[test]
    fn concurrent_mutation_and_dispatch() {
        let registry = Arc::new(DomainRegistry::new());
        registry.add(&service("anchor", &["nimby-domain:demo.test"]));
        let mut handles = vec![];

        for w in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let s = service(&format!("w{w}-{i}"), &["nimby-domain:demo.test"]);
                    registry.add(&s);
                    registry.del(&s);
                }
            }));
        }

        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let balancer = registry.get("demo.test").unwrap();
                    assert!(balancer.contains("anchor"));
                    registry.route("demo.test").unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let balancer = registry.get("demo.test").unwrap();
        assert_eq!(balancer.len(), 1);
        assert_eq!(balancer.total_weight(), 1);
    }

    #[test]
    fn strip_port_only_removes_numeric_suffix() {
        assert_eq!(strip_port("demo.test:8080"), "demo.test");
        assert_eq!(strip_port("demo.test"), "demo.test");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("demo.test:"), "demo.test:");
        assert_eq!(strip_port("demo.test:http"), "demo.test:http");
    }

    #[test]
    fn host_with_port_matches_domain_tagged_with_port() {
        let registry = DomainRegistry::new();
        registry.add(&service("a", &["nimby-domain:demo.test:8080"]));

        assert_eq!(registry.match_host("demo.test:8080"), "demo.test:8080");
        assert_eq!(registry.route("demo.test:8080").unwrap().id, "a");
        // nothing is registered under the bare name
        assert_eq!(registry.match_host("demo.test"), "demo.test");
        assert!(registry.route("demo.test").is_err());
    }

    #[test]
    fn host_with_port_falls_back_to_bare_domain() {
        let registry = DomainRegistry::new();
        registry.add(&service("a", &["nimby-domain:demo.test"]));

        assert_eq!(registry.match_host("demo.test:8443"), "demo.test");
        assert_eq!(registry.match_host("demo.test"), "demo.test");
        assert_eq!(registry.match_host("other.test:80"), "other.test:80");
    }

    #[test]
    fn exact_host_wins_over_bare_domain() {
        let registry = DomainRegistry::new();
        registry.add(&service("bare", &["nimby-domain:demo.test"]));
        registry.add(&service("ported", &["nimby-domain:demo.test:8080"]));

        let host = registry.match_host("demo.test:8080");
        assert_eq!(host, "demo.test:8080");
        assert_eq!(registry.route(host).unwrap().id, "ported");

        let host = registry.match_host("demo.test:9090");
        assert_eq!(host, "demo.test");
        assert_eq!(registry.route(host).unwrap().id, "bare");
    }
}
