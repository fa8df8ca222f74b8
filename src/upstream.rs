//! A single backend instance and the URL requests are forwarded to.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use pingora::upstreams::peer::HttpPeer;
use service_tags::RouteTags;

use crate::directory::ServiceRegistration;

/// Resolved upstream URL: scheme, host:port and base path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn tls(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("https")
    }

    /// Join the endpoint path with an inbound `path?query`.
    pub fn join(&self, path_and_query: &str) -> String {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let base = self.path.trim_end_matches('/');
        let mut joined = String::with_capacity(base.len() + path_and_query.len() + 1);
        if !base.starts_with('/') {
            joined.push('/');
        }
        joined.push_str(base);

        let rest = path.trim_start_matches('/');
        if !rest.is_empty() || path.ends_with('/') || self.path.ends_with('/') {
            if !joined.ends_with('/') {
                joined.push('/');
            }
            joined.push_str(rest);
        }

        if let Some(query) = query {
            joined.push('?');
            joined.push_str(query);
        }
        joined
    }

    /// Address to connect to. Names are resolved without blocking the
    /// calling worker.
    pub async fn socket_addr(&self) -> io::Result<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.host),
                )
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path)
    }
}

/// One backend instance eligible to serve a domain. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    /// Instance id, unique within its domain.
    pub id: String,
    pub job_id: String,
    pub alloc_id: String,
    pub weight: u64,
    pub endpoint: Endpoint,
}

impl Upstream {
    /// Build from a registration and its parsed routing tags.
    pub fn with_route(service: &ServiceRegistration, route: RouteTags) -> Self {
        Upstream {
            id: service.id.clone(),
            job_id: service.job_id.clone(),
            alloc_id: service.alloc_id.clone(),
            weight: route.weight,
            endpoint: Endpoint {
                scheme: route.scheme,
                host: service.address.clone(),
                port: service.port,
                path: route.path,
            },
        }
    }

    /// Pingora peer for connecting to this instance.
    pub async fn peer(&self) -> io::Result<HttpPeer> {
        let addr = self.endpoint.socket_addr().await?;
        Ok(HttpPeer::new(
            addr,
            self.endpoint.tls(),
            self.endpoint.host.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(path: &str) -> Endpoint {
        Endpoint {
            scheme: "http".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
            path: path.to_string(),
        }
    }

    #[test]
    fn upstream_from_registration_applies_tags() {
        let service = ServiceRegistration {
            id: "web-1".to_string(),
            job_id: "web".to_string(),
            alloc_id: "alloc-1".to_string(),
            address: "10.1.2.3".to_string(),
            port: 31000,
            tags: vec![
                "nimby-domain:demo.test".to_string(),
                "nimby-weight:4".to_string(),
                "nimby-proto:https".to_string(),
                "nimby-path:/app".to_string(),
            ],
            ..Default::default()
        };

        let upstream = Upstream::with_route(&service, RouteTags::parse(&service.tags));
        assert_eq!(upstream.id, "web-1");
        assert_eq!(upstream.job_id, "web");
        assert_eq!(upstream.alloc_id, "alloc-1");
        assert_eq!(upstream.weight, 4);
        assert!(upstream.endpoint.tls());
        assert_eq!(upstream.endpoint.to_string(), "https://10.1.2.3:31000/app");
    }

    #[test]
    fn upstream_defaults() {
        let service = ServiceRegistration {
            id: "web-2".to_string(),
            address: "127.0.0.1".to_string(),
            port: 80,
            ..Default::default()
        };

        let upstream = Upstream::with_route(&service, RouteTags::parse(&service.tags));
        assert_eq!(upstream.weight, 1);
        assert!(!upstream.endpoint.tls());
        assert_eq!(upstream.endpoint.to_string(), "http://127.0.0.1:80/");
    }

    #[tokio::test]
    async fn authority_brackets_ipv6() {
        let mut ep = endpoint("/");
        ep.host = "::1".to_string();
        assert_eq!(ep.authority(), "[::1]:8080");
        assert_eq!(ep.socket_addr().await.unwrap(), "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn join_root_endpoint() {
        let ep = endpoint("/");
        assert_eq!(ep.join("/"), "/");
        assert_eq!(ep.join("/users"), "/users");
        assert_eq!(ep.join("/users/"), "/users/");
        assert_eq!(ep.join("/users?page=2"), "/users?page=2");
    }

    #[test]
    fn join_prefixed_endpoint() {
        assert_eq!(endpoint("/api").join("/"), "/api/");
        assert_eq!(endpoint("/api").join("/users"), "/api/users");
        assert_eq!(endpoint("/api/").join("/users"), "/api/users");
        assert_eq!(endpoint("api").join("/users?x=1"), "/api/users?x=1");
    }

    #[tokio::test]
    async fn socket_addr_for_ip_literal() {
        let ep = endpoint("/");
        assert_eq!(ep.socket_addr().await.unwrap(), "10.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn socket_addr_resolves_names() {
        let mut ep = endpoint("/");
        ep.host = "localhost".to_string();
        let addr = ep.socket_addr().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);

        let upstream = Upstream {
            id: "a".to_string(),
            job_id: "web".to_string(),
            alloc_id: "alloc-a".to_string(),
            weight: 1,
            endpoint: ep,
        };
        assert!(upstream.peer().await.is_ok());
    }

    #[tokio::test]
    async fn socket_addr_unknown_name_is_error() {
        let mut ep = endpoint("/");
        ep.host = "does-not-exist.invalid".to_string();
        assert!(ep.socket_addr().await.is_err());
    }
}
