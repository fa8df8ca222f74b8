//! Owned view of every routing tag with defaults applied.

use crate::parse::{DEFAULT_PATH, DEFAULT_SCHEME, domain_tag, path_tag, proto_tag, weight_tag};

/// Routing metadata extracted from one service's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTags {
    /// Host served; `None` excludes the service from routing.
    pub domain: Option<String>,
    /// Selection weight, always in 1..=255.
    pub weight: u64,
    /// Upstream URL scheme.
    pub scheme: String,
    /// Upstream URL path.
    pub path: String,
}

impl RouteTags {
    pub fn parse<S: AsRef<str>>(tags: &[S]) -> Self {
        RouteTags {
            domain: domain_tag(tags).map(str::to_string),
            weight: weight_tag(tags),
            scheme: proto_tag(tags).unwrap_or(DEFAULT_SCHEME).to_string(),
            path: path_tag(tags).unwrap_or(DEFAULT_PATH).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let route = RouteTags::parse(&["nimby-domain:demo.test"]);
        assert_eq!(
            route,
            RouteTags {
                domain: Some("demo.test".to_string()),
                weight: 1,
                scheme: "http".to_string(),
                path: "/".to_string(),
            }
        );
    }

    #[test]
    fn test_overrides() {
        let route = RouteTags::parse(&[
            "nimby-path:/v2/",
            "nimby-domain:api.test",
            "nimby-proto:https",
            "nimby-weight:10",
        ]);
        assert_eq!(route.domain.as_deref(), Some("api.test"));
        assert_eq!(route.weight, 10);
        assert_eq!(route.scheme, "https");
        assert_eq!(route.path, "/v2/");
    }

    #[test]
    fn test_unrouted() {
        let route = RouteTags::parse(&["nimby-weight:5"]);
        assert_eq!(route.domain, None);
        assert_eq!(route.weight, 5);
    }
}
