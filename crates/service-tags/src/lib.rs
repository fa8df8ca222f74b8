//! Routing metadata carried in service registration tags.
//!
//! Service instances opt into ingress routing by tagging themselves with
//! `key:value` strings:
//!
//! | Tag                    | Meaning                       | Default                 |
//! |------------------------|-------------------------------|-------------------------|
//! | `nimby-domain:<name>`  | Host value this instance serves | absent: not routed    |
//! | `nimby-weight:<1-255>` | Relative selection weight     | `1`                     |
//! | `nimby-proto:<scheme>` | Upstream URL scheme           | `http`                  |
//! | `nimby-path:<path>`    | Upstream URL path             | `/`                     |
//!
//! Prefixes are case-sensitive. The first tag of each kind wins and later
//! duplicates are ignored. Unknown tags are ignored.
//!
//! # Example
//!
//! ```rust
//! use service_tags::RouteTags;
//!
//! let tags = ["nimby-domain:demo.test", "nimby-weight:2", "http"];
//! let route = RouteTags::parse(&tags);
//!
//! assert_eq!(route.domain.as_deref(), Some("demo.test"));
//! assert_eq!(route.weight, 2);
//! assert_eq!(route.scheme, "http");
//! assert_eq!(route.path, "/");
//! ```

mod error;
mod parse;
mod route;

pub use error::{Result, TagError};
pub use parse::{
    DEFAULT_PATH, DEFAULT_SCHEME, DEFAULT_WEIGHT, DOMAIN_TAG_PREFIX, PATH_TAG_PREFIX,
    PROTO_TAG_PREFIX, WEIGHT_TAG_PREFIX, domain_tag, parse_weight, path_tag, proto_tag,
    weight_tag,
};
pub use route::RouteTags;
