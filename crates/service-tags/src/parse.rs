//! Extraction of individual routing values from a tag list.

use crate::error::{Result, TagError};

pub const DOMAIN_TAG_PREFIX: &str = "nimby-domain:";
pub const WEIGHT_TAG_PREFIX: &str = "nimby-weight:";
pub const PROTO_TAG_PREFIX: &str = "nimby-proto:";
pub const PATH_TAG_PREFIX: &str = "nimby-path:";

pub const DEFAULT_WEIGHT: u64 = 1;
pub const DEFAULT_SCHEME: &str = "http";
pub const DEFAULT_PATH: &str = "/";

/// Value of the first tag starting with `prefix`, if any.
///
/// An empty value counts as absent.
fn first_value<'a, S: AsRef<str>>(tags: &'a [S], prefix: &str) -> Option<&'a str> {
    tags.iter()
        .find_map(|tag| tag.as_ref().strip_prefix(prefix))
        .filter(|value| !value.is_empty())
}

/// Domain (HTTP host) served by the tagged instance.
pub fn domain_tag<S: AsRef<str>>(tags: &[S]) -> Option<&str> {
    first_value(tags, DOMAIN_TAG_PREFIX)
}

/// Upstream URL scheme override.
pub fn proto_tag<S: AsRef<str>>(tags: &[S]) -> Option<&str> {
    first_value(tags, PROTO_TAG_PREFIX)
}

/// Upstream URL path override.
pub fn path_tag<S: AsRef<str>>(tags: &[S]) -> Option<&str> {
    first_value(tags, PATH_TAG_PREFIX)
}

/// Parse a weight value in the range 1..=255.
pub fn parse_weight(value: &str) -> Result<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TagError::InvalidWeight(value.to_string()));
    }

    let weight: u64 = value
        .parse()
        .map_err(|_| TagError::InvalidWeight(value.to_string()))?;

    match weight {
        1..=255 => Ok(weight),
        _ => Err(TagError::WeightOutOfRange(weight)),
    }
}

/// Selection weight of the tagged instance.
///
/// Only the first weight tag is considered. Missing, malformed, zero or
/// out-of-range values resolve to [`DEFAULT_WEIGHT`].
pub fn weight_tag<S: AsRef<str>>(tags: &[S]) -> u64 {
    tags.iter()
        .find_map(|tag| tag.as_ref().strip_prefix(WEIGHT_TAG_PREFIX))
        .and_then(|value| parse_weight(value).ok())
        .unwrap_or(DEFAULT_WEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_tag_first_wins() {
        let tags = ["other", "nimby-domain:a.test", "nimby-domain:b.test"];
        assert_eq!(domain_tag(&tags), Some("a.test"));
    }

    #[test]
    fn test_domain_tag_missing() {
        let tags = ["nimby-weight:3", "urlprefix-/"];
        assert_eq!(domain_tag(&tags), None);
        assert_eq!(domain_tag::<&str>(&[]), None);
    }

    #[test]
    fn test_domain_tag_empty_value_is_absent() {
        assert_eq!(domain_tag(&["nimby-domain:"]), None);
    }

    #[test]
    fn test_prefixes_are_case_sensitive() {
        assert_eq!(domain_tag(&["Nimby-Domain:a.test"]), None);
        assert_eq!(weight_tag(&["NIMBY-WEIGHT:9"]), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_weight_tag_valid() {
        assert_eq!(weight_tag(&["nimby-weight:1"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:42"]), 42);
        assert_eq!(weight_tag(&["nimby-weight:255"]), 255);
    }

    #[test]
    fn test_weight_tag_defaults() {
        assert_eq!(weight_tag(&["nimby-weight:0"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:-1"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:256"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:+4"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:heavy"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:"]), 1);
        assert_eq!(weight_tag::<&str>(&[]), 1);
    }

    #[test]
    fn test_weight_tag_ignores_later_duplicates() {
        // The first weight tag decides even when it is invalid.
        assert_eq!(weight_tag(&["nimby-weight:0", "nimby-weight:7"]), 1);
        assert_eq!(weight_tag(&["nimby-weight:3", "nimby-weight:7"]), 3);
    }

    #[test]
    fn test_parse_weight_errors() {
        assert_eq!(
            parse_weight("abc"),
            Err(TagError::InvalidWeight("abc".to_string()))
        );
        assert_eq!(parse_weight("0"), Err(TagError::WeightOutOfRange(0)));
        assert_eq!(parse_weight("1000"), Err(TagError::WeightOutOfRange(1000)));
        assert!(matches!(
            parse_weight("99999999999999999999999"),
            Err(TagError::InvalidWeight(_))
        ));
    }

    #[test]
    fn test_proto_and_path_tags() {
        let tags = vec![
            "nimby-proto:https".to_string(),
            "nimby-path:/api".to_string(),
        ];
        assert_eq!(proto_tag(&tags), Some("https"));
        assert_eq!(path_tag(&tags), Some("/api"));
        assert_eq!(proto_tag(&["nimby-path:/x"]), None);
    }
}
