//! Hostname matching against registered domains
//!
//! A hostname belongs to a registered domain when it is that domain or
//! one of its subdomains. There is no public-suffix awareness: a
//! registered `co.uk` matches every `*.co.uk` host.
//!
//! # Examples
//!
//! ```
//! use tb_core::domain::matches;
//!
//! assert!(matches("www.example.com", "example.com"));
//! assert!(!matches("notexample.com", "example.com"));
//! ```

use crate::error::{Error, Result};
use crate::url::{extract_host, extract_scheme};

// =============================================================================
// Matching
// =============================================================================

/// True iff `hostname` is `registered` or a subdomain of it.
///
/// Both inputs must already be lowercase. An empty `registered` never
/// matches.
#[inline]
pub fn matches(hostname: &str, registered: &str) -> bool {
    if registered.is_empty() || hostname.len() < registered.len() {
        return false;
    }
    if hostname.len() == registered.len() {
        return hostname == registered;
    }
    let boundary = hostname.len() - registered.len() - 1;
    hostname.ends_with(registered) && hostname.as_bytes()[boundary] == b'.'
}

/// Get the parent domain (strip leftmost label).
pub fn get_parent_domain(host: &str) -> Option<&str> {
    match host.find('.') {
        Some(idx) if idx < host.len() - 1 => Some(&host[idx + 1..]),
        _ => None,
    }
}

/// Iterator for suffix-walking a host from full host to last label.
pub struct HostSuffixIter<'a> {
    current: Option<&'a str>,
}

impl<'a> Iterator for HostSuffixIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.current?;
        self.current = get_parent_domain(result);
        Some(result)
    }
}

/// Walk host suffixes from most specific to least specific.
///
/// Every suffix yielded is a domain the host [`matches`], and every domain
/// the host matches is yielded, longest first.
pub fn walk_host_suffixes(host: &str) -> HostSuffixIter<'_> {
    HostSuffixIter {
        current: (!host.is_empty()).then_some(host),
    }
}

/// Longest registered domain that `hostname` matches.
///
/// Overlapping registrations (`example.com` and `news.example.com`) resolve
/// to the most specific one, independent of registration order.
pub fn best_match<F>(hostname: &str, mut is_registered: F) -> Option<&str>
where
    F: FnMut(&str) -> bool,
{
    walk_host_suffixes(hostname).find(|suffix| is_registered(suffix))
}

// =============================================================================
// Input Normalization
// =============================================================================

/// Normalize what a user typed into the popup into a registrable domain.
///
/// Accepts bare domains and web URLs. Strips the scheme, a leading `www.`
/// and a trailing `/`, then requires `[a-z0-9.-]+` followed by a dot and at
/// least two letters.
pub fn normalize_domain_input(input: &str) -> Result<String> {
    let lowered = input.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return Err(invalid(input, "empty input"));
    }

    let mut site = lowered.as_str();
    if extract_scheme(site).is_some() {
        site = extract_host(site).unwrap_or("");
    }
    site = site.strip_prefix("www.").unwrap_or(site);
    site = site.strip_suffix('/').unwrap_or(site);

    if !is_valid_domain(site) {
        return Err(invalid(input, "not a domain name"));
    }
    Ok(site.to_string())
}

fn is_valid_domain(site: &str) -> bool {
    let Some(dot) = site.rfind('.') else {
        return false;
    };
    let (head, tld) = (&site[..dot], &site[dot + 1..]);

    !head.is_empty()
        && head
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
        && tld.len() >= 2
        && tld.bytes().all(|b| b.is_ascii_lowercase())
}

fn invalid(input: &str, reason: &'static str) -> Error {
    Error::InvalidDomainInput {
        input: input.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_matches_exact_and_subdomain() {
        assert!(matches("example.com", "example.com"));
        assert!(matches("www.example.com", "example.com"));
        assert!(matches("a.b.example.com", "example.com"));
    }

    #[test]
    fn test_matches_rejects_suffix_without_dot() {
        assert!(!matches("notexample.com", "example.com"));
        assert!(!matches("example.com", "www.example.com"));
        assert!(!matches("example.org", "example.com"));
    }

    #[test]
    fn test_matches_empty_registered_never_matches() {
        assert!(!matches("example.com", ""));
        assert!(!matches("", ""));
    }

    #[test]
    fn test_matches_public_suffix_is_not_special() {
        assert!(matches("shop.example.co.uk", "co.uk"));
    }

    #[test]
    fn test_matches_agrees_with_definition() {
        let hosts = ["example.com", "www.example.com", "xexample.com", "com", "", "a.b.c"];
        let domains = ["example.com", "com", "b.c", "c", "x"];
        for host in hosts {
            for domain in domains {
                let expected = host == domain || host.ends_with(&format!(".{domain}"));
                assert_eq!(matches(host, domain), expected, "{host} vs {domain}");
            }
        }
    }

    #[test]
    fn test_get_parent_domain() {
        assert_eq!(get_parent_domain("sub.example.com"), Some("example.com"));
        assert_eq!(get_parent_domain("example.com"), Some("com"));
        assert_eq!(get_parent_domain("com"), None);
        assert_eq!(get_parent_domain(""), None);
    }

    #[test]
    fn test_walk_host_suffixes() {
        let suffixes: Vec<&str> = walk_host_suffixes("a.example.com").collect();
        assert_eq!(suffixes, vec!["a.example.com", "example.com", "com"]);
        assert_eq!(walk_host_suffixes("").count(), 0);
    }

    #[test]
    fn test_best_match_prefers_longest() {
        let registered: HashSet<&str> = ["example.com", "news.example.com"].into_iter().collect();
        assert_eq!(
            best_match("live.news.example.com", |d| registered.contains(d)),
            Some("news.example.com")
        );
        assert_eq!(
            best_match("www.example.com", |d| registered.contains(d)),
            Some("example.com")
        );
        assert_eq!(best_match("example.org", |d| registered.contains(d)), None);
    }

    #[test]
    fn test_best_match_consistent_with_matches() {
        let registered = ["example.com", "news.example.com", "com", "other.net"];
        let set: HashSet<&str> = registered.into_iter().collect();
        for host in ["news.example.com", "a.example.com", "other.net", "x.org"] {
            let longest = registered
                .iter()
                .filter(|d| matches(host, d))
                .max_by_key(|d| d.len())
                .copied();
            assert_eq!(best_match(host, |d| set.contains(d)), longest, "{host}");
        }
    }

    #[test]
    fn test_normalize_domain_input() {
        assert_eq!(normalize_domain_input("Example.com").unwrap(), "example.com");
        assert_eq!(normalize_domain_input("  https://www.example.com/ ").unwrap(), "example.com");
        assert_eq!(normalize_domain_input("http://news.example.com").unwrap(), "news.example.com");
        assert_eq!(normalize_domain_input("https://example.com/path?q=1").unwrap(), "example.com");
        assert_eq!(normalize_domain_input("example.com/").unwrap(), "example.com");
    }

    #[test]
    fn test_normalize_domain_input_rejects() {
        for bad in ["", "   ", "localhost", "example.c", "exa mple.com", "example.com/path", "example.123", "ex_ample.com"] {
            let err = normalize_domain_input(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidDomainInput { .. }), "{bad}");
        }
    }
}
