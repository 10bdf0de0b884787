use std::collections::BTreeSet;

use super::resource_key::DEFAULT_ROUTE_HOSTNAME;

fn is_wildcard(hostname: &str) -> bool {
    hostname.starts_with("*.")
}

/// `*.example.com` matches any strict subdomain of `example.com`, at any depth.
fn wildcard_matches(wildcard: &str, hostname: &str) -> bool {
    let suffix = &wildcard[1..];
    hostname.len() > suffix.len() && hostname.ends_with(suffix)
}

/// Intersection of a listener hostname and a route hostname, `None` when they are disjoint.
pub fn intersect(listener_hostname: Option<&str>, route_hostname: &str) -> Option<String> {
    let listener_hostname = match listener_hostname {
        None | Some("" | DEFAULT_ROUTE_HOSTNAME) => return Some(route_hostname.to_owned()),
        Some(hostname) => hostname,
    };
    if route_hostname.is_empty() || route_hostname == DEFAULT_ROUTE_HOSTNAME {
        return Some(listener_hostname.to_owned());
    }

    match (is_wildcard(listener_hostname), is_wildcard(route_hostname)) {
        (false, false) => (listener_hostname == route_hostname).then(|| route_hostname.to_owned()),
        (true, false) => wildcard_matches(listener_hostname, route_hostname).then(|| route_hostname.to_owned()),
        (false, true) => wildcard_matches(route_hostname, listener_hostname).then(|| listener_hostname.to_owned()),
        (true, true) => {
            if listener_hostname == route_hostname || wildcard_matches(listener_hostname, &route_hostname[2..]) {
                Some(route_hostname.to_owned())
            } else if wildcard_matches(route_hostname, &listener_hostname[2..]) {
                Some(listener_hostname.to_owned())
            } else {
                None
            }
        },
    }
}

/// Hostnames a route serves on a listener. A route without hostnames inherits the listener's, or `*`.
pub fn effective_hostnames(listener_hostname: Option<&str>, route_hostnames: &[String]) -> BTreeSet<String> {
    if route_hostnames.is_empty() {
        let hostname = listener_hostname.filter(|h| !h.is_empty()).unwrap_or(DEFAULT_ROUTE_HOSTNAME);
        return BTreeSet::from([hostname.to_owned()]);
    }
    route_hostnames.iter().filter_map(|hostname| intersect(listener_hostname, hostname)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_hostnames_match_only_themselves() {
        assert_eq!(intersect(Some("foo.com"), "foo.com"), Some("foo.com".to_owned()));
        assert_eq!(intersect(Some("foo.com"), "bar.com"), None);
    }

    #[test]
    fn wildcard_matches_strict_subdomains() {
        assert_eq!(intersect(Some("*.foo.com"), "a.foo.com"), Some("a.foo.com".to_owned()));
        assert_eq!(intersect(Some("*.foo.com"), "a.b.foo.com"), Some("a.b.foo.com".to_owned()));
        assert_eq!(intersect(Some("*.foo.com"), "foo.com"), None);
        assert_eq!(intersect(Some("a.foo.com"), "*.foo.com"), Some("a.foo.com".to_owned()));
    }

    #[test]
    fn two_wildcards_intersect_to_more_specific() {
        assert_eq!(intersect(Some("*.foo.com"), "*.a.foo.com"), Some("*.a.foo.com".to_owned()));
        assert_eq!(intersect(Some("*.a.foo.com"), "*.foo.com"), Some("*.a.foo.com".to_owned()));
        assert_eq!(intersect(Some("*.foo.com"), "*.foo.com"), Some("*.foo.com".to_owned()));
        assert_eq!(intersect(Some("*.foo.com"), "*.bar.com"), None);
    }

    #[test]
    fn route_without_hostnames_inherits_listener() {
        assert_eq!(effective_hostnames(Some("foo.com"), &[]), BTreeSet::from(["foo.com".to_owned()]));
        assert_eq!(effective_hostnames(None, &[]), BTreeSet::from(["*".to_owned()]));
    }

    #[test]
    fn disjoint_hostnames_are_dropped() {
        let hostnames = vec!["a.foo.com".to_owned(), "bar.com".to_owned()];
        assert_eq!(effective_hostnames(Some("*.foo.com"), &hostnames), BTreeSet::from(["a.foo.com".to_owned()]));
    }
}
