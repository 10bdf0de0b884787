use std::collections::BTreeSet;

use tracing::debug;

use super::backends::{BackendResolver, UnresolvedRefs};
use crate::{
    apis::routes::{HTTPRouteFilter, HTTPRouteFilterType},
    cache::CacheError,
    common::{ReferenceFrom, ServicePortName},
    model::{BackendRefConfig, FilterConfig, MirrorConfig},
};

/// Copies filters field for field. Mirror targets become Backend references; an unresolved mirror drops its filter.
pub fn lower_filters(
    resolver: &BackendResolver,
    from: &ReferenceFrom,
    filters: &[HTTPRouteFilter],
    services: &mut BTreeSet<ServicePortName>,
    unresolved: &mut UnresolvedRefs,
) -> Result<Vec<FilterConfig>, CacheError> {
    let mut lowered = Vec::with_capacity(filters.len());
    for filter in filters {
        let request_mirror = match filter.request_mirror.as_ref() {
            Some(mirror) => match resolver.resolve(from, &mirror.backend_ref)? {
                Ok(service) => {
                    let backend_ref = BackendRefConfig::new(service.to_string(), 1);
                    services.insert(service);
                    Some(MirrorConfig { backend_ref, percent: mirror.percent })
                },
                Err(error) => {
                    debug!("dropping mirror to {} {error:?}", mirror.backend_ref.name);
                    unresolved.record(error, format!("mirror backend {} {}", mirror.backend_ref.name, error.reason()));
                    continue;
                },
            },
            None if filter.r#type == HTTPRouteFilterType::RequestMirror => continue,
            None => None,
        };
        lowered.push(FilterConfig {
            r#type: filter.r#type,
            request_header_modifier: filter.request_header_modifier.clone(),
            response_header_modifier: filter.response_header_modifier.clone(),
            request_mirror,
            request_redirect: filter.request_redirect.clone(),
            url_rewrite: filter.url_rewrite.clone(),
            extension_ref: filter.extension_ref.clone(),
        });
    }
    Ok(lowered)
}

/// First filter type listed twice that may appear only once. Mirrors and extension references repeat freely.
pub fn duplicate_filter(filters: &[HTTPRouteFilter]) -> Option<HTTPRouteFilterType> {
    filters.iter().enumerate().find_map(|(position, filter)| {
        let repeatable = matches!(filter.r#type, HTTPRouteFilterType::RequestMirror | HTTPRouteFilterType::ExtensionRef);
        (!repeatable && filters[..position].iter().any(|earlier| earlier.r#type == filter.r#type)).then_some(filter.r#type)
    })
}

pub fn has_redirect(filters: &[HTTPRouteFilter]) -> bool {
    filters.iter().any(|filter| filter.r#type == HTTPRouteFilterType::RequestRedirect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apis::{GATEWAY_API_GROUP, HTTP_ROUTE_KIND},
        cache::ResourceCache,
        common::test::service,
    };

    const FROM: ReferenceFrom = ReferenceFrom { group: GATEWAY_API_GROUP, kind: HTTP_ROUTE_KIND, namespace: "gw" };

    fn filters(yaml: &str) -> Vec<HTTPRouteFilter> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn mirror_becomes_backend_reference() {
        let cache = ResourceCache::new();
        cache.insert(service("shadow", "gw", &[("http", 8080, 8080)])).unwrap();
        let snapshot = cache.snapshot().unwrap();
        let resolver = BackendResolver::new(&snapshot, true);
        let mut services = BTreeSet::new();
        let mut unresolved = UnresolvedRefs::default();

        let lowered = lower_filters(
            &resolver,
            &FROM,
            &filters(
                r#"
- type: RequestHeaderModifier
  requestHeaderModifier:
    set: [{name: x-env, value: prod}]
- type: RequestMirror
  requestMirror:
    backendRef: {name: shadow, port: 8080}
    percent: 10
"#,
            ),
            &mut services,
            &mut unresolved,
        )
        .unwrap();

        assert_eq!(lowered.len(), 2);
        assert_eq!(lowered[0].request_header_modifier.as_ref().unwrap().set.as_ref().unwrap()[0].value, "prod");
        let mirror = lowered[1].request_mirror.as_ref().unwrap();
        assert_eq!((mirror.backend_ref.name.as_str(), mirror.percent), ("gw/shadow:8080", Some(10)));
        assert_eq!(services.len(), 1);
        assert!(unresolved.is_resolved());
    }

    #[test]
    fn only_non_repeatable_duplicates_are_reported() {
        let repeated_mirrors = filters(
            r#"
- type: RequestMirror
  requestMirror: {backendRef: {name: a, port: 80}}
- type: RequestMirror
  requestMirror: {backendRef: {name: b, port: 80}}
- type: RequestHeaderModifier
  requestHeaderModifier: {add: [{name: x-a, value: a}]}
"#,
        );
        assert_eq!(duplicate_filter(&repeated_mirrors), None);

        let repeated_rewrites = filters(
            r#"
- type: URLRewrite
  urlRewrite: {hostname: a.example.com}
- type: ResponseHeaderModifier
  responseHeaderModifier: {remove: [x-a]}
- type: URLRewrite
  urlRewrite: {hostname: b.example.com}
"#,
        );
        assert_eq!(duplicate_filter(&repeated_rewrites), Some(HTTPRouteFilterType::URLRewrite));
    }

    #[test]
    fn unresolved_mirror_is_dropped() {
        let snapshot = ResourceCache::new().snapshot().unwrap();
        let resolver = BackendResolver::new(&snapshot, true);
        let mut services = BTreeSet::new();
        let mut unresolved = UnresolvedRefs::default();
        let lowered = lower_filters(
            &resolver,
            &FROM,
            &filters("- type: RequestMirror\n  requestMirror:\n    backendRef: {name: missing, port: 80}\n"),
            &mut services,
            &mut unresolved,
        )
        .unwrap();
        assert!(lowered.is_empty());
        assert!(!unresolved.is_resolved());
    }
}
