use kube::ResourceExt;

use super::{ResourceKey, RouteRefKey};
use crate::{
    apis::{
        routes::{BackendRef, ParentReference},
        CONFIG_MAP_KIND, CORE_API_GROUP, FLOMESH_MCS_API_GROUP, GATEWAY_API_GROUP, GATEWAY_KIND, GRPC_ROUTE_KIND, HTTP_ROUTE_KIND,
        SECRET_KIND, SERVICE_IMPORT_KIND, SERVICE_KIND,
    },
    cache::{CacheError, CacheInner, TARGET_KIND_INDEX},
};

/// Referring side of a cross-namespace reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceFrom<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
}

/// Referred side of a cross-namespace reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceTo<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

pub fn is_ref_to_gateway(parent_ref: &ParentReference, route_namespace: &str, gateway: &ResourceKey) -> bool {
    let key = RouteRefKey::from_parent_ref(parent_ref, route_namespace);
    key.is_gateway() && key.resource_key.namespace == gateway.namespace && key.resource_key.name == gateway.name
}

fn group_or_core(group: Option<&str>) -> &str {
    group.unwrap_or(CORE_API_GROUP)
}

pub fn is_valid_backend_ref_to_service(backend_ref: &BackendRef) -> bool {
    let group = group_or_core(backend_ref.group.as_deref());
    let kind = backend_ref.kind.as_deref().unwrap_or(SERVICE_KIND);
    let known_kind = (group == CORE_API_GROUP && kind == SERVICE_KIND) || (group == FLOMESH_MCS_API_GROUP && kind == SERVICE_IMPORT_KIND);
    known_kind && backend_ref.port.is_some()
}

pub fn is_valid_ref_to_secret(group: Option<&str>, kind: Option<&str>) -> bool {
    group_or_core(group) == CORE_API_GROUP && kind.unwrap_or(SECRET_KIND) == SECRET_KIND
}

pub fn is_valid_ref_to_ca(group: Option<&str>, kind: Option<&str>) -> bool {
    group_or_core(group) == CORE_API_GROUP && matches!(kind.unwrap_or(SECRET_KIND), SECRET_KIND | CONFIG_MAP_KIND)
}

/// Same namespace, or some ReferenceGrant in the target namespace allows the pair.
pub fn valid_cross_namespace_ref(cache: &CacheInner, from: &ReferenceFrom, to: &ReferenceTo) -> Result<bool, CacheError> {
    if from.namespace == to.namespace {
        return Ok(true);
    }
    let grants = cache.reference_grants.list_by_index(TARGET_KIND_INDEX, &format!("{}/{}", to.group, to.kind))?;
    Ok(grants.iter().filter(|grant| grant.namespace().as_deref() == Some(to.namespace)).any(|grant| {
        let from_allowed = grant.spec.from.iter().any(|f| f.group == from.group && f.kind == from.kind && f.namespace == from.namespace);
        let to_allowed =
            grant.spec.to.iter().any(|t| t.group == to.group && t.kind == to.kind && t.name.as_deref().is_none_or(|name| name.is_empty() || name == to.name));
        from_allowed && to_allowed
    }))
}

/// Policy targets the engine knows how to resolve.
pub fn is_target_ref_to_known_kind(group: &str, kind: &str) -> bool {
    matches!(
        (group, kind),
        (GATEWAY_API_GROUP, GATEWAY_KIND | HTTP_ROUTE_KIND | GRPC_ROUTE_KIND) | (CORE_API_GROUP, SERVICE_KIND) | (FLOMESH_MCS_API_GROUP, SERVICE_IMPORT_KIND)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::ResourceCache, common::test::reference_grant};

    const ROUTE_FROM: ReferenceFrom = ReferenceFrom { group: GATEWAY_API_GROUP, kind: HTTP_ROUTE_KIND, namespace: "apps" };

    fn service_in(namespace: &str) -> ReferenceTo<'_> {
        ReferenceTo { group: CORE_API_GROUP, kind: SERVICE_KIND, namespace, name: "svc" }
    }

    #[test]
    fn backend_ref_needs_known_kind_and_port() {
        let mut backend_ref = BackendRef { name: "svc".to_owned(), port: Some(80), ..Default::default() };
        assert!(is_valid_backend_ref_to_service(&backend_ref));
        backend_ref.port = None;
        assert!(!is_valid_backend_ref_to_service(&backend_ref));
        backend_ref.port = Some(80);
        backend_ref.kind = Some("ServiceImport".to_owned());
        assert!(!is_valid_backend_ref_to_service(&backend_ref));
        backend_ref.group = Some("flomesh.io".to_owned());
        assert!(is_valid_backend_ref_to_service(&backend_ref));
    }

    #[test]
    fn ca_refs_accept_configmaps_but_secrets_do_not() {
        assert!(is_valid_ref_to_ca(None, Some("ConfigMap")));
        assert!(!is_valid_ref_to_secret(None, Some("ConfigMap")));
        assert!(is_valid_ref_to_secret(Some(""), None));
    }

    #[test]
    fn cross_namespace_requires_grant_in_target_namespace() {
        let cache = ResourceCache::new();
        assert!(valid_cross_namespace_ref(&cache.snapshot().unwrap(), &ROUTE_FROM, &service_in("apps")).unwrap());
        assert!(!valid_cross_namespace_ref(&cache.snapshot().unwrap(), &ROUTE_FROM, &service_in("backends")).unwrap());

        cache.insert(reference_grant("grant", "other", "HTTPRoute", "apps", "Service", None)).unwrap();
        assert!(!valid_cross_namespace_ref(&cache.snapshot().unwrap(), &ROUTE_FROM, &service_in("backends")).unwrap());

        cache.insert(reference_grant("grant", "backends", "HTTPRoute", "apps", "Service", Some("other"))).unwrap();
        assert!(!valid_cross_namespace_ref(&cache.snapshot().unwrap(), &ROUTE_FROM, &service_in("backends")).unwrap());

        cache.insert(reference_grant("grant", "backends", "HTTPRoute", "apps", "Service", None)).unwrap();
        assert!(valid_cross_namespace_ref(&cache.snapshot().unwrap(), &ROUTE_FROM, &service_in("backends")).unwrap());
    }
}
