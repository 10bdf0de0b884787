use std::{collections::BTreeMap, sync::Arc};

use kube::ResourceExt;

use super::{condition_status, is_condition_true, ACCEPTED, ACTIVE, CONFLICTED, PROGRAMMED, RESOLVED_REFS};
use crate::{
    apis::gateway::{Gateway, GatewayClass, Listener, ProtocolType, TlsModeType},
    apis::{GATEWAY_API_GROUP, GRPC_ROUTE_KIND, HTTP_ROUTE_KIND, TCP_ROUTE_KIND, TLS_ROUTE_KIND, UDP_ROUTE_KIND},
    cache::CacheInner,
    common::object_key,
};

fn is_accepted_gateway_class(class: &GatewayClass, controller_name: &str) -> bool {
    let conditions = class.status.as_ref().and_then(|status| status.conditions.as_deref());
    class.spec.controller_name == controller_name && is_condition_true(conditions, ACCEPTED) && is_condition_true(conditions, ACTIVE)
}

/// The one GatewayClass this controller serves: the oldest accepted and active class with a matching controller name.
pub fn effective_gateway_class(cache: &CacheInner, controller_name: &str) -> Option<Arc<GatewayClass>> {
    cache.gateway_classes.list_sorted().into_iter().find(|class| is_accepted_gateway_class(class, controller_name))
}

pub fn is_active_gateway(gateway: &Gateway, effective_class: Option<&GatewayClass>) -> bool {
    let Some(class) = effective_class else {
        return false;
    };
    let conditions = gateway.status.as_ref().and_then(|status| status.conditions.as_deref());
    gateway.spec.gateway_class_name == class.name_any() && is_condition_true(conditions, ACCEPTED) && is_condition_true(conditions, PROGRAMMED)
}

/// Active Gateways keyed by `namespace/name`.
pub fn active_gateways(cache: &CacheInner, controller_name: &str) -> BTreeMap<String, Arc<Gateway>> {
    let effective_class = effective_gateway_class(cache, controller_name);
    cache
        .gateways
        .list()
        .filter(|gateway| is_active_gateway(gateway, effective_class.as_deref()))
        .map(|gateway| (object_key(gateway.as_ref()), Arc::clone(gateway)))
        .collect()
}

/// Listener status says Accepted, Programmed and ResolvedRefs, and not Conflicted.
pub fn is_valid_listener(gateway: &Gateway, listener: &Listener) -> bool {
    let Some(status) = gateway
        .status
        .as_ref()
        .and_then(|status| status.listeners.as_ref())
        .and_then(|listeners| listeners.iter().find(|status| status.name == listener.name))
    else {
        return false;
    };
    let conditions = Some(status.conditions.as_slice());
    is_condition_true(conditions, ACCEPTED)
        && is_condition_true(conditions, PROGRAMMED)
        && is_condition_true(conditions, RESOLVED_REFS)
        && condition_status(conditions, CONFLICTED) != Some("True")
}

pub fn valid_listeners(gateway: &Gateway) -> Vec<&Listener> {
    gateway.spec.listeners.iter().filter(|listener| is_valid_listener(gateway, listener)).collect()
}

pub fn tls_mode(listener: &Listener) -> TlsModeType {
    listener.tls.as_ref().and_then(|tls| tls.mode).unwrap_or_default()
}

/// Route kinds a listener accepts when `allowedRoutes.kinds` is empty.
pub fn default_route_kinds(listener: &Listener) -> Vec<(&'static str, &'static str)> {
    match (listener.protocol, tls_mode(listener)) {
        (ProtocolType::HTTP | ProtocolType::HTTPS, _) => vec![(GATEWAY_API_GROUP, HTTP_ROUTE_KIND), (GATEWAY_API_GROUP, GRPC_ROUTE_KIND)],
        (ProtocolType::TLS, TlsModeType::Passthrough) => vec![(GATEWAY_API_GROUP, TLS_ROUTE_KIND)],
        (ProtocolType::TLS, TlsModeType::Terminate) | (ProtocolType::TCP, _) => vec![(GATEWAY_API_GROUP, TCP_ROUTE_KIND)],
        (ProtocolType::UDP, _) => vec![(GATEWAY_API_GROUP, UDP_ROUTE_KIND)],
        (ProtocolType::Unsupported, _) => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::ResourceCache,
        common::test::{gateway, gateway_class},
    };

    #[test]
    fn oldest_matching_class_is_effective() {
        let cache = ResourceCache::new();
        cache.insert(gateway_class("newer", "fgw", "2024-01-02T00:00:00Z", true)).unwrap();
        cache.insert(gateway_class("older", "fgw", "2024-01-01T00:00:00Z", true)).unwrap();
        cache.insert(gateway_class("oldest", "other", "2023-01-01T00:00:00Z", true)).unwrap();
        cache.insert(gateway_class("not-accepted", "fgw", "2022-01-01T00:00:00Z", false)).unwrap();
        let snapshot = cache.snapshot().unwrap();
        assert_eq!(effective_gateway_class(&snapshot, "fgw").map(|c| c.name_any()), Some("older".to_owned()));
    }

    #[test]
    fn gateway_of_other_class_is_not_active() {
        let cache = ResourceCache::new();
        cache.insert(gateway_class("fgw", "fgw", "2024-01-01T00:00:00Z", true)).unwrap();
        cache.insert(gateway("a", "ns", "fgw", &[("http", "HTTP", 80)])).unwrap();
        cache.insert(gateway("b", "ns", "other", &[("http", "HTTP", 80)])).unwrap();
        let snapshot = cache.snapshot().unwrap();
        let active = active_gateways(&snapshot, "fgw");
        assert_eq!(active.keys().collect::<Vec<_>>(), vec!["ns/a"]);
    }

    #[test]
    fn listener_without_status_is_invalid() {
        let mut gw = gateway("a", "ns", "fgw", &[("http", "HTTP", 80), ("tcp", "TCP", 9000)]);
        if let Some(listeners) = gw.status.as_mut().and_then(|status| status.listeners.as_mut()) {
            listeners.retain(|status| status.name == "http");
        }
        let names: Vec<_> = valid_listeners(&gw).iter().map(|listener| listener.name.clone()).collect();
        assert_eq!(names, vec!["http"]);
    }
}
