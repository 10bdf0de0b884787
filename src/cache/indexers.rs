use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;

use crate::{
    apis::{
        gateway::{Gateway, ReferenceGrant},
        policies::{BackendTLSPolicy, LocalPolicyTargetReference, PolicyTargetReference, UpstreamTLSPolicy},
        routes::{BackendRef, GRPCRoute, HTTPBackendRef, HTTPRoute, HTTPRouteFilter, L4RouteRule, ParentReference},
        CONFIG_MAP_KIND, SECRET_KIND,
    },
    common::{create_id, RouteRefKey, ServicePortName},
};

/// Routes by parent Gateway `namespace/name`.
pub const GATEWAY_INDEX: &str = "gateway";
/// Routes by referenced Service `namespace/name`, mirrors included.
pub const BACKEND_INDEX: &str = "backend";
/// Gateways and policies by referenced Secret `namespace/name`.
pub const SECRET_INDEX: &str = "secret";
/// Gateways and policies by referenced ConfigMap `namespace/name`.
pub const CONFIGMAP_INDEX: &str = "configmap";
/// Gateways by GatewayClass name.
pub const CLASS_INDEX: &str = "class";
/// ReferenceGrants by `to` `group/kind`.
pub const TARGET_KIND_INDEX: &str = "target-kind";
/// Policies by target `group/kind/namespace/name`.
pub const TARGET_INDEX: &str = "target";
/// EndpointSlices by owning Service `namespace/name`.
pub const SERVICE_NAME_INDEX: &str = "service";

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

pub fn target_key(group: &str, kind: &str, namespace: &str, name: &str) -> String {
    format!("{group}/{kind}/{namespace}/{name}")
}

fn parent_values<'a>(namespace: &'a str, parent_refs: Option<&'a [ParentReference]>) -> impl Iterator<Item = (&'static str, String)> + 'a {
    parent_refs
        .unwrap_or_default()
        .iter()
        .map(move |parent_ref| RouteRefKey::from_parent_ref(parent_ref, namespace))
        .filter(RouteRefKey::is_gateway)
        .map(|key| (GATEWAY_INDEX, key.resource_key.namespaced_name()))
}

fn backend_value(namespace: &str, backend_ref: &BackendRef) -> (&'static str, String) {
    (BACKEND_INDEX, ServicePortName::from_backend_ref(backend_ref, namespace).service_key())
}

fn mirror_values<'a>(namespace: &'a str, filters: Option<&'a [HTTPRouteFilter]>) -> impl Iterator<Item = (&'static str, String)> + 'a {
    filters
        .unwrap_or_default()
        .iter()
        .filter_map(|filter| filter.request_mirror.as_ref())
        .map(move |mirror| backend_value(namespace, &mirror.backend_ref))
}

fn l7_rule_values(namespace: &str, filters: Option<&[HTTPRouteFilter]>, backend_refs: Option<&[HTTPBackendRef]>) -> Vec<(&'static str, String)> {
    let mut values: Vec<_> = mirror_values(namespace, filters).collect();
    for backend_ref in backend_refs.unwrap_or_default() {
        values.push(backend_value(namespace, &backend_ref.backend_ref));
        values.extend(mirror_values(namespace, backend_ref.filters.as_deref()));
    }
    values
}

pub fn http_route(route: &HTTPRoute) -> Vec<(&'static str, String)> {
    let namespace = route.namespace().unwrap_or_default();
    let mut values: Vec<_> = parent_values(&namespace, route.spec.parent_refs.as_deref()).collect();
    for rule in route.spec.rules.as_deref().unwrap_or_default() {
        values.extend(l7_rule_values(&namespace, rule.filters.as_deref(), rule.backend_refs.as_deref()));
    }
    values
}

pub fn grpc_route(route: &GRPCRoute) -> Vec<(&'static str, String)> {
    let namespace = route.namespace().unwrap_or_default();
    let mut values: Vec<_> = parent_values(&namespace, route.spec.parent_refs.as_deref()).collect();
    for rule in route.spec.rules.as_deref().unwrap_or_default() {
        values.extend(l7_rule_values(&namespace, rule.filters.as_deref(), rule.backend_refs.as_deref()));
    }
    values
}

pub fn l4_route<R: ResourceExt>(route: &R, parent_refs: Option<&[ParentReference]>, rules: &[L4RouteRule]) -> Vec<(&'static str, String)> {
    let namespace = route.namespace().unwrap_or_default();
    let mut values: Vec<_> = parent_values(&namespace, parent_refs).collect();
    for rule in rules {
        values.extend(rule.backend_refs.as_deref().unwrap_or_default().iter().map(|backend_ref| backend_value(&namespace, backend_ref)));
    }
    values
}

pub fn gateway(gateway: &Gateway) -> Vec<(&'static str, String)> {
    let namespace = gateway.namespace().unwrap_or_default();
    let ref_value = |kind: Option<&String>, name: &str, ref_namespace: Option<&String>| {
        let index = if kind.is_some_and(|k| k == CONFIG_MAP_KIND) { CONFIGMAP_INDEX } else { SECRET_INDEX };
        (index, create_id(name, ref_namespace.unwrap_or(&namespace)))
    };

    let mut values = vec![(CLASS_INDEX, gateway.spec.gateway_class_name.clone())];
    for tls in gateway.spec.listeners.iter().filter_map(|listener| listener.tls.as_ref()) {
        for certificate_ref in tls.certificate_refs.as_deref().unwrap_or_default() {
            values.push((SECRET_INDEX, create_id(&certificate_ref.name, certificate_ref.namespace.as_ref().unwrap_or(&namespace))));
        }
        let ca_refs = tls.frontend_validation.as_ref().and_then(|validation| validation.ca_certificate_refs.as_deref());
        for ca_ref in ca_refs.unwrap_or_default() {
            values.push(ref_value(ca_ref.kind.as_ref(), &ca_ref.name, ca_ref.namespace.as_ref()));
        }
    }
    if let Some(client_ref) = gateway.spec.backend_tls.as_ref().and_then(|tls| tls.client_certificate_ref.as_ref()) {
        values.push(ref_value(client_ref.kind.as_ref(), &client_ref.name, client_ref.namespace.as_ref()));
    }
    values
}

pub fn reference_grant(grant: &ReferenceGrant) -> Vec<(&'static str, String)> {
    grant.spec.to.iter().map(|to| (TARGET_KIND_INDEX, format!("{}/{}", to.group, to.kind))).collect()
}

pub fn endpoint_slice(slice: &EndpointSlice) -> Vec<(&'static str, String)> {
    let namespace = slice.namespace().unwrap_or_default();
    slice.labels().get(SERVICE_NAME_LABEL).map(|service| (SERVICE_NAME_INDEX, create_id(service, &namespace))).into_iter().collect()
}

pub fn policy_target<P: ResourceExt>(policy: &P, target_ref: &PolicyTargetReference) -> Vec<(&'static str, String)> {
    let namespace = target_ref.namespace.clone().or_else(|| policy.namespace()).unwrap_or_default();
    vec![(TARGET_INDEX, target_key(&target_ref.group, &target_ref.kind, &namespace, &target_ref.name))]
}

pub fn local_policy_targets<P: ResourceExt>(policy: &P, target_refs: &[LocalPolicyTargetReference]) -> Vec<(&'static str, String)> {
    let namespace = policy.namespace().unwrap_or_default();
    target_refs.iter().map(|target| (TARGET_INDEX, target_key(&target.group, &target.kind, &namespace, &target.name))).collect()
}

pub fn upstream_tls_policy(policy: &UpstreamTLSPolicy) -> Vec<(&'static str, String)> {
    let namespace = policy.namespace().unwrap_or_default();
    let mut values = policy_target(policy, &policy.spec.target_ref);
    let configs = policy.spec.ports.iter().filter_map(|port| port.config.as_ref()).chain(policy.spec.default_config.as_ref());
    for certificate_ref in configs.filter_map(|config| config.certificate_ref.as_ref()) {
        values.push((SECRET_INDEX, create_id(&certificate_ref.name, certificate_ref.namespace.as_ref().unwrap_or(&namespace))));
    }
    values
}

pub fn backend_tls_policy(policy: &BackendTLSPolicy) -> Vec<(&'static str, String)> {
    let namespace = policy.namespace().unwrap_or_default();
    let mut values = local_policy_targets(policy, &policy.spec.target_refs);
    for ca_ref in policy.spec.validation.ca_certificate_refs.as_deref().unwrap_or_default() {
        let index = if ca_ref.kind == SECRET_KIND { SECRET_INDEX } else { CONFIGMAP_INDEX };
        values.push((index, create_id(&ca_ref.name, &namespace)));
    }
    values
}
