//! Effective policy per attachment point. Policies on one target apply oldest first, the oldest winning per field.

mod merge;

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::ResourceExt;
pub use merge::{merge, with_default};
use tracing::{debug, warn};

use crate::{
    apis::{
        policies::{
            AccessControlConfig, AccessControlPolicy, BackendLBPolicy, BackendTLSPolicy, CircuitBreakingConfig, CircuitBreakingPolicy,
            FaultInjectionConfig, FaultInjectionPolicy, GatewayTLSConfig, GatewayTLSPolicy, HealthCheckConfig, HealthCheckPolicy,
            HostnamePolicy, L7RateLimit, LoadBalancerPolicy, LoadBalancerType, MatchPolicy, PolicyStatus, PortPolicy, RateLimitPolicy,
            RateLimitPolicyMode, RetryConfig, RetryPolicy, SessionPersistence, SessionStickyConfig, SessionStickyPolicy, UpstreamTLSPolicy,
        },
        routes::{GRPCRouteMatch, HTTPRouteMatch},
        CONFIG_MAP_KIND, CORE_API_GROUP, FLOMESH_GATEWAY_API_GROUP, GATEWAY_API_GROUP, GATEWAY_KIND, SECRET_KIND,
    },
    cache::{target_key, CacheError, CacheInner, Cached, TARGET_INDEX},
    common::{self, create_id, is_valid_ref_to_secret, valid_cross_namespace_ref, ReferenceFrom, ReferenceTo, ServicePortName, ACCEPTED},
    model::{BackendSpec, BackendTlsConfig},
};

const DEFAULT_RATE_LIMIT_BACKLOG: i32 = 10;
const DEFAULT_RATE_LIMIT_STATUS_CODE: i32 = 429;
const TLS_TYPE: &str = "kubernetes.io/tls";

/// A policy attachment CRD carrying the shared policy status.
pub trait Policy: Cached {
    fn policy_status(&self) -> Option<&PolicyStatus>;

    /// Accepted on the policy itself or for any ancestor.
    fn is_accepted(&self) -> bool {
        let Some(status) = self.policy_status() else {
            return false;
        };
        let accepted = |conditions: Option<&[Condition]>| common::is_condition_true(conditions, ACCEPTED);
        accepted(status.conditions.as_deref())
            || status.ancestors.as_deref().unwrap_or_default().iter().any(|ancestor| accepted(Some(&ancestor.conditions)))
    }
}

macro_rules! policy {
    ($($kind:ty),*) => {
        $(impl Policy for $kind {
            fn policy_status(&self) -> Option<&PolicyStatus> {
                self.status.as_ref()
            }
        })*
    };
}

policy!(
    RateLimitPolicy,
    AccessControlPolicy,
    FaultInjectionPolicy,
    SessionStickyPolicy,
    LoadBalancerPolicy,
    CircuitBreakingPolicy,
    HealthCheckPolicy,
    RetryPolicy,
    UpstreamTLSPolicy,
    GatewayTLSPolicy,
    BackendLBPolicy,
    BackendTLSPolicy
);

/// Per-port config of one policy. A policy without port entries applies its default to every port.
fn port_config<C>(ports: &[PortPolicy<C>], default: Option<&C>, port: i32) -> Option<C>
where
    C: serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    if ports.is_empty() {
        return default.cloned();
    }
    let entry = ports.iter().find(|entry| entry.port == port)?;
    with_default(entry.config.as_ref(), default)
}

fn hostname_config<C>(hostnames: &[HostnamePolicy<C>], default: Option<&C>, hostname: &str) -> Option<C>
where
    C: serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    let entry = hostnames.iter().find(|entry| entry.hostname == hostname)?;
    with_default(entry.config.as_ref(), default)
}

/// A policy without match entries applies its default to every match of the route.
fn match_config<M, C>(matches: &[MatchPolicy<M, C>], default: Option<&C>, route_match: &M) -> Option<C>
where
    M: PartialEq,
    C: serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    if matches.is_empty() {
        return default.cloned();
    }
    let entry = matches.iter().find(|entry| &entry.route_match == route_match)?;
    with_default(entry.config.as_ref(), default)
}

/// Like `match_config` but without field merging: the entry's config, or else the default, applies whole.
fn whole_match_config<M: PartialEq, C: Clone>(matches: &[MatchPolicy<M, C>], default: Option<&C>, route_match: &M) -> Option<C> {
    if matches.is_empty() {
        return default.cloned();
    }
    let entry = matches.iter().find(|entry| &entry.route_match == route_match)?;
    entry.config.as_ref().or(default).cloned()
}

/// Route match a route-level policy can be keyed on.
pub enum RouteMatchRef<'a> {
    HTTP(&'a HTTPRouteMatch),
    GRPC(&'a GRPCRouteMatch),
}

/// Service-level decorations of one Backend.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct BackendPolicies {
    pub session_sticky: Option<SessionStickyConfig>,
    pub load_balancer: Option<LoadBalancerType>,
    pub circuit_breaking: Option<CircuitBreakingConfig>,
    pub health_check: Option<HealthCheckConfig>,
    pub retry: Option<RetryConfig>,
    pub session_persistence: Option<SessionPersistence>,
    pub tls: Option<BackendTlsConfig>,
}

impl BackendPolicies {
    pub fn decorate(self, spec: &mut BackendSpec) {
        spec.session_sticky = self.session_sticky;
        spec.load_balancer = self.load_balancer;
        spec.circuit_breaking = self.circuit_breaking;
        spec.health_check = self.health_check;
        spec.retry = self.retry;
        spec.session_persistence = self.session_persistence;
        spec.tls = self.tls;
    }
}

pub struct PolicyEngine<'a> {
    snapshot: &'a CacheInner,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(snapshot: &'a CacheInner) -> Self {
        Self { snapshot }
    }

    /// Accepted policies of kind `P` attached to the target, oldest first.
    fn attached<P: Policy>(&self, group: &str, kind: &str, namespace: &str, name: &str) -> Result<Vec<Arc<P>>, CacheError> {
        let policies = P::store(self.snapshot).list_by_index_sorted(TARGET_INDEX, &target_key(group, kind, namespace, name))?;
        Ok(policies.into_iter().filter(|policy| policy.is_accepted()).collect())
    }

    fn gateway_policies<P: Policy>(&self, gateway_namespace: &str, gateway_name: &str) -> Result<Vec<Arc<P>>, CacheError> {
        self.attached(GATEWAY_API_GROUP, GATEWAY_KIND, gateway_namespace, gateway_name)
    }

    fn service_policies<P: Policy>(&self, service: &ServicePortName) -> Result<Vec<Arc<P>>, CacheError> {
        self.attached(&service.group, &service.kind, &service.namespace, &service.name)
    }

    /// Rate limit and access control policies on a Gateway also carry hostname sections, so they reach a listener only
    /// through a listed port. Listener TLS policies have no other section and apply to every port when none is listed.
    pub fn listener_bps_limit(&self, gateway_namespace: &str, gateway_name: &str, port: i32) -> Result<Option<i64>, CacheError> {
        let policies = self.gateway_policies::<RateLimitPolicy>(gateway_namespace, gateway_name)?;
        Ok(policies.iter().find_map(|policy| {
            let spec = &policy.spec;
            spec.ports.iter().find(|entry| entry.port == port).and_then(|entry| entry.bps.or(spec.default_bps))
        }))
    }

    pub fn listener_access_control(&self, gateway_namespace: &str, gateway_name: &str, port: i32) -> Result<Option<AccessControlConfig>, CacheError> {
        let policies = self.gateway_policies::<AccessControlPolicy>(gateway_namespace, gateway_name)?;
        Ok(merge(policies.iter().filter_map(|policy| {
            let entry = policy.spec.ports.iter().find(|entry| entry.port == port)?;
            with_default(entry.config.as_ref(), policy.spec.default_config.as_ref())
        })))
    }

    pub fn listener_tls(&self, gateway_namespace: &str, gateway_name: &str, port: i32) -> Result<Option<GatewayTLSConfig>, CacheError> {
        let policies = self.gateway_policies::<GatewayTLSPolicy>(gateway_namespace, gateway_name)?;
        Ok(merge(policies.iter().filter_map(|policy| port_config(&policy.spec.ports, policy.spec.default_config.as_ref(), port))))
    }

    pub fn hostname_rate_limit(&self, gateway_namespace: &str, gateway_name: &str, hostname: &str) -> Result<Option<L7RateLimit>, CacheError> {
        let policies = self.gateway_policies::<RateLimitPolicy>(gateway_namespace, gateway_name)?;
        let merged = merge(policies.iter().filter_map(|policy| hostname_config(&policy.spec.hostnames, policy.spec.default_config.as_ref(), hostname)));
        Ok(merged.map(with_rate_limit_defaults))
    }

    pub fn hostname_access_control(&self, gateway_namespace: &str, gateway_name: &str, hostname: &str) -> Result<Option<AccessControlConfig>, CacheError> {
        let policies = self.gateway_policies::<AccessControlPolicy>(gateway_namespace, gateway_name)?;
        Ok(merge(policies.iter().filter_map(|policy| hostname_config(&policy.spec.hostnames, policy.spec.default_config.as_ref(), hostname))))
    }

    /// Delay and abort are exclusive, so the oldest fault injection applies whole.
    pub fn hostname_fault_injection(&self, gateway_namespace: &str, gateway_name: &str, hostname: &str) -> Result<Option<FaultInjectionConfig>, CacheError> {
        let policies = self.gateway_policies::<FaultInjectionPolicy>(gateway_namespace, gateway_name)?;
        Ok(policies.iter().find_map(|policy| {
            let entry = policy.spec.hostnames.iter().find(|entry| entry.hostname == hostname)?;
            entry.config.clone().or_else(|| policy.spec.default_config.clone())
        }))
    }

    fn route_policies<P: Policy>(&self, route_kind: &str, route_namespace: &str, route_name: &str) -> Result<Vec<Arc<P>>, CacheError> {
        self.attached(GATEWAY_API_GROUP, route_kind, route_namespace, route_name)
    }

    pub fn match_rate_limit(&self, route_kind: &str, namespace: &str, name: &str, route_match: &RouteMatchRef) -> Result<Option<L7RateLimit>, CacheError> {
        let policies = self.route_policies::<RateLimitPolicy>(route_kind, namespace, name)?;
        let merged = merge(policies.iter().filter_map(|policy| {
            let spec = &policy.spec;
            match route_match {
                RouteMatchRef::HTTP(route_match) => match_config(&spec.http, spec.default_config.as_ref(), *route_match),
                RouteMatchRef::GRPC(route_match) => match_config(&spec.grpc, spec.default_config.as_ref(), *route_match),
            }
        }));
        Ok(merged.map(with_rate_limit_defaults))
    }

    pub fn match_access_control(
        &self,
        route_kind: &str,
        namespace: &str,
        name: &str,
        route_match: &RouteMatchRef,
    ) -> Result<Option<AccessControlConfig>, CacheError> {
        let policies = self.route_policies::<AccessControlPolicy>(route_kind, namespace, name)?;
        Ok(merge(policies.iter().filter_map(|policy| {
            let spec = &policy.spec;
            match route_match {
                RouteMatchRef::HTTP(route_match) => match_config(&spec.http, spec.default_config.as_ref(), *route_match),
                RouteMatchRef::GRPC(route_match) => match_config(&spec.grpc, spec.default_config.as_ref(), *route_match),
            }
        })))
    }

    pub fn match_fault_injection(
        &self,
        route_kind: &str,
        namespace: &str,
        name: &str,
        route_match: &RouteMatchRef,
    ) -> Result<Option<FaultInjectionConfig>, CacheError> {
        let policies = self.route_policies::<FaultInjectionPolicy>(route_kind, namespace, name)?;
        Ok(policies.iter().find_map(|policy| {
            let spec = &policy.spec;
            match route_match {
                RouteMatchRef::HTTP(route_match) => whole_match_config(&spec.http, spec.default_config.as_ref(), *route_match),
                RouteMatchRef::GRPC(route_match) => whole_match_config(&spec.grpc, spec.default_config.as_ref(), *route_match),
            }
        }))
    }

    /// Everything attached at the Service or ServiceImport level for one port.
    pub fn backend_policies(&self, service: &ServicePortName, secret_files: &mut BTreeMap<String, String>) -> Result<BackendPolicies, CacheError> {
        let port = service.port.unwrap_or_default();
        let session_sticky = self.service_policies::<SessionStickyPolicy>(service)?;
        let load_balancer = self.service_policies::<LoadBalancerPolicy>(service)?;
        let circuit_breaking = self.service_policies::<CircuitBreakingPolicy>(service)?;
        let health_check = self.service_policies::<HealthCheckPolicy>(service)?;
        let retry = self.service_policies::<RetryPolicy>(service)?;
        let backend_lb = self.service_policies::<BackendLBPolicy>(service)?;

        Ok(BackendPolicies {
            session_sticky: merge(session_sticky.iter().filter_map(|p| port_config(&p.spec.ports, p.spec.default_config.as_ref(), port))),
            load_balancer: load_balancer.iter().find_map(|policy| {
                let spec = &policy.spec;
                if spec.ports.is_empty() {
                    spec.default_type
                } else {
                    spec.ports.iter().find(|entry| entry.port == port).and_then(|entry| entry.r#type.or(spec.default_type))
                }
            }),
            circuit_breaking: merge(circuit_breaking.iter().filter_map(|p| port_config(&p.spec.ports, p.spec.default_config.as_ref(), port))),
            health_check: merge(health_check.iter().filter_map(|p| port_config(&p.spec.ports, p.spec.default_config.as_ref(), port))),
            retry: merge(retry.iter().filter_map(|p| port_config(&p.spec.ports, p.spec.default_config.as_ref(), port))),
            session_persistence: merge(backend_lb.iter().filter_map(|policy| policy.spec.session_persistence.clone())),
            tls: self.backend_tls(service, secret_files)?,
        })
    }

    /// BackendTLS validation wins over UpstreamTLS client certificates when both are attached; both are carried.
    fn backend_tls(&self, service: &ServicePortName, secret_files: &mut BTreeMap<String, String>) -> Result<Option<BackendTlsConfig>, CacheError> {
        let port = service.port.unwrap_or_default();
        let mut tls: Option<BackendTlsConfig> = None;

        for policy in self.service_policies::<UpstreamTLSPolicy>(service)? {
            let Some(config) = port_config(&policy.spec.ports, policy.spec.default_config.as_ref(), port) else {
                continue;
            };
            let Some(certificate_ref) = config.certificate_ref.as_ref() else {
                continue;
            };
            let policy_namespace = policy.namespace().unwrap_or_default();
            let secret_namespace = certificate_ref.namespace.clone().unwrap_or_else(|| policy_namespace.clone());
            if !is_valid_ref_to_secret(certificate_ref.group.as_deref(), certificate_ref.kind.as_deref()) {
                warn!("UpstreamTLSPolicy {policy_namespace}/{} refers to unsupported kind {:?}", policy.name_any(), certificate_ref.kind);
                continue;
            }
            let from = ReferenceFrom { group: FLOMESH_GATEWAY_API_GROUP, kind: "UpstreamTLSPolicy", namespace: &policy_namespace };
            let to = ReferenceTo { group: CORE_API_GROUP, kind: SECRET_KIND, namespace: &secret_namespace, name: &certificate_ref.name };
            if !valid_cross_namespace_ref(self.snapshot, &from, &to)? {
                warn!("UpstreamTLSPolicy {policy_namespace}/{} is not permitted to use secret {secret_namespace}/{}", policy.name_any(), certificate_ref.name);
                continue;
            }
            let Some(secret) = self.snapshot.secrets.get(&create_id(&certificate_ref.name, &secret_namespace)) else {
                debug!("UpstreamTLSPolicy secret {secret_namespace}/{} not found", certificate_ref.name);
                continue;
            };
            let Some((cert, key)) = tls_pair(secret) else {
                continue;
            };
            let cert_name = format!("upstream-tls-{secret_namespace}-{}.crt", certificate_ref.name);
            let key_name = format!("upstream-tls-{secret_namespace}-{}.key", certificate_ref.name);
            secret_files.insert(cert_name.clone(), cert);
            secret_files.insert(key_name.clone(), key);
            tls = Some(BackendTlsConfig {
                certificates: vec![BTreeMap::from([("tls.crt".to_owned(), cert_name), ("tls.key".to_owned(), key_name)])],
                mtls: config.mtls,
                ..Default::default()
            });
            break;
        }

        let service_port_name = self.service_port_name(service);
        let backend_tls = self.service_policies::<BackendTLSPolicy>(service)?.into_iter().find(|policy| {
            policy.spec.target_refs.iter().any(|target| {
                target.name == service.name && target.section_name.as_ref().is_none_or(|section| Some(section) == service_port_name.as_ref())
            })
        });

        if let Some(policy) = backend_tls {
            let policy_namespace = policy.namespace().unwrap_or_default();
            let validation = &policy.spec.validation;
            let tls = tls.get_or_insert_with(BackendTlsConfig::default);
            for (index, ca_ref) in validation.ca_certificate_refs.as_deref().unwrap_or_default().iter().enumerate() {
                let key = create_id(&ca_ref.name, &policy_namespace);
                let ca = match ca_ref.kind.as_str() {
                    CONFIG_MAP_KIND => self.snapshot.config_maps.get(&key).and_then(|config_map| config_map_ca(config_map)),
                    SECRET_KIND => self.snapshot.secrets.get(&key).and_then(|secret| secret_ca(secret)),
                    _ => None,
                };
                let Some(ca) = ca else {
                    debug!("BackendTLSPolicy {policy_namespace}/{} CA {key} not resolvable", policy.name_any());
                    continue;
                };
                let ca_name = format!("bk-tls-ca-{policy_namespace}-{}-{index}.crt", policy.name_any());
                secret_files.insert(ca_name.clone(), ca);
                tls.ca_certificates.push(BTreeMap::from([("ca.crt".to_owned(), ca_name)]));
            }
            tls.hostname = Some(validation.hostname.clone());
            tls.well_known_ca_certificates.clone_from(&validation.well_known_ca_certificates);
        }

        Ok(tls)
    }

    fn service_port_name(&self, service: &ServicePortName) -> Option<String> {
        let found = self.snapshot.services.get(&service.service_key())?;
        let ports = found.spec.as_ref()?.ports.as_ref()?;
        ports.iter().find(|port| Some(port.port) == service.port).and_then(|port| port.name.clone())
    }
}

fn with_rate_limit_defaults(mut config: L7RateLimit) -> L7RateLimit {
    config.mode.get_or_insert(RateLimitPolicyMode::Local);
    config.backlog.get_or_insert(DEFAULT_RATE_LIMIT_BACKLOG);
    if config.burst.is_none() {
        config.burst = config.requests;
    }
    config.response_status_code.get_or_insert(DEFAULT_RATE_LIMIT_STATUS_CODE);
    config
}

fn data_string(data: Option<&BTreeMap<String, k8s_openapi::ByteString>>, key: &str) -> Option<String> {
    let bytes = &data?.get(key)?.0;
    (!bytes.is_empty()).then(|| String::from_utf8_lossy(bytes).into_owned())
}

/// `tls.crt` and `tls.key` of a `kubernetes.io/tls` Secret, both non-empty.
pub fn tls_pair(secret: &Secret) -> Option<(String, String)> {
    if secret.type_.as_deref() != Some(TLS_TYPE) {
        return None;
    }
    Some((data_string(secret.data.as_ref(), "tls.crt")?, data_string(secret.data.as_ref(), "tls.key")?))
}

pub fn secret_ca(secret: &Secret) -> Option<String> {
    data_string(secret.data.as_ref(), "ca.crt")
}

pub fn config_map_ca(config_map: &ConfigMap) -> Option<String> {
    config_map.data.as_ref()?.get("ca.crt").filter(|ca| !ca.is_empty()).cloned()
}
