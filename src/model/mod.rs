//! Configuration consumed by the proxy runtime, one document per Gateway.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::apis::{
    gateway::{AllowedRoutes, GatewayAddress, ProtocolType, TlsModeType},
    policies::{
        AccessControlConfig, CircuitBreakingConfig, FaultInjectionConfig, HealthCheckConfig, L7RateLimit, LoadBalancerType, RetryConfig,
        SessionPersistence, SessionStickyConfig,
    },
    routes::{
        GRPCRouteMatch, HTTPHeaderFilter, HTTPRequestRedirectFilter, HTTPRouteFilterType, HTTPRouteMatch, HTTPRouteTimeouts, HTTPURLRewriteFilter,
        LocalObjectReference,
    },
};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub gateway: GatewayConfig,
    pub resources: Vec<Resource>,
    pub secret_files: BTreeMap<String, String>,
    pub version: String,
}

#[derive(thiserror::Error, Debug)]
#[error("unable to serialize config: {0}")]
pub struct HashError(#[from] serde_json::Error);

impl Config {
    /// SHA-256 over the canonical JSON of everything but the version field.
    pub fn hash(&self) -> Result<String, HashError> {
        let mut unversioned = serde_json::to_value(self)?;
        if let Some(object) = unversioned.as_object_mut() {
            object.remove("version");
        }
        let bytes = serde_json::to_vec(&unversioned)?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }

    pub fn with_version(mut self) -> Result<Self, HashError> {
        self.version = self.hash()?;
        Ok(self)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: GatewayConfigSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigSpec {
    pub gateway_class_name: String,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<GatewayAddress>>,
    #[serde(default, rename = "backendTLS", skip_serializing_if = "Option::is_none")]
    pub backend_tls: Option<GatewayBackendTlsConfig>,
}

/// Client certificate the proxy presents to TLS backends.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayBackendTlsConfig {
    pub client_certificate: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Advertised port.
    pub port: i32,
    /// Port the proxy binds, privileged ports shifted above 60000.
    pub listen: i32,
    pub protocol: ProtocolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_routes: Option<AllowedRoutes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control_lists: Option<AccessControlConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTlsConfig {
    pub mode: TlsModeType,
    #[serde(default)]
    pub certificates: Vec<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_validation: Option<FrontendValidationConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendValidationConfig {
    #[serde(default)]
    pub ca_certificates: Vec<BTreeMap<String, String>>,
}

/// Everything but the Gateway, tagged by `kind`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind")]
pub enum Resource {
    HTTPRoute(RouteResource<L7RouteSpec<HTTPRouteMatch>>),
    GRPCRoute(RouteResource<L7RouteSpec<GRPCRouteMatch>>),
    TLSRoute(RouteResource<L4RouteSpec>),
    TCPRoute(RouteResource<L4RouteSpec>),
    UDPRoute(RouteResource<L4RouteSpec>),
    Backend(RouteResource<BackendSpec>),
    RouteTable(RouteResource<RouteTableSpec>),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteResource<S> {
    pub metadata: ObjectMeta,
    pub spec: S,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L7RouteSpec<M> {
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<L7RuleConfig<M>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L7RuleConfig<M> {
    #[serde(default)]
    pub matches: Vec<M>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub backend_refs: Vec<BackendRefConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<HTTPRouteTimeouts>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L4RouteSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<L4RuleConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L4RuleConfig {
    #[serde(default)]
    pub backend_refs: Vec<BackendRefConfig>,
}

/// Reference to a `Backend` resource by its `namespace/name:port` name.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRefConfig {
    pub kind: String,
    pub name: String,
    pub weight: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterConfig>,
}

impl BackendRefConfig {
    pub fn new(name: String, weight: i32) -> Self {
        Self { kind: BACKEND_KIND.to_owned(), name, weight, filters: vec![] }
    }
}

pub const BACKEND_KIND: &str = "Backend";

/// Route filter with mirror targets rewritten to `Backend` references.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub r#type: HTTPRouteFilterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header_modifier: Option<HTTPHeaderFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header_modifier: Option<HTTPHeaderFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_mirror: Option<MirrorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_redirect: Option<HTTPRequestRedirectFilter>,
    #[serde(default, rename = "urlRewrite", skip_serializing_if = "Option::is_none")]
    pub url_rewrite: Option<HTTPURLRewriteFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_ref: Option<LocalObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    pub backend_ref: BackendRefConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    #[serde(default)]
    pub targets: Vec<BackendTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_sticky: Option<SessionStickyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaking: Option<CircuitBreakingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<BackendTlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistence>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BackendTarget {
    pub address: String,
    pub port: i32,
    pub weight: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendTlsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<BTreeMap<String, String>>,
    #[serde(default, rename = "mTLS", skip_serializing_if = "Option::is_none")]
    pub mtls: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ca_certificates: Vec<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well_known_ca_certificates: Option<String>,
}

/// Merged routing table of one listen port.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum RouteTableSpec {
    L7 { port: i32, hostnames: BTreeMap<String, L7HostnameRule> },
    TLSPassthrough { port: i32, hostnames: BTreeMap<String, String> },
    TLSTerminate { port: i32, hostnames: BTreeMap<String, Vec<BackendRefConfig>> },
    TCP { port: i32, backends: Vec<BackendRefConfig> },
    UDP { port: i32, backends: Vec<BackendRefConfig> },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum L7RouteType {
    HTTP,
    GRPC,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L7HostnameRule {
    pub route_type: L7RouteType,
    pub matches: Vec<RouteMatchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<L7RateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control_lists: Option<AccessControlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_injection: Option<FaultInjectionConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MatchConfig {
    HTTP(HTTPRouteMatch),
    GRPC(GRPCRouteMatch),
}

/// One match of one rule, carrying its own backends, filters and decorations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatchConfig {
    /// `namespace/name` of the contributing route.
    pub route: String,
    #[serde(rename = "match")]
    pub route_match: MatchConfig,
    #[serde(default)]
    pub backend_refs: Vec<BackendRefConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<HTTPRouteTimeouts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<L7RateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control_lists: Option<AccessControlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_injection: Option<FaultInjectionConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_ignored_by_hash() {
        let config = Config { secret_files: BTreeMap::from([("a.crt".to_owned(), "pem".to_owned())]), ..Default::default() };
        let versioned = config.clone().with_version().unwrap();
        assert_eq!(versioned.version.len(), 64);
        assert_eq!(versioned.hash().unwrap(), config.hash().unwrap());

        let changed = Config { secret_files: BTreeMap::from([("a.crt".to_owned(), "other".to_owned())]), ..Default::default() };
        assert_ne!(changed.hash().unwrap(), config.hash().unwrap());
    }

    #[test]
    fn resources_are_tagged_by_kind() {
        let backend = Resource::Backend(RouteResource {
            metadata: ObjectMeta { namespace: None, name: "gw/svc:8080".to_owned() },
            spec: BackendSpec { targets: vec![BackendTarget { address: "10.0.0.1".to_owned(), port: 9090, weight: 1 }], ..Default::default() },
        });
        let value = serde_json::to_value(&backend).unwrap();
        assert_eq!(value["kind"], "Backend");
        assert_eq!(value["metadata"]["name"], "gw/svc:8080");
        assert_eq!(value["spec"]["targets"][0]["port"], 9090);
    }
}
