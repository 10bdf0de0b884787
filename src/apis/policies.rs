use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    gateway::ObjectReference,
    routes::{GRPCRouteMatch, HTTPHeader, HTTPRouteMatch, LocalObjectReference, ParentReference},
};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetReference {
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalPolicyTargetReference {
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestors: Option<Vec<PolicyAncestorStatus>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAncestorStatus {
    pub ancestor_ref: ParentReference,
    pub controller_name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RateLimitPolicyMode {
    #[default]
    Local,
    Global,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "RateLimitPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortRateLimit>,
    #[serde(default, rename = "bps", skip_serializing_if = "Option::is_none")]
    pub default_bps: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<HostnamePolicy<L7RateLimit>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<MatchPolicy<HTTPRouteMatch, L7RateLimit>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grpc: Vec<MatchPolicy<GRPCRouteMatch, L7RateLimit>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<L7RateLimit>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortRateLimit {
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct L7RateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RateLimitPolicyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_time_window: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers_to_add: Option<Vec<HTTPHeader>>,
}

/// Per-hostname override of a policy's default config.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostnamePolicy<C> {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<C>,
}

/// Per-route-match override of a policy's default config.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchPolicy<M, C> {
    #[serde(rename = "match")]
    pub route_match: M,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<C>,
}

/// Per-port override of a policy's default config.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortPolicy<C> {
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<C>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "AccessControlPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<AccessControlConfig>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<HostnamePolicy<AccessControlConfig>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<MatchPolicy<HTTPRouteMatch, AccessControlConfig>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grpc: Vec<MatchPolicy<GRPCRouteMatch, AccessControlConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<AccessControlConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<String>>,
    #[serde(default, rename = "enableXFF", skip_serializing_if = "Option::is_none")]
    pub enable_xff: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "FaultInjectionPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct FaultInjectionPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<HostnamePolicy<FaultInjectionConfig>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<MatchPolicy<HTTPRouteMatch, FaultInjectionConfig>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grpc: Vec<MatchPolicy<GRPCRouteMatch, FaultInjectionConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<FaultInjectionConfig>,
}

/// Delay and abort are mutually exclusive.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultInjectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultInjectionDelay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultInjectionAbort>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultInjectionDelay {
    #[serde(default)]
    pub percent: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultInjectionAbort {
    #[serde(default)]
    pub percent: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "SessionStickyPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct SessionStickyPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<SessionStickyConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<SessionStickyConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStickyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum LoadBalancerType {
    #[default]
    RoundRobinLoadBalancer,
    HashingLoadBalancer,
    LeastConnectionLoadBalancer,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "LoadBalancerPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortLoadBalancer>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub default_type: Option<LoadBalancerType>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortLoadBalancer {
    pub port: i32,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<LoadBalancerType>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "CircuitBreakingPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakingPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<CircuitBreakingConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<CircuitBreakingConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_request_amount: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_time_window: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_time_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_amount_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_ratio_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_amount_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ratio_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_time_window: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_status_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_response_content: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "HealthCheckPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<HealthCheckConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<HealthCheckConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fails: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_timeout: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<HealthCheckMatch>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_codes: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HTTPHeader>>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "RetryPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<RetryConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<RetryConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_interval: Option<i32>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "UpstreamTLSPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTLSPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<UpstreamTLSConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<UpstreamTLSConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTLSConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_ref: Option<ObjectReference>,
    #[serde(default, rename = "mTLS", skip_serializing_if = "Option::is_none")]
    pub mtls: Option<bool>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.flomesh.io", version = "v1alpha1", kind = "GatewayTLSPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct GatewayTLSPolicySpec {
    pub target_ref: PolicyTargetReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortPolicy<GatewayTLSConfig>>,
    #[serde(default, rename = "config", skip_serializing_if = "Option::is_none")]
    pub default_config: Option<GatewayTLSConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTLSConfig {
    #[serde(default, rename = "mTLS", skip_serializing_if = "Option::is_none")]
    pub mtls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_suites: Option<Vec<String>>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.networking.k8s.io", version = "v1alpha2", kind = "BackendLBPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackendLBPolicySpec {
    pub target_refs: Vec<LocalPolicyTargetReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistence>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionPersistence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_config: Option<BTreeMap<String, String>>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.networking.k8s.io", version = "v1alpha3", kind = "BackendTLSPolicy", namespaced, status = "PolicyStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackendTLSPolicySpec {
    pub target_refs: Vec<LocalPolicyTargetReference>,
    pub validation: BackendTLSPolicyValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendTLSPolicyValidation {
    #[serde(default, rename = "caCertificateRefs", skip_serializing_if = "Option::is_none")]
    pub ca_certificate_refs: Option<Vec<LocalObjectReference>>,
    #[serde(default, rename = "wellKnownCACertificates", skip_serializing_if = "Option::is_none")]
    pub well_known_ca_certificates: Option<String>,
    pub hostname: String,
}
