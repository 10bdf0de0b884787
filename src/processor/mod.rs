//! Builds the proxy configuration of one active Gateway from a cache snapshot.

mod backends;
mod filters;
mod listeners;
mod route_listener_matcher;
mod route_table;
mod routes;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

pub use self::routes::RouteObject;
use self::{
    backends::BackendResolver,
    listeners::{terminates_tls, ListenerResolver},
    route_listener_matcher::RouteListenerMatcher,
    routes::RouteWalker,
};
use crate::{
    apis::{gateway::Gateway, routes::RouteParentStatus, GATEWAY_KIND},
    cache::{CacheError, CacheInner},
    common::{create_id, ResourceKey},
    model::{BackendSpec, Config, GatewayConfig, GatewayConfigSpec, HashError, ObjectMeta, Resource, RouteResource},
    policy::PolicyEngine,
};

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("{0}")]
    Cache(#[from] CacheError),
    #[error("{0}")]
    Hash(#[from] HashError),
}

#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub controller_name: String,
    pub use_endpoint_slices: bool,
}

/// Parent statuses this controller computed for one route.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteStatusUpdate {
    pub kind: &'static str,
    pub key: ResourceKey,
    /// `namespace/name` of the Gateway the parents were computed for.
    pub gateway: String,
    pub generation: Option<i64>,
    pub parents: Vec<RouteParentStatus>,
}

/// `ResolvedRefs` conditions of the Gateway's TLS listeners, by listener name.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayStatusUpdate {
    pub key: ResourceKey,
    pub listeners: BTreeMap<String, Condition>,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub config: Config,
    pub route_statuses: Vec<RouteStatusUpdate>,
    pub gateway_status: GatewayStatusUpdate,
}

pub struct GatewayProcessor<'a> {
    snapshot: &'a CacheInner,
    gateway: &'a Gateway,
    settings: &'a ProcessorSettings,
}

impl<'a> GatewayProcessor<'a> {
    pub fn new(snapshot: &'a CacheInner, gateway: &'a Gateway, settings: &'a ProcessorSettings) -> Self {
        Self { snapshot, gateway, settings }
    }

    #[instrument(level = "debug", skip(self), fields(gateway = %create_id(&self.gateway.name_any(), &self.gateway.namespace().unwrap_or_default())))]
    pub fn build(&self) -> Result<BuildOutput, ProcessorError> {
        let namespace = self.gateway.namespace().unwrap_or_default();
        let name = self.gateway.name_any();
        let engine = PolicyEngine::new(self.snapshot);
        let listener_resolver = ListenerResolver::new(self.snapshot, self.gateway);
        let mut secret_files = BTreeMap::new();

        let mut listener_conditions = BTreeMap::new();
        let mut resolved_tls = BTreeMap::new();
        for listener in self.gateway.spec.listeners.iter().filter(|listener| terminates_tls(listener)) {
            let resolved = listener_resolver.resolve_tls(listener)?;
            listener_conditions.insert(listener.name.clone(), listener_resolver.condition(&resolved));
            resolved_tls.insert(listener.name.clone(), resolved);
        }

        let matcher = RouteListenerMatcher::new(self.snapshot, self.gateway);
        let mut listeners = Vec::with_capacity(matcher.listeners().len());
        for listener in matcher.listeners() {
            let tls = resolved_tls.remove(&listener.name).map(|resolved| {
                secret_files.extend(resolved.files);
                resolved.config
            });
            listeners.push(listener_resolver.listener_config(&engine, listener, tls)?);
        }
        let backend_tls = listener_resolver.backend_client_certificate(&mut secret_files)?;

        let walker = RouteWalker::new(self.snapshot, create_id(&name, &namespace), &self.settings.controller_name, matcher, self.settings.use_endpoint_slices);
        let contributions = walker.walk()?;
        let mut resources = contributions.resources;

        let resolver = BackendResolver::new(self.snapshot, self.settings.use_endpoint_slices);
        for service in &contributions.services {
            let targets = resolver.targets(service)?;
            if targets.is_empty() {
                debug!("no targets for {service}");
                continue;
            }
            let mut spec = BackendSpec { targets, ..Default::default() };
            engine.backend_policies(service, &mut secret_files)?.decorate(&mut spec);
            resources.push(Resource::Backend(RouteResource { metadata: ObjectMeta { namespace: None, name: service.to_string() }, spec }));
        }
        resources.extend(contributions.tables.into_resources(&engine, &namespace, &name)?);

        let config = Config {
            gateway: GatewayConfig {
                kind: GATEWAY_KIND.to_owned(),
                metadata: ObjectMeta { namespace: Some(namespace.clone()), name: name.clone() },
                spec: GatewayConfigSpec {
                    gateway_class_name: self.gateway.spec.gateway_class_name.clone(),
                    listeners,
                    addresses: self.gateway.spec.addresses.clone(),
                    backend_tls,
                },
            },
            resources,
            secret_files,
            version: String::new(),
        }
        .with_version()?;
        debug!("built version {} with {} resources", config.version, config.resources.len());

        Ok(BuildOutput {
            config,
            route_statuses: contributions.statuses,
            gateway_status: GatewayStatusUpdate { key: ResourceKey::from_resource(self.gateway), listeners: listener_conditions },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apis::routes::HTTPRoute,
        cache::ResourceCache,
        common::{
            condition_status,
            test::{endpoint_slice, gateway, http_route, reference_grant, service, tls_secret},
            RESOLVED_REFS,
        },
        model::RouteTableSpec,
    };

    const CONTROLLER: &str = "flomesh.io/gateway-controller";

    fn settings() -> ProcessorSettings {
        ProcessorSettings { controller_name: CONTROLLER.to_owned(), use_endpoint_slices: true }
    }

    fn build(cache: &ResourceCache, gateway_key: &str) -> BuildOutput {
        let snapshot = cache.snapshot().unwrap();
        let gw = snapshot.gateways.get(gateway_key).unwrap().clone();
        GatewayProcessor::new(&snapshot, &gw, &settings()).build().unwrap()
    }

    fn s1_cache() -> ResourceCache {
        let cache = ResourceCache::new();
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        gw.spec.listeners[0].hostname = Some("*.example.com".to_owned());
        cache.insert(gw).unwrap();
        let route: HTTPRoute = serde_yaml::from_str(
            r#"
apiVersion: gateway.networking.k8s.io/v1
kind: HTTPRoute
metadata: {name: web, namespace: gw, creationTimestamp: "2024-01-01T00:00:00Z", generation: 1}
spec:
  parentRefs: [{name: g1}]
  hostnames: [a.example.com]
  rules:
  - matches: [{path: {type: PathPrefix, value: /foo}}]
    backendRefs: [{name: svc, port: 8080, weight: 1}]
"#,
        )
        .unwrap();
        cache.insert(route).unwrap();
        cache.insert(service("svc", "gw", &[("http", 8080, 9090)])).unwrap();
        cache.insert(endpoint_slice("svc-1", "gw", "svc", "http", 9090, &[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", false)])).unwrap();
        cache
    }

    fn backend<'c>(config: &'c Config, name: &str) -> Option<&'c BackendSpec> {
        config.resources.iter().find_map(|resource| match resource {
            Resource::Backend(backend) if backend.metadata.name == name => Some(&backend.spec),
            _ => None,
        })
    }

    fn route_table(config: &Config, port: i32) -> Option<&RouteTableSpec> {
        config.resources.iter().find_map(|resource| match resource {
            Resource::RouteTable(table) if table.metadata.name == port.to_string() => Some(&table.spec),
            _ => None,
        })
    }

    #[test]
    fn http_route_with_endpoint_slice_backends() {
        let output = build(&s1_cache(), "gw/g1");
        let config = &output.config;

        assert_eq!(config.gateway.spec.listeners.len(), 1);
        let listener = &config.gateway.spec.listeners[0];
        assert_eq!((listener.port, listener.listen), (80, 60080));

        let Resource::HTTPRoute(route) = &config.resources[0] else { panic!("expected an HTTPRoute first") };
        assert_eq!(route.spec.hostnames, vec!["a.example.com"]);
        assert_eq!(route.spec.rules.len(), 1);
        assert_eq!(route.spec.rules[0].backend_refs[0].name, "gw/svc:8080");
        assert_eq!(route.spec.rules[0].backend_refs[0].weight, 1);

        let targets: Vec<_> = backend(config, "gw/svc:8080").unwrap().targets.iter().map(|t| (t.address.as_str(), t.port, t.weight)).collect();
        assert_eq!(targets, vec![("10.0.0.1", 9090, 1), ("10.0.0.2", 9090, 1)]);

        let Some(RouteTableSpec::L7 { hostnames, .. }) = route_table(config, 80) else { panic!("expected an L7 table on port 80") };
        assert_eq!(hostnames.keys().collect::<Vec<_>>(), vec!["a.example.com"]);
        assert_eq!(config.version, config.hash().unwrap());
    }

    #[test]
    fn repeated_builds_are_identical() {
        let cache = s1_cache();
        let first = build(&cache, "gw/g1").config;
        let second = build(&cache, "gw/g1").config;
        assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());
    }

    #[test]
    fn https_listener_emits_certificate_files() {
        let cache = s1_cache();
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80), ("https", "HTTPS", 443)]);
        gw.spec.listeners[0].hostname = Some("*.example.com".to_owned());
        gw.spec.listeners[1].tls = serde_json::from_value(serde_json::json!({"mode": "Terminate", "certificateRefs": [{"name": "cert"}]})).unwrap();
        cache.insert(gw).unwrap();
        cache.insert(tls_secret("cert", "gw", "kubernetes.io/tls", "X", "Y")).unwrap();
        let output = build(&cache, "gw/g1");

        let https = &output.config.gateway.spec.listeners[1];
        assert_eq!(https.listen, 60443);
        let certificate = &https.tls.as_ref().unwrap().certificates[0];
        assert_eq!(certificate["tls.crt"], "tls-443-0.crt");
        assert_eq!(certificate["tls.key"], "tls-443-0.key");
        assert_eq!(output.config.secret_files["tls-443-0.crt"], "X");
        assert_eq!(output.config.secret_files["tls-443-0.key"], "Y");
        assert_eq!(output.gateway_status.listeners["https"].status, "True");
    }

    #[test]
    fn secret_of_wrong_type_emits_no_files() {
        let cache = ResourceCache::new();
        let mut gw = gateway("g1", "gw", "fgw", &[("https", "HTTPS", 443)]);
        gw.spec.listeners[0].tls = serde_json::from_value(serde_json::json!({"certificateRefs": [{"name": "cert"}]})).unwrap();
        cache.insert(gw).unwrap();
        cache.insert(tls_secret("cert", "gw", "Opaque", "X", "Y")).unwrap();
        let output = build(&cache, "gw/g1");

        assert!(output.config.secret_files.is_empty());
        assert!(output.config.gateway.spec.listeners[0].tls.as_ref().unwrap().certificates.is_empty());
        let condition = &output.gateway_status.listeners["https"];
        assert_eq!((condition.type_.as_str(), condition.status.as_str()), (RESOLVED_REFS, "False"));
    }

    fn cross_namespace_cache() -> ResourceCache {
        let cache = ResourceCache::new();
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        gw.spec.listeners[0].allowed_routes = serde_json::from_value(serde_json::json!({"namespaces": {"from": "All"}})).unwrap();
        cache.insert(gw).unwrap();
        let mut route = http_route("r1", "a", "g1", &[]);
        route.spec.parent_refs = serde_json::from_value(serde_json::json!([{"name": "g1", "namespace": "gw"}])).unwrap();
        route.spec.rules = serde_json::from_value(serde_json::json!([
            {"matches": [{"path": {"type": "PathPrefix", "value": "/remote"}}], "backendRefs": [{"name": "remote", "namespace": "b", "port": 80}]},
            {"matches": [{"path": {"type": "PathPrefix", "value": "/local"}}], "backendRefs": [{"name": "local", "port": 80}]}
        ]))
        .unwrap();
        cache.insert(route).unwrap();
        cache.insert(service("remote", "b", &[("http", 80, 8080)])).unwrap();
        cache.insert(endpoint_slice("remote-1", "b", "remote", "http", 8080, &[("10.0.1.1", true)])).unwrap();
        cache.insert(service("local", "a", &[("http", 80, 8080)])).unwrap();
        cache.insert(endpoint_slice("local-1", "a", "local", "http", 8080, &[("10.0.2.1", true)])).unwrap();
        cache
    }

    #[test]
    fn cross_namespace_backend_without_grant_is_dropped() {
        let output = build(&cross_namespace_cache(), "gw/g1");

        let parent = &output.route_statuses[0].parents[0];
        assert_eq!(condition_status(Some(&parent.conditions), RESOLVED_REFS), Some("False"));
        assert_eq!(parent.conditions[1].reason, "RefNotPermitted");
        assert!(backend(&output.config, "b/remote:80").is_none());
        assert!(backend(&output.config, "a/local:80").is_some());
        let Resource::HTTPRoute(route) = &output.config.resources[0] else { panic!("expected an HTTPRoute first") };
        assert!(route.spec.rules[0].backend_refs.is_empty());
    }

    #[test]
    fn cross_namespace_backend_with_grant_resolves() {
        let cache = cross_namespace_cache();
        cache.insert(reference_grant("allow", "b", "HTTPRoute", "a", "Service", Some("remote"))).unwrap();
        let output = build(&cache, "gw/g1");

        let parent = &output.route_statuses[0].parents[0];
        assert_eq!(condition_status(Some(&parent.conditions), RESOLVED_REFS), Some("True"));
        assert_eq!(backend(&output.config, "b/remote:80").unwrap().targets[0].address, "10.0.1.1");
    }

    #[test]
    fn backend_on_undeclared_service_port_is_not_found() {
        let cache = ResourceCache::new();
        cache.insert(gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)])).unwrap();
        cache.insert(service("svc", "gw", &[("http", 8080, 9090)])).unwrap();
        cache.insert(http_route("r1", "gw", "g1", &["svc:1234"])).unwrap();
        let output = build(&cache, "gw/g1");

        let parent = &output.route_statuses[0].parents[0];
        assert_eq!(condition_status(Some(&parent.conditions), RESOLVED_REFS), Some("False"));
        assert_eq!(parent.conditions[1].reason, "BackendNotFound");
        let Resource::HTTPRoute(route) = &output.config.resources[0] else { panic!("expected an HTTPRoute first") };
        assert!(route.spec.rules[0].backend_refs.is_empty());
        assert!(backend(&output.config, "gw/svc:1234").is_none());
    }

    #[test]
    fn listener_of_other_kind_rejects_route() {
        let cache = ResourceCache::new();
        let mut gw = gateway("g1", "gw", "fgw", &[("tls", "TLS", 8443)]);
        gw.spec.listeners[0].tls = serde_json::from_value(serde_json::json!({"mode": "Passthrough"})).unwrap();
        cache.insert(gw).unwrap();
        cache.insert(service("svc", "gw", &[("http", 8080, 8080)])).unwrap();
        cache.insert(http_route("r1", "gw", "g1", &["svc:8080"])).unwrap();
        let output = build(&cache, "gw/g1");

        let accepted = &output.route_statuses[0].parents[0].conditions[0];
        assert_eq!((accepted.status.as_str(), accepted.reason.as_str()), ("False", "NotAllowedByListeners"));
        assert!(output.config.resources.is_empty());
        assert_eq!(output.config.gateway.spec.listeners[0].tls.as_ref().unwrap().mode, crate::apis::gateway::TlsModeType::Passthrough);
    }

    #[test]
    fn routes_sharing_a_hostname_merge_their_matches() {
        let cache = ResourceCache::new();
        cache.insert(gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)])).unwrap();
        cache.insert(service("svc", "gw", &[("http", 8080, 8080)])).unwrap();
        for (name, path, created) in [("short", "/", "2024-01-01T00:00:00Z"), ("long", "/api", "2024-01-02T00:00:00Z")] {
            let route: HTTPRoute = serde_json::from_value(serde_json::json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "HTTPRoute",
                "metadata": {"name": name, "namespace": "gw", "creationTimestamp": created},
                "spec": {
                    "parentRefs": [{"name": "g1"}],
                    "hostnames": ["a.example.com"],
                    "rules": [{"matches": [{"path": {"type": "PathPrefix", "value": path}}], "backendRefs": [{"name": "svc", "port": 8080}]}]
                }
            }))
            .unwrap();
            cache.insert(route).unwrap();
        }
        let output = build(&cache, "gw/g1");

        let Some(RouteTableSpec::L7 { hostnames, .. }) = route_table(&output.config, 80) else { panic!("expected an L7 table") };
        let routes: Vec<_> = hostnames["a.example.com"].matches.iter().map(|m| m.route.as_str()).collect();
        assert_eq!(routes, vec!["gw/long", "gw/short"]);
    }

    #[test]
    fn routes_only_reach_the_gateway_they_name() {
        let cache = s1_cache();
        cache.insert(gateway("g2", "gw", "fgw", &[("http", "HTTP", 8080)])).unwrap();
        let output = build(&cache, "gw/g2");

        assert!(output.route_statuses.is_empty());
        assert!(output.config.resources.is_empty());
        assert_eq!(output.config.gateway.spec.listeners[0].listen, 8080);
    }

    #[test]
    fn gateway_without_valid_listeners_leaves_routes_pending() {
        let cache = ResourceCache::new();
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        gw.status = None;
        cache.insert(gw).unwrap();
        cache.insert(http_route("r1", "gw", "g1", &[])).unwrap();
        let output = build(&cache, "gw/g1");

        let accepted = &output.route_statuses[0].parents[0].conditions[0];
        assert_eq!((accepted.status.as_str(), accepted.reason.as_str()), ("Unknown", "NotAcceptedYet"));
        assert!(output.config.gateway.spec.listeners.is_empty());
    }
}
