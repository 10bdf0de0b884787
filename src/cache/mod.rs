mod indexers;
mod store;

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, RwLock},
};

pub use indexers::{
    target_key, BACKEND_INDEX, CLASS_INDEX, CONFIGMAP_INDEX, GATEWAY_INDEX, SECRET_INDEX, SERVICE_NAME_INDEX, TARGET_INDEX,
    TARGET_KIND_INDEX,
};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Endpoints, Namespace, Secret, Service},
    discovery::v1::EndpointSlice,
};
use kube::Resource;
pub use store::{sort_resources, Store};

use crate::apis::{
    gateway::{Gateway, GatewayClass, ReferenceGrant},
    policies::{
        AccessControlPolicy, BackendLBPolicy, BackendTLSPolicy, CircuitBreakingPolicy, FaultInjectionPolicy, GatewayTLSPolicy,
        HealthCheckPolicy, LoadBalancerPolicy, RateLimitPolicy, RetryPolicy, SessionStickyPolicy, UpstreamTLSPolicy,
    },
    routes::{GRPCRoute, HTTPRoute, TCPRoute, TLSRoute, UDPRoute},
    service_import::ServiceImport,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    LockingError,
    #[error("index {0} points at missing object {1}")]
    StaleIndex(String, String),
}

/// Every watched kind, one store each. Stores are shared between snapshots until a write touches their kind.
#[derive(Clone, Default, Debug)]
pub struct CacheInner {
    pub gateway_classes: Arc<Store<GatewayClass>>,
    pub gateways: Arc<Store<Gateway>>,
    pub http_routes: Arc<Store<HTTPRoute>>,
    pub grpc_routes: Arc<Store<GRPCRoute>>,
    pub tls_routes: Arc<Store<TLSRoute>>,
    pub tcp_routes: Arc<Store<TCPRoute>>,
    pub udp_routes: Arc<Store<UDPRoute>>,
    pub reference_grants: Arc<Store<ReferenceGrant>>,
    pub services: Arc<Store<Service>>,
    pub service_imports: Arc<Store<ServiceImport>>,
    pub endpoint_slices: Arc<Store<EndpointSlice>>,
    pub endpoints: Arc<Store<Endpoints>>,
    pub secrets: Arc<Store<Secret>>,
    pub config_maps: Arc<Store<ConfigMap>>,
    pub namespaces: Arc<Store<Namespace>>,
    pub rate_limit_policies: Arc<Store<RateLimitPolicy>>,
    pub access_control_policies: Arc<Store<AccessControlPolicy>>,
    pub fault_injection_policies: Arc<Store<FaultInjectionPolicy>>,
    pub session_sticky_policies: Arc<Store<SessionStickyPolicy>>,
    pub load_balancer_policies: Arc<Store<LoadBalancerPolicy>>,
    pub circuit_breaking_policies: Arc<Store<CircuitBreakingPolicy>>,
    pub health_check_policies: Arc<Store<HealthCheckPolicy>>,
    pub retry_policies: Arc<Store<RetryPolicy>>,
    pub upstream_tls_policies: Arc<Store<UpstreamTLSPolicy>>,
    pub gateway_tls_policies: Arc<Store<GatewayTLSPolicy>>,
    pub backend_lb_policies: Arc<Store<BackendLBPolicy>>,
    pub backend_tls_policies: Arc<Store<BackendTLSPolicy>>,
}

/// Immutable view of the cache taken at one instant.
pub type Snapshot = Arc<CacheInner>;

/// A kind the cache can hold.
pub trait Cached: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn store(cache: &CacheInner) -> &Store<Self>;
    fn store_mut(cache: &mut CacheInner) -> &mut Store<Self>;
    fn index_values(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

macro_rules! cached {
    ($kind:ty, $field:ident) => {
        cached!($kind, $field, |_| Vec::new());
    };
    ($kind:ty, $field:ident, $indexer:expr) => {
        impl Cached for $kind {
            fn store(cache: &CacheInner) -> &Store<Self> {
                &cache.$field
            }
            fn store_mut(cache: &mut CacheInner) -> &mut Store<Self> {
                Arc::make_mut(&mut cache.$field)
            }
            fn index_values(&self) -> Vec<(&'static str, String)> {
                let indexer: fn(&Self) -> Vec<(&'static str, String)> = $indexer;
                indexer(self)
            }
        }
    };
}

cached!(GatewayClass, gateway_classes);
cached!(Gateway, gateways, indexers::gateway);
cached!(HTTPRoute, http_routes, indexers::http_route);
cached!(GRPCRoute, grpc_routes, indexers::grpc_route);
cached!(TLSRoute, tls_routes, |route| indexers::l4_route(route, route.spec.parent_refs.as_deref(), &route.spec.rules));
cached!(TCPRoute, tcp_routes, |route| indexers::l4_route(route, route.spec.parent_refs.as_deref(), &route.spec.rules));
cached!(UDPRoute, udp_routes, |route| indexers::l4_route(route, route.spec.parent_refs.as_deref(), &route.spec.rules));
cached!(ReferenceGrant, reference_grants, indexers::reference_grant);
cached!(Service, services);
cached!(ServiceImport, service_imports);
cached!(EndpointSlice, endpoint_slices, indexers::endpoint_slice);
cached!(Endpoints, endpoints);
cached!(Secret, secrets);
cached!(ConfigMap, config_maps);
cached!(Namespace, namespaces);
cached!(RateLimitPolicy, rate_limit_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(AccessControlPolicy, access_control_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(FaultInjectionPolicy, fault_injection_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(SessionStickyPolicy, session_sticky_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(LoadBalancerPolicy, load_balancer_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(CircuitBreakingPolicy, circuit_breaking_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(HealthCheckPolicy, health_check_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(RetryPolicy, retry_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(UpstreamTLSPolicy, upstream_tls_policies, indexers::upstream_tls_policy);
cached!(GatewayTLSPolicy, gateway_tls_policies, |p| indexers::policy_target(p, &p.spec.target_ref));
cached!(BackendLBPolicy, backend_lb_policies, |p| indexers::local_policy_targets(p, &p.spec.target_refs));
cached!(BackendTLSPolicy, backend_tls_policies, indexers::backend_tls_policy);

/// Thread-safe, copy-on-write resource cache. Writers never block readers holding a snapshot.
///
/// Writers are serialized on `working`; readers only ever take the `published` lock long enough to clone or swap an `Arc`.
#[derive(Clone, Default)]
pub struct ResourceCache {
    working: Arc<Mutex<CacheInner>>,
    published: Arc<RwLock<Snapshot>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `change` to the store of `K` and publishes the result as the next snapshot.
    fn write<K: Cached, T>(&self, change: impl FnOnce(&mut Store<K>) -> T) -> Result<T, CacheError> {
        let mut working = self.working.lock().map_err(|_| CacheError::LockingError)?;
        let result = change(K::store_mut(&mut working));
        let next = Arc::new(working.clone());
        *self.published.write().map_err(|_| CacheError::LockingError)? = next;
        Ok(result)
    }

    /// Stores the object and returns the version it replaced.
    pub fn insert<K: Cached>(&self, object: K) -> Result<Option<Arc<K>>, CacheError> {
        let index_values = object.index_values();
        self.write(|store: &mut Store<K>| store.insert(object, index_values))
    }

    pub fn update<K: Cached>(&self, _old: &K, new: K) -> Result<Option<Arc<K>>, CacheError> {
        self.insert(new)
    }

    pub fn delete<K: Cached>(&self, object: &K) -> Result<Option<Arc<K>>, CacheError> {
        let key = crate::common::object_key(object);
        self.write(|store: &mut Store<K>| store.delete(&key))
    }

    /// Drops every object of kind `K` whose key is not in `keys`, returning the dropped objects.
    pub fn retain<K: Cached>(&self, keys: &BTreeSet<String>) -> Result<Vec<Arc<K>>, CacheError> {
        self.write(|store: &mut Store<K>| {
            let stale: Vec<_> = store.list().map(|object| crate::common::object_key(object.as_ref())).filter(|key| !keys.contains(key)).collect();
            stale.iter().filter_map(|key| store.delete(key)).collect()
        })
    }

    pub fn get<K: Cached>(&self, key: &str) -> Result<Option<Arc<K>>, CacheError> {
        let lock = self.published.read().map_err(|_| CacheError::LockingError)?;
        Ok(K::store(&lock).get(key).cloned())
    }

    pub fn snapshot(&self) -> Result<Snapshot, CacheError> {
        let lock = self.published.read().map_err(|_| CacheError::LockingError)?;
        Ok(Arc::clone(&lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test::{gateway, http_route};

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let cache = ResourceCache::new();
        cache.insert(gateway("gw", "gw", "fgw", &[("http", "HTTP", 80)])).unwrap();
        let before = cache.snapshot().unwrap();

        cache.insert(http_route("route", "gw", "gw", &["svc:8080"])).unwrap();
        let after = cache.snapshot().unwrap();

        assert!(before.http_routes.is_empty());
        assert_eq!(after.http_routes.len(), 1);
        assert_eq!(after.http_routes.list_by_index(GATEWAY_INDEX, "gw/gw").unwrap().len(), 1);
        assert_eq!(after.http_routes.list_by_index(BACKEND_INDEX, "gw/svc").unwrap().len(), 1);
    }

    #[test]
    fn untouched_kinds_are_shared_between_snapshots() {
        let cache = ResourceCache::new();
        cache.insert(gateway("gw", "gw", "fgw", &[("http", "HTTP", 80)])).unwrap();
        let before = cache.snapshot().unwrap();

        cache.insert(http_route("route", "gw", "gw", &["svc:8080"])).unwrap();
        let after = cache.snapshot().unwrap();

        assert!(Arc::ptr_eq(&before.gateways, &after.gateways));
        assert!(!Arc::ptr_eq(&before.http_routes, &after.http_routes));
        assert_eq!(before.gateways.len(), 1);
    }

    #[test]
    fn update_moves_route_between_gateways() {
        let cache = ResourceCache::new();
        let old = http_route("route", "gw", "gw-a", &["svc:8080"]);
        cache.insert(old.clone()).unwrap();
        let replaced = cache.update(&old, http_route("route", "gw", "gw-b", &["svc:8080"])).unwrap();
        assert!(replaced.is_some());

        let snapshot = cache.snapshot().unwrap();
        assert!(snapshot.http_routes.list_by_index(GATEWAY_INDEX, "gw/gw-a").unwrap().is_empty());
        assert_eq!(snapshot.http_routes.list_by_index(GATEWAY_INDEX, "gw/gw-b").unwrap().len(), 1);
    }

    #[test]
    fn delete_returns_object_and_get_misses() {
        let cache = ResourceCache::new();
        let route = http_route("route", "gw", "gw", &["svc:8080"]);
        cache.insert(route.clone()).unwrap();
        assert!(cache.delete(&route).unwrap().is_some());
        assert!(cache.get::<HTTPRoute>("gw/route").unwrap().is_none());
        assert!(!cache.snapshot().unwrap().http_routes.has_index_entry(BACKEND_INDEX, "gw/svc"));
    }

    #[test]
    fn retain_drops_objects_missing_from_relist() {
        let cache = ResourceCache::new();
        cache.insert(http_route("kept", "gw", "gw", &["svc:8080"])).unwrap();
        cache.insert(http_route("gone", "gw", "gw", &["svc:8080"])).unwrap();
        let dropped = cache.retain::<HTTPRoute>(&BTreeSet::from(["gw/kept".to_owned()])).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(crate::common::object_key(dropped[0].as_ref()), "gw/gone");
        assert_eq!(cache.snapshot().unwrap().http_routes.len(), 1);
    }
}
