use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use k8s_openapi::api::{
    core::v1::{ConfigMap, Endpoints, Namespace, Secret, Service},
    discovery::v1::EndpointSlice,
};
use kube::ResourceExt;
use tracing::debug;

use super::ControllerError;
use crate::{
    apis::{
        gateway::{FromNamespaces, Gateway, GatewayClass, ReferenceGrant},
        policies::{
            AccessControlPolicy, BackendLBPolicy, BackendTLSPolicy, CircuitBreakingPolicy, FaultInjectionPolicy, GatewayTLSPolicy,
            HealthCheckPolicy, LoadBalancerPolicy, LocalPolicyTargetReference, PolicyTargetReference, RateLimitPolicy, RetryPolicy,
            SessionStickyPolicy, UpstreamTLSPolicy,
        },
        routes::{GRPCRoute, HTTPRoute, ParentReference, TCPRoute, TLSRoute, UDPRoute},
        service_import::ServiceImport,
    },
    cache::{CacheInner, Cached, BACKEND_INDEX, CONFIGMAP_INDEX, SECRET_INDEX},
    common::{self, is_target_ref_to_known_kind, object_key, RouteRefKey},
};

#[derive(Default, Debug)]
struct ActiveState {
    effective_class: Option<String>,
    active_gateways: BTreeMap<String, Arc<Gateway>>,
}

/// Decides whether a cache change can affect the output of any active Gateway.
pub struct Triggers {
    controller_name: String,
    use_endpoint_slices: bool,
    state: Mutex<ActiveState>,
}

impl Triggers {
    pub fn new(controller_name: &str, use_endpoint_slices: bool) -> Self {
        Self { controller_name: controller_name.to_owned(), use_endpoint_slices, state: Mutex::new(ActiveState::default()) }
    }

    /// Keys of the Gateways that are active after the last class or gateway event.
    pub fn active_gateways(&self) -> Result<BTreeMap<String, Arc<Gateway>>, ControllerError> {
        Ok(self.state.lock().map_err(|_| ControllerError::LockingError)?.active_gateways.clone())
    }

    fn is_active(&self, gateway_key: &str) -> Result<bool, ControllerError> {
        Ok(self.state.lock().map_err(|_| ControllerError::LockingError)?.active_gateways.contains_key(gateway_key))
    }

    /// Recomputes the effective class and the active set, returning the previous state.
    fn refresh(&self, snapshot: &CacheInner) -> Result<ActiveState, ControllerError> {
        let effective_class = common::effective_gateway_class(snapshot, &self.controller_name).map(|class| class.name_any());
        let active_gateways = common::active_gateways(snapshot, &self.controller_name);
        let mut state = self.state.lock().map_err(|_| ControllerError::LockingError)?;
        Ok(std::mem::replace(&mut *state, ActiveState { effective_class, active_gateways }))
    }

    fn routes_to_active_gateway(&self, namespace: &str, parent_refs: Option<&[ParentReference]>) -> Result<bool, ControllerError> {
        for parent_ref in parent_refs.unwrap_or_default() {
            let key = RouteRefKey::from_parent_ref(parent_ref, namespace);
            if key.is_gateway() && self.is_active(&key.resource_key.namespaced_name())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_routable_service(snapshot: &CacheInner, service_key: &str) -> bool {
        snapshot.http_routes.has_index_entry(BACKEND_INDEX, service_key)
            || snapshot.grpc_routes.has_index_entry(BACKEND_INDEX, service_key)
            || snapshot.tls_routes.has_index_entry(BACKEND_INDEX, service_key)
            || snapshot.tcp_routes.has_index_entry(BACKEND_INDEX, service_key)
            || snapshot.udp_routes.has_index_entry(BACKEND_INDEX, service_key)
    }

    fn referenced_by_active_gateway(&self, snapshot: &CacheInner, index: &str, key: &str) -> Result<bool, ControllerError> {
        for gateway in snapshot.gateways.list_by_index(index, key)? {
            if self.is_active(&object_key(gateway.as_ref()))? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// How one kind's events gate a rebuild. `old` is absent on create, `new` is absent on delete.
pub trait Trigger: Cached {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError>;
}

fn either<K, F>(old: Option<&K>, new: Option<&K>, mut check: F) -> Result<bool, ControllerError>
where
    F: FnMut(&K) -> Result<bool, ControllerError>,
{
    for object in old.into_iter().chain(new) {
        if check(object)? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Trigger for GatewayClass {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        let previous = triggers.refresh(snapshot)?;
        let current = triggers.state.lock().map_err(|_| ControllerError::LockingError)?.effective_class.clone();
        if previous.effective_class != current {
            debug!("effective gateway class changed {:?} -> {current:?}", previous.effective_class);
            return Ok(true);
        }
        either(old, new, |class| Ok(current.as_deref() == Some(class.name_any().as_str())))
    }
}

impl Trigger for Gateway {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        let previous = triggers.refresh(snapshot)?;
        either(old, new, |gateway| {
            let key = object_key(gateway);
            Ok(previous.active_gateways.contains_key(&key) || triggers.is_active(&key)?)
        })
    }
}

macro_rules! route_trigger {
    ($kind:ty) => {
        impl Trigger for $kind {
            fn is_effective(triggers: &Triggers, _snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
                either(old, new, |route| triggers.routes_to_active_gateway(&route.namespace().unwrap_or_default(), route.spec.parent_refs.as_deref()))
            }
        }
    };
}

route_trigger!(HTTPRoute);
route_trigger!(GRPCRoute);
route_trigger!(TLSRoute);
route_trigger!(TCPRoute);
route_trigger!(UDPRoute);

impl Trigger for Service {
    fn is_effective(_triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        either(old, new, |service| Ok(Triggers::is_routable_service(snapshot, &object_key(service))))
    }
}

impl Trigger for ServiceImport {
    fn is_effective(_triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        either(old, new, |import| Ok(Triggers::is_routable_service(snapshot, &object_key(import))))
    }
}

impl Trigger for EndpointSlice {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        if !triggers.use_endpoint_slices {
            return Ok(false);
        }
        either(old, new, |slice| {
            let namespace = slice.namespace().unwrap_or_default();
            Ok(slice
                .labels()
                .get("kubernetes.io/service-name")
                .is_some_and(|service| Triggers::is_routable_service(snapshot, &common::create_id(service, &namespace))))
        })
    }
}

impl Trigger for Endpoints {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        either(old, new, |endpoints| {
            let key = object_key(endpoints);
            if !Triggers::is_routable_service(snapshot, &key) {
                return Ok(false);
            }
            Ok(!triggers.use_endpoint_slices || snapshot.services.get(&key).is_some_and(|service| common::is_headless_without_selector(service)))
        })
    }
}

impl Trigger for Secret {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        either(old, new, |secret| {
            let key = object_key(secret);
            Ok(triggers.referenced_by_active_gateway(snapshot, SECRET_INDEX, &key)?
                || snapshot.upstream_tls_policies.has_index_entry(SECRET_INDEX, &key)
                || snapshot.backend_tls_policies.has_index_entry(SECRET_INDEX, &key))
        })
    }
}

impl Trigger for ConfigMap {
    fn is_effective(triggers: &Triggers, snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
        either(old, new, |config_map| {
            let key = object_key(config_map);
            Ok(triggers.referenced_by_active_gateway(snapshot, CONFIGMAP_INDEX, &key)?
                || snapshot.backend_tls_policies.has_index_entry(CONFIGMAP_INDEX, &key))
        })
    }
}

impl Trigger for ReferenceGrant {
    fn is_effective(_triggers: &Triggers, _snapshot: &CacheInner, _old: Option<&Self>, _new: Option<&Self>) -> Result<bool, ControllerError> {
        Ok(true)
    }
}

impl Trigger for Namespace {
    fn is_effective(triggers: &Triggers, _snapshot: &CacheInner, _old: Option<&Self>, _new: Option<&Self>) -> Result<bool, ControllerError> {
        let selects_by_label = triggers.active_gateways()?.values().any(|gateway| {
            gateway.spec.listeners.iter().any(|listener| {
                let from = listener.allowed_routes.as_ref().and_then(|allowed| allowed.namespaces.as_ref()).and_then(|namespaces| namespaces.from);
                from == Some(FromNamespaces::Selector)
            })
        });
        Ok(selects_by_label)
    }
}

macro_rules! policy_trigger {
    ($kind:ty) => {
        impl Trigger for $kind {
            fn is_effective(_triggers: &Triggers, _snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
                either(old, new, |policy| Ok(targets_known_kind(&policy.spec.target_ref)))
            }
        }
    };
    ($kind:ty, local) => {
        impl Trigger for $kind {
            fn is_effective(_triggers: &Triggers, _snapshot: &CacheInner, old: Option<&Self>, new: Option<&Self>) -> Result<bool, ControllerError> {
                either(old, new, |policy| Ok(policy.spec.target_refs.iter().any(local_targets_known_kind)))
            }
        }
    };
}

fn targets_known_kind(target_ref: &PolicyTargetReference) -> bool {
    is_target_ref_to_known_kind(&target_ref.group, &target_ref.kind)
}

fn local_targets_known_kind(target_ref: &LocalPolicyTargetReference) -> bool {
    is_target_ref_to_known_kind(&target_ref.group, &target_ref.kind)
}

policy_trigger!(RateLimitPolicy);
policy_trigger!(AccessControlPolicy);
policy_trigger!(FaultInjectionPolicy);
policy_trigger!(SessionStickyPolicy);
policy_trigger!(LoadBalancerPolicy);
policy_trigger!(CircuitBreakingPolicy);
policy_trigger!(HealthCheckPolicy);
policy_trigger!(RetryPolicy);
policy_trigger!(UpstreamTLSPolicy);
policy_trigger!(GatewayTLSPolicy);
policy_trigger!(BackendLBPolicy, local);
policy_trigger!(BackendTLSPolicy, local);
