use std::{fmt::Debug, marker::PhantomData, slice};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, span, warn, Instrument, Level};
use typed_builder::TypedBuilder;

use crate::{
    apis::{
        gateway::{Gateway, ListenerStatus},
        routes::{GRPCRoute, HTTPRoute, RouteParentStatus, TCPRoute, TLSRoute, UDPRoute},
        GATEWAY_KIND, GRPC_ROUTE_KIND, HTTP_ROUTE_KIND, TCP_ROUTE_KIND, TLS_ROUTE_KIND, UDP_ROUTE_KIND,
    },
    cache::{CacheInner, Cached},
    common::{is_ref_to_gateway, same_conditions, ResourceKey, RESOLVED_REFS},
    processor::{GatewayStatusUpdate, RouteObject, RouteStatusUpdate},
};

const CONFLICT_RETRIES: usize = 3;

/// Conditions keep the transition time of the condition they replace when the status did not flip.
fn keep_transition_times(existing: &[Condition], conditions: &mut [Condition]) {
    for condition in conditions {
        if let Some(old) = existing.iter().find(|old| old.type_ == condition.type_ && old.status == condition.status) {
            condition.last_transition_time = old.last_transition_time.clone();
        }
    }
}

fn same_parents(left: &[RouteParentStatus], right: &[RouteParentStatus]) -> bool {
    left.len() == right.len()
        && left.iter().all(|parent| {
            right.iter().any(|other| {
                other.parent_ref == parent.parent_ref && other.controller_name == parent.controller_name && same_conditions(&other.conditions, &parent.conditions)
            })
        })
}

fn gateway_key(update: &RouteStatusUpdate) -> ResourceKey {
    let (namespace, name) = update.gateway.split_once('/').unwrap_or_default();
    ResourceKey::new(GATEWAY_KIND, namespace, name)
}

/// Parents the route should carry once `update` is applied, `None` when they already do.
///
/// Parents written by other controllers are kept. Our own parents are kept when they belong to
/// another Gateway and the route still names them.
pub fn merged_parents<R: RouteObject>(route: &R, controller_name: &str, update: &RouteStatusUpdate) -> Option<Vec<RouteParentStatus>> {
    let namespace = route.namespace().unwrap_or_default();
    let gateway = gateway_key(update);
    let current = route.route_status().map(|status| status.parents.as_slice()).unwrap_or_default();

    let mut parents: Vec<_> = current
        .iter()
        .filter(|parent| {
            parent.controller_name != controller_name
                || (!is_ref_to_gateway(&parent.parent_ref, &namespace, &gateway)
                    && route.parent_refs().contains(&parent.parent_ref)
                    && !update.parents.iter().any(|updated| updated.parent_ref == parent.parent_ref))
        })
        .cloned()
        .collect();
    for updated in &update.parents {
        let mut updated = updated.clone();
        if let Some(existing) = current.iter().find(|parent| parent.controller_name == controller_name && parent.parent_ref == updated.parent_ref) {
            keep_transition_times(&existing.conditions, &mut updated.conditions);
        }
        parents.push(updated);
    }

    (!same_parents(current, &parents)).then_some(parents)
}

/// Listener statuses once the `ResolvedRefs` conditions of `update` are applied, `None` when unchanged.
pub fn merged_listeners(gateway: &Gateway, update: &GatewayStatusUpdate) -> Option<Vec<ListenerStatus>> {
    let mut listeners = gateway.status.as_ref().and_then(|status| status.listeners.clone()).unwrap_or_default();
    let mut changed = false;
    for (name, condition) in &update.listeners {
        let index = if let Some(index) = listeners.iter().position(|listener| &listener.name == name) {
            index
        } else {
            listeners.push(ListenerStatus { name: name.clone(), ..Default::default() });
            listeners.len() - 1
        };
        let conditions = &mut listeners[index].conditions;
        let mut condition = condition.clone();
        match conditions.iter().position(|existing| existing.type_ == RESOLVED_REFS) {
            Some(index) if same_conditions(slice::from_ref(&conditions[index]), slice::from_ref(&condition)) => {},
            Some(index) => {
                keep_transition_times(slice::from_ref(&conditions[index]), slice::from_mut(&mut condition));
                conditions[index] = condition;
                changed = true;
            },
            None => {
                conditions.push(condition);
                changed = true;
            },
        }
    }
    changed.then_some(listeners)
}

#[derive(Clone, TypedBuilder)]
pub struct StatusChannels {
    http_routes: mpsc::Sender<RouteStatusUpdate>,
    grpc_routes: mpsc::Sender<RouteStatusUpdate>,
    tls_routes: mpsc::Sender<RouteStatusUpdate>,
    tcp_routes: mpsc::Sender<RouteStatusUpdate>,
    udp_routes: mpsc::Sender<RouteStatusUpdate>,
    gateways: mpsc::Sender<GatewayStatusUpdate>,
}

/// Channels whose HTTPRoute and Gateway receivers are handed back, the others being closed.
#[cfg(test)]
pub fn test_channels() -> (StatusChannels, mpsc::Receiver<RouteStatusUpdate>, mpsc::Receiver<GatewayStatusUpdate>) {
    let (http, http_receiver) = mpsc::channel(16);
    let (gateways, gateway_receiver) = mpsc::channel(16);
    let channels = StatusChannels::builder()
        .http_routes(http)
        .grpc_routes(mpsc::channel(1).0)
        .tls_routes(mpsc::channel(1).0)
        .tcp_routes(mpsc::channel(1).0)
        .udp_routes(mpsc::channel(1).0)
        .gateways(gateways)
        .build();
    (channels, http_receiver, gateway_receiver)
}

/// Forwards the statuses of a rebuild to the patchers, dropping those the snapshot already carries.
pub struct StatusShaper {
    controller_name: String,
    channels: StatusChannels,
}

impl StatusShaper {
    pub fn new(controller_name: &str, channels: StatusChannels) -> Self {
        Self { controller_name: controller_name.to_owned(), channels }
    }

    fn route_changed<R: RouteObject>(&self, snapshot: &CacheInner, update: &RouteStatusUpdate) -> bool {
        R::store(snapshot)
            .get(&update.key.namespaced_name())
            .is_some_and(|route| merged_parents(route.as_ref(), &self.controller_name, update).is_some())
    }

    /// Returns how many updates were sent.
    pub async fn send(&self, snapshot: &CacheInner, routes: Vec<RouteStatusUpdate>, gateway: GatewayStatusUpdate) -> usize {
        let mut sent = 0;
        for update in routes {
            let (changed, sender) = match update.kind {
                HTTP_ROUTE_KIND => (self.route_changed::<HTTPRoute>(snapshot, &update), &self.channels.http_routes),
                GRPC_ROUTE_KIND => (self.route_changed::<GRPCRoute>(snapshot, &update), &self.channels.grpc_routes),
                TLS_ROUTE_KIND => (self.route_changed::<TLSRoute>(snapshot, &update), &self.channels.tls_routes),
                TCP_ROUTE_KIND => (self.route_changed::<TCPRoute>(snapshot, &update), &self.channels.tcp_routes),
                UDP_ROUTE_KIND => (self.route_changed::<UDPRoute>(snapshot, &update), &self.channels.udp_routes),
                kind => {
                    warn!("no status channel for {kind}");
                    continue;
                },
            };
            if !changed {
                debug!("{} status unchanged", update.key);
                continue;
            }
            let key = update.key.clone();
            if sender.send(update).await.is_err() {
                warn!("status channel closed, dropping {key}");
            } else {
                sent += 1;
            }
        }

        let gateway_changed = snapshot
            .gateways
            .get(&gateway.key.namespaced_name())
            .is_some_and(|current| merged_listeners(current, &gateway).is_some());
        if gateway_changed {
            let key = gateway.key.clone();
            if self.channels.gateways.send(gateway).await.is_err() {
                warn!("status channel closed, dropping {key}");
            } else {
                sent += 1;
            }
        }
        sent
    }
}

#[async_trait]
pub trait Patcher<R>
where
    R: DeserializeOwned + Clone + Debug + Serialize,
    R: Resource<DynamicType = ()>,
    R: Send + Sync + 'static,
{
    type Update: Send + Sync + 'static;

    fn receiver(&mut self) -> &mut mpsc::Receiver<Self::Update>;
    fn api(&self, namespace: &str) -> Api<R>;
    fn key(update: &Self::Update) -> &ResourceKey;
    /// The new `status` of `current`, `None` when nothing changes.
    fn status_patch(&self, current: &R, update: &Self::Update) -> Option<serde_json::Value>;

    async fn start(&mut self) -> crate::Result<()> {
        while let Some(update) = self.receiver().recv().await {
            let resource_key = Self::key(&update).clone();
            let span = span!(Level::INFO, "PatcherService", resource = %std::any::type_name::<R>(), operation = "PatchStatus", id = %resource_key);
            let api = self.api(&resource_key.namespace);

            for _ in 0..CONFLICT_RETRIES {
                let current = match api.get_opt(&resource_key.name).instrument(span.clone()).await {
                    Ok(Some(current)) => current,
                    Ok(None) => {
                        span.in_scope(|| debug!("resource gone, status dropped"));
                        break;
                    },
                    Err(e) => {
                        span.in_scope(|| warn!("unable to read resource {e:?}"));
                        break;
                    },
                };
                let Some(status) = self.status_patch(&current, &update) else {
                    span.in_scope(|| debug!("status unchanged"));
                    break;
                };
                let patch = json!({"metadata": {"resourceVersion": current.resource_version()}, "status": status});
                let res = api.patch_status(&resource_key.name, &PatchParams::default(), &Patch::Merge(&patch)).instrument(span.clone()).await;
                match res {
                    Ok(_) => {
                        span.in_scope(|| info!("patch status result ok"));
                        break;
                    },
                    Err(kube::Error::Api(response)) if response.code == 409 => {
                        span.in_scope(|| debug!("conflict, retrying"));
                    },
                    Err(e) => {
                        span.in_scope(|| warn!("patch status failed {e:?}"));
                        break;
                    },
                }
            }
        }
        crate::Result::<()>::Ok(())
    }
}

#[derive(TypedBuilder)]
pub struct RoutePatcherService<R> {
    client: Client,
    controller_name: String,
    receiver: mpsc::Receiver<RouteStatusUpdate>,
    #[builder(default, setter(skip))]
    kind: PhantomData<R>,
}

impl<R> Patcher<R> for RoutePatcherService<R>
where
    R: RouteObject + DeserializeOwned + Serialize + Debug,
    R: Resource<Scope = kube_core::NamespaceResourceScope>,
{
    type Update = RouteStatusUpdate;

    fn receiver(&mut self) -> &mut mpsc::Receiver<RouteStatusUpdate> {
        &mut self.receiver
    }

    fn api(&self, namespace: &str) -> Api<R> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn key(update: &RouteStatusUpdate) -> &ResourceKey {
        &update.key
    }

    fn status_patch(&self, current: &R, update: &RouteStatusUpdate) -> Option<serde_json::Value> {
        merged_parents(current, &self.controller_name, update).map(|parents| json!({"parents": parents}))
    }
}

#[derive(TypedBuilder)]
pub struct GatewayPatcherService {
    client: Client,
    receiver: mpsc::Receiver<GatewayStatusUpdate>,
}

impl Patcher<Gateway> for GatewayPatcherService {
    type Update = GatewayStatusUpdate;

    fn receiver(&mut self) -> &mut mpsc::Receiver<GatewayStatusUpdate> {
        &mut self.receiver
    }

    fn api(&self, namespace: &str) -> Api<Gateway> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn key(update: &GatewayStatusUpdate) -> &ResourceKey {
        &update.key
    }

    fn status_patch(&self, current: &Gateway, update: &GatewayStatusUpdate) -> Option<serde_json::Value> {
        merged_listeners(current, update).map(|listeners| json!({"listeners": listeners}))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::DateTime};

    use super::*;
    use crate::{
        apis::routes::{ParentReference, RouteStatus},
        cache::ResourceCache,
        common::{
            new_condition,
            test::{gateway, http_route},
            ACCEPTED,
        },
    };

    const CONTROLLER: &str = "flomesh.io/gateway-controller";

    fn parent(name: &str, controller_name: &str, accepted: bool) -> RouteParentStatus {
        RouteParentStatus {
            parent_ref: ParentReference { name: name.to_owned(), ..Default::default() },
            controller_name: controller_name.to_owned(),
            conditions: vec![new_condition(ACCEPTED, accepted, if accepted { "Accepted" } else { "NoMatchingParent" }, "", Some(1))],
        }
    }

    fn update(gateway: &str) -> RouteStatusUpdate {
        RouteStatusUpdate {
            kind: HTTP_ROUTE_KIND,
            key: ResourceKey::new(HTTP_ROUTE_KIND, "gw", "web"),
            gateway: format!("gw/{gateway}"),
            generation: Some(1),
            parents: vec![parent(gateway, CONTROLLER, true)],
        }
    }

    fn route_with_parents(parent_refs: &[&str], parents: Vec<RouteParentStatus>) -> HTTPRoute {
        let mut route = http_route("web", "gw", parent_refs[0], &["svc:8080"]);
        route.spec.parent_refs = Some(parent_refs.iter().map(|name| ParentReference { name: (*name).to_owned(), ..Default::default() }).collect());
        route.status = Some(RouteStatus { parents });
        route
    }

    #[test]
    fn parents_of_other_controllers_and_gateways_are_kept() {
        let route = route_with_parents(&["g1", "g2"], vec![parent("g1", "other.io/controller", false), parent("g2", CONTROLLER, true), parent("g1", CONTROLLER, false)]);

        let parents = merged_parents(&route, CONTROLLER, &update("g1")).unwrap();

        assert_eq!(parents.len(), 3);
        assert_eq!(parents[0].controller_name, "other.io/controller");
        assert_eq!(parents[1].parent_ref.name, "g2");
        assert_eq!(parents[2].parent_ref.name, "g1");
        assert_eq!(parents[2].conditions[0].status, "True");
    }

    #[test]
    fn parents_no_longer_named_by_the_route_are_dropped() {
        let route = route_with_parents(&["g1"], vec![parent("g2", CONTROLLER, true)]);
        let parents = merged_parents(&route, CONTROLLER, &update("g1")).unwrap();
        assert_eq!(parents.iter().map(|parent| parent.parent_ref.name.as_str()).collect::<Vec<_>>(), vec!["g1"]);
    }

    #[test]
    fn identical_conditions_are_not_patched() {
        let mut existing = parent("g1", CONTROLLER, true);
        existing.conditions[0].last_transition_time = Time(DateTime::from_timestamp(0, 0).unwrap_or_default());
        existing.conditions[0].observed_generation = Some(0);
        let route = route_with_parents(&["g1"], vec![existing]);

        assert!(merged_parents(&route, CONTROLLER, &update("g1")).is_none());
    }

    #[test]
    fn changed_message_keeps_transition_time() {
        let mut existing = parent("g1", CONTROLLER, true);
        let epoch = Time(DateTime::from_timestamp(0, 0).unwrap_or_default());
        existing.conditions[0].last_transition_time = epoch.clone();
        existing.conditions[0].message = "old".to_owned();
        let route = route_with_parents(&["g1"], vec![existing]);

        let parents = merged_parents(&route, CONTROLLER, &update("g1")).unwrap();
        assert_eq!(parents[0].conditions[0].last_transition_time, epoch);
        assert_eq!(parents[0].conditions[0].message, "");
    }

    #[test]
    fn listener_resolved_refs_condition_is_replaced() {
        let gw = gateway("g1", "gw", "fgw", &[("https", "HTTPS", 443)]);
        let failed = new_condition(RESOLVED_REFS, false, "InvalidCertificateRef", "secret missing", Some(1));
        let gateway_update = GatewayStatusUpdate { key: ResourceKey::from_resource(&gw), listeners: BTreeMap::from([("https".to_owned(), failed)]) };

        let listeners = merged_listeners(&gw, &gateway_update).unwrap();

        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].conditions.len(), 3);
        let resolved = listeners[0].conditions.iter().find(|condition| condition.type_ == RESOLVED_REFS).unwrap();
        assert_eq!(resolved.reason, "InvalidCertificateRef");
        assert!(listeners[0].conditions.iter().any(|condition| condition.type_ == ACCEPTED && condition.status == "True"));
    }

    #[tokio::test]
    async fn statuses_already_present_are_not_sent_again() {
        let cache = ResourceCache::new();
        let gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        cache.insert(gw.clone()).unwrap();
        cache.insert(http_route("web", "gw", "g1", &["svc:8080"])).unwrap();
        let (channels, mut routes, _gateways) = test_channels();
        let shaper = StatusShaper::new(CONTROLLER, channels);
        let no_listener_change = || GatewayStatusUpdate { key: ResourceKey::from_resource(&gw), listeners: BTreeMap::new() };

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(shaper.send(&snapshot, vec![update("g1")], no_listener_change()).await, 1);
        let sent = routes.recv().await.unwrap();

        let mut patched = http_route("web", "gw", "g1", &["svc:8080"]);
        patched.status = Some(RouteStatus { parents: sent.parents });
        cache.insert(patched).unwrap();

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(shaper.send(&snapshot, vec![update("g1")], no_listener_change()).await, 0);
        assert!(routes.try_recv().is_err());
    }
}
