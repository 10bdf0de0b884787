use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::{
    backends::{BackendRefError, BackendResolver, UnresolvedRefs},
    filters::{duplicate_filter, has_redirect, lower_filters},
    route_listener_matcher::{ListenerAttachment, ParentMatch, Rejection, RouteListenerMatcher, UNSUPPORTED_VALUE},
    route_table::{L7Match, MatchEntry, RouteTables},
    RouteStatusUpdate,
};
use crate::{
    apis::{
        gateway::{ProtocolType, TlsModeType},
        routes::{
            BackendRef, GRPCRoute, HTTPBackendRef, HTTPRoute, HTTPRouteFilter, HTTPRouteTimeouts, L4RouteRule, ParentReference, RouteParentStatus,
            RouteStatus, TCPRoute, TLSRoute, UDPRoute,
        },
        GATEWAY_API_GROUP, GRPC_ROUTE_KIND, HTTP_ROUTE_KIND, TCP_ROUTE_KIND, TLS_ROUTE_KIND, UDP_ROUTE_KIND,
    },
    cache::{CacheError, CacheInner, Cached, GATEWAY_INDEX},
    common::{create_id, new_condition, tls_mode, ReferenceFrom, ResourceKey, ServicePortName, ACCEPTED, PARTIALLY_INVALID},
    model::{BackendRefConfig, L4RouteSpec, L4RuleConfig, L7RouteSpec, L7RuleConfig, ObjectMeta, Resource, RouteMatchConfig, RouteResource},
    policy::PolicyEngine,
};

/// What the walker needs to know about a route kind.
pub trait RouteObject: Cached {
    const ROUTE_KIND: &'static str;

    fn parent_refs(&self) -> &[ParentReference];
    /// `None` for kinds without hostnames.
    fn hostnames(&self) -> Option<&[String]>;
    fn route_status(&self) -> Option<&RouteStatus>;
    fn set_route_status(&mut self, status: RouteStatus);
}

macro_rules! route_object {
    ($kind:ty, $route_kind:expr, |$route:ident| $hostnames:expr) => {
        impl RouteObject for $kind {
            const ROUTE_KIND: &'static str = $route_kind;

            fn parent_refs(&self) -> &[ParentReference] {
                self.spec.parent_refs.as_deref().unwrap_or_default()
            }

            fn hostnames(&self) -> Option<&[String]> {
                let $route = self;
                $hostnames
            }

            fn route_status(&self) -> Option<&RouteStatus> {
                self.status.as_ref()
            }

            fn set_route_status(&mut self, status: RouteStatus) {
                self.status = Some(status);
            }
        }
    };
}

route_object!(HTTPRoute, HTTP_ROUTE_KIND, |route| Some(route.spec.hostnames.as_deref().unwrap_or_default()));
route_object!(GRPCRoute, GRPC_ROUTE_KIND, |route| Some(route.spec.hostnames.as_deref().unwrap_or_default()));
route_object!(TLSRoute, TLS_ROUTE_KIND, |route| Some(route.spec.hostnames.as_deref().unwrap_or_default()));
route_object!(TCPRoute, TCP_ROUTE_KIND, |_route| None);
route_object!(UDPRoute, UDP_ROUTE_KIND, |_route| None);

/// Rule of an L7 route, GRPC rules having no timeouts.
struct L7Rule<'r, M> {
    matches: Vec<M>,
    filters: &'r [HTTPRouteFilter],
    backend_refs: &'r [HTTPBackendRef],
    timeouts: Option<HTTPRouteTimeouts>,
}

impl<'r, M: L7Match> L7Rule<'r, M> {
    fn new(matches: Option<&[M]>, filters: Option<&'r [HTTPRouteFilter]>, backend_refs: Option<&'r [HTTPBackendRef]>, timeouts: Option<HTTPRouteTimeouts>) -> Self {
        let matches = match matches {
            Some(matches) if !matches.is_empty() => matches.to_vec(),
            _ => vec![M::catch_all()],
        };
        Self { matches, filters: filters.unwrap_or_default(), backend_refs: backend_refs.unwrap_or_default(), timeouts }
    }
}

/// Everything the routes of one Gateway contribute to its configuration.
#[derive(Default)]
pub struct RouteContributions {
    pub resources: Vec<Resource>,
    pub services: BTreeSet<ServicePortName>,
    pub tables: RouteTables,
    pub statuses: Vec<RouteStatusUpdate>,
}

/// Walks the routes attached to one Gateway, kind by kind, oldest first.
pub struct RouteWalker<'a> {
    snapshot: &'a CacheInner,
    gateway_key: String,
    controller_name: &'a str,
    matcher: RouteListenerMatcher<'a>,
    resolver: BackendResolver<'a>,
    engine: PolicyEngine<'a>,
    output: RouteContributions,
}

impl<'a> RouteWalker<'a> {
    pub fn new(snapshot: &'a CacheInner, gateway_key: String, controller_name: &'a str, matcher: RouteListenerMatcher<'a>, use_endpoint_slices: bool) -> Self {
        Self {
            snapshot,
            gateway_key,
            controller_name,
            matcher,
            resolver: BackendResolver::new(snapshot, use_endpoint_slices),
            engine: PolicyEngine::new(snapshot),
            output: RouteContributions::default(),
        }
    }

    pub fn walk(mut self) -> Result<RouteContributions, CacheError> {
        for route in self.snapshot.http_routes.list_by_index_sorted(GATEWAY_INDEX, &self.gateway_key)? {
            let rules = route
                .spec
                .rules
                .iter()
                .flatten()
                .map(|rule| L7Rule::new(rule.matches.as_deref(), rule.filters.as_deref(), rule.backend_refs.as_deref(), rule.timeouts.clone()))
                .collect();
            self.l7_route(route.as_ref(), rules)?;
        }
        for route in self.snapshot.grpc_routes.list_by_index_sorted(GATEWAY_INDEX, &self.gateway_key)? {
            let rules = route
                .spec
                .rules
                .iter()
                .flatten()
                .map(|rule| L7Rule::new(rule.matches.as_deref(), rule.filters.as_deref(), rule.backend_refs.as_deref(), None))
                .collect();
            self.l7_route(route.as_ref(), rules)?;
        }
        for route in self.snapshot.tls_routes.list_by_index_sorted(GATEWAY_INDEX, &self.gateway_key)? {
            self.l4_route(route.as_ref(), &route.spec.rules, Resource::TLSRoute)?;
        }
        for route in self.snapshot.tcp_routes.list_by_index_sorted(GATEWAY_INDEX, &self.gateway_key)? {
            self.l4_route(route.as_ref(), &route.spec.rules, Resource::TCPRoute)?;
        }
        for route in self.snapshot.udp_routes.list_by_index_sorted(GATEWAY_INDEX, &self.gateway_key)? {
            self.l4_route(route.as_ref(), &route.spec.rules, Resource::UDPRoute)?;
        }
        Ok(self.output)
    }

    fn l7_route<R: RouteObject, M: L7Match>(&mut self, route: &R, rules: Vec<L7Rule<'_, M>>) -> Result<(), CacheError> {
        let namespace = route.namespace().unwrap_or_default();
        let name = route.name_any();
        let parents = self.matcher.match_route(R::ROUTE_KIND, &namespace, route.parent_refs(), route.hostnames());
        let attachments = merged_attachments(&parents);
        let from = ReferenceFrom { group: GATEWAY_API_GROUP, kind: R::ROUTE_KIND, namespace: &namespace };
        let mut services = BTreeSet::new();
        let mut unresolved = UnresolvedRefs::default();

        let mut conflict = None;
        let mut lowered = Vec::with_capacity(rules.len());
        for rule in rules {
            let duplicate = duplicate_filter(rule.filters)
                .or_else(|| rule.backend_refs.iter().find_map(|backend_ref| duplicate_filter(backend_ref.filters.as_deref().unwrap_or_default())));
            if let Some(filter_type) = duplicate {
                warn!("{} {namespace}/{name} dropping rule repeating the {filter_type:?} filter", R::ROUTE_KIND);
                conflict.get_or_insert_with(|| format!("filter {filter_type:?} may appear only once per rule or backend"));
                continue;
            }
            if rule.backend_refs.is_empty() && !has_redirect(rule.filters) {
                debug!("{} {namespace}/{name} dropping rule without backends", R::ROUTE_KIND);
                continue;
            }
            let filters = lower_filters(&self.resolver, &from, rule.filters, &mut services, &mut unresolved)?;
            let mut backend_refs = Vec::with_capacity(rule.backend_refs.len());
            for backend_ref in rule.backend_refs {
                let Some(mut config) = self.lower_backend_ref(&from, &backend_ref.backend_ref, &mut services, &mut unresolved)? else {
                    continue;
                };
                config.filters = lower_filters(&self.resolver, &from, backend_ref.filters.as_deref().unwrap_or_default(), &mut services, &mut unresolved)?;
                backend_refs.push(config);
            }
            lowered.push(L7RuleConfig { matches: rule.matches, filters, backend_refs, timeouts: rule.timeouts });
        }

        if !attachments.is_empty() {
            let route_id = create_id(&name, &namespace);
            let mut entries = vec![];
            for rule in &lowered {
                for route_match in &rule.matches {
                    let match_ref = route_match.match_ref();
                    entries.push(MatchEntry {
                        created: route.meta().creation_timestamp.clone(),
                        config: RouteMatchConfig {
                            route: route_id.clone(),
                            route_match: route_match.clone().into_config(),
                            backend_refs: rule.backend_refs.clone(),
                            filters: rule.filters.clone(),
                            timeouts: rule.timeouts.clone(),
                            rate_limit: self.engine.match_rate_limit(R::ROUTE_KIND, &namespace, &name, &match_ref)?,
                            access_control_lists: self.engine.match_access_control(R::ROUTE_KIND, &namespace, &name, &match_ref)?,
                            fault_injection: self.engine.match_fault_injection(R::ROUTE_KIND, &namespace, &name, &match_ref)?,
                        },
                    });
                }
            }

            let mut hostnames = BTreeSet::new();
            for attachment in attachments.values() {
                for hostname in &attachment.hostnames {
                    if self.output.tables.add_l7(attachment.listener.port, hostname, M::ROUTE_TYPE, entries.clone()) {
                        hostnames.insert(hostname.clone());
                    } else {
                        warn!("{} {route_id} hostname {hostname} on port {} already serves another route type", R::ROUTE_KIND, attachment.listener.port);
                        conflict.get_or_insert_with(|| format!("hostname {hostname} on port {} already serves another route type", attachment.listener.port));
                    }
                }
            }
            self.output.services.extend(services);
            self.output.resources.push(M::resource(RouteResource {
                metadata: ObjectMeta { namespace: Some(namespace.clone()), name: name.clone() },
                spec: L7RouteSpec { hostnames: hostnames.into_iter().collect(), rules: lowered },
            }));
        }

        self.push_status(route, parents, &unresolved, conflict);
        Ok(())
    }

    fn l4_route<R: RouteObject>(&mut self, route: &R, rules: &[L4RouteRule], into_resource: fn(RouteResource<L4RouteSpec>) -> Resource) -> Result<(), CacheError> {
        let namespace = route.namespace().unwrap_or_default();
        let name = route.name_any();
        let parents = self.matcher.match_route(R::ROUTE_KIND, &namespace, route.parent_refs(), route.hostnames());
        let attachments = merged_attachments(&parents);
        let from = ReferenceFrom { group: GATEWAY_API_GROUP, kind: R::ROUTE_KIND, namespace: &namespace };
        let mut services = BTreeSet::new();
        let mut unresolved = UnresolvedRefs::default();

        let mut lowered = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut backend_refs = vec![];
            for backend_ref in rule.backend_refs.iter().flatten() {
                // Passthrough traffic only reaches Services of the route's own namespace.
                if R::ROUTE_KIND == TLS_ROUTE_KIND && backend_ref.namespace.as_ref().is_some_and(|ns| *ns != namespace) {
                    let error = BackendRefError::RefNotPermitted;
                    unresolved.record(error, format!("backend {} {}", backend_ref.name, error.reason()));
                    continue;
                }
                if let Some(config) = self.lower_backend_ref(&from, backend_ref, &mut services, &mut unresolved)? {
                    backend_refs.push(config);
                }
            }
            lowered.push(L4RuleConfig { backend_refs });
        }

        let mut conflict = None;
        if !attachments.is_empty() {
            let route_id = create_id(&name, &namespace);
            let backends: Vec<BackendRefConfig> = lowered.iter().flat_map(|rule| rule.backend_refs.iter().cloned()).collect();
            let mut hostnames = BTreeSet::new();
            for attachment in attachments.values() {
                let port = attachment.listener.port;
                match (attachment.listener.protocol, tls_mode(attachment.listener)) {
                    (ProtocolType::TLS, TlsModeType::Passthrough) => {
                        let Some(target) = backends.first() else {
                            continue;
                        };
                        for hostname in &attachment.hostnames {
                            if self.output.tables.add_passthrough(port, hostname, target.name.clone()) {
                                hostnames.insert(hostname.clone());
                            } else {
                                warn!("{} {route_id} hostname {hostname} on port {port} already passes through elsewhere", R::ROUTE_KIND);
                                conflict.get_or_insert_with(|| format!("hostname {hostname} on port {port} already passes through to another backend"));
                            }
                        }
                    },
                    (ProtocolType::TLS, TlsModeType::Terminate) => {
                        for hostname in &attachment.hostnames {
                            self.output.tables.add_terminate(port, hostname, backends.clone());
                        }
                    },
                    (ProtocolType::TCP, _) => self.output.tables.add_tcp(port, backends.clone()),
                    (ProtocolType::UDP, _) => self.output.tables.add_udp(port, backends.clone()),
                    (protocol, _) => debug!("{} {route_id} ignoring attachment to {protocol:?} listener", R::ROUTE_KIND),
                }
            }
            self.output.services.extend(services);
            self.output.resources.push(into_resource(RouteResource {
                metadata: ObjectMeta { namespace: Some(namespace.clone()), name: name.clone() },
                spec: L4RouteSpec { hostnames: hostnames.into_iter().collect(), rules: lowered },
            }));
        }

        self.push_status(route, parents, &unresolved, conflict);
        Ok(())
    }

    fn lower_backend_ref(
        &self,
        from: &ReferenceFrom,
        backend_ref: &BackendRef,
        services: &mut BTreeSet<ServicePortName>,
        unresolved: &mut UnresolvedRefs,
    ) -> Result<Option<BackendRefConfig>, CacheError> {
        match self.resolver.resolve(from, backend_ref)? {
            Ok(service) => {
                let config = BackendRefConfig::new(service.to_string(), backend_ref.weight.unwrap_or(1));
                services.insert(service);
                Ok(Some(config))
            },
            Err(error) => {
                debug!("{} {} backend {} {error:?}", from.kind, from.namespace, backend_ref.name);
                unresolved.record(error, format!("backend {} {}", backend_ref.name, error.reason()));
                Ok(None)
            },
        }
    }

    fn push_status<R: RouteObject>(&mut self, route: &R, parents: Vec<ParentMatch>, unresolved: &UnresolvedRefs, conflict: Option<String>) {
        let generation = route.meta().generation;
        let parents = parents
            .into_iter()
            .map(|parent| {
                let mut conditions = vec![];
                match parent.outcome {
                    Ok(_) => {
                        conditions.push(new_condition(ACCEPTED, true, ACCEPTED, "", generation));
                        conditions.push(unresolved.condition(generation));
                        if let Some(message) = &conflict {
                            conditions.push(new_condition(PARTIALLY_INVALID, true, UNSUPPORTED_VALUE, message, generation));
                        }
                    },
                    Err(rejection) => {
                        conditions.push(rejected(&rejection, generation));
                        if rejection.reason != UNSUPPORTED_VALUE {
                            conditions.push(unresolved.condition(generation));
                        }
                    },
                }
                RouteParentStatus { parent_ref: parent.parent_ref, controller_name: self.controller_name.to_owned(), conditions }
            })
            .collect();
        self.output.statuses.push(RouteStatusUpdate {
            kind: R::ROUTE_KIND,
            key: ResourceKey::from_resource(route),
            gateway: self.gateway_key.clone(),
            generation,
            parents,
        });
    }
}

fn rejected(rejection: &Rejection, generation: Option<i64>) -> Condition {
    let mut condition = new_condition(ACCEPTED, false, rejection.reason, &rejection.message, generation);
    rejection.status.clone_into(&mut condition.status);
    condition
}

/// Attachments of all accepted parent refs, one per listener.
fn merged_attachments<'a>(parents: &[ParentMatch<'a>]) -> BTreeMap<&'a str, ListenerAttachment<'a>> {
    let mut merged: BTreeMap<&str, ListenerAttachment> = BTreeMap::new();
    for attachment in parents.iter().filter_map(|parent| parent.outcome.as_ref().ok()).flatten() {
        merged
            .entry(attachment.listener.name.as_str())
            .and_modify(|existing| existing.hostnames.extend(attachment.hostnames.iter().cloned()))
            .or_insert_with(|| attachment.clone());
    }
    merged
}
