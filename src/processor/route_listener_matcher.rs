use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use tracing::debug;

use crate::{
    apis::{
        gateway::{FromNamespaces, Gateway, Listener},
        routes::ParentReference,
        GATEWAY_API_GROUP, GATEWAY_KIND,
    },
    cache::CacheInner,
    common::{default_route_kinds, hostname, label_selector, valid_listeners, ResourceKey, RouteRefKey, DEFAULT_ROUTE_HOSTNAME},
};

pub const NOT_ACCEPTED_YET: &str = "NotAcceptedYet";
pub const NO_MATCHING_PARENT: &str = "NoMatchingParent";
pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
pub const NO_MATCHING_LISTENER_HOSTNAME: &str = "NoMatchingListenerHostname";
pub const UNSUPPORTED_VALUE: &str = "UnsupportedValue";

/// A listener a route attaches to, with the hostnames it serves there.
#[derive(Debug, Clone)]
pub struct ListenerAttachment<'a> {
    pub listener: &'a Listener,
    pub hostnames: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// `False`, or `Unknown` while the Gateway has no valid listener.
    pub status: &'static str,
    pub reason: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(status: &'static str, reason: &'static str, message: String) -> Self {
        Self { status, reason, message }
    }
}

#[derive(Debug, Clone)]
pub struct ParentMatch<'a> {
    pub parent_ref: ParentReference,
    pub outcome: Result<Vec<ListenerAttachment<'a>>, Rejection>,
}

pub struct RouteListenerMatcher<'a> {
    snapshot: &'a CacheInner,
    gateway_key: ResourceKey,
    listeners: Vec<&'a Listener>,
}

impl<'a> RouteListenerMatcher<'a> {
    pub fn new(snapshot: &'a CacheInner, gateway: &'a Gateway) -> Self {
        Self {
            snapshot,
            gateway_key: ResourceKey::new(GATEWAY_KIND, &gateway.namespace().unwrap_or_default(), &gateway.name_any()).with_group(GATEWAY_API_GROUP),
            listeners: valid_listeners(gateway),
        }
    }

    pub fn listeners(&self) -> &[&'a Listener] {
        &self.listeners
    }

    /// Evaluates every parentRef of a route that concerns this Gateway. Parent refs to other Gateways are skipped.
    /// `route_hostnames` is `None` for kinds without hostnames.
    pub fn match_route(&self, route_kind: &str, route_namespace: &str, parent_refs: &[ParentReference], route_hostnames: Option<&[String]>) -> Vec<ParentMatch<'a>> {
        let mut matches = vec![];
        for parent_ref in parent_refs {
            let key = RouteRefKey::from_parent_ref(parent_ref, route_namespace);
            if !key.is_gateway() {
                let message = format!("parent {}/{} is not a Gateway", key.resource_key.group, key.resource_key.kind);
                matches.push(ParentMatch { parent_ref: parent_ref.clone(), outcome: Err(Rejection::new("False", UNSUPPORTED_VALUE, message)) });
                continue;
            }
            if key.resource_key.namespace != self.gateway_key.namespace || key.resource_key.name != self.gateway_key.name {
                continue;
            }
            let outcome = self.attach(route_kind, route_namespace, &key, route_hostnames);
            debug!("{route_kind} {route_namespace} parent {} outcome {:?}", self.gateway_key, outcome.as_ref().map(Vec::len));
            matches.push(ParentMatch { parent_ref: parent_ref.clone(), outcome });
        }
        matches
    }

    fn attach(&self, route_kind: &str, route_namespace: &str, key: &RouteRefKey, route_hostnames: Option<&[String]>) -> Result<Vec<ListenerAttachment<'a>>, Rejection> {
        if self.listeners.is_empty() {
            return Err(Rejection::new("Unknown", NOT_ACCEPTED_YET, format!("{} has no valid listener yet", self.gateway_key)));
        }

        let by_parent: Vec<_> = self
            .listeners
            .iter()
            .filter(|listener| key.section_name.as_ref().is_none_or(|section| *section == listener.name))
            .filter(|listener| key.port.is_none_or(|port| port == listener.port))
            .collect();
        if by_parent.is_empty() {
            return Err(Rejection::new("False", NO_MATCHING_PARENT, format!("no listener of {} matches the parent reference", self.gateway_key)));
        }

        let allowed: Vec<_> = by_parent
            .into_iter()
            .filter(|listener| allows_kind(listener, route_kind) && self.allows_namespace(listener, route_namespace))
            .collect();
        if allowed.is_empty() {
            return Err(Rejection::new("False", NOT_ALLOWED_BY_LISTENERS, format!("listeners of {} do not allow {route_kind} from {route_namespace}", self.gateway_key)));
        }

        let attachments: Vec<_> = allowed
            .into_iter()
            .map(|listener| {
                let hostnames = match route_hostnames {
                    Some(route_hostnames) => hostname::effective_hostnames(listener.hostname.as_deref(), route_hostnames),
                    None => BTreeSet::from([listener.hostname.clone().filter(|h| !h.is_empty()).unwrap_or_else(|| DEFAULT_ROUTE_HOSTNAME.to_owned())]),
                };
                ListenerAttachment { listener: *listener, hostnames }
            })
            .filter(|attachment| !attachment.hostnames.is_empty())
            .collect();
        if attachments.is_empty() {
            return Err(Rejection::new("False", NO_MATCHING_LISTENER_HOSTNAME, format!("no listener hostname of {} intersects the route", self.gateway_key)));
        }
        Ok(attachments)
    }

    fn allows_namespace(&self, listener: &Listener, route_namespace: &str) -> bool {
        let namespaces = listener.allowed_routes.as_ref().and_then(|allowed| allowed.namespaces.as_ref());
        match namespaces.and_then(|namespaces| namespaces.from).unwrap_or_default() {
            FromNamespaces::All => true,
            FromNamespaces::Same => route_namespace == self.gateway_key.namespace,
            FromNamespaces::Selector => {
                let Some(selector) = namespaces.and_then(|namespaces| namespaces.selector.as_ref()) else {
                    return false;
                };
                let empty = BTreeMap::new();
                self.snapshot
                    .namespaces
                    .get(route_namespace)
                    .is_some_and(|namespace| label_selector::matches(selector, namespace.metadata.labels.as_ref().unwrap_or(&empty)))
            },
        }
    }
}

/// Explicit `allowedRoutes.kinds` are narrowed to what the listener protocol supports.
fn allows_kind(listener: &Listener, route_kind: &str) -> bool {
    let supported = default_route_kinds(listener);
    let explicit = listener.allowed_routes.as_ref().and_then(|allowed| allowed.kinds.as_deref()).unwrap_or_default();
    if explicit.is_empty() {
        return supported.iter().any(|(_, kind)| *kind == route_kind);
    }
    explicit
        .iter()
        .filter(|kind| kind.group.as_deref().unwrap_or(GATEWAY_API_GROUP) == GATEWAY_API_GROUP)
        .any(|kind| kind.kind == route_kind && supported.iter().any(|(_, supported)| *supported == route_kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::ResourceCache, common::test::gateway};

    fn parent(name: &str) -> ParentReference {
        ParentReference { name: name.to_owned(), ..Default::default() }
    }

    #[test]
    fn only_listeners_allowing_the_kind_are_attached() {
        let mut gw = gateway("g1", "gw", "fgw", &[("tls", "TLS", 8443)]);
        gw.spec.listeners[0].tls = serde_json::from_value(serde_json::json!({"mode": "Passthrough"})).unwrap();
        let snapshot = ResourceCache::new().snapshot().unwrap();
        let matcher = RouteListenerMatcher::new(&snapshot, &gw);

        let matches = matcher.match_route("HTTPRoute", "gw", &[parent("g1")], Some(&[][..]));
        assert_eq!(matches[0].outcome.as_ref().unwrap_err().reason, NOT_ALLOWED_BY_LISTENERS);
        let matches = matcher.match_route("TLSRoute", "gw", &[parent("g1")], Some(&[][..]));
        assert_eq!(matches[0].outcome.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn section_name_and_port_narrow_listeners() {
        let gw = gateway("g1", "gw", "fgw", &[("a", "HTTP", 80), ("b", "HTTP", 8080)]);
        let snapshot = ResourceCache::new().snapshot().unwrap();
        let matcher = RouteListenerMatcher::new(&snapshot, &gw);

        let by_section = ParentReference { section_name: Some("b".to_owned()), ..parent("g1") };
        let attached = matcher.match_route("HTTPRoute", "gw", &[by_section], None);
        assert_eq!(attached[0].outcome.as_ref().unwrap()[0].listener.port, 8080);

        let missing = ParentReference { port: Some(9090), ..parent("g1") };
        let rejected = matcher.match_route("HTTPRoute", "gw", &[missing], None);
        assert_eq!(rejected[0].outcome.as_ref().unwrap_err().reason, NO_MATCHING_PARENT);
    }

    #[test]
    fn other_namespaces_need_all_or_matching_selector() {
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        let snapshot = ResourceCache::new().snapshot().unwrap();
        let foreign = ParentReference { namespace: Some("gw".to_owned()), ..parent("g1") };
        let same_only = RouteListenerMatcher::new(&snapshot, &gw).match_route("HTTPRoute", "apps", std::slice::from_ref(&foreign), None);
        assert_eq!(same_only[0].outcome.as_ref().unwrap_err().reason, NOT_ALLOWED_BY_LISTENERS);

        gw.spec.listeners[0].allowed_routes =
            serde_json::from_value(serde_json::json!({"namespaces": {"from": "Selector", "selector": {"matchLabels": {"team": "a"}}}})).unwrap();
        let cache = ResourceCache::new();
        cache
            .insert(serde_json::from_value::<k8s_openapi::api::core::v1::Namespace>(serde_json::json!({
                "apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "apps", "labels": {"team": "a"}}
            }))
            .unwrap())
            .unwrap();
        let snapshot = cache.snapshot().unwrap();
        let selected = RouteListenerMatcher::new(&snapshot, &gw).match_route("HTTPRoute", "apps", &[foreign], None);
        assert!(selected[0].outcome.is_ok());
    }

    #[test]
    fn disjoint_hostnames_are_rejected() {
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        gw.spec.listeners[0].hostname = Some("*.example.com".to_owned());
        let snapshot = ResourceCache::new().snapshot().unwrap();
        let matcher = RouteListenerMatcher::new(&snapshot, &gw);

        let rejected = matcher.match_route("HTTPRoute", "gw", &[parent("g1")], Some(&["foo.org".to_owned()][..]));
        assert_eq!(rejected[0].outcome.as_ref().unwrap_err().reason, NO_MATCHING_LISTENER_HOSTNAME);
        let accepted = matcher.match_route("HTTPRoute", "gw", &[parent("g1")], Some(&["a.example.com".to_owned()][..]));
        assert_eq!(accepted[0].outcome.as_ref().unwrap()[0].hostnames, BTreeSet::from(["a.example.com".to_owned()]));
    }

    #[test]
    fn gateway_without_valid_listener_is_not_accepted_yet() {
        let mut gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        gw.status = None;
        let snapshot = ResourceCache::new().snapshot().unwrap();
        let matches = RouteListenerMatcher::new(&snapshot, &gw).match_route("HTTPRoute", "gw", &[parent("g1"), parent("other")], None);
        assert_eq!(matches.len(), 1);
        let rejection = matches[0].outcome.as_ref().unwrap_err();
        assert_eq!((rejection.status, rejection.reason), ("Unknown", NOT_ACCEPTED_YET));
    }
}
