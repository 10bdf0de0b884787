use std::{
    cmp::Reverse,
    collections::{btree_map::Entry, BTreeMap},
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::warn;

use crate::{
    apis::routes::{GRPCRouteMatch, HTTPPathMatch, HTTPRouteMatch, PathMatchType},
    cache::CacheError,
    model::{
        BackendRefConfig, L7HostnameRule, L7RouteSpec, L7RouteType, MatchConfig, ObjectMeta, Resource, RouteMatchConfig, RouteResource,
        RouteTableSpec,
    },
    policy::{PolicyEngine, RouteMatchRef},
};

/// Match type of an L7 route kind.
pub trait L7Match: Clone {
    const ROUTE_TYPE: L7RouteType;

    fn match_ref(&self) -> RouteMatchRef<'_>;
    fn into_config(self) -> MatchConfig;
    fn resource(resource: RouteResource<L7RouteSpec<Self>>) -> Resource;
    /// Match used by a rule that declares none.
    fn catch_all() -> Self;
}

impl L7Match for HTTPRouteMatch {
    const ROUTE_TYPE: L7RouteType = L7RouteType::HTTP;

    fn match_ref(&self) -> RouteMatchRef<'_> {
        RouteMatchRef::HTTP(self)
    }

    fn into_config(self) -> MatchConfig {
        MatchConfig::HTTP(self)
    }

    fn resource(resource: RouteResource<L7RouteSpec<Self>>) -> Resource {
        Resource::HTTPRoute(resource)
    }

    fn catch_all() -> Self {
        HTTPRouteMatch {
            path: Some(HTTPPathMatch { r#type: Some(PathMatchType::PathPrefix), value: Some("/".to_owned()) }),
            ..Default::default()
        }
    }
}

impl L7Match for GRPCRouteMatch {
    const ROUTE_TYPE: L7RouteType = L7RouteType::GRPC;

    fn match_ref(&self) -> RouteMatchRef<'_> {
        RouteMatchRef::GRPC(self)
    }

    fn into_config(self) -> MatchConfig {
        MatchConfig::GRPC(self)
    }

    fn resource(resource: RouteResource<L7RouteSpec<Self>>) -> Resource {
        Resource::GRPCRoute(resource)
    }

    fn catch_all() -> Self {
        GRPCRouteMatch::default()
    }
}

/// One match contributed to an L7 hostname, with what it sorts by.
#[derive(Clone, Debug)]
pub struct MatchEntry {
    pub created: Option<Time>,
    pub config: RouteMatchConfig,
}

/// (path specificity, header count, query param count, method present). Larger sorts first.
type Specificity = ((u8, usize), usize, usize, bool);

impl MatchEntry {
    fn specificity(&self) -> Specificity {
        match &self.config.route_match {
            MatchConfig::HTTP(route_match) => {
                let path = route_match.path.as_ref();
                let rank = match path.and_then(|path| path.r#type).unwrap_or_default() {
                    PathMatchType::Exact => 2,
                    PathMatchType::PathPrefix => 1,
                    PathMatchType::RegularExpression => 0,
                };
                let length = path.and_then(|path| path.value.as_ref()).map_or(1, String::len);
                (
                    (rank, length),
                    route_match.headers.as_ref().map_or(0, Vec::len),
                    route_match.query_params.as_ref().map_or(0, Vec::len),
                    route_match.method.is_some(),
                )
            },
            MatchConfig::GRPC(route_match) => {
                let method = route_match.method.as_ref();
                let service = method.and_then(|method| method.service.as_ref());
                let name = method.and_then(|method| method.method.as_ref());
                let declared = u8::from(service.is_some()) + u8::from(name.is_some());
                let length = service.map_or(0, String::len) + name.map_or(0, String::len);
                ((declared, length), route_match.headers.as_ref().map_or(0, Vec::len), 0, false)
            },
        }
    }
}

/// Most specific first, then oldest route, then `namespace/name`. The sort is stable.
pub fn sort_matches(entries: &mut [MatchEntry]) {
    entries.sort_by(|a, b| {
        Reverse(a.specificity())
            .cmp(&Reverse(b.specificity()))
            .then_with(|| a.created.cmp(&b.created))
            .then_with(|| a.config.route.cmp(&b.config.route))
    });
}

#[derive(Debug)]
struct L7Hostname {
    route_type: L7RouteType,
    matches: Vec<MatchEntry>,
}

/// Route tables of one Gateway keyed by listener port.
#[derive(Debug, Default)]
pub struct RouteTables {
    l7: BTreeMap<i32, BTreeMap<String, L7Hostname>>,
    passthrough: BTreeMap<i32, BTreeMap<String, String>>,
    terminate: BTreeMap<i32, BTreeMap<String, Vec<BackendRefConfig>>>,
    tcp: BTreeMap<i32, Vec<BackendRefConfig>>,
    udp: BTreeMap<i32, Vec<BackendRefConfig>>,
}

impl RouteTables {
    /// Adds matches at (port, hostname). Refused when the hostname already serves the other L7 type.
    pub fn add_l7(&mut self, port: i32, hostname: &str, route_type: L7RouteType, entries: Vec<MatchEntry>) -> bool {
        match self.l7.entry(port).or_default().entry(hostname.to_owned()) {
            Entry::Vacant(vacant) => {
                vacant.insert(L7Hostname { route_type, matches: entries });
                true
            },
            Entry::Occupied(mut occupied) if occupied.get().route_type == route_type => {
                occupied.get_mut().matches.extend(entries);
                true
            },
            Entry::Occupied(_) => false,
        }
    }

    /// First writer wins.
    pub fn add_passthrough(&mut self, port: i32, hostname: &str, target: String) -> bool {
        match self.passthrough.entry(port).or_default().entry(hostname.to_owned()) {
            Entry::Vacant(vacant) => {
                vacant.insert(target);
                true
            },
            Entry::Occupied(occupied) => *occupied.get() == target,
        }
    }

    /// Last writer wins.
    pub fn add_terminate(&mut self, port: i32, hostname: &str, backends: Vec<BackendRefConfig>) {
        self.terminate.entry(port).or_default().insert(hostname.to_owned(), backends);
    }

    pub fn add_tcp(&mut self, port: i32, backends: Vec<BackendRefConfig>) {
        self.tcp.insert(port, backends);
    }

    pub fn add_udp(&mut self, port: i32, backends: Vec<BackendRefConfig>) {
        self.udp.insert(port, backends);
    }

    /// One `RouteTable` per port, L7 hostnames decorated with the Gateway's hostname policies.
    pub fn into_resources(self, engine: &PolicyEngine, gateway_namespace: &str, gateway_name: &str) -> Result<Vec<Resource>, CacheError> {
        let mut tables = BTreeMap::new();
        for (port, hostnames) in self.l7 {
            let mut rules = BTreeMap::new();
            for (hostname, mut entry) in hostnames {
                sort_matches(&mut entry.matches);
                let rule = L7HostnameRule {
                    route_type: entry.route_type,
                    matches: entry.matches.into_iter().map(|entry| entry.config).collect(),
                    rate_limit: engine.hostname_rate_limit(gateway_namespace, gateway_name, &hostname)?,
                    access_control_lists: engine.hostname_access_control(gateway_namespace, gateway_name, &hostname)?,
                    fault_injection: engine.hostname_fault_injection(gateway_namespace, gateway_name, &hostname)?,
                };
                rules.insert(hostname, rule);
            }
            tables.insert(port, RouteTableSpec::L7 { port, hostnames: rules });
        }
        for (port, hostnames) in self.passthrough {
            insert_table(&mut tables, port, RouteTableSpec::TLSPassthrough { port, hostnames });
        }
        for (port, hostnames) in self.terminate {
            insert_table(&mut tables, port, RouteTableSpec::TLSTerminate { port, hostnames });
        }
        for (port, backends) in self.tcp {
            insert_table(&mut tables, port, RouteTableSpec::TCP { port, backends });
        }
        for (port, backends) in self.udp {
            insert_table(&mut tables, port, RouteTableSpec::UDP { port, backends });
        }
        Ok(tables
            .into_iter()
            .map(|(port, spec)| Resource::RouteTable(RouteResource { metadata: ObjectMeta { namespace: None, name: port.to_string() }, spec }))
            .collect())
    }
}

/// Tables are keyed by port alone, so a TCP and a UDP listener sharing a port keep only the later table.
fn insert_table(tables: &mut BTreeMap<i32, RouteTableSpec>, port: i32, spec: RouteTableSpec) {
    if tables.insert(port, spec).is_some() {
        warn!("port {port} is served by listeners of different protocols, keeping only the last route table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceCache;

    fn entry(route: &str, created: &str, route_match: serde_json::Value) -> MatchEntry {
        MatchEntry {
            created: Some(serde_json::from_value(serde_json::json!(created)).unwrap()),
            config: RouteMatchConfig {
                route: route.to_owned(),
                route_match: MatchConfig::HTTP(serde_json::from_value(route_match).unwrap()),
                backend_refs: vec![],
                filters: vec![],
                timeouts: None,
                rate_limit: None,
                access_control_lists: None,
                fault_injection: None,
            },
        }
    }

    fn order(entries: &[MatchEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.config.route.as_str()).collect()
    }

    #[test]
    fn exact_before_longer_prefix_before_shorter_prefix() {
        let mut entries = vec![
            entry("gw/short", "2024-01-01T00:00:00Z", serde_json::json!({"path": {"type": "PathPrefix", "value": "/"}})),
            entry("gw/regex", "2024-01-01T00:00:00Z", serde_json::json!({"path": {"type": "RegularExpression", "value": "/.*/very/long"}})),
            entry("gw/long", "2024-01-01T00:00:00Z", serde_json::json!({"path": {"type": "PathPrefix", "value": "/foo"}})),
            entry("gw/exact", "2024-01-01T00:00:00Z", serde_json::json!({"path": {"type": "Exact", "value": "/"}})),
        ];
        sort_matches(&mut entries);
        assert_eq!(order(&entries), vec!["gw/exact", "gw/long", "gw/short", "gw/regex"]);
    }

    #[test]
    fn headers_then_query_then_method_break_path_ties() {
        let path = serde_json::json!({"type": "PathPrefix", "value": "/"});
        let mut entries = vec![
            entry("gw/plain", "2024-01-01T00:00:00Z", serde_json::json!({"path": path})),
            entry("gw/method", "2024-01-01T00:00:00Z", serde_json::json!({"path": path, "method": "GET"})),
            entry("gw/query", "2024-01-01T00:00:00Z", serde_json::json!({"path": path, "queryParams": [{"name": "q", "value": "1"}]})),
            entry("gw/header", "2024-01-01T00:00:00Z", serde_json::json!({"path": path, "headers": [{"name": "x", "value": "1"}]})),
        ];
        sort_matches(&mut entries);
        assert_eq!(order(&entries), vec!["gw/header", "gw/query", "gw/method", "gw/plain"]);
    }

    #[test]
    fn equal_keys_fall_back_to_age_then_name_and_keep_input_order() {
        let path = serde_json::json!({"path": {"type": "PathPrefix", "value": "/"}});
        let mut entries = vec![
            entry("gw/b", "2024-01-02T00:00:00Z", path.clone()),
            entry("gw/a", "2024-01-02T00:00:00Z", path.clone()),
            entry("gw/old", "2024-01-01T00:00:00Z", path.clone()),
            entry("gw/a", "2024-01-02T00:00:00Z", serde_json::json!({"path": {"type": "PathPrefix", "value": "/"}, "headers": []})),
        ];
        entries[3].config.filters = vec![Default::default()];
        sort_matches(&mut entries);
        assert_eq!(order(&entries), vec!["gw/old", "gw/a", "gw/a", "gw/b"]);
        assert!(entries[1].config.filters.is_empty());
        assert_eq!(entries[2].config.filters.len(), 1);
    }

    #[test]
    fn other_l7_type_at_occupied_hostname_is_refused() {
        let mut tables = RouteTables::default();
        let http = entry("gw/http", "2024-01-01T00:00:00Z", serde_json::json!({}));
        assert!(tables.add_l7(80, "a.example.com", L7RouteType::HTTP, vec![http.clone()]));
        assert!(tables.add_l7(80, "a.example.com", L7RouteType::HTTP, vec![http]));
        assert!(!tables.add_l7(80, "a.example.com", L7RouteType::GRPC, vec![]));
        assert!(tables.add_l7(80, "b.example.com", L7RouteType::GRPC, vec![]));
    }

    #[test]
    fn passthrough_first_writer_and_l4_last_writer() {
        let mut tables = RouteTables::default();
        assert!(tables.add_passthrough(8443, "a.example.com", "gw/first:443".to_owned()));
        assert!(!tables.add_passthrough(8443, "a.example.com", "gw/second:443".to_owned()));
        tables.add_tcp(9000, vec![BackendRefConfig::new("gw/one:9000".to_owned(), 1)]);
        tables.add_tcp(9000, vec![BackendRefConfig::new("gw/two:9000".to_owned(), 1)]);

        let snapshot = ResourceCache::new().snapshot().unwrap();
        let resources = tables.into_resources(&PolicyEngine::new(&snapshot), "gw", "g1").unwrap();
        let value = serde_json::to_value(&resources).unwrap();
        assert_eq!(value[0]["metadata"]["name"], "8443");
        assert_eq!(value[0]["spec"]["hostnames"]["a.example.com"], "gw/first:443");
        assert_eq!(value[1]["spec"]["type"], "TCP");
        assert_eq!(value[1]["spec"]["backends"][0]["name"], "gw/two:9000");
    }

    #[test]
    fn udp_table_replaces_tcp_table_on_a_shared_port() {
        let mut tables = RouteTables::default();
        tables.add_tcp(5353, vec![BackendRefConfig::new("gw/dns-tcp:53".to_owned(), 1)]);
        tables.add_udp(5353, vec![BackendRefConfig::new("gw/dns-udp:53".to_owned(), 1)]);

        let snapshot = ResourceCache::new().snapshot().unwrap();
        let resources = tables.into_resources(&PolicyEngine::new(&snapshot), "gw", "g1").unwrap();
        assert_eq!(resources.len(), 1);
        let value = serde_json::to_value(&resources).unwrap();
        assert_eq!(value[0]["spec"]["type"], "UDP");
        assert_eq!(value[0]["spec"]["backends"][0]["name"], "gw/dns-udp:53");
    }
}
