use std::collections::BTreeSet;

use k8s_openapi::{
    api::{
        core::v1::{EndpointPort as CoreEndpointPort, Service, ServicePort},
        discovery::v1::EndpointPort,
    },
    apimachinery::pkg::{apis::meta::v1::Condition, util::intstr::IntOrString},
};
use tracing::{debug, warn};

use crate::{
    apis::{routes::BackendRef, SERVICE_IMPORT_KIND},
    cache::{CacheError, CacheInner, SERVICE_NAME_INDEX},
    common::{
        is_headless_without_selector, is_valid_backend_ref_to_service, new_condition, valid_cross_namespace_ref, ReferenceFrom, ReferenceTo,
        ServicePortName, RESOLVED_REFS,
    },
    model::BackendTarget,
};

const IPV4: &str = "IPv4";
const EXTERNAL_NAME: &str = "ExternalName";

/// Why a backend reference did not resolve. Each maps to a `ResolvedRefs=False` reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendRefError {
    InvalidKind,
    RefNotPermitted,
    BackendNotFound,
}

impl BackendRefError {
    pub fn reason(self) -> &'static str {
        match self {
            Self::InvalidKind => "InvalidKind",
            Self::RefNotPermitted => "RefNotPermitted",
            Self::BackendNotFound => "BackendNotFound",
        }
    }
}

/// First backend reference of a route that failed to resolve.
#[derive(Debug, Default, Clone)]
pub struct UnresolvedRefs(Option<(BackendRefError, String)>);

impl UnresolvedRefs {
    pub fn record(&mut self, error: BackendRefError, message: String) {
        self.0.get_or_insert((error, message));
    }

    pub fn is_resolved(&self) -> bool {
        self.0.is_none()
    }

    pub fn condition(&self, observed_generation: Option<i64>) -> Condition {
        match &self.0 {
            Some((error, message)) => new_condition(RESOLVED_REFS, false, error.reason(), message, observed_generation),
            None => new_condition(RESOLVED_REFS, true, RESOLVED_REFS, "", observed_generation),
        }
    }
}

pub struct BackendResolver<'a> {
    snapshot: &'a CacheInner,
    use_endpoint_slices: bool,
}

impl<'a> BackendResolver<'a> {
    pub fn new(snapshot: &'a CacheInner, use_endpoint_slices: bool) -> Self {
        Self { snapshot, use_endpoint_slices }
    }

    /// Validates a backend reference made by `from` and names the service port it addresses.
    pub fn resolve(&self, from: &ReferenceFrom, backend_ref: &BackendRef) -> Result<Result<ServicePortName, BackendRefError>, CacheError> {
        if !is_valid_backend_ref_to_service(backend_ref) {
            return Ok(Err(BackendRefError::InvalidKind));
        }
        let service = ServicePortName::from_backend_ref(backend_ref, from.namespace);
        let to = ReferenceTo { group: &service.group, kind: &service.kind, namespace: &service.namespace, name: &service.name };
        if !valid_cross_namespace_ref(self.snapshot, from, &to)? {
            return Ok(Err(BackendRefError::RefNotPermitted));
        }
        let declares_port = if service.kind == SERVICE_IMPORT_KIND {
            self.snapshot
                .service_imports
                .get(&service.service_key())
                .map(|import| import.spec.ports.iter().any(|port| Some(port.port) == service.port))
        } else {
            self.snapshot.services.get(&service.service_key()).map(|object| find_service_port(object, service.port).is_some())
        };
        match declares_port {
            Some(true) => Ok(Ok(service)),
            Some(false) => {
                debug!("port {:?} is not found in {} {}", service.port, service.kind, service.service_key());
                Ok(Err(BackendRefError::BackendNotFound))
            },
            None => Ok(Err(BackendRefError::BackendNotFound)),
        }
    }

    /// Ready endpoints of a service port, de-duplicated and sorted. A ServiceImport is served by the Service of the same name.
    pub fn targets(&self, service_port: &ServicePortName) -> Result<Vec<BackendTarget>, CacheError> {
        let Some(service) = self.snapshot.services.get(&service_port.service_key()) else {
            debug!("no Service behind {service_port}");
            return Ok(vec![]);
        };
        let spec = service.spec.as_ref();
        if spec.and_then(|spec| spec.type_.as_deref()) == Some(EXTERNAL_NAME) {
            warn!("Service {service_port} is of type ExternalName, ignored");
            return Ok(vec![]);
        }
        let Some(port) = find_service_port(service, service_port.port) else {
            debug!("Service {service_port} has no matching port");
            return Ok(vec![]);
        };

        let targets = if !self.use_endpoint_slices || is_headless_without_selector(service) {
            self.targets_by_endpoints(&service_port.service_key(), port)
        } else {
            self.targets_by_endpoint_slices(&service_port.service_key(), port)?
        };
        Ok(targets.into_iter().map(|(address, port)| BackendTarget { address, port, weight: 1 }).collect())
    }

    fn targets_by_endpoints(&self, service_key: &str, service_port: &ServicePort) -> BTreeSet<(String, i32)> {
        let mut targets = BTreeSet::new();
        let Some(endpoints) = self.snapshot.endpoints.get(service_key) else {
            return targets;
        };
        for subset in endpoints.subsets.as_deref().unwrap_or_default() {
            let port = find_endpoint_port(subset.ports.as_deref().unwrap_or_default(), service_port);
            if !(1..=65535).contains(&port) {
                continue;
            }
            for address in subset.addresses.as_deref().unwrap_or_default() {
                targets.insert((address.ip.clone(), port));
            }
        }
        targets
    }

    fn targets_by_endpoint_slices(&self, service_key: &str, service_port: &ServicePort) -> Result<BTreeSet<(String, i32)>, CacheError> {
        let mut targets = BTreeSet::new();
        let slices = self.snapshot.endpoint_slices.list_by_index(SERVICE_NAME_INDEX, service_key)?;
        for slice in slices.iter().filter(|slice| slice.address_type == IPV4) {
            let port = find_endpoint_slice_port(slice.ports.as_deref().unwrap_or_default(), service_port);
            if !(1..=65535).contains(&port) {
                continue;
            }
            for endpoint in slice.endpoints.iter().filter(|endpoint| endpoint.conditions.as_ref().and_then(|c| c.ready) == Some(true)) {
                for address in &endpoint.addresses {
                    targets.insert((address.clone(), port));
                }
            }
        }
        Ok(targets)
    }
}

/// With no port given a single-port Service resolves to its only port.
pub fn find_service_port(service: &Service, port: Option<i32>) -> Option<&ServicePort> {
    let ports = service.spec.as_ref()?.ports.as_deref()?;
    match port {
        None if ports.len() == 1 => ports.first(),
        None => None,
        Some(port) => ports.iter().find(|service_port| service_port.port == port),
    }
}

fn target_port_or_port(service_port: &ServicePort) -> i32 {
    match service_port.target_port {
        Some(IntOrString::Int(port)) if port != 0 => port,
        _ => service_port.port,
    }
}

fn find_endpoint_slice_port(ports: &[EndpointPort], service_port: &ServicePort) -> i32 {
    let port_name = service_port.name.as_deref().unwrap_or_default();
    for port in ports {
        let Some(number) = port.port else {
            return target_port_or_port(service_port);
        };
        if port.name.as_deref().unwrap_or_default() == port_name {
            return number;
        }
    }
    0
}

fn find_endpoint_port(ports: &[CoreEndpointPort], service_port: &ServicePort) -> i32 {
    let port_name = service_port.name.as_deref().unwrap_or_default();
    if port_name.is_empty() {
        return ports.first().map_or(0, |port| port.port);
    }
    if let Some(port) = ports.iter().find(|port| port.name.as_deref() == Some(port_name)) {
        return port.port;
    }
    match (ports.is_empty(), &service_port.target_port) {
        (false, Some(IntOrString::Int(port))) => *port,
        _ => 0,
    }
}
