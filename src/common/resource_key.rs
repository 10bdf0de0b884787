use std::fmt::Display;

use kube::{Resource, ResourceExt};

use crate::apis::{
    routes::{BackendRef, ParentReference},
    CORE_API_GROUP, GATEWAY_API_GROUP, GATEWAY_KIND, SERVICE_KIND,
};

pub const DEFAULT_ROUTE_HOSTNAME: &str = "*";

/// Identity of a watched object: (group, kind, namespace, name). Cluster scoped objects carry an empty namespace.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: String::new(),
            kind: kind.to_owned(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        group.clone_into(&mut self.group);
        self
    }

    /// `namespace/name`, the key used by field indexes.
    pub fn namespaced_name(&self) -> String {
        create_id(&self.name, &self.namespace)
    }

    pub fn from_resource<R>(resource: &R) -> Self
    where
        R: Resource<DynamicType = ()>,
    {
        Self {
            group: R::group(&()).into_owned(),
            kind: R::kind(&()).into_owned(),
            namespace: resource.meta().namespace.clone().unwrap_or_default(),
            name: resource.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.namespaced_name())
    }
}

pub fn create_id(name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Key of a namespaced object as stored in the cache.
pub fn object_key<R: ResourceExt>(resource: &R) -> String {
    create_id(&resource.name_any(), &resource.namespace().unwrap_or_default())
}

/// Parent reference resolved against the namespace of the route carrying it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct RouteRefKey {
    pub resource_key: ResourceKey,
    pub section_name: Option<String>,
    pub port: Option<i32>,
}

impl RouteRefKey {
    pub fn from_parent_ref(parent_ref: &ParentReference, route_namespace: &str) -> Self {
        Self {
            resource_key: ResourceKey {
                group: parent_ref.group.clone().unwrap_or(GATEWAY_API_GROUP.to_owned()),
                kind: parent_ref.kind.clone().unwrap_or(GATEWAY_KIND.to_owned()),
                namespace: parent_ref.namespace.clone().unwrap_or(route_namespace.to_owned()),
                name: parent_ref.name.clone(),
            },
            section_name: parent_ref.section_name.clone(),
            port: parent_ref.port,
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.resource_key.group == GATEWAY_API_GROUP && self.resource_key.kind == GATEWAY_KIND
    }
}

impl AsRef<ResourceKey> for RouteRefKey {
    fn as_ref(&self) -> &ResourceKey {
        &self.resource_key
    }
}

/// A Service (or ServiceImport) port addressed by routes and policies, rendered as `namespace/name:port`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServicePortName {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub port: Option<i32>,
}

impl ServicePortName {
    pub fn from_backend_ref(backend_ref: &BackendRef, route_namespace: &str) -> Self {
        Self {
            group: backend_ref.group.clone().unwrap_or(CORE_API_GROUP.to_owned()),
            kind: backend_ref.kind.clone().unwrap_or(SERVICE_KIND.to_owned()),
            namespace: backend_ref.namespace.clone().unwrap_or(route_namespace.to_owned()),
            name: backend_ref.name.clone(),
            port: backend_ref.port,
        }
    }

    pub fn service_key(&self) -> String {
        create_id(&self.name, &self.namespace)
    }
}

impl Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}/{}:{port}", self.namespace, self.name),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_ref_defaults_to_gateway_in_route_namespace() {
        let parent_ref = ParentReference { name: "gw".to_owned(), ..Default::default() };
        let key = RouteRefKey::from_parent_ref(&parent_ref, "apps");
        assert!(key.is_gateway());
        assert_eq!(key.resource_key.namespaced_name(), "apps/gw");
    }

    #[test]
    fn service_port_name_display() {
        let backend_ref = BackendRef { name: "svc".to_owned(), port: Some(8080), ..Default::default() };
        let name = ServicePortName::from_backend_ref(&backend_ref, "gw");
        assert_eq!(name.to_string(), "gw/svc:8080");
        assert_eq!(name.service_key(), "gw/svc");
    }
}
