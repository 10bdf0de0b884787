use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    apis::{
        gateway::{Gateway, Listener, ObjectReference, ProtocolType, TlsModeType},
        CONFIG_MAP_KIND, CORE_API_GROUP, GATEWAY_API_GROUP, GATEWAY_KIND, SECRET_KIND,
    },
    cache::{CacheError, CacheInner},
    common::{create_id, is_valid_ref_to_ca, is_valid_ref_to_secret, new_condition, tls_mode, valid_cross_namespace_ref, ReferenceFrom, ReferenceTo, RESOLVED_REFS},
    model::{FrontendValidationConfig, GatewayBackendTlsConfig, ListenerConfig, ListenerTlsConfig},
    policy::{config_map_ca, secret_ca, tls_pair, PolicyEngine},
};

const PRIVILEGED_PORT_OFFSET: i32 = 60000;
const INVALID_CERTIFICATE_REF: &str = "InvalidCertificateRef";
const INVALID_CA_CERTIFICATE_REF: &str = "InvalidCACertificateRef";
const REF_NOT_PERMITTED: &str = "RefNotPermitted";

/// Port the proxy binds for an advertised listener port.
pub fn listen_port(port: i32) -> i32 {
    if port < 1024 {
        port + PRIVILEGED_PORT_OFFSET
    } else {
        port
    }
}

pub fn terminates_tls(listener: &Listener) -> bool {
    match listener.protocol {
        ProtocolType::HTTPS => true,
        ProtocolType::TLS => tls_mode(listener) == TlsModeType::Terminate,
        _ => false,
    }
}

/// Outcome of resolving one listener's TLS material. Files are only published when the listener is.
#[derive(Debug, Default)]
pub struct ResolvedListenerTls {
    pub config: ListenerTlsConfig,
    pub files: BTreeMap<String, String>,
    pub failure: Option<(&'static str, String)>,
}

impl ResolvedListenerTls {
    fn fail(&mut self, reason: &'static str, message: String) {
        debug!("{message}");
        self.failure.get_or_insert((reason, message));
    }
}

pub struct ListenerResolver<'a> {
    snapshot: &'a CacheInner,
    gateway: &'a Gateway,
    gateway_namespace: String,
}

impl<'a> ListenerResolver<'a> {
    pub fn new(snapshot: &'a CacheInner, gateway: &'a Gateway) -> Self {
        Self { snapshot, gateway, gateway_namespace: gateway.namespace().unwrap_or_default() }
    }

    fn is_permitted(&self, kind: &str, namespace: &str, name: &str) -> Result<bool, CacheError> {
        let from = ReferenceFrom { group: GATEWAY_API_GROUP, kind: GATEWAY_KIND, namespace: &self.gateway_namespace };
        let to = ReferenceTo { group: CORE_API_GROUP, kind, namespace, name };
        valid_cross_namespace_ref(self.snapshot, &from, &to)
    }

    /// Certificates and frontend CAs of a TLS terminating listener.
    pub fn resolve_tls(&self, listener: &Listener) -> Result<ResolvedListenerTls, CacheError> {
        let mut resolved = ResolvedListenerTls::default();
        resolved.config.mode = tls_mode(listener);
        let Some(tls) = listener.tls.as_ref() else {
            resolved.fail(INVALID_CERTIFICATE_REF, format!("listener {} has no TLS configuration", listener.name));
            return Ok(resolved);
        };

        for (index, certificate_ref) in tls.certificate_refs.as_deref().unwrap_or_default().iter().enumerate() {
            self.resolve_certificate(listener, index, certificate_ref, &mut resolved)?;
        }
        if resolved.config.certificates.is_empty() && resolved.failure.is_none() {
            resolved.fail(INVALID_CERTIFICATE_REF, format!("listener {} has no certificate", listener.name));
        }

        if let Some(validation) = tls.frontend_validation.as_ref() {
            let mut frontend = FrontendValidationConfig::default();
            for (index, ca_ref) in validation.ca_certificate_refs.as_deref().unwrap_or_default().iter().enumerate() {
                if let Some(file) = self.resolve_ca(listener, index, ca_ref, &mut resolved)? {
                    frontend.ca_certificates.push(BTreeMap::from([("ca.crt".to_owned(), file)]));
                }
            }
            resolved.config.frontend_validation = Some(frontend);
        }

        for (key, value) in tls.options.iter().flatten() {
            resolved.config.options.insert(key.clone(), Value::String(value.clone()));
        }
        Ok(resolved)
    }

    fn resolve_certificate(&self, listener: &Listener, index: usize, certificate_ref: &ObjectReference, resolved: &mut ResolvedListenerTls) -> Result<(), CacheError> {
        let namespace = certificate_ref.namespace.clone().unwrap_or_else(|| self.gateway_namespace.clone());
        let key = create_id(&certificate_ref.name, &namespace);
        if !is_valid_ref_to_secret(certificate_ref.group.as_deref(), certificate_ref.kind.as_deref()) {
            resolved.fail(INVALID_CERTIFICATE_REF, format!("certificate {key} of listener {} is not a Secret", listener.name));
            return Ok(());
        }
        if !self.is_permitted(SECRET_KIND, &namespace, &certificate_ref.name)? {
            resolved.fail(REF_NOT_PERMITTED, format!("certificate {key} of listener {} is not permitted", listener.name));
            return Ok(());
        }
        let Some((cert, key_pem)) = self.snapshot.secrets.get(&key).and_then(|secret| tls_pair(secret)) else {
            resolved.fail(INVALID_CERTIFICATE_REF, format!("certificate {key} of listener {} is missing or not a TLS secret", listener.name));
            return Ok(());
        };
        let cert_file = format!("tls-{}-{index}.crt", listener.port);
        let key_file = format!("tls-{}-{index}.key", listener.port);
        resolved.files.insert(cert_file.clone(), cert);
        resolved.files.insert(key_file.clone(), key_pem);
        resolved.config.certificates.push(BTreeMap::from([("tls.crt".to_owned(), cert_file), ("tls.key".to_owned(), key_file)]));
        Ok(())
    }

    fn resolve_ca(&self, listener: &Listener, index: usize, ca_ref: &ObjectReference, resolved: &mut ResolvedListenerTls) -> Result<Option<String>, CacheError> {
        let namespace = ca_ref.namespace.clone().unwrap_or_else(|| self.gateway_namespace.clone());
        let key = create_id(&ca_ref.name, &namespace);
        if !is_valid_ref_to_ca(ca_ref.group.as_deref(), ca_ref.kind.as_deref()) {
            resolved.fail(INVALID_CA_CERTIFICATE_REF, format!("CA {key} of listener {} is neither a Secret nor a ConfigMap", listener.name));
            return Ok(None);
        }
        let kind = ca_ref.kind.as_deref().unwrap_or(SECRET_KIND);
        if !self.is_permitted(kind, &namespace, &ca_ref.name)? {
            resolved.fail(REF_NOT_PERMITTED, format!("CA {key} of listener {} is not permitted", listener.name));
            return Ok(None);
        }
        let ca = if kind == CONFIG_MAP_KIND {
            self.snapshot.config_maps.get(&key).and_then(|config_map| config_map_ca(config_map))
        } else {
            self.snapshot.secrets.get(&key).and_then(|secret| secret_ca(secret))
        };
        let Some(ca) = ca else {
            resolved.fail(INVALID_CA_CERTIFICATE_REF, format!("CA {key} of listener {} has no ca.crt", listener.name));
            return Ok(None);
        };
        let file = format!("ca-{}-{index}.crt", listener.port);
        resolved.files.insert(file.clone(), ca);
        Ok(Some(file))
    }

    /// `ResolvedRefs` condition reported on a TLS listener.
    pub fn condition(&self, resolved: &ResolvedListenerTls) -> Condition {
        let generation = self.gateway.metadata.generation;
        match &resolved.failure {
            Some((reason, message)) => new_condition(RESOLVED_REFS, false, reason, message, generation),
            None => new_condition(RESOLVED_REFS, true, RESOLVED_REFS, "", generation),
        }
    }

    /// Listener as emitted, decorated with Gateway port policies.
    pub fn listener_config(&self, engine: &PolicyEngine, listener: &Listener, tls: Option<ListenerTlsConfig>) -> Result<ListenerConfig, CacheError> {
        let name = self.gateway.name_any();
        let tls = match tls {
            Some(mut tls) => {
                if let Some(policy) = engine.listener_tls(&self.gateway_namespace, &name, listener.port)? {
                    if let Ok(Value::Object(options)) = serde_json::to_value(policy) {
                        tls.options.extend(options);
                    }
                }
                Some(tls)
            },
            None if listener.protocol == ProtocolType::TLS => Some(ListenerTlsConfig { mode: TlsModeType::Passthrough, ..Default::default() }),
            None => None,
        };
        Ok(ListenerConfig {
            name: listener.name.clone(),
            hostname: listener.hostname.clone(),
            port: listener.port,
            listen: listen_port(listener.port),
            protocol: listener.protocol,
            tls,
            allowed_routes: listener.allowed_routes.clone(),
            bps_limit: engine.listener_bps_limit(&self.gateway_namespace, &name, listener.port)?,
            access_control_lists: engine.listener_access_control(&self.gateway_namespace, &name, listener.port)?,
        })
    }

    /// Client certificate from `spec.backendTLS.clientCertificateRef`, when it resolves.
    pub fn backend_client_certificate(&self, secret_files: &mut BTreeMap<String, String>) -> Result<Option<GatewayBackendTlsConfig>, CacheError> {
        let Some(certificate_ref) = self.gateway.spec.backend_tls.as_ref().and_then(|tls| tls.client_certificate_ref.as_ref()) else {
            return Ok(None);
        };
        let namespace = certificate_ref.namespace.clone().unwrap_or_else(|| self.gateway_namespace.clone());
        if !is_valid_ref_to_secret(certificate_ref.group.as_deref(), certificate_ref.kind.as_deref())
            || !self.is_permitted(SECRET_KIND, &namespace, &certificate_ref.name)?
        {
            warn!("backend client certificate {namespace}/{} is not usable", certificate_ref.name);
            return Ok(None);
        }
        let Some((cert, key)) = self.snapshot.secrets.get(&create_id(&certificate_ref.name, &namespace)).and_then(|secret| tls_pair(secret)) else {
            debug!("backend client certificate {namespace}/{} not found", certificate_ref.name);
            return Ok(None);
        };
        let base = format!("gw-bk-tls-{}-{}", self.gateway_namespace, self.gateway.name_any());
        let cert_file = format!("{base}.crt");
        let key_file = format!("{base}.key");
        secret_files.insert(cert_file.clone(), cert);
        secret_files.insert(key_file.clone(), key);
        Ok(Some(GatewayBackendTlsConfig {
            client_certificate: BTreeMap::from([("tls.crt".to_owned(), cert_file), ("tls.key".to_owned(), key_file)]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::ResourceCache,
        common::test::{reference_grant, tls_secret},
    };

    fn https_gateway(certificate_ref: serde_json::Value) -> Gateway {
        serde_yaml::from_str::<Gateway>(&format!(
            r#"
apiVersion: gateway.networking.k8s.io/v1
kind: Gateway
metadata:
  name: g1
  namespace: gw
  generation: 3
spec:
  gatewayClassName: fgw
  listeners:
  - name: https
    port: 443
    protocol: HTTPS
    tls:
      mode: Terminate
      certificateRefs: [{certificate_ref}]
"#
        ))
        .unwrap()
    }

    #[test]
    fn privileged_ports_are_shifted() {
        assert_eq!(listen_port(80), 60080);
        assert_eq!(listen_port(1023), 61023);
        assert_eq!(listen_port(1024), 1024);
        assert_eq!(listen_port(8443), 8443);
    }

    #[test]
    fn tls_secret_is_emitted_as_indexed_files() {
        let cache = ResourceCache::new();
        cache.insert(tls_secret("cert", "gw", "kubernetes.io/tls", "X", "Y")).unwrap();
        let snapshot = cache.snapshot().unwrap();
        let gateway = https_gateway(serde_json::json!({"name": "cert"}));
        let resolver = ListenerResolver::new(&snapshot, &gateway);

        let resolved = resolver.resolve_tls(&gateway.spec.listeners[0]).unwrap();
        assert!(resolved.failure.is_none());
        assert_eq!(resolved.files.get("tls-443-0.crt").map(String::as_str), Some("X"));
        assert_eq!(resolved.files.get("tls-443-0.key").map(String::as_str), Some("Y"));
        assert_eq!(resolved.config.certificates[0]["tls.crt"], "tls-443-0.crt");
        let condition = resolver.condition(&resolved);
        assert_eq!((condition.status.as_str(), condition.observed_generation), ("True", Some(3)));
    }

    #[test]
    fn opaque_secret_emits_nothing() {
        let cache = ResourceCache::new();
        cache.insert(tls_secret("cert", "gw", "Opaque", "X", "Y")).unwrap();
        let snapshot = cache.snapshot().unwrap();
        let gateway = https_gateway(serde_json::json!({"name": "cert"}));
        let resolver = ListenerResolver::new(&snapshot, &gateway);

        let resolved = resolver.resolve_tls(&gateway.spec.listeners[0]).unwrap();
        assert!(resolved.files.is_empty());
        assert!(resolved.config.certificates.is_empty());
        let condition = resolver.condition(&resolved);
        assert_eq!((condition.status.as_str(), condition.reason.as_str()), ("False", "InvalidCertificateRef"));
    }

    #[test]
    fn cross_namespace_certificate_needs_grant() {
        let cache = ResourceCache::new();
        cache.insert(tls_secret("cert", "certs", "kubernetes.io/tls", "X", "Y")).unwrap();
        let gateway = https_gateway(serde_json::json!({"name": "cert", "namespace": "certs"}));

        let snapshot = cache.snapshot().unwrap();
        let resolved = ListenerResolver::new(&snapshot, &gateway).resolve_tls(&gateway.spec.listeners[0]).unwrap();
        assert_eq!(resolved.failure.map(|(reason, _)| reason), Some("RefNotPermitted"));

        cache.insert(reference_grant("certs", "certs", "Gateway", "gw", "Secret", None)).unwrap();
        let snapshot = cache.snapshot().unwrap();
        let resolved = ListenerResolver::new(&snapshot, &gateway).resolve_tls(&gateway.spec.listeners[0]).unwrap();
        assert!(resolved.failure.is_none());
    }
}
