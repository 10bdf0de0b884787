//! Watch streams feeding the resource cache. Every change the trigger layer deems effective becomes a rebuild request.

pub mod triggers;

use std::{collections::BTreeSet, fmt::Debug, marker::PhantomData, sync::Arc};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Endpoints, Namespace, Secret, Service},
    discovery::v1::EndpointSlice,
};
use kube::{
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Api, Client,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::triggers::{Trigger, Triggers};
use crate::{
    apis::{
        gateway::{Gateway, GatewayClass, ReferenceGrant},
        policies::{
            AccessControlPolicy, BackendLBPolicy, BackendTLSPolicy, CircuitBreakingPolicy, FaultInjectionPolicy, GatewayTLSPolicy,
            HealthCheckPolicy, LoadBalancerPolicy, RateLimitPolicy, RetryPolicy, SessionStickyPolicy, UpstreamTLSPolicy,
        },
        routes::{GRPCRoute, HTTPRoute, TCPRoute, TLSRoute, UDPRoute},
        service_import::ServiceImport,
    },
    cache::{CacheError, ResourceCache},
    common::object_key,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ControllerError {
    #[error("trigger state lock poisoned")]
    LockingError,
    #[error("{0}")]
    Cache(#[from] CacheError),
}

/// An effective change was observed. Requests are coalesced by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebuildRequest {
    pub kind: String,
    pub key: String,
}

/// Keeps the cache in sync with one kind's watch stream.
pub struct ResourceWatcher<K> {
    cache: ResourceCache,
    triggers: Arc<Triggers>,
    sender: mpsc::Sender<RebuildRequest>,
    relisted: BTreeSet<String>,
    kind: PhantomData<K>,
}

impl<K> ResourceWatcher<K>
where
    K: Trigger + DeserializeOwned + Debug,
{
    pub fn new(cache: ResourceCache, triggers: Arc<Triggers>, sender: mpsc::Sender<RebuildRequest>) -> Self {
        Self { cache, triggers, sender, relisted: BTreeSet::new(), kind: PhantomData }
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn apply(&self, object: &K) -> Result<bool, ControllerError> {
        let old = self.cache.insert(object.clone())?;
        let snapshot = self.cache.snapshot()?;
        K::is_effective(&self.triggers, &snapshot, old.as_deref(), Some(object))
    }

    fn delete(&self, object: &K) -> Result<bool, ControllerError> {
        let old = self.cache.delete(object)?;
        let snapshot = self.cache.snapshot()?;
        K::is_effective(&self.triggers, &snapshot, Some(old.as_deref().unwrap_or(object)), None)
    }

    /// Applies one event and returns the keys whose change is effective.
    pub fn handle(&mut self, event: Event<K>) -> Result<Vec<String>, ControllerError> {
        let mut effective = vec![];
        match event {
            Event::Apply(object) => {
                if self.apply(&object)? {
                    effective.push(object_key(&object));
                }
            },
            Event::Delete(object) => {
                if self.delete(&object)? {
                    effective.push(object_key(&object));
                }
            },
            Event::Init => self.relisted.clear(),
            Event::InitApply(object) => {
                self.relisted.insert(object_key(&object));
                if self.apply(&object)? {
                    effective.push(object_key(&object));
                }
            },
            Event::InitDone => {
                let removed = self.cache.retain::<K>(&self.relisted)?;
                let snapshot = self.cache.snapshot()?;
                for object in removed {
                    if K::is_effective(&self.triggers, &snapshot, Some(object.as_ref()), None)? {
                        effective.push(object_key(object.as_ref()));
                    }
                }
                self.relisted.clear();
                debug!("{} relist done", Self::kind());
            },
        }
        Ok(effective)
    }

    async fn notify(&self, keys: Vec<String>) {
        for key in keys {
            debug!("effective change {} {key}", Self::kind());
            if self.sender.send(RebuildRequest { kind: Self::kind(), key }).await.is_err() {
                warn!("rebuild channel closed");
            }
        }
    }

    pub async fn start(mut self, api: Api<K>) {
        info!("watching {}", Self::kind());
        let mut stream = watcher::watcher(api, watcher::Config::default()).default_backoff().boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => match self.handle(event) {
                    Ok(keys) => self.notify(keys).await,
                    Err(e) => warn!("{} event dropped {e}", Self::kind()),
                },
                Err(e) => warn!("{} watch error {e}", Self::kind()),
            }
        }
        warn!("{} watch stream ended", Self::kind());
    }
}

fn watch<K>(client: &Client, cache: &ResourceCache, triggers: &Arc<Triggers>, sender: &mpsc::Sender<RebuildRequest>) -> BoxFuture<'static, ()>
where
    K: Trigger + DeserializeOwned + Debug,
{
    let watcher = ResourceWatcher::<K>::new(cache.clone(), Arc::clone(triggers), sender.clone());
    watcher.start(Api::all(client.clone())).boxed()
}

/// One watch per kind, all feeding the same cache.
pub fn watch_all(client: &Client, cache: &ResourceCache, triggers: &Arc<Triggers>, sender: &mpsc::Sender<RebuildRequest>) -> Vec<BoxFuture<'static, ()>> {
    vec![
        watch::<GatewayClass>(client, cache, triggers, sender),
        watch::<Gateway>(client, cache, triggers, sender),
        watch::<HTTPRoute>(client, cache, triggers, sender),
        watch::<GRPCRoute>(client, cache, triggers, sender),
        watch::<TLSRoute>(client, cache, triggers, sender),
        watch::<TCPRoute>(client, cache, triggers, sender),
        watch::<UDPRoute>(client, cache, triggers, sender),
        watch::<ReferenceGrant>(client, cache, triggers, sender),
        watch::<Service>(client, cache, triggers, sender),
        watch::<ServiceImport>(client, cache, triggers, sender),
        watch::<EndpointSlice>(client, cache, triggers, sender),
        watch::<Endpoints>(client, cache, triggers, sender),
        watch::<Secret>(client, cache, triggers, sender),
        watch::<ConfigMap>(client, cache, triggers, sender),
        watch::<Namespace>(client, cache, triggers, sender),
        watch::<RateLimitPolicy>(client, cache, triggers, sender),
        watch::<AccessControlPolicy>(client, cache, triggers, sender),
        watch::<FaultInjectionPolicy>(client, cache, triggers, sender),
        watch::<SessionStickyPolicy>(client, cache, triggers, sender),
        watch::<LoadBalancerPolicy>(client, cache, triggers, sender),
        watch::<CircuitBreakingPolicy>(client, cache, triggers, sender),
        watch::<HealthCheckPolicy>(client, cache, triggers, sender),
        watch::<RetryPolicy>(client, cache, triggers, sender),
        watch::<UpstreamTLSPolicy>(client, cache, triggers, sender),
        watch::<GatewayTLSPolicy>(client, cache, triggers, sender),
        watch::<BackendLBPolicy>(client, cache, triggers, sender),
        watch::<BackendTLSPolicy>(client, cache, triggers, sender),
    ]
}
