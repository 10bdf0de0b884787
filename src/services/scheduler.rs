//! One rebuild worker per active Gateway. Workers run concurrently across Gateways and one at a time for a given
//! Gateway; notifications arriving while a rebuild runs collapse into a single follow-up rebuild.

use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn, Instrument};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::{
    publisher::{PublishError, Publisher},
    status::StatusShaper,
};
use crate::{
    cache::{CacheError, ResourceCache},
    controllers::{triggers::Triggers, ControllerError, RebuildRequest},
    processor::{GatewayProcessor, ProcessorError, ProcessorSettings},
};

#[derive(Error, Debug)]
pub enum RebuildError {
    #[error("{0}")]
    Cache(#[from] CacheError),
    #[error("{0}")]
    Processor(#[from] ProcessorError),
    #[error("{0}")]
    Publish(#[from] PublishError),
}

/// What a rebuild needs, shared by every worker.
#[derive(TypedBuilder)]
pub struct RebuildContext {
    cache: ResourceCache,
    settings: ProcessorSettings,
    publisher: Publisher,
    shaper: StatusShaper,
}

/// Builds the Gateway from a fresh snapshot, publishes it, then hands its statuses to the shaper.
#[instrument(level = "info", skip(context))]
async fn rebuild(gateway_key: String, context: Arc<RebuildContext>) -> Result<(), RebuildError> {
    let snapshot = context.cache.snapshot()?;
    let Some(gateway) = snapshot.gateways.get(&gateway_key).cloned() else {
        debug!("gateway gone");
        return Ok(());
    };
    let output = GatewayProcessor::new(&snapshot, &gateway, &context.settings).build()?;
    let published = context.publisher.publish(&output.config).await?;
    let statuses = context.shaper.send(&snapshot, output.route_statuses, output.gateway_status).await;
    info!("rebuilt version {} published {published} statuses {statuses}", output.config.version);
    Ok(())
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Worker {
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(gateway_key: String, context: Arc<RebuildContext>) -> Self {
        let notify = Arc::new(Notify::new());
        let span = tracing::info_span!("RebuildWorker", gateway = %gateway_key);
        let handle = tokio::spawn(Self::run(gateway_key, context, Arc::clone(&notify)).instrument(span));
        Self { notify, handle }
    }

    async fn run(gateway_key: String, context: Arc<RebuildContext>, notify: Arc<Notify>) {
        loop {
            notify.notified().await;
            let span = tracing::info_span!("Rebuild", id = %Uuid::new_v4());
            let mut task = AbortOnDrop(tokio::spawn(rebuild(gateway_key.clone(), Arc::clone(&context)).instrument(span)));
            match (&mut task.0).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!("rebuild failed {e}"),
                Err(e) if e.is_panic() => warn!("rebuild panicked {e}"),
                Err(e) => debug!("rebuild cancelled {e}"),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(TypedBuilder)]
pub struct Scheduler {
    receiver: mpsc::Receiver<RebuildRequest>,
    triggers: Arc<Triggers>,
    context: Arc<RebuildContext>,
    #[builder(default, setter(skip))]
    workers: BTreeMap<String, Worker>,
}

impl Scheduler {
    pub async fn start(mut self) -> crate::Result<()> {
        info!("rebuild scheduler started");
        while let Some(request) = self.receiver.recv().await {
            let mut coalesced = 0;
            while self.receiver.try_recv().is_ok() {
                coalesced += 1;
            }
            debug!("rebuild requested by {} {} and {coalesced} more", request.kind, request.key);
            if let Err(e) = self.reconcile() {
                warn!("unable to schedule rebuilds {e}");
            }
        }
        info!("rebuild channel closed");
        crate::Result::<()>::Ok(())
    }

    /// Drops the workers of Gateways no longer active and wakes one worker per active Gateway.
    fn reconcile(&mut self) -> Result<(), ControllerError> {
        let active = self.triggers.active_gateways()?;
        self.workers.retain(|key, _| {
            let keep = active.contains_key(key);
            if !keep {
                info!("gateway {key} no longer active");
            }
            keep
        });
        let context = &self.context;
        for key in active.keys() {
            let worker = self.workers.entry(key.clone()).or_insert_with(|| Worker::spawn(key.clone(), Arc::clone(context)));
            worker.notify.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kube::runtime::watcher::Event;

    use super::*;
    use crate::{
        apis::gateway::{Gateway, GatewayClass},
        common::test::{endpoint_slice, gateway, gateway_class, http_route, service, CREATED},
        controllers::ResourceWatcher,
        processor::RouteStatusUpdate,
        services::{repo::memory::InMemoryRepo, status::test_channels},
    };

    const CONTROLLER: &str = "fgw";

    fn cache() -> ResourceCache {
        let cache = ResourceCache::new();
        cache.insert(gateway_class("fgw", CONTROLLER, CREATED, true)).unwrap();
        cache.insert(gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)])).unwrap();
        cache.insert(http_route("web", "gw", "g1", &["svc:8080"])).unwrap();
        cache.insert(service("svc", "gw", &[("http", 8080, 9090)])).unwrap();
        cache.insert(endpoint_slice("svc-1", "gw", "svc", "http", 9090, &[("10.0.0.1", true)])).unwrap();
        cache
    }

    fn context(cache: &ResourceCache, repo: Arc<InMemoryRepo>) -> (Arc<RebuildContext>, mpsc::Receiver<RouteStatusUpdate>) {
        let (channels, routes, _gateways) = test_channels();
        let context = RebuildContext::builder()
            .cache(cache.clone())
            .settings(ProcessorSettings { controller_name: CONTROLLER.to_owned(), use_endpoint_slices: true })
            .publisher(Publisher::new(repo, Duration::from_secs(1)))
            .shaper(StatusShaper::new(CONTROLLER, channels))
            .build();
        (Arc::new(context), routes)
    }

    #[tokio::test]
    async fn rebuild_publishes_then_sends_route_statuses() {
        let repo = Arc::new(InMemoryRepo::with_codebase("/local/gw/gw"));
        let (context, mut routes) = context(&cache(), Arc::clone(&repo));

        rebuild("gw/g1".to_owned(), context).await.unwrap();

        assert!(repo.files("/local/gw/gw").contains_key("config.json"));
        let update = routes.recv().await.unwrap();
        assert_eq!(update.key.name, "web");
        assert_eq!(update.gateway, "gw/g1");
    }

    #[tokio::test]
    async fn failed_publish_sends_no_status() {
        let repo = Arc::new(InMemoryRepo::default());
        let (context, mut routes) = context(&cache(), Arc::clone(&repo));

        assert!(matches!(rebuild("gw/g1".to_owned(), context).await, Err(RebuildError::Publish(_))));
        assert!(routes.try_recv().is_err());
        assert_eq!(repo.batch_count(), 0);
    }

    #[tokio::test]
    async fn workers_follow_the_active_gateways() {
        let cache = ResourceCache::new();
        let triggers = Arc::new(Triggers::new(CONTROLLER, true));
        let (sender, _requests) = mpsc::channel(16);
        let (_unused, receiver) = mpsc::channel(16);
        ResourceWatcher::<GatewayClass>::new(cache.clone(), Arc::clone(&triggers), sender.clone())
            .handle(Event::Apply(gateway_class("fgw", CONTROLLER, CREATED, true)))
            .unwrap();
        let gw = gateway("g1", "gw", "fgw", &[("http", "HTTP", 80)]);
        let mut gateways = ResourceWatcher::<Gateway>::new(cache.clone(), Arc::clone(&triggers), sender);
        gateways.handle(Event::Apply(gw.clone())).unwrap();

        let (context, _routes) = context(&cache, Arc::new(InMemoryRepo::with_codebase("/local/gw/gw")));
        let mut scheduler = Scheduler::builder().receiver(receiver).triggers(Arc::clone(&triggers)).context(context).build();

        scheduler.reconcile().unwrap();
        assert_eq!(scheduler.workers.keys().collect::<Vec<_>>(), vec!["gw/g1"]);

        gateways.handle(Event::Delete(gw)).unwrap();
        scheduler.reconcile().unwrap();
        assert!(scheduler.workers.is_empty());
    }
}
