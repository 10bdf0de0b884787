use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use kube::Client;
use serde::Deserialize;
use services::{
    GatewayPatcherService, Patcher, PipyRepoClient, Publisher, RebuildContext, RoutePatcherService, Scheduler, StatusChannels, StatusShaper,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use typed_builder::TypedBuilder;

pub mod apis;
pub mod cache;
mod common;
pub mod controllers;
pub mod model;
mod policy;
pub mod processor;
pub mod services;

use crate::{
    apis::routes::{GRPCRoute, HTTPRoute, TCPRoute, TLSRoute, UDPRoute},
    cache::ResourceCache,
    controllers::triggers::Triggers,
    processor::ProcessorSettings,
};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

const CHANNEL_CAPACITY: usize = 1024;

fn default_repo_timeout_seconds() -> u64 {
    5
}

fn default_use_endpoint_slices() -> bool {
    true
}

#[derive(Debug, TypedBuilder, Deserialize)]
pub struct Configuration {
    pub controller_name: String,
    pub repo_url: String,
    #[serde(default = "default_repo_timeout_seconds")]
    #[builder(default = default_repo_timeout_seconds())]
    pub repo_timeout_seconds: u64,
    #[builder(default)]
    pub enable_open_telemetry: Option<bool>,
    #[serde(default = "default_use_endpoint_slices")]
    #[builder(default = default_use_endpoint_slices())]
    pub use_endpoint_slices: bool,
}

#[derive(Error, Debug)]
enum ConfigurationError {
    #[error("controller name must be not empty")]
    ControllerName,
    #[error("repository url must be an http(s) url")]
    RepoUrl,
    #[error("repository timeout must be positive")]
    RepoTimeout,
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        if self.controller_name.is_empty() {
            return Err(ConfigurationError::ControllerName.into());
        }
        if !(self.repo_url.starts_with("http://") || self.repo_url.starts_with("https://")) {
            return Err(ConfigurationError::RepoUrl.into());
        }
        if self.repo_timeout_seconds == 0 {
            return Err(ConfigurationError::RepoTimeout.into());
        }
        Ok(())
    }
}

pub async fn start(configuration: Configuration) -> Result<()> {
    info!("Flomesh gateway controller started");
    let client = Client::try_default().await?;
    let cache = ResourceCache::new();
    let triggers = Arc::new(Triggers::new(&configuration.controller_name, configuration.use_endpoint_slices));
    let repo_timeout = Duration::from_secs(configuration.repo_timeout_seconds);

    let (rebuild_request_sender, rebuild_request_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (http_route_patcher_channel_sender, http_route_patcher_channel_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (grpc_route_patcher_channel_sender, grpc_route_patcher_channel_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (tls_route_patcher_channel_sender, tls_route_patcher_channel_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (tcp_route_patcher_channel_sender, tcp_route_patcher_channel_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (udp_route_patcher_channel_sender, udp_route_patcher_channel_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (gateway_patcher_channel_sender, gateway_patcher_channel_receiver) = mpsc::channel(CHANNEL_CAPACITY);

    let status_channels = StatusChannels::builder()
        .http_routes(http_route_patcher_channel_sender)
        .grpc_routes(grpc_route_patcher_channel_sender)
        .tls_routes(tls_route_patcher_channel_sender)
        .tcp_routes(tcp_route_patcher_channel_sender)
        .udp_routes(udp_route_patcher_channel_sender)
        .gateways(gateway_patcher_channel_sender)
        .build();

    let repo = PipyRepoClient::new(&configuration.repo_url, repo_timeout)?;
    let context = RebuildContext::builder()
        .cache(cache.clone())
        .settings(ProcessorSettings {
            controller_name: configuration.controller_name.clone(),
            use_endpoint_slices: configuration.use_endpoint_slices,
        })
        .publisher(Publisher::new(Arc::new(repo), repo_timeout))
        .shaper(StatusShaper::new(&configuration.controller_name, status_channels))
        .build();

    let scheduler = Scheduler::builder()
        .receiver(rebuild_request_receiver)
        .triggers(Arc::clone(&triggers))
        .context(Arc::new(context))
        .build();

    let mut http_route_patcher_service = RoutePatcherService::<HTTPRoute>::builder()
        .client(client.clone())
        .controller_name(configuration.controller_name.clone())
        .receiver(http_route_patcher_channel_receiver)
        .build();
    let mut grpc_route_patcher_service = RoutePatcherService::<GRPCRoute>::builder()
        .client(client.clone())
        .controller_name(configuration.controller_name.clone())
        .receiver(grpc_route_patcher_channel_receiver)
        .build();
    let mut tls_route_patcher_service = RoutePatcherService::<TLSRoute>::builder()
        .client(client.clone())
        .controller_name(configuration.controller_name.clone())
        .receiver(tls_route_patcher_channel_receiver)
        .build();
    let mut tcp_route_patcher_service = RoutePatcherService::<TCPRoute>::builder()
        .client(client.clone())
        .controller_name(configuration.controller_name.clone())
        .receiver(tcp_route_patcher_channel_receiver)
        .build();
    let mut udp_route_patcher_service = RoutePatcherService::<UDPRoute>::builder()
        .client(client.clone())
        .controller_name(configuration.controller_name.clone())
        .receiver(udp_route_patcher_channel_receiver)
        .build();
    let mut gateway_patcher_service = GatewayPatcherService::builder().client(client.clone()).receiver(gateway_patcher_channel_receiver).build();

    let patcher_services = vec![
        async move { http_route_patcher_service.start().await }.boxed(),
        async move { grpc_route_patcher_service.start().await }.boxed(),
        async move { tls_route_patcher_service.start().await }.boxed(),
        async move { tcp_route_patcher_service.start().await }.boxed(),
        async move { udp_route_patcher_service.start().await }.boxed(),
        async move { gateway_patcher_service.start().await }.boxed(),
    ];

    let watchers = controllers::watch_all(&client, &cache, &triggers, &rebuild_request_sender);
    drop(rebuild_request_sender);
    let watcher_services = async move {
        info!("Watching {} kinds", watchers.len());
        futures::future::join_all(watchers).await;
        crate::Result::<()>::Ok(())
    };

    let mut services = patcher_services;
    services.push(scheduler.start().boxed());
    services.push(watcher_services.boxed());

    futures::future::join_all(services).await;
    info!("Flomesh gateway controller stopped");
    Ok(())
}
