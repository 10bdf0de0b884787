use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::repo::{Batch, BatchItem, Repo, RepoError};
use crate::model::Config;

const CONFIG_FILE: &str = "config.json";
const BASE_CODEBASE: &str = "/base/gateways";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("{0}")]
    Repo(#[from] RepoError),
    #[error("unable to serialize config {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("repository timed out after {0:?}")]
    Timeout(Duration),
}

/// Fields of a published `config.json` the publisher reads back.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PublishedConfig {
    #[serde(default)]
    version: String,
    #[serde(default)]
    secret_files: BTreeMap<String, serde_json::Value>,
}

pub fn codebase_path(gateway_namespace: &str) -> String {
    format!("/local/gw/{gateway_namespace}")
}

/// Writes built configurations to the repository, skipping unchanged versions.
pub struct Publisher {
    repo: Arc<dyn Repo>,
    timeout: Duration,
}

impl Publisher {
    pub fn new(repo: Arc<dyn Repo>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    /// Returns whether anything was written.
    #[instrument(level = "debug", skip_all, fields(gateway = ?config.gateway.metadata, version = %config.version))]
    pub async fn publish(&self, config: &Config) -> Result<bool, PublishError> {
        tokio::time::timeout(self.timeout, self.publish_config(config)).await.map_err(|_| PublishError::Timeout(self.timeout))?
    }

    async fn publish_config(&self, config: &Config) -> Result<bool, PublishError> {
        let path = codebase_path(config.gateway.metadata.namespace.as_deref().unwrap_or_default());
        if !self.repo.codebase_exists(&path).await? {
            info!("deriving codebase {path}");
            self.repo.derive_codebase(&path, BASE_CODEBASE).await?;
        }

        let published = self
            .repo
            .get_file(&format!("{path}/{CONFIG_FILE}"))
            .await?
            .and_then(|content| serde_json::from_str::<PublishedConfig>(&content).ok())
            .unwrap_or_default();
        if published.version == config.version {
            debug!("{path}/{CONFIG_FILE} unchanged");
            return Ok(false);
        }

        let mut items = vec![BatchItem::upsert(CONFIG_FILE, serde_json::to_string(config)?)];
        items.extend(config.secret_files.iter().map(|(file, content)| BatchItem::upsert(file, content.clone())));
        items.extend(published.secret_files.keys().filter(|file| !config.secret_files.contains_key(*file)).map(|file| BatchItem::delete(file)));
        self.repo.batch(&config.version, vec![Batch { base_path: path.clone(), items }]).await?;
        info!("published {path} version {}", config.version);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        model::{GatewayConfig, ObjectMeta},
        services::repo::memory::InMemoryRepo,
    };

    fn config(secret_files: &[(&str, &str)]) -> Config {
        Config {
            gateway: GatewayConfig {
                kind: "Gateway".to_owned(),
                metadata: ObjectMeta { namespace: Some("gw".to_owned()), name: "g1".to_owned() },
                ..Default::default()
            },
            secret_files: secret_files.iter().map(|(file, content)| ((*file).to_owned(), (*content).to_owned())).collect(),
            ..Default::default()
        }
        .with_version()
        .unwrap()
    }

    #[tokio::test]
    async fn unchanged_version_is_not_written_again() {
        let repo = Arc::new(InMemoryRepo::with_codebase("/local/gw/gw"));
        let publisher = Publisher::new(repo.clone(), Duration::from_secs(1));
        let config = config(&[("tls-443-0.crt", "X")]);

        assert!(publisher.publish(&config).await.unwrap());
        assert!(!publisher.publish(&config).await.unwrap());
        assert_eq!(repo.batch_count(), 1);
        let files = repo.files("/local/gw/gw");
        assert_eq!(files["tls-443-0.crt"], "X");
        assert!(files["config.json"].contains(&config.version));
    }

    #[tokio::test]
    async fn stale_secret_files_are_deleted() {
        let repo = Arc::new(InMemoryRepo::with_codebase("/local/gw/gw"));
        let publisher = Publisher::new(repo.clone(), Duration::from_secs(1));
        publisher.publish(&config(&[("tls-443-0.crt", "X"), ("tls-443-0.key", "Y")])).await.unwrap();
        publisher.publish(&config(&[("tls-8443-0.crt", "X")])).await.unwrap();

        let files: Vec<_> = repo.files("/local/gw/gw").into_keys().collect();
        assert_eq!(files, vec!["config.json", "tls-8443-0.crt"]);
    }

    #[tokio::test]
    async fn missing_codebase_is_derived_from_base() {
        let repo = Arc::new(InMemoryRepo::default());
        repo.codebases.lock().unwrap().insert(BASE_CODEBASE.to_owned(), BTreeMap::from([("main.js".to_owned(), "pipy()".to_owned())]));
        let publisher = Publisher::new(repo.clone(), Duration::from_secs(1));
        assert!(publisher.publish(&config(&[])).await.unwrap());

        let files = repo.files("/local/gw/gw");
        assert!(files.contains_key("main.js"));
        assert!(files.contains_key("config.json"));
    }

    struct StalledRepo;

    #[async_trait]
    impl Repo for StalledRepo {
        async fn codebase_exists(&self, _path: &str) -> Result<bool, RepoError> {
            futures::future::pending().await
        }

        async fn get_file(&self, _path: &str) -> Result<Option<String>, RepoError> {
            Ok(None)
        }

        async fn derive_codebase(&self, _path: &str, _base: &str) -> Result<(), RepoError> {
            Ok(())
        }

        async fn batch(&self, _version: &str, _batches: Vec<Batch>) -> Result<(), RepoError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_repository_times_out() {
        let publisher = Publisher::new(Arc::new(StalledRepo), Duration::from_millis(10));
        assert!(matches!(publisher.publish(&config(&[])).await, Err(PublishError::Timeout(_))));
    }
}
