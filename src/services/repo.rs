use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const REPO_API_PATH: &str = "/api/v1/repo";
const REPO_FILES_API_PATH: &str = "/api/v1/repo-files";

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("repository request failed {0}")]
    Http(#[from] reqwest::Error),
    #[error("repository answered {status} for {path}")]
    Status { status: u16, path: String },
}

/// Codebase as listed by the repository.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Codebase {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

/// File of a batch, relative to the batch base path. `None` content deletes the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchItem {
    pub path: String,
    pub content: Option<String>,
}

impl BatchItem {
    pub fn upsert(path: &str, content: String) -> Self {
        Self { path: path.to_owned(), content: Some(content) }
    }

    pub fn delete(path: &str) -> Self {
        Self { path: path.to_owned(), content: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub base_path: String,
    pub items: Vec<BatchItem>,
}

/// Repository the proxies load their configuration from.
#[async_trait]
pub trait Repo: Send + Sync {
    async fn codebase_exists(&self, path: &str) -> Result<bool, RepoError>;
    async fn get_file(&self, path: &str) -> Result<Option<String>, RepoError>;
    /// Creates `path` as a child of `base`. Existing codebases are left alone.
    async fn derive_codebase(&self, path: &str, base: &str) -> Result<(), RepoError>;
    /// Writes every batch and commits its codebase.
    async fn batch(&self, version: &str, batches: Vec<Batch>) -> Result<(), RepoError>;
}

/// Client of the Pipy repository REST interface.
pub struct PipyRepoClient {
    client: Client,
    base_url: String,
}

impl PipyRepoClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RepoError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_owned() })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}{REPO_API_PATH}{path}", self.base_url)
    }

    fn file_url(&self, path: &str) -> String {
        format!("{}{REPO_FILES_API_PATH}{path}", self.base_url)
    }

    async fn codebase(&self, path: &str) -> Result<Option<Codebase>, RepoError> {
        let response = self.client.get(self.repo_url(path)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(RepoError::Status { status: status.as_u16(), path: path.to_owned() }),
        }
    }

    async fn create_codebase(&self, path: &str, codebase: &Codebase) -> Result<(), RepoError> {
        let response = self.client.post(self.repo_url(path)).json(codebase).send().await?;
        check(response.status(), path)
    }

    /// Bumps the codebase version so that proxies reload it.
    async fn commit(&self, path: &str) -> Result<(), RepoError> {
        let current = self.codebase(path).await?.unwrap_or_default();
        let next = current.version.parse::<u64>().unwrap_or_default() + 1;
        let body = Codebase { version: next.to_string(), base: None };
        let response = self.client.patch(self.repo_url(path)).json(&body).send().await?;
        check(response.status(), path)
    }

    async fn upsert_file(&self, path: &str, content: String) -> Result<(), RepoError> {
        let content_type = if path.ends_with(".json") { "application/json" } else { "text/plain" };
        let response = self.client.post(self.file_url(path)).header(CONTENT_TYPE, content_type).body(content).send().await?;
        check(response.status(), path)
    }

    async fn delete_file(&self, path: &str) -> Result<(), RepoError> {
        let response = self.client.delete(self.file_url(path)).send().await?;
        check(response.status(), path)
    }
}

fn check(status: StatusCode, path: &str) -> Result<(), RepoError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(RepoError::Status { status: status.as_u16(), path: path.to_owned() })
    }
}

#[async_trait]
impl Repo for PipyRepoClient {
    async fn codebase_exists(&self, path: &str) -> Result<bool, RepoError> {
        Ok(self.codebase(path).await?.is_some())
    }

    async fn get_file(&self, path: &str) -> Result<Option<String>, RepoError> {
        let response = self.client.get(self.file_url(path)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => Err(RepoError::Status { status: status.as_u16(), path: path.to_owned() }),
        }
    }

    async fn derive_codebase(&self, path: &str, base: &str) -> Result<(), RepoError> {
        if self.codebase(path).await?.is_some() {
            return Ok(());
        }
        if self.codebase(base).await?.is_none() {
            return Err(RepoError::Status { status: StatusCode::NOT_FOUND.as_u16(), path: base.to_owned() });
        }
        debug!("deriving {path} from {base}");
        self.create_codebase(path, &Codebase { version: "1".to_owned(), base: Some(base.to_owned()) }).await?;
        self.commit(path).await
    }

    async fn batch(&self, version: &str, batches: Vec<Batch>) -> Result<(), RepoError> {
        for batch in batches {
            if self.codebase(&batch.base_path).await?.is_none() {
                self.create_codebase(&batch.base_path, &Codebase { version: "1".to_owned(), base: None }).await?;
            }
            for item in batch.items {
                let path = format!("{}/{}", batch.base_path, item.path);
                match item.content {
                    Some(content) => self.upsert_file(&path, content).await?,
                    None => {
                        if let Err(e) = self.delete_file(&path).await {
                            warn!("unable to delete {path} {e}");
                        }
                    },
                }
            }
            self.commit(&batch.base_path).await?;
            debug!("committed {} at config version {version}", batch.base_path);
        }
        Ok(())
    }
}
