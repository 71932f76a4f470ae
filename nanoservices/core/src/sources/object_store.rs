use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};
use reqwest::{Client as ReqwestClient, StatusCode};
use url::form_urlencoded::byte_serialize;

use super::traits::{ObjectStore, Source};
use crate::scheduler::sensor::Sensor;

/// A bucket stored as a directory: `root/bucket/object/path`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    name: String,
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>, bucket: &str) -> Self {
        Self {
            name: format!("fs://{bucket}"),
            root: root.as_ref().join(bucket),
        }
    }

    fn resolve(&self, path: &str) -> EltResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::connector(&self.name, format!("invalid object path `{path}`")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &str) -> EltResult<bool> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::connector(&self.name, e)),
        }
    }

    async fn get(&self, path: &str) -> EltResult<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::connector(&self.name, format!("object absent: `{path}`")),
            _ => Error::connector(&self.name, e),
        })
    }
}

const GCS_API: &str = "https://storage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Cloud Storage over its JSON API.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    name: String,
    client: ReqwestClient,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl GcsObjectStore {
    pub fn new(bucket: &str, token: Option<String>) -> Self {
        Self {
            name: format!("gs://{bucket}"),
            client: ReqwestClient::new(),
            endpoint: GCS_API.to_string(),
            bucket: bucket.to_string(),
            token,
        }
    }

    /// Point at another API host, e.g. a local emulator.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Metadata URL of `path`. The object name is one path segment, so `/`
    /// becomes `%2F` and spaces `%20`; a literal `+` is already `%2B`.
    pub fn object_url(&self, path: &str) -> String {
        let object = byte_serialize(path.trim_start_matches('/').as_bytes())
            .collect::<String>()
            .replace('+', "%20");
        format!("{}/storage/v1/b/{}/o/{}", self.endpoint, self.bucket, object)
    }

    async fn send(&self, url: &str) -> EltResult<reqwest::Response> {
        let mut request = self.client.get(url).timeout(REQUEST_TIMEOUT);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(|e| Error::connector(&self.name, e))
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &str) -> EltResult<bool> {
        let resp = self.send(&self.object_url(path)).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::connector(&self.name, format!("metadata request for `{path}` returned {s}"))),
        }
    }

    async fn get(&self, path: &str) -> EltResult<Vec<u8>> {
        let url = format!("{}?alt=media", self.object_url(path));
        let resp = self.send(&url).await?;
        match resp.status() {
            s if s.is_success() => {
                let body = resp.bytes().await.map_err(|e| Error::connector(&self.name, e))?;
                Ok(body.to_vec())
            }
            StatusCode::NOT_FOUND => Err(Error::connector(&self.name, format!("object absent: `{path}`"))),
            s => Err(Error::connector(&self.name, format!("download of `{path}` returned {s}"))),
        }
    }
}

/// Satisfied once an object exists.
pub struct ObjectExistsSensor {
    store: Arc<dyn ObjectStore>,
    path: String,
}

impl ObjectExistsSensor {
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Sensor for ObjectExistsSensor {
    async fn poll(&self) -> EltResult<bool> {
        self.store.exists(&self.path).await
    }
}

/// Extracts one object as records.
pub struct ObjectSource {
    name: String,
    store: Arc<dyn ObjectStore>,
    path: String,
}

impl ObjectSource {
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: format!("{}/{}", store.name(), path),
            store,
            path,
        }
    }
}

#[async_trait]
impl Source for ObjectSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> EltResult<RecordSet> {
        let records = self.store.fetch(&self.path).await?;
        tracing::info!(source = %self.name, rows = records.num_rows(), "object extract complete");
        Ok(records)
    }
}
