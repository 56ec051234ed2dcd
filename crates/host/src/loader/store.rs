//! Package store boundary: where version archives come from.
//!
//! Stores answer `(container, blob name)` lookups with archive bytes. A
//! missing archive is `Ok(None)`, never an error; the load pipeline logs
//! and skips that version.

use std::path::PathBuf;

use async_trait::async_trait;
use url::Url;

use crate::types::{PluginVersion, StoreError};

/// Blob name a plugin version's archive is published under.
pub fn blob_name(plugin: &str, version: &PluginVersion) -> String {
    format!("{plugin}/{plugin}-{version}.tar.gz")
}

#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn fetch_archive(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Store rooted at a local directory; containers are subdirectories.
pub struct FsPackageStore {
    root: PathBuf,
}

impl FsPackageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PackageStore for FsPackageStore {
    async fn fetch_archive(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.root.join(container).join(blob);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

/// Store backed by an HTTP object endpoint.
///
/// Objects live at `GET {base}/{container}/{blob}`; 404 means the archive
/// does not exist.
pub struct HttpPackageStore {
    base: Url,
    client: reqwest::Client,
}

impl HttpPackageStore {
    pub fn new(base: Url) -> Self {
        Self::with_client(base, reqwest::Client::new())
    }

    pub fn with_client(base: Url, client: reqwest::Client) -> Self {
        Self { base, client }
    }

    fn object_url(&self, container: &str, blob: &str) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| StoreError::Http {
                url: self.base.to_string(),
                reason: "base URL cannot carry path segments".to_string(),
            })?;
            segments.pop_if_empty();
            segments.push(container);
            segments.extend(blob.split('/'));
        }
        Ok(url)
    }
}

#[async_trait]
impl PackageStore for HttpPackageStore {
    async fn fetch_archive(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.object_url(container, blob)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| StoreError::Http {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|err| StoreError::Http {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_names_embed_plugin_and_version() {
        assert_eq!(
            blob_name("weather", &PluginVersion::new(1, 2, 0)),
            "weather/weather-1.2.0.tar.gz"
        );
    }

    #[test]
    fn object_urls_nest_under_the_base_path() {
        let store = HttpPackageStore::new(Url::parse("http://store.example/api").unwrap());
        let url = store
            .object_url("plugins", "weather/weather-1.0.0.tar.gz")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://store.example/api/plugins/weather/weather-1.0.0.tar.gz"
        );
    }

    #[tokio::test]
    async fn fs_store_reads_existing_blobs() {
        let root = tempfile::tempdir().unwrap();
        let blob = blob_name("weather", &PluginVersion::new(1, 0, 0));
        let path = root.path().join("plugins").join(&blob);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"archive-bytes").unwrap();

        let store = FsPackageStore::new(root.path());
        let fetched = store.fetch_archive("plugins", &blob).await.unwrap();
        assert_eq!(fetched.as_deref(), Some(b"archive-bytes".as_slice()));
    }

    #[tokio::test]
    async fn fs_store_reports_missing_blobs_as_none() {
        let root = tempfile::tempdir().unwrap();
        let store = FsPackageStore::new(root.path());
        let fetched = store
            .fetch_archive("plugins", "ghost/ghost-0.1.0.tar.gz")
            .await
            .unwrap();
        assert!(fetched.is_none());
    }
}
