//! Remote catalog backed by JSON files produced by an external fetcher.
//!
//! Each file is an array of `{"title": ..., "url": ..., "length": ...}`
//! objects. `length` is optional; zero or missing means unknown.

use async_trait::async_trait;
use c3dl_core::{FetchError, Quality, RemoteCatalog, RemoteItem};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    title: String,
    url: String,
    #[serde(default, alias = "size")]
    length: Option<u64>,
}

/// Reads item lists from disk. A source without a file is unavailable.
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    releases: Option<PathBuf>,
    relive: Option<PathBuf>,
}

impl JsonCatalog {
    pub fn new(releases: Option<PathBuf>, relive: Option<PathBuf>) -> Self {
        Self { releases, relive }
    }
}

#[async_trait]
impl RemoteCatalog for JsonCatalog {
    async fn fetch_release_items(
        &self,
        congress: &str,
        quality: Quality,
    ) -> Result<Vec<RemoteItem>, FetchError> {
        let entries = read_entries("release feed", self.releases.as_deref()).await?;
        debug!("{} release item(s) listed for {}", entries.len(), congress);
        Ok(entries
            .into_iter()
            .map(|e| RemoteItem::release(e.title, e.url, quality.format(), e.length))
            .collect())
    }

    async fn fetch_relive_items(&self, congress: &str) -> Result<Vec<RemoteItem>, FetchError> {
        let entries = read_entries("relive listing", self.relive.as_deref()).await?;
        debug!("{} relive item(s) listed for {}", entries.len(), congress);
        Ok(entries
            .into_iter()
            .map(|e| RemoteItem::relive(e.title, e.url))
            .collect())
    }
}

async fn read_entries(catalog: &str, path: Option<&Path>) -> Result<Vec<CatalogEntry>, FetchError> {
    let path = path.ok_or_else(|| FetchError::Unreachable {
        catalog: catalog.to_string(),
        message: "no listing file given".to_string(),
    })?;

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FetchError::Unreachable {
            catalog: catalog.to_string(),
            message: format!("{}: {}", path.display(), e),
        })?;

    serde_json::from_str(&contents).map_err(|e| FetchError::Unparseable {
        catalog: catalog.to_string(),
        message: format!("{}: {}", path.display(), e),
    })
}
