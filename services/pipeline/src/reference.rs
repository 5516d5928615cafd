//! Channel reference table: standard channel id → provider metadata.
//!
//! Loaded once per shard process and shared read-only by the
//! classification workers.

use crate::classifier::UNKNOWN;
use crate::config::ReferenceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Failed to fetch channel list: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Channel list endpoint answered {0}")]
    Status(reqwest::StatusCode),

    #[error("Failed to access cache {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed channel list: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One channel as published by the reference endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceEntry {
    #[serde(rename = "chId")]
    pub ch_id: String,
    #[serde(default)]
    pub name: String,
    pub operator: String,
    #[serde(rename = "sourceType")]
    pub source_type: String,
}

#[derive(Debug, Deserialize)]
struct ChannelList {
    data: Vec<ReferenceEntry>,
}

/// Provider fields appended to a classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub operator: String,
    pub source_type: String,
}

impl ProviderInfo {
    pub fn unknown() -> Self {
        Self {
            operator: UNKNOWN.to_string(),
            source_type: UNKNOWN.to_string(),
        }
    }

    pub fn into_fields(self) -> [String; 2] {
        [self.operator, self.source_type]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: HashMap<String, ReferenceEntry>,
}

impl ReferenceTable {
    pub fn from_entries(entries: impl IntoIterator<Item = ReferenceEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.ch_id.clone(), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Provider of a channel, or the unknown pair
    pub fn lookup(&self, channel_id: &str) -> ProviderInfo {
        match self.entries.get(channel_id) {
            Some(entry) => ProviderInfo {
                operator: entry.operator.clone(),
                source_type: entry.source_type.clone(),
            },
            None => {
                debug!(channel_id, "Channel not in reference table");
                ProviderInfo::unknown()
            }
        }
    }

    /// Load from the cache file when it is usable, otherwise from the
    /// endpoint, then refresh the cache.
    #[instrument(skip(config), fields(cache = %config.cache_file.display()))]
    pub async fn load(config: &ReferenceConfig) -> Result<Self, ReferenceError> {
        let cached = if config.cache_file.is_file() {
            match Self::load_file(&config.cache_file).await {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!(error = %e, "Unusable reference cache, fetching from network");
                    None
                }
            }
        } else {
            None
        };

        let table = match cached {
            Some(table) => table,
            None => Self::fetch(&config.url).await?,
        };

        if let Err(e) = table.save(&config.cache_file).await {
            warn!(error = %e, "Failed to write reference cache");
        }

        info!(channels = table.len(), "Reference table loaded");
        Ok(table)
    }

    pub async fn fetch(url: &str) -> Result<Self, ReferenceError> {
        let response = reqwest::get(url).await?;
        if !response.status().is_success() {
            return Err(ReferenceError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let list: ChannelList = serde_json::from_slice(&body)?;
        Ok(Self::from_entries(list.data))
    }

    async fn load_file(path: &Path) -> Result<Self, ReferenceError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| ReferenceError::Cache {
                path: path.to_path_buf(),
                source,
            })?;
        let entries: HashMap<String, ReferenceEntry> = serde_json::from_slice(&contents)?;
        Ok(Self { entries })
    }

    async fn save(&self, path: &Path) -> Result<(), ReferenceError> {
        let contents = serde_json::to_vec(&self.entries)?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| ReferenceError::Cache {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::serve;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};

    fn entry(ch_id: &str, operator: &str, source_type: &str) -> ReferenceEntry {
        ReferenceEntry {
            ch_id: ch_id.to_string(),
            name: format!("name-{ch_id}"),
            operator: operator.to_string(),
            source_type: source_type.to_string(),
        }
    }

    fn channel_router() -> Router {
        Router::new().route(
            "/channels",
            get(|| async {
                Json(serde_json::json!({
                    "data": [
                        {"id": 1, "chId": "C1", "name": "Channel-X", "operator": "OpA", "sourceType": "IPTV", "alias": []},
                        {"id": 2, "chId": "C2", "name": "Channel-Y", "operator": "OpB", "sourceType": "OTT", "alias": []}
                    ]
                }))
            }),
        )
    }

    #[test]
    fn test_lookup() {
        let table = ReferenceTable::from_entries([entry("C1", "OpA", "IPTV")]);
        assert_eq!(
            table.lookup("C1").into_fields().to_vec(),
            vec!["OpA", "IPTV"]
        );
        assert_eq!(
            table.lookup("C9").into_fields().to_vec(),
            vec!["UNKNOWN", "UNKNOWN"]
        );
    }

    #[tokio::test]
    async fn test_load_fetches_and_writes_cache() {
        let base = serve(channel_router()).await;
        let dir = tempfile::tempdir().unwrap();
        let config = ReferenceConfig {
            url: format!("{base}/channels"),
            cache_file: dir.path().join("channels.json"),
        };

        let table = ReferenceTable::load(&config).await.unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("C2").operator, "OpB");
        assert!(config.cache_file.is_file());
    }

    #[tokio::test]
    async fn test_load_prefers_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("channels.json");
        let cached = ReferenceTable::from_entries([entry("C7", "OpC", "DVB")]);
        cached.save(&cache_file).await.unwrap();

        let config = ReferenceConfig {
            // Unroutable: the cache must be enough
            url: "http://127.0.0.1:9/channels".to_string(),
            cache_file,
        };
        let table = ReferenceTable::load(&config).await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("C7").source_type, "DVB");
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_network() {
        let base = serve(channel_router()).await;
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("channels.json");
        std::fs::write(&cache_file, "{not json").unwrap();

        let config = ReferenceConfig {
            url: format!("{base}/channels"),
            cache_file: cache_file.clone(),
        };
        let table = ReferenceTable::load(&config).await.unwrap();
        assert_eq!(table.len(), 2);

        let rewritten = ReferenceTable::load_file(&cache_file).await.unwrap();
        assert_eq!(rewritten.len(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_error_without_cache_fails() {
        let router = Router::new().route(
            "/channels",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let config = ReferenceConfig {
            url: format!("{base}/channels"),
            cache_file: dir.path().join("channels.json"),
        };
        assert!(matches!(
            ReferenceTable::load(&config).await,
            Err(ReferenceError::Status(_))
        ));
    }
}
