//! Remote key-value service store.
//!
//! Every instance reads and writes directly. Keys are prefixed with a fixed
//! namespace. The service contract:
//!
//! - `GET {base}/values/{key}` returns `{"metadata": "...", "value": "..."}` or 404
//! - `PUT {base}/values/{key}` stores that body
//! - `DELETE {base}/values/{key}`
//! - `GET {base}/keys?prefix=&limit=&cursor=` returns `{"keys": [...], "cursor": ...}`
//!
//! Keys in paths are percent-encoded; requests carry a bearer token when configured.

use std::time::Duration;

use async_trait::async_trait;
use cachified_core::{DurableRecord, RemoteKvConfig, StorageError};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{BackendKind, DurableStore};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
struct ValueBody {
    metadata: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct KeysPage {
    keys: Vec<String>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteKvStore {
    client: Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
}

impl RemoteKvStore {
    pub fn new(config: &RemoteKvConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StorageError::OpenFailed {
                backend: BackendKind::RemoteKv.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &RemoteKvConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            namespace: config.namespace.clone(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn value_url(&self, key: &str) -> String {
        let namespaced = format!("{}{}", self.namespace, key);
        format!(
            "{}/values/{}",
            self.base_url,
            urlencoding::encode(&namespaced)
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StorageError> {
        self.authorized(builder)
            .send()
            .await
            .map_err(|e| request_failed(e.status().map_or(0, |s| s.as_u16()), e.to_string()))
    }

    /// Page through keys under `prefix` (already namespaced), keeping those
    /// accepted by `matches` until `limit` are collected.
    async fn scan_keys<F>(&self, limit: usize, matches: F) -> Result<Vec<String>, StorageError>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        while keys.len() < limit {
            let mut query = vec![
                ("prefix", self.namespace.clone()),
                ("limit", PAGE_SIZE.min(limit).to_string()),
            ];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }

            let response = self
                .send(
                    self.client
                        .get(format!("{}/keys", self.base_url))
                        .query(&query),
                )
                .await?;
            let response = check_status(response).await?;
            let page: KeysPage = response
                .json()
                .await
                .map_err(|e| request_failed(0, format!("invalid keys page: {}", e)))?;

            for namespaced in page.keys {
                let key = namespaced
                    .strip_prefix(self.namespace.as_str())
                    .unwrap_or(&namespaced);
                if matches(key) {
                    keys.push(key.to_string());
                    if keys.len() >= limit {
                        break;
                    }
                }
            }

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl DurableStore for RemoteKvStore {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteKv
    }

    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, StorageError> {
        let response = self.send(self.client.get(self.value_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let body: ValueBody = response
            .json()
            .await
            .map_err(|e| request_failed(0, format!("invalid value body for {}: {}", key, e)))?;
        Ok(Some(DurableRecord {
            key: key.to_string(),
            value: body.value,
            metadata: body.metadata,
        }))
    }

    async fn set(&self, record: DurableRecord) -> Result<(), StorageError> {
        let url = self.value_url(&record.key);
        let body = ValueBody {
            metadata: record.metadata,
            value: record.value,
        };
        let response = self.send(self.client.put(url).json(&body)).await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.send(self.client.delete(self.value_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(key, "Remote KV delete of absent key");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn list_keys(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        self.scan_keys(limit, |_| true).await
    }

    async fn search_keys(&self, query: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        self.scan_keys(limit, |key| key.contains(query)).await
    }
}

async fn check_status(response: Response) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(request_failed(status.as_u16(), message))
}

fn request_failed(status: u16, message: String) -> StorageError {
    StorageError::RequestFailed {
        backend: BackendKind::RemoteKv.to_string(),
        status,
        message,
    }
}
