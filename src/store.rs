//! Replicated store client.
//!
//! The engine only needs a single path holding a single value, so the
//! [`Store`] trait is deliberately tiny.  [`EtcdStore`] talks to the cluster's
//! etcd; [`MemStore`] keeps the value in process and backs single-node
//! deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions};
use log::info;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::StoreConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("value at {0} is not valid utf-8")]
    Encoding(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// The value at `path`, or `None` if nothing was ever written there.
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite the value at `path`.
    async fn put(&self, path: &str, value: &str) -> Result<(), StoreError>;
}

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self, StoreError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(path, None).await?;
        match resp.kvs().first() {
            Some(kv) => kv
                .value_str()
                .map(|value| Some(value.to_string()))
                .map_err(|_| StoreError::Encoding(path.to_string())),
            None => Ok(None),
        }
    }

    async fn put(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(path, value, None).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(path).cloned())
    }

    async fn put(&self, path: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .write()
            .await
            .insert(path.to_string(), value.to_string());
        Ok(())
    }
}

/// Build the store backend selected by `config.backend`.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "etcd" => {
            if config.etcd_endpoints.is_empty() {
                return Err(anyhow!("etcd endpoints are required for the etcd backend"));
            }
            let store = EtcdStore::connect(&config.etcd_endpoints, config.timeout()).await?;
            Ok(Arc::new(store))
        }
        "memory" => {
            info!("Using in-process replicated store");
            Ok(Arc::new(MemStore::new()))
        }
        other => Err(anyhow!("unsupported store backend: {}", other)),
    }
}
