//! Keeps the local container table and the replicated store in agreement.
//!
//! The leader is authoritative: it publishes its whole container table to
//! the store.  Every other node mirrors what the leader published, workers
//! keeping only the containers scheduled on them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::db::{Conn, View};
use crate::join::hash_join;
use crate::store::{Store, StoreError};
use crate::types::{Container, Minion, Role};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no {0} row yet")]
    NotReady(&'static str),
    #[error("no desired state published yet")]
    NoDesiredState,
    #[error("replicated store did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed container payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode `containers` the way the leader publishes them.  The output only
/// depends on the set of replicated identities, not on row ids or order.
pub fn encode_containers(mut containers: Vec<Container>) -> Result<String, serde_json::Error> {
    containers.sort_by_cached_key(Container::replicated_key);
    serde_json::to_string_pretty(&containers)
}

pub struct ContainerSync {
    conn: Conn,
    store: Arc<dyn Store>,
    path: String,
    timeout: Duration,
}

impl ContainerSync {
    pub fn new(conn: Conn, store: Arc<dyn Store>, config: &StoreConfig) -> Self {
        Self {
            conn,
            store,
            path: config.container_path.clone(),
            timeout: config.timeout(),
        }
    }

    /// One sync pass in the direction dictated by leadership.
    pub async fn run_once(&self) -> Result<(), SyncError> {
        let (minion, etcd) = self
            .conn
            .read(|view| (view.minion_self(), view.etcd_record()));
        let minion = minion.ok_or(SyncError::NotReady("self minion"))?;
        let etcd = etcd.ok_or(SyncError::NotReady("etcd"))?;

        if etcd.leader {
            self.publish().await
        } else {
            self.mirror(&minion).await
        }
    }

    async fn publish(&self) -> Result<(), SyncError> {
        let containers = self.conn.select(|_: &Container| true);
        let count = containers.len();
        let payload = encode_containers(containers)?;
        self.bounded(self.store.put(&self.path, &payload)).await?;
        debug!("Published {} containers to {}", count, self.path);
        Ok(())
    }

    async fn mirror(&self, minion: &Minion) -> Result<(), SyncError> {
        let payload = self
            .bounded(self.store.get(&self.path))
            .await?
            .filter(|payload| !payload.trim().is_empty())
            .ok_or(SyncError::NoDesiredState)?;

        let mut remote: Vec<Container> = serde_json::from_str(&payload)?;
        if minion.role == Role::Worker {
            remote.retain(|dbc| dbc.minion == minion.private_ip);
        }

        let (added, removed) = self
            .conn
            .txn(|view| Ok::<_, SyncError>(join_containers(view, remote)))?;
        if added + removed > 0 {
            debug!(
                "Mirrored {}: {} containers added, {} removed",
                self.path, added, removed
            );
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }
}

/// Make the container table hold exactly `remote`.  Rows already present
/// keep their id and local fields.  Returns the number of rows added and
/// removed.
fn join_containers(view: &mut View<'_>, remote: Vec<Container>) -> (usize, usize) {
    let local = view.select(|_: &Container| true);
    let joined = hash_join(
        remote,
        local,
        Container::replicated_key,
        Container::replicated_key,
    );

    for stale in &joined.right_only {
        view.remove(stale);
    }
    for dbc in &joined.left_only {
        let row = view.insert::<Container>();
        view.commit(Container {
            id: row.id,
            ..dbc.clone()
        });
    }
    (joined.left_only.len(), joined.right_only.len())
}
