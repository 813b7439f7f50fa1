//! Periodic control loops.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{self, MissedTickBehavior};

use crate::affinity::update_node_labels;
use crate::db::Conn;
use crate::deployment::update_deployments;
use crate::status::update_container_statuses;
use crate::substrate::Substrate;
use crate::sync::{ContainerSync, SyncError};
use crate::types::Minion;

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sync the container table with the replicated store every `period`.
pub async fn run_sync_loop(sync: ContainerSync, period: Duration) {
    info!("Starting container sync every {:?}", period);
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        match sync.run_once().await {
            Ok(()) => {}
            Err(e @ (SyncError::NotReady(_) | SyncError::NoDesiredState)) => {
                debug!("Skipping container sync: {}", e)
            }
            Err(e) => warn!("Container sync failed: {}", e),
        }
    }
}

/// One reconciliation pass against the substrate.  Only the leader changes
/// what runs; every node reports status.
pub async fn reconcile_once(conn: &Conn, substrate: &dyn Substrate) {
    let leader = conn.read(|view| view.etcd_record().is_some_and(|etcd| etcd.leader));
    if leader {
        let minions = conn.select(|_: &Minion| true);
        update_node_labels(&minions, substrate).await;
        update_deployments(conn, substrate).await;
    }
    update_container_statuses(conn, substrate).await;
}

pub async fn run_substrate_loop(conn: Conn, substrate: Arc<dyn Substrate>, period: Duration) {
    info!("Starting substrate reconciliation every {:?}", period);
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        reconcile_once(&conn, substrate.as_ref()).await;
    }
}
