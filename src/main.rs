//! Steward daemon entry point.

use std::convert::Infallible;
use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use steward::config::Config;
use steward::controller::{run_substrate_loop, run_sync_loop};
use steward::db::Conn;
use steward::store;
use steward::substrate::KubeSubstrate;
use steward::sync::ContainerSync;
use steward::types::{EtcdRecord, Minion};

/// Write the rows describing this node.  Normally maintained by the machine
/// and membership subsystems; here they come from configuration.
fn seed_identity(conn: &Conn, cfg: &Config) {
    let result: Result<(), Infallible> = conn.txn(|view| {
        let minion = view.insert::<Minion>();
        view.commit(Minion {
            is_self: true,
            role: cfg.minion.role,
            private_ip: cfg.minion.private_ip.clone(),
            provider: cfg.minion.provider.clone(),
            region: cfg.minion.region.clone(),
            size: cfg.minion.size.clone(),
            floating_ip: cfg.minion.floating_ip.clone(),
            ..minion
        });

        let etcd = view.insert::<EtcdRecord>();
        view.commit(EtcdRecord {
            leader: cfg.minion.leader,
            etcd_ips: cfg.store.etcd_endpoints.clone(),
            ..etcd
        });
        Ok(())
    });
    if let Err(never) = result {
        match never {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting steward with config: {:?}", cfg);

    let conn = Conn::new();
    seed_identity(&conn, &cfg);

    // Replicated store
    let store = store::connect(&cfg.store).await?;
    let sync = ContainerSync::new(conn.clone(), store, &cfg.store);
    let mut handles = vec![tokio::spawn(run_sync_loop(sync, cfg.sync_interval()))];

    // Substrate
    if cfg.substrate.enabled {
        match KubeSubstrate::connect(&cfg.substrate.namespace).await {
            Ok(substrate) => handles.push(tokio::spawn(run_substrate_loop(
                conn.clone(),
                Arc::new(substrate),
                cfg.substrate_interval(),
            ))),
            Err(e) => return Err(anyhow::anyhow!("Failed to connect to the substrate: {}", e)),
        }
    } else {
        info!("Substrate reconciliation disabled");
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    for handle in &handles {
        handle.abort();
    }
    futures_util::future::join_all(handles).await;

    info!("Shutdown complete.");
    Ok(())
}
