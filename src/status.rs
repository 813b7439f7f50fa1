//! Feed the state of running workloads back into the container table.

use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use log::error;

use crate::db::Conn;
use crate::join::hash_join;
use crate::secret::{missing_secrets, SecretAccessor, SecretClient};
use crate::substrate::Substrate;
use crate::types::{Container, Image};

const SCHEDULED_CONDITION: &str = "PodScheduled";

fn pod_hostname(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.hostname.clone())
        .unwrap_or_default()
}

/// The status a pod reports, and the time its container started if it is
/// running.  `None` when the pod says nothing useful yet.
fn pod_status(pod: &Pod) -> Option<(String, Option<DateTime<Utc>>)> {
    let status = pod.status.as_ref()?;

    if let Some([container]) = status.container_statuses.as_deref() {
        if let Some(state) = &container.state {
            if let Some(running) = &state.running {
                let started = running.started_at.as_ref().map(|t| t.0);
                return Some(("running".to_string(), started));
            }
            if let Some(waiting) = &state.waiting {
                let reason = waiting.reason.clone().unwrap_or_default();
                return Some((format!("waiting: {}", reason), None));
            }
            if let Some(terminated) = &state.terminated {
                let reason = terminated.reason.clone().unwrap_or_default();
                return Some((format!("terminated: {}", reason), None));
            }
        }
    }

    let scheduled = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == SCHEDULED_CONDITION && c.status == "True");
    scheduled.then(|| ("scheduled".to_string(), None))
}

/// The status of a container that has no pod yet, if there is anything to
/// report.
fn pending_status(
    dbc: &Container,
    images: &HashMap<(String, String), &Image>,
    secrets: &dyn SecretAccessor,
) -> Option<String> {
    let mut status = None;

    let names = dbc.referenced_secrets();
    if !names.is_empty() {
        let missing = missing_secrets(secrets, &names);
        status = Some(if missing.is_empty() {
            "Secrets ready".to_string()
        } else {
            format!("Waiting for secrets: [{}]", missing.join(" "))
        });
    }

    // A pending build is the more useful thing to report.
    if !dbc.dockerfile.is_empty() {
        if let Some(image) = images.get(&(dbc.image.clone(), dbc.dockerfile.clone())) {
            status = Some(image.status.to_string());
        }
    }
    status
}

/// Compute the new state of every container whose status changed.
pub fn container_statuses(
    containers: Vec<Container>,
    pods: &[Pod],
    images: &[Image],
    secrets: &dyn SecretAccessor,
) -> Vec<Container> {
    let images: HashMap<_, _> = images.iter().map(|img| (img.key(), img)).collect();
    let joined = hash_join(
        containers,
        pods.iter(),
        |dbc: &Container| dbc.hostname.clone(),
        |pod: &&Pod| pod_hostname(pod),
    );

    let mut changed = Vec::new();
    for (dbc, pod) in joined.pairs {
        let mut next = dbc.clone();
        next.pod_name = pod.metadata.name.clone().unwrap_or_default();
        if let Some(host_ip) = pod
            .status
            .as_ref()
            .and_then(|s| s.host_ip.as_deref())
            .filter(|ip| !ip.is_empty())
        {
            next.minion = host_ip.to_string();
        }
        if let Some((status, started)) = pod_status(pod) {
            next.status = status;
            if started.is_some() {
                next.created = started;
            }
        }
        if next != dbc {
            changed.push(next);
        }
    }

    for dbc in joined.left_only {
        let Some(status) = pending_status(&dbc, &images, secrets) else {
            continue;
        };
        if status != dbc.status {
            changed.push(Container { status, ..dbc });
        }
    }
    changed
}

/// Refresh container statuses from the pods running in the substrate.
pub async fn update_container_statuses(conn: &Conn, substrate: &dyn Substrate) {
    let pods = match substrate.list_pods().await {
        Ok(pods) => pods,
        Err(e) => {
            error!("Failed to list current pods: {}", e);
            return;
        }
    };

    let names: BTreeSet<String> = conn
        .select(|_: &Container| true)
        .iter()
        .flat_map(Container::referenced_secrets)
        .collect();
    let secrets = match SecretClient::new(substrate).snapshot(&names).await {
        Ok(secrets) => secrets,
        Err(e) => {
            error!("Failed to read secrets: {}", e);
            return;
        }
    };

    let result: Result<(), Infallible> = conn.txn(|view| {
        let images = view.select(|_: &Image| true);
        let containers = view.select(|_: &Container| true);
        for dbc in container_statuses(containers, &pods, &images, &secrets) {
            view.commit(dbc);
        }
        Ok(())
    });
    match result {
        Ok(()) => {}
        Err(never) => match never {},
    }
}
