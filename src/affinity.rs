//! Placement rules as substrate scheduling constraints.
//!
//! Host attribute rules are matched against node labels, which
//! [`update_node_labels`] keeps in line with the minion table.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{
    Affinity, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodAffinityTerm, PodAntiAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use log::{error, info, warn};

use crate::deployment::HOSTNAME_KEY;
use crate::substrate::{retry_on_conflict, Backoff, Substrate};
use crate::types::{Minion, Placement};

pub const PROVIDER_KEY: &str = "steward.io/host.provider";
pub const REGION_KEY: &str = "steward.io/host.region";
pub const SIZE_KEY: &str = "steward.io/host.size";
pub const FLOATING_IP_KEY: &str = "steward.io/host.floatingIP";

const TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Combine the placement rules into one affinity per target hostname.
pub fn to_affinities(placements: &[Placement]) -> BTreeMap<String, Affinity> {
    let mut result: BTreeMap<String, Affinity> = BTreeMap::new();
    for plcm in placements {
        let affinity = result.entry(plcm.target_container.clone()).or_default();

        if let Some(other) = &plcm.other_container {
            if plcm.exclusive {
                let term = PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            HOSTNAME_KEY.to_string(),
                            other.clone(),
                        )])),
                        ..Default::default()
                    }),
                    topology_key: TOPOLOGY_KEY.to_string(),
                    ..Default::default()
                };
                affinity
                    .pod_anti_affinity
                    .get_or_insert_with(PodAntiAffinity::default)
                    .required_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(term);
            } else {
                warn!(
                    "Inclusive container placement constraints are not supported, ignoring {:?}",
                    plcm
                );
            }
        }

        let node_constraints = [
            (PROVIDER_KEY, &plcm.provider),
            (REGION_KEY, &plcm.region),
            (SIZE_KEY, &plcm.size),
            (FLOATING_IP_KEY, &plcm.floating_ip),
        ];
        for (key, value) in node_constraints {
            let Some(value) = value.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };

            let operator = if plcm.exclusive { "NotIn" } else { "In" };
            let requirement = NodeSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: Some(vec![value.to_string()]),
            };

            let selector = affinity
                .node_affinity
                .get_or_insert_with(NodeAffinity::default)
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(NodeSelector::default);
            if selector.node_selector_terms.is_empty() {
                selector.node_selector_terms.push(NodeSelectorTerm::default());
            }
            selector.node_selector_terms[0]
                .match_expressions
                .get_or_insert_with(Vec::new)
                .push(requirement);
        }
    }

    result.retain(|_, affinity| {
        affinity.node_affinity.is_some() || affinity.pod_anti_affinity.is_some()
    });
    result
}

fn minion_labels(minion: &Minion) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PROVIDER_KEY.to_string(), minion.provider.clone()),
        (REGION_KEY.to_string(), minion.region.clone()),
        (SIZE_KEY.to_string(), minion.size.clone()),
        (FLOATING_IP_KEY.to_string(), minion.floating_ip.clone()),
    ])
}

fn private_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .map(|addr| addr.address.as_str())
}

fn needs_update(node: &Node, labels: &BTreeMap<String, String>) -> bool {
    let actual = node.labels();
    labels.iter().any(|(k, v)| actual.get(k) != Some(v))
}

/// Make the host attribute labels of every known node match its minion row.
/// Labels not managed here are left alone.
pub async fn update_node_labels(minions: &[Minion], substrate: &dyn Substrate) {
    let node_to_labels: HashMap<&str, BTreeMap<String, String>> = minions
        .iter()
        .map(|m| (m.private_ip.as_str(), minion_labels(m)))
        .collect();

    let nodes = match substrate.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            error!("Failed to get current nodes: {}", e);
            return;
        }
    };

    for node in nodes {
        let name = node.name_any();
        let Some(ip) = private_ip(&node) else {
            error!("Failed to get private IP of node {}", name);
            continue;
        };
        let Some(labels) = node_to_labels.get(ip) else {
            continue;
        };
        if !needs_update(&node, labels) {
            continue;
        }

        info!("Updating labels of node {} to {:?}", name, labels);
        let name = name.as_str();
        // Conflicts are benign, the substrate updates nodes on its own to
        // record their status.
        let result = retry_on_conflict(Backoff::default(), move || async move {
            let mut node = substrate.get_node(name).await?;
            node.labels_mut().extend(labels.clone());
            substrate.replace_node(&node).await
        })
        .await;
        if let Err(e) = result {
            error!("Failed to update labels of node {}: {}", name, e);
        }
    }
}
