//! In-memory substrate for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use kube::ResourceExt;

use super::{Result, Substrate, SubstrateError};

#[derive(Default)]
pub struct MockState {
    pub deployments: BTreeMap<String, Deployment>,
    pub config_maps: BTreeMap<String, ConfigMap>,
    pub pods: Vec<Pod>,
    pub nodes: BTreeMap<String, Node>,
    pub secrets: BTreeMap<String, Secret>,
    /// Mutating calls in the order they were made, e.g. `create deployment a`.
    pub actions: Vec<String>,
    /// Remaining conflicts to report per replaced object name.
    pub conflicts: HashMap<String, u32>,
    /// Object names whose mutations fail outright.
    pub broken: HashSet<String>,
    pub fail_lists: bool,
}

#[derive(Default)]
pub struct MockSubstrate {
    state: Mutex<MockState>,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Drain the recorded actions.
    pub fn take_actions(&self) -> Vec<String> {
        std::mem::take(&mut self.state().actions)
    }

    fn list<T: Clone>(&self, pick: impl FnOnce(&MockState) -> Vec<T>) -> Result<Vec<T>> {
        let state = self.state();
        if state.fail_lists {
            return Err(SubstrateError::Unavailable("list failed".into()));
        }
        Ok(pick(&state))
    }

    fn mutate(&self, action: &str, kind: &str, name: &str) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.state();
        if state.broken.contains(name) {
            return Err(SubstrateError::Unavailable(format!("{} {} failed", action, name)));
        }
        if action == "replace" {
            if let Some(left) = state.conflicts.get_mut(name) {
                if *left > 0 {
                    *left -= 1;
                    state.actions.push(format!("conflict {} {}", kind, name));
                    return Err(SubstrateError::Conflict(name.to_string()));
                }
            }
        }
        state.actions.push(format!("{} {} {}", action, kind, name));
        Ok(state)
    }
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        self.list(|s| s.deployments.values().cloned().collect())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        self.state()
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let name = deployment.name_any();
        let mut state = self.mutate("create", "deployment", &name)?;
        state.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        let name = deployment.name_any();
        let mut state = self.mutate("replace", "deployment", &name)?;
        state.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let mut state = self.mutate("delete", "deployment", name)?;
        state.deployments.remove(name);
        Ok(())
    }

    async fn list_config_maps(&self) -> Result<Vec<ConfigMap>> {
        self.list(|s| s.config_maps.values().cloned().collect())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let name = config_map.name_any();
        let mut state = self.mutate("create", "configmap", &name)?;
        state.config_maps.insert(name, config_map.clone());
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        let mut state = self.mutate("delete", "configmap", name)?;
        state.config_maps.remove(name);
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.list(|s| s.pods.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list(|s| s.nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.state()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))
    }

    async fn replace_node(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        let mut state = self.mutate("replace", "node", &name)?;
        state.nodes.insert(name, node.clone());
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.state().secrets.get(name).cloned())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let name = secret.name_any();
        let mut state = self.mutate("create", "secret", &name)?;
        state.secrets.insert(name, secret.clone());
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let name = secret.name_any();
        let mut state = self.mutate("replace", "secret", &name)?;
        state.secrets.insert(name, secret.clone());
        Ok(())
    }
}
