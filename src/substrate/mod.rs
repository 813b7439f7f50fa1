use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use thiserror::Error;

pub mod kubernetes;
#[cfg(test)]
pub mod mock;
pub mod retry;

pub use kubernetes::KubeSubstrate;
pub use retry::{retry_on_conflict, Backoff};

#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The object was modified concurrently.  Safe to refetch and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("substrate unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Kube(kube::Error),
}

impl SubstrateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SubstrateError::Conflict(_))
    }
}

impl From<kube::Error> for SubstrateError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => SubstrateError::Conflict(resp.message),
            kube::Error::Api(resp) if resp.code == 404 => SubstrateError::NotFound(resp.message),
            other => SubstrateError::Kube(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SubstrateError>;

/// The slice of the orchestration API the engine drives.
///
/// Namespaced objects live in the namespace the implementation was built
/// for.  Objects are keyed by name.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn list_deployments(&self) -> Result<Vec<Deployment>>;
    async fn get_deployment(&self, name: &str) -> Result<Deployment>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()>;
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn list_config_maps(&self) -> Result<Vec<ConfigMap>>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;
    async fn delete_config_map(&self, name: &str) -> Result<()>;

    async fn list_pods(&self) -> Result<Vec<Pod>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn replace_node(&self, node: &Node) -> Result<()>;

    /// `Ok(None)` if no secret with this name exists.
    async fn get_secret(&self, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, secret: &Secret) -> Result<()>;
    async fn replace_secret(&self, secret: &Secret) -> Result<()>;
}
