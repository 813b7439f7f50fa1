use super::{Result, Substrate, SubstrateError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// [`Substrate`] backed by the Kubernetes API server.
pub struct KubeSubstrate {
    client: Client,
    namespace: String,
}

impl KubeSubstrate {
    /// Connect using the in-cluster service account or the local kubeconfig.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        info!("Connected to Kubernetes, namespace {}", namespace);
        Ok(Self {
            client,
            namespace: namespace.to_string(),
        })
    }

    fn namespaced<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

async fn list<K>(api: Api<K>) -> Result<Vec<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&ListParams::default()).await?.items)
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    api.create(&PostParams::default(), obj).await?;
    Ok(())
}

async fn replace<K>(api: Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    api.replace(&obj.name_any(), &PostParams::default(), obj).await?;
    Ok(())
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
}

async fn get<K>(api: Api<K>, name: &str) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.get_opt(name)
        .await?
        .ok_or_else(|| SubstrateError::NotFound(name.to_string()))
}

#[async_trait]
impl Substrate for KubeSubstrate {
    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        list(self.namespaced()).await
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        get(self.namespaced(), name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        create(self.namespaced(), deployment).await
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        replace(self.namespaced(), deployment).await
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        delete::<Deployment>(self.namespaced(), name).await
    }

    async fn list_config_maps(&self) -> Result<Vec<ConfigMap>> {
        list(self.namespaced()).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        create(self.namespaced(), config_map).await
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        delete::<ConfigMap>(self.namespaced(), name).await
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        list(self.namespaced()).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        list(self.nodes()).await
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        get(self.nodes(), name).await
    }

    async fn replace_node(&self, node: &Node) -> Result<()> {
        replace(self.nodes(), node).await
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = self.namespaced();
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        create(self.namespaced(), secret).await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        replace(self.namespaced(), secret).await
    }
}
