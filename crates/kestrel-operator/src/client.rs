//! Cluster access seam used by the reconciler
//!
//! Resources travel as JSON so that templates and diffs work on the same
//! representation for every kind. [`KubeClusterApi`] maps each
//! [`ResourceKind`] onto the typed `kube::Api`.

use crate::crds::{Broker, BrokerStatus};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;

/// Generated resource kinds the synchronizer manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    StatefulSet,
    Service,
    Secret,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Service => "Service",
            ResourceKind::Secret => "Secret",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object; `None` when it does not exist
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>>;

    async fn create(&self, kind: ResourceKind, namespace: &str, object: &Value) -> Result<()>;

    /// Full replace; the object carries the observed `resourceVersion`
    async fn replace(&self, kind: ResourceKind, namespace: &str, name: &str, object: &Value) -> Result<()>;

    /// Objects of `kind` matching a label selector
    async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> Result<Vec<Value>>;

    /// Delete one object; an already missing object is not an error
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn patch_broker_status(&self, namespace: &str, name: &str, status: &BrokerStatus) -> Result<()>;
}

/// [`ClusterApi`] backed by a live cluster
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_as<K>(&self, namespace: &str, name: &str) -> Result<Option<Value>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await? {
            Some(object) => Ok(Some(serde_json::to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn create_as<K>(&self, namespace: &str, object: &Value) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let typed: K = serde_json::from_value(object.clone())?;
        api.create(&PostParams::default(), &typed).await?;
        Ok(())
    }

    async fn replace_as<K>(&self, namespace: &str, name: &str, object: &Value) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let typed: K = serde_json::from_value(object.clone())?;
        api.replace(name, &PostParams::default(), &typed).await?;
        Ok(())
    }

    async fn list_as<K>(&self, namespace: &str, label_selector: &str) -> Result<Vec<Value>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        list.items
            .into_iter()
            .map(|object| serde_json::to_value(object).map_err(Into::into))
            .collect()
    }

    async fn delete_as<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        match kind {
            ResourceKind::StatefulSet => self.get_as::<StatefulSet>(namespace, name).await,
            ResourceKind::Service => self.get_as::<Service>(namespace, name).await,
            ResourceKind::Secret => self.get_as::<Secret>(namespace, name).await,
        }
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, object: &Value) -> Result<()> {
        match kind {
            ResourceKind::StatefulSet => self.create_as::<StatefulSet>(namespace, object).await,
            ResourceKind::Service => self.create_as::<Service>(namespace, object).await,
            ResourceKind::Secret => self.create_as::<Secret>(namespace, object).await,
        }
    }

    async fn replace(&self, kind: ResourceKind, namespace: &str, name: &str, object: &Value) -> Result<()> {
        match kind {
            ResourceKind::StatefulSet => self.replace_as::<StatefulSet>(namespace, name, object).await,
            ResourceKind::Service => self.replace_as::<Service>(namespace, name, object).await,
            ResourceKind::Secret => self.replace_as::<Secret>(namespace, name, object).await,
        }
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> Result<Vec<Value>> {
        match kind {
            ResourceKind::StatefulSet => self.list_as::<StatefulSet>(namespace, label_selector).await,
            ResourceKind::Service => self.list_as::<Service>(namespace, label_selector).await,
            ResourceKind::Secret => self.list_as::<Secret>(namespace, label_selector).await,
        }
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ResourceKind::StatefulSet => self.delete_as::<StatefulSet>(namespace, name).await,
            ResourceKind::Service => self.delete_as::<Service>(namespace, name).await,
            ResourceKind::Secret => self.delete_as::<Secret>(namespace, name).await,
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(pods.items)
    }

    async fn patch_broker_status(&self, namespace: &str, name: &str, status: &BrokerStatus) -> Result<()> {
        let api: Api<Broker> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status_merge_patch(status)? });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Merge patches keep absent keys, so cleared optional fields are sent as `null`
pub fn status_merge_patch(status: &BrokerStatus) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        for key in ["scaleDown", "appliedChecksum"] {
            fields.entry(key).or_insert(Value::Null);
        }
    }
    Ok(value)
}
