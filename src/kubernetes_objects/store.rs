use std::collections::BTreeMap;
use std::future::Future;

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{Instrument, trace_span};

use super::MANAGER_ROLE_NAME;
use super::elasticsearch::Elasticsearch;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object was modified concurrently")]
    Conflict,

    #[error("object has no resource version")]
    MissingResourceVersion,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Kubernetes client error: {0}")]
    KubeClient(#[source] kube::Error),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict,
            _ => StoreError::KubeClient(err),
        }
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

/// Read/write access to the Kubernetes objects this crate coordinates through.
///
/// Writes are optimistic: they carry the resource version of the object they
/// were computed from and fail with [`StoreError::Conflict`] if it changed.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    fn get_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Elasticsearch>, StoreError>> + Send;

    /// Persists the annotations of `es`.
    fn update_target_annotations(
        &self,
        es: &Elasticsearch,
    ) -> impl Future<Output = Result<Elasticsearch, StoreError>> + Send;

    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Pod>, StoreError>> + Send;

    fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<Pod>, StoreError>> + Send;

    /// Persists the conditions of `pod` through the status subresource.
    fn update_pod_conditions(
        &self,
        pod: &Pod,
    ) -> impl Future<Output = Result<Pod, StoreError>> + Send;

    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Secret>, StoreError>> + Send;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER_ROLE_NAME.to_string()),
            ..Default::default()
        }
    }
}

impl ObjectStore for KubeStore {
    async fn get_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Elasticsearch>, StoreError> {
        let api: Api<Elasticsearch> = Api::namespaced(self.client.clone(), namespace);
        async { api.get_opt(name).await.map_err(StoreError::from) }
            .instrument(trace_span!(
                "get_elasticsearch",
                kubernetes_namespace = %namespace,
                elasticsearch_name = %name
            ))
            .await
    }

    async fn update_target_annotations(
        &self,
        es: &Elasticsearch,
    ) -> Result<Elasticsearch, StoreError> {
        let namespace = es.namespace().unwrap_or_default();
        let name = es.name_any();
        let resource_version = es
            .resource_version()
            .ok_or(StoreError::MissingResourceVersion)?;
        let api: Api<Elasticsearch> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": es.annotations(),
            }
        });
        async {
            api.patch(&name, &Self::patch_params(), &Patch::Merge(&patch))
                .await
                .map_err(StoreError::from)
        }
        .instrument(trace_span!(
            "patch_elasticsearch_annotations",
            kubernetes_namespace = %namespace,
            elasticsearch_name = %name
        ))
        .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        async { api.get_opt(name).await.map_err(StoreError::from) }
            .instrument(trace_span!(
                "get_pod",
                kubernetes_namespace = %namespace,
                pod_name = %name
            ))
            .await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let params = ListParams::default().labels(&selector);
        async { api.list(&params).await.map_err(StoreError::from) }
            .instrument(trace_span!(
                "list_pods",
                kubernetes_namespace = %namespace,
                label_selector = %selector
            ))
            .await
            .map(|list| list.items)
    }

    async fn update_pod_conditions(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let resource_version = pod
            .resource_version()
            .ok_or(StoreError::MissingResourceVersion)?;
        let conditions = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
            },
            "status": {
                "conditions": conditions,
            }
        });
        async {
            api.patch_status(&name, &Self::patch_params(), &Patch::Merge(&patch))
                .await
                .map_err(StoreError::from)
        }
        .instrument(trace_span!(
            "patch_pod_status",
            kubernetes_namespace = %namespace,
            pod_name = %name
        ))
        .await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        async { api.get_opt(name).await.map_err(StoreError::from) }
            .instrument(trace_span!(
                "get_secret",
                kubernetes_namespace = %namespace,
                secret_name = %name
            ))
            .await
    }
}
