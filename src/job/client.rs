use std::future::Future;
use std::time::Duration;

use derive_debug::Dbg;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use reqwest::{Certificate, Method};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use super::definition::{ApiCall, ApiMethod, ClientConf};
use crate::kubernetes_objects::HTTP_PORT;
use crate::kubernetes_objects::elasticsearch::{
    CERT_FILE_NAME, ELASTIC_USER_NAME, Elasticsearch, InvalidVersion, Version,
};
use crate::kubernetes_objects::store::{ObjectStore, StoreError};
use crate::readiness_gate::GateProtocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    pub body: Vec<u8>,
}

impl From<&ApiCall> for ApiRequest {
    fn from(call: &ApiCall) -> Self {
        ApiRequest {
            method: call.method,
            path: call.request_path(),
            body: call.body(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterHealth {
    pub status: HealthStatus,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no available Elasticsearch pods")]
    NoAvailablePods,

    #[error("secret '{0}' not found")]
    SecretNotFound(String),

    #[error("secret '{secret}' has no '{key}' entry")]
    SecretKeyMissing { secret: String, key: String },

    #[error("failed to parse certificates from secret '{0}'")]
    InvalidCertificates(String, #[source] Option<reqwest::Error>),

    #[error("failed to parse Elasticsearch version: {0}")]
    Version(#[from] InvalidVersion),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Kubernetes store error: {0}")]
    Store(#[from] StoreError),
}

/// Error of a health probe: the cluster could not be reached yet.
#[derive(Error, Debug)]
pub enum UnreachableError {
    #[error("failed to get Elasticsearch client: {0}")]
    Resolve(#[from] ResolveError),

    #[error("failed to get Elasticsearch health: {0}")]
    Health(#[from] ClientError),
}

/// HTTP access to one Elasticsearch cluster.
pub trait ClusterClient: Send + Sync {
    /// Sends `req`. The response body is always read to the end.
    fn request(
        &self,
        req: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, ClientError>> + Send;

    fn cluster_health(&self) -> impl Future<Output = Result<ClusterHealth, ClientError>> + Send;
}

/// Builds a [`ClusterClient`] for a target resource.
pub trait Connector: Clone + Send + Sync + 'static {
    type Client: ClusterClient;

    fn connect<S: ObjectStore>(
        &self,
        store: &S,
        es: &Elasticsearch,
        conf: Option<&ClientConf>,
        protocol: GateProtocol,
    ) -> impl Future<Output = Result<Self::Client, ResolveError>> + Send;
}

#[derive(Dbg)]
pub struct ElasticsearchClient {
    #[dbg(skip)]
    http: reqwest::Client,
    base_url: String,
    user: String,
    #[dbg(placeholder = "***")]
    password: String,
    version: Version,
}

fn to_method(method: ApiMethod) -> Method {
    match method {
        ApiMethod::Get => Method::GET,
        ApiMethod::Head => Method::HEAD,
        ApiMethod::Post => Method::POST,
        ApiMethod::Put => Method::PUT,
        ApiMethod::Patch => Method::PATCH,
        ApiMethod::Delete => Method::DELETE,
    }
}

impl ClusterClient for ElasticsearchClient {
    async fn request(&self, req: &ApiRequest) -> Result<ApiResponse, ClientError> {
        let mut builder = self
            .http
            .request(to_method(req.method), format!("{}{}", self.base_url, req.path))
            .basic_auth(&self.user, Some(&self.password));
        if !req.body.is_empty() {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(req.body.clone());
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                debug!("Failed to read response body: {}", e);
                Vec::new()
            }
        };
        Ok(ApiResponse { status, body })
    }

    async fn cluster_health(&self) -> Result<ClusterHealth, ClientError> {
        let resp = self
            .request(&ApiRequest {
                method: ApiMethod::Get,
                path: "/_cluster/health".to_string(),
                body: Vec::new(),
            })
            .await?;
        if resp.status != 200 {
            return Err(ClientError::UnexpectedStatus(resp.status));
        }
        Ok(serde_json::from_slice(&resp.body)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    type Client = ElasticsearchClient;

    async fn connect<S: ObjectStore>(
        &self,
        store: &S,
        es: &Elasticsearch,
        conf: Option<&ClientConf>,
        protocol: GateProtocol,
    ) -> Result<ElasticsearchClient, ResolveError> {
        resolve_client(store, es, conf, protocol).await
    }
}

/// Where to reach a cluster, and whether that address is a Pod IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub direct_to_pod: bool,
}

/// Picks the address to reach `es` at.
///
/// While Pods are held back by the readiness gate the service has no ready
/// endpoints, so a running Pod is addressed directly instead.
pub async fn resolve_endpoint<S: ObjectStore>(
    store: &S,
    es: &Elasticsearch,
    protocol: GateProtocol,
) -> Result<Endpoint, ResolveError> {
    if !es.has_readiness_gate(protocol.gate(&es.metadata)) {
        return Ok(Endpoint {
            url: es.service_url(),
            direct_to_pod: false,
        });
    }

    let namespace = es.namespace().unwrap_or_default();
    let pods = store.list_pods(&namespace, &es.pod_selector()).await?;
    pods.iter()
        .find_map(running_pod_ip)
        .map(|ip| Endpoint {
            url: format!("{}://{}:{}", es.scheme(), ip, HTTP_PORT),
            direct_to_pod: true,
        })
        .ok_or(ResolveError::NoAvailablePods)
}

fn running_pod_ip(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
    if ip.contains(':') {
        Some(format!("[{ip}]"))
    } else {
        Some(ip.to_string())
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<Vec<u8>, ResolveError> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .ok_or_else(|| ResolveError::SecretKeyMissing {
            secret: secret.name_any(),
            key: key.to_string(),
        })
}

async fn load_secret<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: String,
) -> Result<Secret, ResolveError> {
    store
        .get_secret(namespace, &name)
        .await?
        .ok_or(ResolveError::SecretNotFound(name))
}

/// Loads the CA certificates of the HTTP layer from the public certs secret.
pub async fn load_certificates<S: ObjectStore>(
    store: &S,
    es: &Elasticsearch,
) -> Result<Vec<Certificate>, ResolveError> {
    let namespace = es.namespace().unwrap_or_default();
    let name = es.public_certs_secret_name();
    let secret = load_secret(store, &namespace, name.clone()).await?;
    let pem = secret_value(&secret, CERT_FILE_NAME)?;
    let certs = Certificate::from_pem_bundle(&pem)
        .map_err(|e| ResolveError::InvalidCertificates(name.clone(), Some(e)))?;
    if certs.is_empty() {
        return Err(ResolveError::InvalidCertificates(name, None));
    }
    Ok(certs)
}

pub async fn load_password<S: ObjectStore>(
    store: &S,
    es: &Elasticsearch,
) -> Result<String, ResolveError> {
    let namespace = es.namespace().unwrap_or_default();
    let secret = load_secret(store, &namespace, es.elastic_user_secret_name()).await?;
    let password = secret_value(&secret, ELASTIC_USER_NAME)?;
    String::from_utf8(password).map_err(|_| ResolveError::SecretKeyMissing {
        secret: secret.name_any(),
        key: ELASTIC_USER_NAME.to_string(),
    })
}

pub fn request_timeout(es: &Elasticsearch, conf: Option<&ClientConf>) -> Duration {
    conf.map(|c| c.request_timeout)
        .filter(|t| !t.is_zero())
        .unwrap_or_else(|| es.request_timeout())
}

#[instrument(
    "resolve_client",
    level = "debug",
    skip_all,
    fields(
        kubernetes_namespace = ?es.namespace(),
        elasticsearch_name = %es.name_any()
    )
)]
pub async fn resolve_client<S: ObjectStore>(
    store: &S,
    es: &Elasticsearch,
    conf: Option<&ClientConf>,
    protocol: GateProtocol,
) -> Result<ElasticsearchClient, ResolveError> {
    let endpoint = resolve_endpoint(store, es, protocol).await?;
    let timeout = request_timeout(es, conf);
    let version = es.spec.version.parse::<Version>()?;

    debug!(
        "Elasticsearch connection settings: VERSION={} URL={} REQTIMEOUT={}s",
        version,
        endpoint.url,
        timeout.as_secs_f64()
    );

    let mut builder = reqwest::Client::builder().timeout(timeout);
    if es.spec.http.tls.enabled() {
        builder = builder.tls_built_in_root_certs(false);
        for cert in load_certificates(store, es).await? {
            builder = builder.add_root_certificate(cert);
        }
        if endpoint.direct_to_pod {
            // certificates are issued for the service names, not Pod IPs
            builder = builder.danger_accept_invalid_hostnames(true);
        }
    }
    let password = load_password(store, es).await?;

    let client = ElasticsearchClient {
        http: builder.build()?,
        base_url: endpoint.url,
        user: ELASTIC_USER_NAME.to_string(),
        password,
        version,
    };
    debug!("Elasticsearch client ready: {:?}", client);
    Ok(client)
}
