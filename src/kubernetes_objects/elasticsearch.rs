use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use duration_string::DurationString;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CLIENT_TIMEOUT_ANNOTATION, CLUSTER_NAME_LABEL, HTTP_PORT};

/// Key of the CA certificate inside the public certs secret.
pub const CERT_FILE_NAME: &str = "tls.crt";

/// Built-in superuser whose password lives in the generated user secret.
pub const ELASTIC_USER_NAME: &str = "elastic";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Subset of the Elasticsearch custom resource read by this crate.
///
/// Fields not listed here are left untouched: writes go through merge patches
/// on metadata only.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "elasticsearch.k8s.elastic.co",
    version = "v1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    namespaced,
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub node_sets: Vec<NodeSet>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default)]
    pub tls: TlsOptions,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed_certificate: Option<SelfSignedCertificate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedCertificate {
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,
}

impl TlsOptions {
    pub fn enabled(&self) -> bool {
        let self_signed_disabled = self
            .self_signed_certificate
            .as_ref()
            .is_some_and(|s| s.disabled);
        let user_defined = self
            .certificate
            .as_ref()
            .and_then(|c| c.secret_name.as_deref())
            .is_some_and(|n| !n.is_empty());
        !self_signed_disabled || user_defined
    }
}

impl Elasticsearch {
    pub fn scheme(&self) -> &'static str {
        if self.spec.http.tls.enabled() {
            "https"
        } else {
            "http"
        }
    }

    pub fn http_service_name(&self) -> String {
        format!("{}-es-http", self.name_any())
    }

    /// Stable in-cluster address of the HTTP service.
    pub fn service_url(&self) -> String {
        format!(
            "{}://{}.{}.svc:{}",
            self.scheme(),
            self.http_service_name(),
            self.namespace().unwrap_or_default(),
            HTTP_PORT
        )
    }

    pub fn public_certs_secret_name(&self) -> String {
        format!("{}-es-http-certs-public", self.name_any())
    }

    pub fn elastic_user_secret_name(&self) -> String {
        format!("{}-es-elastic-user", self.name_any())
    }

    /// Labels selecting every Pod of this cluster.
    pub fn pod_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), self.name_any())])
    }

    /// Whether any node set declares `gate` as a Pod readiness gate.
    pub fn has_readiness_gate(&self, gate: &str) -> bool {
        if gate.is_empty() {
            return false;
        }
        self.spec
            .node_sets
            .iter()
            .filter_map(|ns| ns.pod_template.as_ref())
            .filter_map(|t| t.spec.as_ref())
            .filter_map(|s| s.readiness_gates.as_ref())
            .flatten()
            .any(|rg| rg.condition_type == gate)
    }

    /// Client timeout from the override annotation, or the default.
    pub fn request_timeout(&self) -> Duration {
        self.annotations()
            .get(CLIENT_TIMEOUT_ANNOTATION)
            .and_then(|v| DurationString::from_str(v).ok())
            .map(Duration::from)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version '{0}'")]
pub struct InvalidVersion(pub String);

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_string());
        let (core, pre) = match s.trim().split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (s.trim(), None),
        };
        let parts = core
            .split('.')
            .map(|p| p.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        match parts.as_slice() {
            [major, minor, patch] => Ok(Version {
                major: *major,
                minor: *minor,
                patch: *patch,
                pre,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodReadinessGate, PodSpec};

    pub(crate) fn mk_elasticsearch(name: &str, namespace: &str) -> Elasticsearch {
        let mut es = Elasticsearch::new(
            name,
            ElasticsearchSpec {
                version: "8.15.0".to_string(),
                ..Default::default()
            },
        );
        es.metadata.namespace = Some(namespace.to_string());
        es
    }

    pub(crate) fn with_readiness_gate(mut es: Elasticsearch, gate: &str) -> Elasticsearch {
        es.spec.node_sets.push(NodeSet {
            name: "default".to_string(),
            pod_template: Some(PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    readiness_gates: Some(vec![PodReadinessGate {
                        condition_type: gate.to_string(),
                    }]),
                    ..Default::default()
                }),
            }),
        });
        es
    }

    #[test]
    fn test_tls_enabled_by_default() {
        let es = mk_elasticsearch("quickstart", "default");
        assert!(es.spec.http.tls.enabled());
        assert_eq!(es.service_url(), "https://quickstart-es-http.default.svc:9200");
    }

    #[test]
    fn test_tls_disabled_self_signed() {
        let mut es = mk_elasticsearch("quickstart", "default");
        es.spec.http.tls.self_signed_certificate = Some(SelfSignedCertificate { disabled: true });
        assert_eq!(es.service_url(), "http://quickstart-es-http.default.svc:9200");

        es.spec.http.tls.certificate = Some(SecretRef {
            secret_name: Some("my-cert".to_string()),
        });
        assert_eq!(es.scheme(), "https");
    }

    #[test]
    fn test_has_readiness_gate() {
        let es = mk_elasticsearch("quickstart", "default");
        assert!(!es.has_readiness_gate("gate"));

        let es = with_readiness_gate(es, "gate");
        assert!(es.has_readiness_gate("gate"));
        assert!(!es.has_readiness_gate("other"));
        assert!(!es.has_readiness_gate(""));
    }

    #[test]
    fn test_request_timeout_annotation() {
        let mut es = mk_elasticsearch("quickstart", "default");
        assert_eq!(es.request_timeout(), DEFAULT_REQUEST_TIMEOUT);

        es.annotations_mut()
            .insert(CLIENT_TIMEOUT_ANNOTATION.to_string(), "45s".to_string());
        assert_eq!(es.request_timeout(), Duration::from_secs(45));

        es.annotations_mut()
            .insert(CLIENT_TIMEOUT_ANNOTATION.to_string(), "soon".to_string());
        assert_eq!(es.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(
            "8.15.0".parse::<Version>().unwrap(),
            Version {
                major: 8,
                minor: 15,
                patch: 0,
                pre: None
            }
        );
        let snapshot = "7.17.1-SNAPSHOT".parse::<Version>().unwrap();
        assert_eq!(snapshot.pre.as_deref(), Some("SNAPSHOT"));
        assert_eq!(snapshot.to_string(), "7.17.1-SNAPSHOT");

        assert!("".parse::<Version>().is_err());
        assert!("8.15".parse::<Version>().is_err());
        assert!("8.x.0".parse::<Version>().is_err());
        assert!("8.15.0-".parse::<Version>().is_err());
    }
}
