pub mod elasticsearch;
pub mod store;

pub(crate) const MANAGER_ROLE_NAME: &str = "provision-gate";

/// Label carried by every Pod of an Elasticsearch cluster, valued with the cluster name.
pub const CLUSTER_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/cluster-name";

/// Annotation overriding the default Elasticsearch client request timeout.
pub const CLIENT_TIMEOUT_ANNOTATION: &str = "eck.k8s.elastic.co/es-client-timeout";

pub const HTTP_PORT: u16 = 9200;
