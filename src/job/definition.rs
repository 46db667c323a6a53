use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use duration_string::DurationString;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use super::backoff::BackoffPolicy;

/// Applied when a job definition sets no `noProgressTimeout`.
pub const DEFAULT_NO_PROGRESS_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Error, Debug)]
pub enum JobDefinitionError {
    #[error("failed to read job definition from '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode job definition: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("failed to decode job definition: {0}")]
    DecodeJson(#[from] serde_json::Error),

    #[error("invalid job definition [{}]", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Post-creation API calls to run against a target resource.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub target: ResourceRef,
    pub api_calls: Vec<ApiCall>,
    pub client_conf: Option<ClientConf>,
    /// Zero means [`DEFAULT_NO_PROGRESS_TIMEOUT`].
    pub no_progress_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Elasticsearch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConf {
    pub request_timeout: Duration,
    pub retry_attempts: u8,
    pub retry_backoff: Duration,
    pub retry_max_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub method: ApiMethod,
    pub path: String,
    /// JSON text sent as the request body. Kept byte for byte when the
    /// definition itself is JSON.
    pub payload: Option<String>,
    pub success_codes: Vec<u16>,
    pub retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl JobDefinition {
    /// Reads a definition from `path`, or from stdin when `path` is `-`.
    pub async fn load(path: &str) -> Result<JobDefinition, JobDefinitionError> {
        let read_err = |source| JobDefinitionError::Read {
            path: path.to_string(),
            source,
        };
        let bytes = if path == "-" {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .map_err(read_err)?;
            buf
        } else {
            tokio::fs::read(Path::new(path)).await.map_err(read_err)?
        };
        Self::parse(&bytes)
    }

    /// Decodes a YAML or JSON document and validates it.
    ///
    /// A document starting with `{` is decoded as JSON so that payloads
    /// reach the cluster exactly as written.
    pub fn parse(bytes: &[u8]) -> Result<JobDefinition, JobDefinitionError> {
        if looks_like_json(bytes) {
            let raw: RawJobDefinition<Box<RawValue>> = serde_json::from_slice(bytes)?;
            JobDefinition::try_from(raw)
        } else {
            let raw: RawJobDefinition<serde_json::Value> = serde_yaml::from_slice(bytes)?;
            JobDefinition::try_from(raw)
        }
    }

    /// Encodes the definition as JSON, the form `parse` reads back verbatim.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&RawJobDefinition::<Box<RawValue>>::try_from(self)?)
    }

    pub fn wait_timeout(&self) -> Duration {
        if self.no_progress_timeout.is_zero() {
            DEFAULT_NO_PROGRESS_TIMEOUT
        } else {
            self.no_progress_timeout
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_client_conf(self.client_conf.as_ref())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Elasticsearch => f.write_str("Elasticsearch"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Elasticsearch" => Ok(ResourceKind::Elasticsearch),
            other => Err(format!("unknown resource kind: '{other}'")),
        }
    }
}

impl ApiCall {
    pub fn is_successful(&self, status: u16) -> bool {
        self.success_codes.contains(&status)
    }

    /// Path with a guaranteed leading slash.
    pub fn request_path(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }

    pub fn body(&self) -> Vec<u8> {
        self.payload
            .as_deref()
            .map(|p| p.as_bytes().to_vec())
            .unwrap_or_default()
    }
}

impl ApiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::Get => "GET",
            ApiMethod::Head => "HEAD",
            ApiMethod::Post => "POST",
            ApiMethod::Put => "PUT",
            ApiMethod::Patch => "PATCH",
            ApiMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(ApiMethod::Get),
            "HEAD" => Ok(ApiMethod::Head),
            "POST" => Ok(ApiMethod::Post),
            "PUT" => Ok(ApiMethod::Put),
            "PATCH" => Ok(ApiMethod::Patch),
            "DELETE" => Ok(ApiMethod::Delete),
            other => Err(format!("unknown method: '{other}'")),
        }
    }
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawJobDefinition<P> {
    #[serde(default)]
    target: RawResourceRef,

    #[serde(default = "Vec::new")]
    api_calls: Vec<RawApiCall<P>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_conf: Option<RawClientConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    no_progress_timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
struct RawResourceRef {
    #[serde(default)]
    kind: String,

    #[serde(default)]
    name: String,

    #[serde(default)]
    namespace: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct RawClientConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_timeout: Option<String>,

    #[serde(default)]
    retry_attempts: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_backoff: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_max_duration: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawApiCall<P> {
    #[serde(default)]
    method: String,

    #[serde(default)]
    path: String,

    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    payload: Option<P>,

    #[serde(default)]
    success_codes: Vec<u16>,

    #[serde(default)]
    retry: bool,
}

/// Payload forms the raw definition can carry.
trait PayloadText {
    fn into_text(self) -> String;
}

impl PayloadText for Box<RawValue> {
    fn into_text(self) -> String {
        self.get().to_string()
    }
}

impl PayloadText for serde_json::Value {
    fn into_text(self) -> String {
        self.to_string()
    }
}

fn looks_like_json(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Parses an optional textual duration, recording a problem under `field`.
fn parse_duration(value: Option<&str>, field: &str, problems: &mut Vec<String>) -> Duration {
    let Some(v) = value else {
        return Duration::ZERO;
    };
    match normalize_duration(v.trim()).map(|n| DurationString::from_str(&n)) {
        Some(Ok(d)) => d.into(),
        _ => {
            problems.push(format!("{field} has an invalid duration '{v}'"));
            Duration::ZERO
        }
    }
}

/// Rewrites the forms `DurationString` does not read, a bare `0`, `µs` and
/// fractional amounts like `1.5s`, into whole units it does.
fn normalize_duration(text: &str) -> Option<String> {
    if text == "0" {
        return Some("0s".to_string());
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut normalized = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        let num_len = rest.find(|c| !is_number(c)).unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_len);
        let unit_len = tail.find(is_number).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit = if unit == "µs" { "us" } else { unit };

        if num.contains('.') {
            let nanos_per_unit = match unit {
                "ns" => 1.0,
                "us" => 1e3,
                "ms" => 1e6,
                "s" => 1e9,
                "m" => 60e9,
                "h" => 3600e9,
                _ => return None,
            };
            let amount: f64 = num.parse().ok()?;
            normalized.push_str(&format!("{}ns", (amount * nanos_per_unit).round() as u64));
        } else {
            normalized.push_str(num);
            normalized.push_str(unit);
        }
        rest = tail;
    }
    Some(normalized)
}

fn format_duration(d: Duration) -> Option<String> {
    (!d.is_zero()).then(|| DurationString::from(d).to_string())
}

impl<P: PayloadText> TryFrom<RawJobDefinition<P>> for JobDefinition {
    type Error = JobDefinitionError;

    fn try_from(raw: RawJobDefinition<P>) -> Result<Self, Self::Error> {
        let mut problems = Vec::new();

        let kind = raw
            .target
            .kind
            .parse::<ResourceKind>()
            .map_err(|e| problems.push(format!("Target {e}")))
            .ok();
        if is_blank(&raw.target.name) {
            problems.push("Target name is required".to_string());
        }
        if is_blank(&raw.target.namespace) {
            problems.push("Target namespace is required".to_string());
        }

        let no_progress_timeout = parse_duration(
            raw.no_progress_timeout.as_deref(),
            "noProgressTimeout",
            &mut problems,
        );

        let client_conf = raw.client_conf.map(|cc| ClientConf {
            request_timeout: parse_duration(
                cc.request_timeout.as_deref(),
                "clientConf.requestTimeout",
                &mut problems,
            ),
            retry_attempts: cc.retry_attempts,
            retry_backoff: parse_duration(
                cc.retry_backoff.as_deref(),
                "clientConf.retryBackoff",
                &mut problems,
            ),
            retry_max_duration: parse_duration(
                cc.retry_max_duration.as_deref(),
                "clientConf.retryMaxDuration",
                &mut problems,
            ),
        });

        let api_calls = raw
            .api_calls
            .into_iter()
            .enumerate()
            .filter_map(|(i, call)| {
                if is_blank(&call.path) {
                    problems.push(format!("API call {i} is missing the path field"));
                }
                let method = call
                    .method
                    .parse::<ApiMethod>()
                    .map_err(|e| problems.push(format!("API call {i} has {e}")))
                    .ok()?;
                Some(ApiCall {
                    method,
                    path: call.path,
                    payload: call.payload.map(PayloadText::into_text),
                    success_codes: call.success_codes,
                    retry: call.retry,
                })
            })
            .collect::<Vec<_>>();

        match kind {
            Some(kind) if problems.is_empty() => Ok(JobDefinition {
                target: ResourceRef {
                    kind,
                    name: raw.target.name,
                    namespace: raw.target.namespace,
                },
                api_calls,
                client_conf,
                no_progress_timeout,
            }),
            _ => Err(JobDefinitionError::Invalid(problems)),
        }
    }
}

impl TryFrom<&JobDefinition> for RawJobDefinition<Box<RawValue>> {
    type Error = serde_json::Error;

    fn try_from(def: &JobDefinition) -> Result<Self, Self::Error> {
        let api_calls = def
            .api_calls
            .iter()
            .map(|call| {
                Ok::<_, serde_json::Error>(RawApiCall {
                    method: call.method.to_string(),
                    path: call.path.clone(),
                    payload: call.payload.clone().map(RawValue::from_string).transpose()?,
                    success_codes: call.success_codes.clone(),
                    retry: call.retry,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RawJobDefinition {
            target: RawResourceRef {
                kind: def.target.kind.to_string(),
                name: def.target.name.clone(),
                namespace: def.target.namespace.clone(),
            },
            api_calls,
            client_conf: def.client_conf.as_ref().map(|cc| RawClientConf {
                request_timeout: format_duration(cc.request_timeout),
                retry_attempts: cc.retry_attempts,
                retry_backoff: format_duration(cc.retry_backoff),
                retry_max_duration: format_duration(cc.retry_max_duration),
            }),
            no_progress_timeout: format_duration(def.no_progress_timeout),
        })
    }
}
