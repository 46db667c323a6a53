//! Readiness gates expressed as a pair of annotations on a target resource.
//!
//! The gate annotation names the Pod condition type that dependent Pods wait
//! on. The completion annotation flips to `"true"` once the job behind the
//! gate has finished. A resource without a gate annotation is never gated.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::{Deserialize, Serialize};

pub const BOOTSTRAPPED_ANNOTATION: &str = "eck.k8s.elastic.co/bootstrapped";
pub const BOOTSTRAP_READINESS_GATE_ANNOTATION: &str = "eck.k8s.elastic.co/bootstrap-readiness-gate";

pub const POST_PROVISION_COMPLETE_ANNOTATION: &str = "eck.k8s.elastic.co/post-provision-complete";
pub const POST_PROVISION_READINESS_GATE_ANNOTATION: &str =
    "eck.k8s.elastic.co/post-provision-readiness-gate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateKind {
    Bootstrap,
    PostProvision,
}

impl GateKind {
    pub const ALL: [GateKind; 2] = [GateKind::Bootstrap, GateKind::PostProvision];

    pub fn protocol(self) -> GateProtocol {
        match self {
            GateKind::Bootstrap => GateProtocol::BOOTSTRAP,
            GateKind::PostProvision => GateProtocol::POST_PROVISION,
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateKind::Bootstrap => f.write_str("bootstrap"),
            GateKind::PostProvision => f.write_str("post-provision"),
        }
    }
}

impl FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bootstrap" => Ok(GateKind::Bootstrap),
            "post-provision" => Ok(GateKind::PostProvision),
            other => Err(format!("unknown readiness gate kind: {other}")),
        }
    }
}

/// One instance of the annotation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateProtocol {
    pub kind: GateKind,
    pub gate_annotation: &'static str,
    pub complete_annotation: &'static str,
}

impl GateProtocol {
    pub const BOOTSTRAP: GateProtocol = GateProtocol {
        kind: GateKind::Bootstrap,
        gate_annotation: BOOTSTRAP_READINESS_GATE_ANNOTATION,
        complete_annotation: BOOTSTRAPPED_ANNOTATION,
    };

    pub const POST_PROVISION: GateProtocol = GateProtocol {
        kind: GateKind::PostProvision,
        gate_annotation: POST_PROVISION_READINESS_GATE_ANNOTATION,
        complete_annotation: POST_PROVISION_COMPLETE_ANNOTATION,
    };

    /// Name of the readiness gate, empty if the object is not gated.
    pub fn gate<'a>(&self, meta: &'a ObjectMeta) -> &'a str {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(self.gate_annotation))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_complete(&self, meta: &ObjectMeta) -> bool {
        if self.gate(meta).is_empty() {
            return true;
        }
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(self.complete_annotation))
            .is_some_and(|v| v == "true")
    }

    /// Marks `obj` as complete in memory. Persisting it is up to the caller.
    pub fn set_complete<K: Resource>(&self, obj: Option<&mut K>) {
        let Some(obj) = obj else {
            return;
        };
        obj.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(self.complete_annotation.to_string(), "true".to_string());
    }
}
