use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};

use crate::readiness_gate::GateProtocol;

/// Gate state of a target resource for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NoGate,
    PendingCompletion { gate: String },
    Ready { gate: String },
}

impl GateState {
    pub fn of(protocol: GateProtocol, meta: &ObjectMeta) -> GateState {
        let gate = protocol.gate(meta);
        if gate.is_empty() {
            GateState::NoGate
        } else if protocol.is_complete(meta) {
            GateState::Ready {
                gate: gate.to_string(),
            }
        } else {
            GateState::PendingCompletion {
                gate: gate.to_string(),
            }
        }
    }
}

/// What to do with a Pod whose target has not completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingConditionPolicy {
    /// Write the condition as False right away.
    #[default]
    WriteCurrent,
    /// Leave the Pod untouched and look again later.
    RequeueUntilComplete,
}

fn status_str(ready: bool) -> &'static str {
    if ready { "True" } else { "False" }
}

pub fn pod_declares_gate(pod: &Pod, gate: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.readiness_gates.as_ref())
        .is_some_and(|gates| gates.iter().any(|g| g.condition_type == gate))
}

pub fn pod_conditions(pod: &Pod) -> &[PodCondition] {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// Conditions to persist so that `gate` reflects `ready`, or `None` if the
/// existing ones already do.
///
/// Probe and transition times are only touched on a status change.
pub fn next_conditions(
    existing: &[PodCondition],
    gate: &str,
    ready: bool,
    now: &Time,
) -> Option<Vec<PodCondition>> {
    let status = status_str(ready);
    let mut conditions = existing.to_vec();

    match conditions.iter_mut().find(|c| c.type_ == gate) {
        Some(c) if c.status == status => return None,
        Some(c) => {
            c.status = status.to_string();
            c.last_probe_time = Some(now.clone());
            c.last_transition_time = Some(now.clone());
        }
        None => conditions.push(PodCondition {
            type_: gate.to_string(),
            status: status.to_string(),
            last_probe_time: Some(now.clone()),
            last_transition_time: Some(now.clone()),
            ..Default::default()
        }),
    }
    Some(conditions)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::chrono::DateTime;

    use super::*;
    use crate::readiness_gate::{
        POST_PROVISION_COMPLETE_ANNOTATION, POST_PROVISION_READINESS_GATE_ANNOTATION,
    };

    fn at(second: i64) -> Time {
        Time(DateTime::from_timestamp(second, 0).unwrap())
    }

    fn condition(gate: &str, status: &str, time: i64) -> PodCondition {
        PodCondition {
            type_: gate.to_string(),
            status: status.to_string(),
            last_probe_time: Some(at(time)),
            last_transition_time: Some(at(time)),
            ..Default::default()
        }
    }

    fn meta(annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_gate_state() {
        let p = GateProtocol::POST_PROVISION;
        assert_eq!(GateState::of(p, &meta(&[])), GateState::NoGate);
        assert_eq!(
            GateState::of(p, &meta(&[(POST_PROVISION_COMPLETE_ANNOTATION, "true")])),
            GateState::NoGate
        );
        assert_eq!(
            GateState::of(p, &meta(&[(POST_PROVISION_READINESS_GATE_ANNOTATION, "g")])),
            GateState::PendingCompletion {
                gate: "g".to_string()
            }
        );
        assert_eq!(
            GateState::of(
                p,
                &meta(&[
                    (POST_PROVISION_READINESS_GATE_ANNOTATION, "g"),
                    (POST_PROVISION_COMPLETE_ANNOTATION, "true")
                ])
            ),
            GateState::Ready {
                gate: "g".to_string()
            }
        );
    }

    #[test]
    fn test_adds_missing_condition() {
        let existing = vec![condition("Ready", "False", 1)];
        let next = next_conditions(&existing, "gate", false, &at(10)).unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0], existing[0]);
        assert_eq!(next[1], condition("gate", "False", 10));
    }

    #[test]
    fn test_flips_condition() {
        let existing = vec![condition("gate", "False", 1)];
        let next = next_conditions(&existing, "gate", true, &at(10)).unwrap();
        assert_eq!(next, vec![condition("gate", "True", 10)]);
    }

    #[test]
    fn test_unchanged_condition_is_not_rewritten() {
        let existing = vec![condition("gate", "True", 1)];
        assert_eq!(next_conditions(&existing, "gate", true, &at(10)), None);

        let existing = vec![condition("gate", "False", 1)];
        assert_eq!(next_conditions(&existing, "gate", false, &at(10)), None);
    }

    #[test]
    fn test_missing_condition_policy_serde() {
        let policy: MissingConditionPolicy = serde_yaml::from_str("requeueUntilComplete").unwrap();
        assert_eq!(policy, MissingConditionPolicy::RequeueUntilComplete);
        assert_eq!(MissingConditionPolicy::default(), MissingConditionPolicy::WriteCurrent);
    }
}
