//! Mirrors the completion annotation of a target resource onto the readiness
//! gate condition of its Pods.
//!
//! The same state machine serves both gate protocols. Each protocol gets its
//! own controller, keyed by Pod, so a Pod is never reconciled twice at once
//! for the same gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{Span, debug, field, info, instrument, warn};
use tracing_error::{ExtractSpanTrace, SpanTrace};

use self::condition::{
    GateState, MissingConditionPolicy, next_conditions, pod_conditions, pod_declares_gate,
};
use crate::config::{ErrorBackoffConfig, GateConfig, ReconcilerConfig};
use crate::error::{SpannedErr, SpannedExt};
use crate::kubernetes_objects::CLUSTER_NAME_LABEL;
use crate::kubernetes_objects::elasticsearch::Elasticsearch;
use crate::kubernetes_objects::store::{KubeStore, ObjectStore, StoreError};
use crate::readiness_gate::{GateKind, GateProtocol};

pub mod condition;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes store error: {0}")]
    Store(#[from] SpannedErr<StoreError>),
}

impl ExtractSpanTrace for ReconcileError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            ReconcileError::Store(e) => e.span_trace(),
        }
    }
}

pub struct Context<S> {
    store: S,
    protocol: GateProtocol,
    gate: GateConfig,
    error_backoff: ErrorBackoffConfig,
    iteration: AtomicU64,
    failures: Mutex<HashMap<ObjectRef<Pod>, u32>>,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(
        store: S,
        protocol: GateProtocol,
        gate: GateConfig,
        error_backoff: ErrorBackoffConfig,
    ) -> Self {
        Self {
            store,
            protocol,
            gate,
            error_backoff,
            iteration: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before retrying `key` after one more failure: the initial delay,
    /// doubled per consecutive failure and capped at the max.
    fn next_error_delay(&self, key: ObjectRef<Pod>) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key).or_insert(0);
        let delay = self
            .error_backoff
            .initial
            .saturating_mul(2u32.saturating_pow(*count))
            .min(self.error_backoff.max);
        *count = count.saturating_add(1);
        delay
    }

    fn reset_failures(&self, key: &ObjectRef<Pod>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drops the failure count of a Pod that left the cache before its retry.
    fn forget_pod(&self, namespace: Option<&str>, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.name != name || key.namespace.as_deref() != namespace);
    }
}

#[instrument(
    "reconcile",
    skip_all,
    fields(
        gate = %ctx.protocol.kind,
        kubernetes_namespace = ?pod.namespace(),
        pod_name = %pod.name_any(),
        iteration = field::Empty
    )
)]
pub async fn reconcile<S: ObjectStore>(
    pod: Arc<Pod>,
    ctx: Arc<Context<S>>,
) -> Result<Action, ReconcileError> {
    let iteration = ctx.iteration.fetch_add(1, Ordering::Relaxed) + 1;
    Span::current().record("iteration", iteration);

    let started = Instant::now();
    info!("Starting reconciliation run");
    let result = reconcile_pod(&pod, &ctx).await;
    info!(
        "Ending reconciliation run (took {} ms)",
        started.elapsed().as_millis()
    );

    if result.is_ok() {
        ctx.reset_failures(&ObjectRef::from_obj(pod.as_ref()));
    }
    result
}

async fn reconcile_pod<S: ObjectStore>(
    pod: &Pod,
    ctx: &Context<S>,
) -> Result<Action, ReconcileError> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let Some(pod) = ctx.store.get_pod(&namespace, &name).await.with_span_trace()? else {
        debug!("Pod '{}' no longer exists.", name);
        return Ok(Action::await_change());
    };
    let Some(es_name) = pod.labels().get(CLUSTER_NAME_LABEL) else {
        debug!("Pod '{}' does not belong to an Elasticsearch cluster.", name);
        return Ok(Action::await_change());
    };
    let Some(es) = ctx
        .store
        .get_target(&namespace, es_name)
        .await
        .with_span_trace()?
    else {
        debug!("Elasticsearch '{}' no longer exists.", es_name);
        return Ok(Action::await_change());
    };

    let (gate, ready) = match GateState::of(ctx.protocol, &es.metadata) {
        GateState::NoGate => return Ok(Action::await_change()),
        GateState::PendingCompletion { gate } => (gate, false),
        GateState::Ready { gate } => (gate, true),
    };
    if !pod_declares_gate(&pod, &gate) {
        debug!("Pod '{}' does not declare readiness gate '{}'.", name, gate);
        return Ok(Action::await_change());
    }
    if !ready && ctx.gate.missing_condition == MissingConditionPolicy::RequeueUntilComplete {
        debug!(
            "Elasticsearch '{}' is not {} complete yet. Checking again in {} seconds.",
            es_name,
            ctx.protocol.kind,
            ctx.gate.requeue_interval.as_secs()
        );
        return Ok(Action::requeue(ctx.gate.requeue_interval));
    }

    let now = Time(Utc::now());
    let Some(conditions) = next_conditions(pod_conditions(&pod), &gate, ready, &now) else {
        debug!("Condition '{}' of Pod '{}' is up to date.", gate, name);
        return Ok(Action::await_change());
    };

    let mut updated = pod.clone();
    updated.status.get_or_insert_with(Default::default).conditions = Some(conditions);
    match ctx.store.update_pod_conditions(&updated).await {
        Ok(_) => {
            info!(
                "Condition '{}' of Pod '{}' set to {}.",
                gate,
                name,
                if ready { "True" } else { "False" }
            );
            Ok(Action::await_change())
        }
        Err(StoreError::Conflict) => {
            debug!("Pod '{}' was modified concurrently. Requeueing.", name);
            Ok(Action::requeue(Duration::ZERO))
        }
        Err(e) => Err(e).with_span_trace().map_err(ReconcileError::Store),
    }
}

pub fn error_policy<S: ObjectStore>(
    pod: Arc<Pod>,
    err: &ReconcileError,
    ctx: Arc<Context<S>>,
) -> Action {
    let delay = ctx.next_error_delay(ObjectRef::from_obj(pod.as_ref()));
    warn!(
        "Reconciliation of Pod '{}' for {} gate failed: {}. Retrying in {} seconds.",
        pod.name_any(),
        ctx.protocol.kind,
        err,
        delay.as_secs()
    );
    Action::requeue(delay)
}

/// Pods of `es` in `cache` that declare the gate `es` currently names.
fn pods_to_reconcile(
    cache: &Store<Pod>,
    protocol: GateProtocol,
    es: &Elasticsearch,
) -> Vec<ObjectRef<Pod>> {
    let gate = protocol.gate(&es.metadata);
    if gate.is_empty() {
        return Vec::new();
    }
    let name = es.name_any();
    cache
        .state()
        .iter()
        .filter(|p| p.namespace() == es.namespace())
        .filter(|p| p.labels().get(CLUSTER_NAME_LABEL) == Some(&name))
        .filter(|p| pod_declares_gate(p, gate))
        .map(|p| ObjectRef::from_obj(p.as_ref()))
        .collect()
}

fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

async fn run_controller(client: Client, config: &ReconcilerConfig, kind: GateKind) {
    let protocol = kind.protocol();
    let namespace = config.namespace.as_deref();
    let ctx = Arc::new(Context::new(
        KubeStore::new(client.clone()),
        protocol,
        config.gate(kind).clone(),
        config.error_backoff.clone(),
    ));

    let pods: Api<Pod> = api(client.clone(), namespace);
    let clusters: Api<Elasticsearch> = api(client, namespace);
    let controller = Controller::new(pods, watcher::Config::default().labels(CLUSTER_NAME_LABEL));
    let cache = controller.store();

    info!("Starting {} readiness gate controller.", kind);
    controller
        .watches(clusters, watcher::Config::default(), move |es| {
            pods_to_reconcile(&cache, protocol, &es)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(move |result| {
            match result {
                Ok((pod, action)) => debug!("Reconciled Pod '{}': {:?}", pod.name, action),
                Err(controller::Error::ObjectNotFound(pod)) => {
                    debug!("Pod '{}' is gone, dropping its retry state.", pod.name);
                    ctx.forget_pod(pod.namespace.as_deref(), &pod.name);
                }
                Err(e) => warn!("{} controller error: {}", kind, e),
            }
            futures::future::ready(())
        })
        .await;
    info!("{} readiness gate controller stopped.", kind);
}

/// Runs one controller per gate protocol until a shutdown signal arrives.
pub async fn run(client: Client, config: ReconcilerConfig) {
    match config.namespace.as_deref() {
        Some(ns) => info!("Watching namespace '{}'.", ns),
        None => info!("Watching all namespaces."),
    }
    futures::future::join_all(
        GateKind::ALL
            .into_iter()
            .map(|kind| run_controller(client.clone(), &config, kind)),
    )
    .await;
}
