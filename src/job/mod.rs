//! One-shot job: wait for a healthy target, run its API calls, then mark
//! the target complete for the selected readiness gate.

use std::fmt::Display;

use futures::Stream;
use kube::ResourceExt;
use tracing::{info, instrument};

use self::backoff::{BackoffPolicy, retry_on_error};
use self::client::{ClusterClient, Connector, UnreachableError};
use self::definition::{JobDefinition, ResourceRef};
use self::error::JobError;
use self::executor::execute_all;
use self::waiter::{TargetEvent, wait_for_healthy};
use crate::error::SpannedExt;
use crate::kubernetes_objects::elasticsearch::Elasticsearch;
use crate::kubernetes_objects::store::{ObjectStore, StoreError};
use crate::readiness_gate::GateProtocol;

pub mod backoff;
pub mod client;
pub mod definition;
pub mod error;
pub mod executor;
pub mod waiter;

pub struct JobRunner<S, C> {
    store: S,
    connector: C,
    protocol: GateProtocol,
}

impl<S: ObjectStore, C: Connector> JobRunner<S, C> {
    pub fn new(store: S, connector: C, protocol: GateProtocol) -> Self {
        Self {
            store,
            connector,
            protocol,
        }
    }

    #[instrument("run_job", skip_all, fields(resource = %def.target, gate = %self.protocol.kind))]
    pub async fn run<Ev, E>(&self, def: &JobDefinition, events: Ev) -> Result<(), JobError>
    where
        Ev: Stream<Item = Result<TargetEvent<Elasticsearch>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let probe = {
            let store = self.store.clone();
            let connector = self.connector.clone();
            let conf = def.client_conf.clone();
            let protocol = self.protocol;
            move |es: Elasticsearch| {
                let store = store.clone();
                let connector = connector.clone();
                let conf = conf.clone();
                async move {
                    let client = connector
                        .connect(&store, &es, conf.as_ref(), protocol)
                        .await?;
                    Ok::<_, UnreachableError>(client.cluster_health().await?.status)
                }
            }
        };

        let es = wait_for_healthy(&def.target, events, probe, def.wait_timeout())
            .await
            .with_span_trace()
            .map_err(JobError::Wait)?;

        let client = self
            .connector
            .connect(&self.store, &es, def.client_conf.as_ref(), self.protocol)
            .await
            .with_span_trace()
            .map_err(JobError::Resolve)?;

        info!(
            "Running {} API calls against {}...",
            def.api_calls.len(),
            def.target
        );
        execute_all(def, &client)
            .await
            .with_span_trace()
            .map_err(JobError::Call)?;

        let es = mark_complete(&self.store, self.protocol, &def.target)
            .await
            .with_span_trace()
            .map_err(JobError::Annotate)?;
        info!(
            "Elasticsearch '{}' marked as {} complete.",
            es.name_any(),
            self.protocol.kind
        );
        Ok(())
    }
}

/// Sets the completion annotation on the stored target, re-reading it on
/// every conflict.
#[instrument("mark_complete", level = "debug", skip(store))]
pub async fn mark_complete<S: ObjectStore>(
    store: &S,
    protocol: GateProtocol,
    target: &ResourceRef,
) -> Result<Elasticsearch, StoreError> {
    retry_on_error(
        &BackoffPolicy::conflict_retry(),
        StoreError::is_conflict,
        move || async move {
            let mut es = store
                .get_target(&target.namespace, &target.name)
                .await?
                .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
            protocol.set_complete(Some(&mut es));
            store.update_target_annotations(&es).await
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::job::client::HealthStatus;
    use crate::job::client::tests::{FakeCluster, FakeConnector};
    use crate::job::executor::CallError;
    use crate::job::waiter::WaitError;
    use crate::kubernetes_objects::elasticsearch::tests::mk_elasticsearch;
    use crate::kubernetes_objects::store::fake::FakeStore;
    use crate::readiness_gate::{BOOTSTRAPPED_ANNOTATION, POST_PROVISION_COMPLETE_ANNOTATION};

    const TESTDATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/testdata");

    type Events = Vec<Result<TargetEvent<Elasticsearch>, String>>;

    fn then_silence(
        events: Events,
    ) -> impl Stream<Item = Result<TargetEvent<Elasticsearch>, String>> + Send + 'static {
        use futures::StreamExt;
        stream::iter(events).chain(stream::pending())
    }

    async fn quickstart_job() -> JobDefinition {
        JobDefinition::load(&format!("{TESTDATA}/valid_yaml.yaml"))
            .await
            .unwrap()
    }

    fn setup(cluster: FakeCluster) -> (FakeStore, JobRunner<FakeStore, FakeConnector>) {
        let store = FakeStore::default();
        store.insert_target(mk_elasticsearch("quickstart", "default"));
        let runner = JobRunner::new(
            store.clone(),
            FakeConnector { cluster },
            GateProtocol::POST_PROVISION,
        );
        (store, runner)
    }

    fn annotation(store: &FakeStore, key: &str) -> Option<String> {
        store
            .target("default", "quickstart")
            .and_then(|es| es.annotations().get(key).cloned())
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_marks_target_complete() {
        let cluster = FakeCluster::default()
            .health(HealthStatus::Yellow)
            .health(HealthStatus::Green)
            .reply(200);
        let (store, runner) = setup(cluster.clone());
        let es = mk_elasticsearch("quickstart", "default");
        let events = then_silence(vec![
            Ok(TargetEvent::Applied(es.clone())),
            Ok(TargetEvent::Applied(es)),
        ]);

        runner.run(&quickstart_job().await, events).await.unwrap();

        assert_eq!(cluster.requests().len(), 1);
        assert_eq!(cluster.requests()[0].path, "/_ilm/policy/my_policy");
        assert_eq!(
            annotation(&store, POST_PROVISION_COMPLETE_ANNOTATION).as_deref(),
            Some("true")
        );
        assert_eq!(annotation(&store, BOOTSTRAPPED_ANNOTATION), None);
        assert_eq!(store.target_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_target_issues_no_calls() {
        let cluster = FakeCluster::default().reply(200);
        let (store, runner) = setup(cluster.clone());
        let es = mk_elasticsearch("quickstart", "default");
        let events = then_silence(vec![
            Ok(TargetEvent::Applied(es.clone())),
            Ok(TargetEvent::Deleted(es)),
        ]);

        let err = runner.run(&quickstart_job().await, events).await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Wait(ref e) if matches!(e.err, WaitError::ResourceDeleted(_))
        ));
        assert!(cluster.requests().is_empty());
        assert_eq!(store.target_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_leaves_target_incomplete() {
        let cluster = FakeCluster::default()
            .health(HealthStatus::Green)
            .reply(500)
            .reply(500)
            .reply(500);
        let (store, runner) = setup(cluster.clone());
        let events = then_silence(vec![Ok(TargetEvent::Applied(mk_elasticsearch(
            "quickstart",
            "default",
        )))]);

        let err = runner.run(&quickstart_job().await, events).await.unwrap_err();

        match err {
            JobError::Call(e) => {
                assert_eq!(e.err.index, 0);
                assert!(matches!(e.err.source, CallError::UnexpectedStatus(500)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cluster.requests().len(), 3);
        assert_eq!(annotation(&store, POST_PROVISION_COMPLETE_ANNOTATION), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_complete_retries_conflicts() {
        let (store, _) = setup(FakeCluster::default());
        store.inject_conflicts(2);
        let target = quickstart_job().await.target;

        let es = mark_complete(&store, GateProtocol::BOOTSTRAP, &target)
            .await
            .unwrap();

        assert_eq!(
            es.annotations().get(BOOTSTRAPPED_ANNOTATION).map(String::as_str),
            Some("true")
        );
        assert_eq!(store.target_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_complete_gives_up_on_persistent_conflicts() {
        let (store, _) = setup(FakeCluster::default());
        store.inject_conflicts(5);
        let target = quickstart_job().await.target;

        let err = mark_complete(&store, GateProtocol::POST_PROVISION, &target)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.target_writes(), 0);
    }

    #[tokio::test]
    async fn test_mark_complete_missing_target() {
        let store = FakeStore::default();
        let target = quickstart_job().await.target;
        let err = mark_complete(&store, GateProtocol::POST_PROVISION, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
