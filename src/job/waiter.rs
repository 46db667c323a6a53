use std::fmt::Display;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use futures::{Stream, StreamExt, future};
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, info, instrument, warn};

use super::client::HealthStatus;
use super::definition::ResourceRef;
use crate::kubernetes_objects::elasticsearch::Elasticsearch;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("{0} did not become healthy within {1} seconds")]
    Timeout(String, u64),

    #[error("{0} was deleted while waiting for it to become healthy")]
    ResourceDeleted(String),

    #[error("watch on {0} ended unexpectedly")]
    WatchEnded(String),
}

/// A change to the watched resource, typed at subscription time.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEvent<K> {
    Applied(K),
    Deleted(K),
}

/// Subscribes to changes of the single resource named by `target`.
pub fn target_events(
    client: Client,
    target: &ResourceRef,
) -> impl Stream<Item = Result<TargetEvent<Elasticsearch>, watcher::Error>> + Send + use<> {
    let api: Api<Elasticsearch> = Api::namespaced(client, &target.namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", target.name));
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| {
            future::ready(match event {
                Ok(Event::Apply(es)) | Ok(Event::InitApply(es)) => {
                    Some(Ok(TargetEvent::Applied(es)))
                }
                Ok(Event::Delete(es)) => Some(Ok(TargetEvent::Deleted(es))),
                Ok(Event::Init) | Ok(Event::InitDone) => None,
                Err(e) => Some(Err(e)),
            })
        })
}

/// Holds the sending half of a result that can be delivered at most once.
struct ResultCell<T>(Option<oneshot::Sender<T>>);

impl<T> ResultCell<T> {
    fn new(tx: oneshot::Sender<T>) -> Self {
        Self(Some(tx))
    }

    /// Returns false if the cell was already fulfilled or nobody is waiting anymore.
    fn fulfill(&mut self, value: T) -> bool {
        match self.0.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/// Waits until `probe` reports a green cluster for some observed version of
/// the target, which is then returned.
///
/// Probe failures are expected while the cluster rolls out and only logged.
/// Watch errors are logged too; the stream is expected to reconnect on its
/// own, so only the deadline bounds the wait. The event stream is consumed by a task owned by this call, so it is
/// dropped on every return path.
#[instrument("wait_for_healthy", skip_all, fields(resource = %target, timeout_secs = timeout.as_secs()))]
pub async fn wait_for_healthy<K, S, E, P, Fut, PE>(
    target: &ResourceRef,
    events: S,
    probe: P,
    timeout: Duration,
) -> Result<K, WaitError>
where
    K: Clone + Send + 'static,
    S: Stream<Item = Result<TargetEvent<K>, E>> + Send + 'static,
    E: Display + Send + 'static,
    P: Fn(K) -> Fut + Send + 'static,
    Fut: Future<Output = Result<HealthStatus, PE>> + Send + 'static,
    PE: Display + Send + 'static,
{
    info!(
        "Waiting up to {} seconds for {} to become healthy...",
        timeout.as_secs(),
        target
    );

    let (tx, rx) = oneshot::channel();
    let mut tasks = JoinSet::new();
    tasks.spawn(
        watch_until_healthy(target.to_string(), events, probe, ResultCell::new(tx))
            .instrument(Span::current()),
    );

    let result = match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(WaitError::WatchEnded(target.to_string())),
        Err(_) => Err(WaitError::Timeout(target.to_string(), timeout.as_secs())),
    };
    tasks.abort_all();
    result
}

async fn watch_until_healthy<K, S, E, P, Fut, PE>(
    target: String,
    events: S,
    probe: P,
    mut cell: ResultCell<Result<K, WaitError>>,
) where
    K: Clone,
    S: Stream<Item = Result<TargetEvent<K>, E>>,
    E: Display,
    P: Fn(K) -> Fut,
    Fut: Future<Output = Result<HealthStatus, PE>>,
    PE: Display,
{
    let mut events = pin!(events);
    let mut errors_count = 0u64;

    while let Some(event) = events.next().await {
        match event {
            Ok(TargetEvent::Applied(obj)) => {
                errors_count = 0;
                match probe(obj.clone()).await {
                    Ok(HealthStatus::Green) => {
                        info!("{} is healthy.", target);
                        cell.fulfill(Ok(obj));
                        return;
                    }
                    Ok(status) => debug!("{} health is {:?}, waiting for green.", target, status),
                    Err(e) => debug!("{} is not reachable yet: {}", target, e),
                }
            }
            Ok(TargetEvent::Deleted(_)) => {
                warn!("{} was deleted.", target);
                cell.fulfill(Err(WaitError::ResourceDeleted(target)));
                return;
            }
            Err(e) => {
                errors_count += 1;
                warn!(
                    "Error while watching {} ({} in a row): {}",
                    target, errors_count, e
                );
            }
        }
    }

    cell.fulfill(Err(WaitError::WatchEnded(target)));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::channel::mpsc;
    use futures::stream;

    use super::*;
    use crate::job::definition::ResourceKind;

    fn target() -> ResourceRef {
        ResourceRef {
            kind: ResourceKind::Elasticsearch,
            name: "quickstart".to_string(),
            namespace: "default".to_string(),
        }
    }

    type Events = Vec<Result<TargetEvent<&'static str>, String>>;

    /// Health is encoded in the observed object itself.
    async fn probe(obj: &'static str) -> Result<HealthStatus, String> {
        match obj {
            "green" => Ok(HealthStatus::Green),
            "yellow" => Ok(HealthStatus::Yellow),
            other => Err(format!("connection refused ({other})")),
        }
    }

    fn then_silence(events: Events) -> impl Stream<Item = Result<TargetEvent<&'static str>, String>> {
        stream::iter(events).chain(stream::pending())
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_green() {
        let events = then_silence(vec![
            Ok(TargetEvent::Applied("down")),
            Ok(TargetEvent::Applied("yellow")),
            Ok(TargetEvent::Applied("green")),
        ]);
        let res = wait_for_healthy(&target(), events, probe, Duration::from_secs(60)).await;
        assert_eq!(res.unwrap(), "green");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_is_terminal() {
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();
        let events = then_silence(vec![
            Ok(TargetEvent::Applied("yellow")),
            Ok(TargetEvent::Deleted("yellow")),
            Ok(TargetEvent::Applied("green")),
        ]);
        let res = wait_for_healthy(
            &target(),
            events,
            move |obj: &'static str| {
                counter.fetch_add(1, Ordering::SeqCst);
                probe(obj)
            },
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(res, Err(WaitError::ResourceDeleted(_))));
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let events = then_silence(vec![Ok(TargetEvent::Applied("yellow"))]);
        let res = wait_for_healthy(&target(), events, probe, Duration::from_secs(15 * 60)).await;
        assert!(matches!(res, Err(WaitError::Timeout(_, 900))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end() {
        let events = stream::iter(Events::new());
        let res = wait_for_healthy(&target(), events, probe, Duration::from_secs(60)).await;
        assert!(matches!(res, Err(WaitError::WatchEnded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_waiting_through_watch_errors() {
        let mut events: Events = vec![Err("apiserver 503".to_string()); 20];
        events.push(Ok(TargetEvent::Applied("green")));
        let res = wait_for_healthy(&target(), then_silence(events), probe, Duration::from_secs(900)).await;
        assert_eq!(res.unwrap(), "green");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_errors_run_into_timeout() {
        let mut events: Events = vec![Ok(TargetEvent::Applied("yellow"))];
        events.extend(vec![Err("apiserver 503".to_string()); 20]);
        let res = wait_for_healthy(&target(), then_silence(events), probe, Duration::from_secs(60)).await;
        assert!(matches!(res, Err(WaitError::Timeout(_, 60))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_is_dropped_after_wait() {
        let (tx, rx) = mpsc::unbounded::<Result<TargetEvent<&'static str>, String>>();
        tx.unbounded_send(Ok(TargetEvent::Applied("green"))).unwrap();

        let res = wait_for_healthy(&target(), rx, probe, Duration::from_secs(60)).await;
        assert!(res.is_ok());

        for _ in 0..10 {
            if tx.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(tx.is_closed());
    }

    #[test]
    fn test_result_cell_fulfilled_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut cell = ResultCell::new(tx);
        assert!(cell.fulfill(1));
        assert!(!cell.fulfill(2));
        assert_eq!(rx.try_recv(), Ok(1));
    }
}
