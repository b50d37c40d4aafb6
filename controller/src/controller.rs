use crate::error::{self, Result};
use crate::filter::{self, EventTranslator};
use crate::metrics::SafeUpdaterMetrics;
use crate::queue::{QueueHandle, WorkQueue};
use crate::reconciler::{ReconcileAction, Reconciler, RolloutTarget};
use crate::telemetry::HealthState;
use models::cluster::ClusterClient;
use models::key::ObjectKey;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{event, Level};

/// The initial listing of the target DaemonSet must complete within this deadline.
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(180);

/// The SafeUpdaterController drives the rollout of the target DaemonSet.
///
/// A watch on the target DaemonSet feeds a de-duplicating work queue; a single worker drains the queue and runs
/// one reconcile pass at a time, so no two passes ever overlap.
pub struct SafeUpdaterController<C: ClusterClient> {
    daemonsets: Api<DaemonSet>,
    reconciler: Reconciler<C>,
    metrics: SafeUpdaterMetrics,
    health: Arc<HealthState>,
}

impl<C: ClusterClient> SafeUpdaterController<C> {
    pub fn new(
        k8s_client: kube::Client,
        reconciler: Reconciler<C>,
        metrics: SafeUpdaterMetrics,
        health: Arc<HealthState>,
    ) -> Self {
        let daemonsets = Api::namespaced(k8s_client, reconciler.target().namespace);
        SafeUpdaterController {
            daemonsets,
            reconciler,
            metrics,
            health,
        }
    }

    /// Runs the controller until `cancel` fires or the watch fails permanently.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let target = self.reconciler.target().clone();
        let watch_config =
            watcher::Config::default().fields(&format!("metadata.name={}", target.name));
        let mut stream = watcher(self.daemonsets.clone(), watch_config)
            .default_backoff()
            .boxed();

        let mut queue = WorkQueue::new();
        let handle = queue.handle();
        let mut translator = EventTranslator::new();

        event!(Level::INFO, target = %target.key(), "Waiting for initial listing of target DaemonSet.");
        sync_initial_list(
            &mut stream,
            &mut translator,
            &handle,
            &target,
            CACHE_SYNC_TIMEOUT,
        )
        .await?;
        self.health.set_synced(true);
        event!(Level::INFO, "Initial listing complete. Starting worker.");

        let pump = pump_events(stream, translator, handle, target);
        let worker = run_worker(&self.reconciler, &mut queue, &self.metrics, cancel.clone());

        tokio::select! {
            result = pump => result,
            result = worker => result,
            _ = cancel.changed() => Ok(()),
        }
    }
}

/// Waits for the first full listing of the target DaemonSet, failing if it takes longer than `deadline`.
async fn sync_initial_list<S>(
    stream: &mut S,
    translator: &mut EventTranslator,
    handle: &QueueHandle,
    target: &RolloutTarget,
    deadline: Duration,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<DaemonSet>, watcher::Error>> + Unpin,
{
    tokio::time::timeout(
        deadline,
        wait_for_initial_list(stream, translator, handle, target),
    )
    .await
    .map_err(|_| error::Error::CacheSyncTimeout {
        timeout_secs: deadline.as_secs(),
    })?
}

/// Consumes watch events until the first full listing has been observed.
async fn wait_for_initial_list<S>(
    stream: &mut S,
    translator: &mut EventTranslator,
    handle: &QueueHandle,
    target: &RolloutTarget,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<DaemonSet>, watcher::Error>> + Unpin,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(watch_event) => {
                let listed = matches!(watch_event, watcher::Event::Restarted(_));
                enqueue_passing(translator, handle, target, watch_event);
                if listed {
                    return Ok(());
                }
            }
            Err(e) => event!(Level::WARN, "Watch on target DaemonSet failed: '{}'", e),
        }
    }
    error::WatchEndedSnafu.fail()
}

/// Forwards watch events into the work queue for as long as the watch runs.
async fn pump_events<S>(
    mut stream: S,
    mut translator: EventTranslator,
    handle: QueueHandle,
    target: RolloutTarget,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<DaemonSet>, watcher::Error>> + Unpin,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(watch_event) => enqueue_passing(&mut translator, &handle, &target, watch_event),
            // The stream backs off and retries on its own.
            Err(e) => event!(Level::WARN, "Watch on target DaemonSet failed: '{}'", e),
        }
    }
    error::WatchEndedSnafu.fail()
}

fn enqueue_passing(
    translator: &mut EventTranslator,
    handle: &QueueHandle,
    target: &RolloutTarget,
    watch_event: watcher::Event<DaemonSet>,
) {
    for filter_event in translator.translate(watch_event) {
        if filter::passes(target, &filter_event) {
            let key = filter_event.key();
            event!(Level::DEBUG, request = %key, "Event passed filter. Enqueueing.");
            handle.add(key);
        } else {
            event!(Level::TRACE, request = %filter_event.key(), "Event filtered out.");
        }
    }
}

/// Drains the queue one request at a time until cancelled.
///
/// A cancelled pass is abandoned at its next await point, so it issues no further cluster calls.
pub async fn run_worker<C: ClusterClient>(
    reconciler: &Reconciler<C>,
    queue: &mut WorkQueue,
    metrics: &SafeUpdaterMetrics,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let key = tokio::select! {
            key = queue.next() => match key {
                Some(key) => key,
                None => return Ok(()),
            },
            _ = cancel.changed() => return Ok(()),
        };

        let result = tokio::select! {
            result = reconciler.reconcile(&key) => result,
            _ = cancel.changed() => error::CancelledSnafu { target: key.to_string() }.fail(),
        };

        if !handle_result(queue, metrics, key, result) {
            return Ok(());
        }
    }
}

/// Applies the outcome of a pass to the queue. Returns false if the worker should stop.
fn handle_result(
    queue: &mut WorkQueue,
    metrics: &SafeUpdaterMetrics,
    key: ObjectKey,
    result: Result<ReconcileAction>,
) -> bool {
    match result {
        Ok(ReconcileAction::Requeue) => {
            metrics.record_pass(true);
            queue.requeue(key);
        }
        Ok(ReconcileAction::Done) => {
            metrics.record_pass(true);
            queue.forget(&key);
        }
        Err(error::Error::Cancelled { target }) => {
            event!(Level::INFO, %target, "Reconcile pass cancelled by shutdown.");
            metrics.record_pass(false);
            return false;
        }
        Err(e) => {
            metrics.record_pass(false);
            event!(Level::ERROR, request = %key, "Reconcile pass failed: '{}'", e);
            queue.add_rate_limited(key);
        }
    }
    true
}
