//! A single reconcile pass over the target DaemonSet.
//!
//! Each pass snapshots the target's pods and revision plus one check per dependency DaemonSet, and then deletes
//! at most one out-of-date target pod. The DaemonSet controller (with the `OnDelete` strategy) replaces the
//! deleted pod on the new revision; the pass asks to be requeued so that the rollout continues pod by pod.
use crate::check::{self, Check, DependencySpec};
use crate::error::{self, Result};
use crate::metrics::SafeUpdaterMetrics;
use crate::revision;
use models::cluster::ClusterClient;
use models::constants;
use models::daemonset::{self, RolloutCounters};
use models::key::{ObjectKey, PodKey};
use models::pod;
use models::selector::LabelSelector;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

/// The DaemonSet whose pods are rolled, and how to find its pods and revisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutTarget {
    pub namespace: &'static str,
    pub name: &'static str,
    pub pod_label_selector: &'static str,
    pub revision_label_selector: &'static str,
}

impl RolloutTarget {
    /// The node-local-dns DaemonSet.
    pub fn node_local_dns() -> Self {
        RolloutTarget {
            namespace: constants::TARGET_NAMESPACE,
            name: constants::TARGET_NAME,
            pod_label_selector: constants::TARGET_POD_LABEL_SELECTOR,
            revision_label_selector: constants::TARGET_CONTROLLER_REVISION_LABEL_SELECTOR,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace, self.name)
    }
}

/// What the caller should do with the request after a successful pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing left to do until the DaemonSet changes.
    Done,
    /// Run another pass soon; the rollout is still in progress.
    Requeue,
}

pub struct Reconciler<C: ClusterClient> {
    client: C,
    target: RolloutTarget,
    target_selector: LabelSelector,
    dependencies: Vec<DependencySpec>,
    metrics: SafeUpdaterMetrics,
}

impl<C: ClusterClient> Reconciler<C> {
    pub fn new(
        client: C,
        target: RolloutTarget,
        dependencies: Vec<DependencySpec>,
        metrics: SafeUpdaterMetrics,
    ) -> Result<Self> {
        let target_selector =
            target
                .pod_label_selector
                .parse()
                .context(error::InvalidTargetSelectorSnafu {
                    selector: target.pod_label_selector,
                })?;

        Ok(Reconciler {
            client,
            target,
            target_selector,
            dependencies,
            metrics,
        })
    }

    pub fn target(&self) -> &RolloutTarget {
        &self.target
    }

    /// Runs one reconcile pass for the DaemonSet identified by `request`.
    #[instrument(skip(self, request), fields(request = %request), err)]
    pub async fn reconcile(&self, request: &ObjectKey) -> Result<ReconcileAction> {
        let target = request.to_string();

        let ds = match self
            .client
            .get_daemonset(&request.namespace, &request.name)
            .await
            .context(error::FetchTargetDaemonSetSnafu { target: &target })?
        {
            Some(ds) => ds,
            None => {
                event!(Level::INFO, "Target DaemonSet does not exist. Nothing to do.");
                return Ok(ReconcileAction::Done);
            }
        };

        if daemonset::is_being_deleted(&ds) {
            event!(Level::INFO, "Target DaemonSet is being deleted. Skipping.");
            return Ok(ReconcileAction::Done);
        }

        if !daemonset::is_on_delete(&ds) {
            event!(
                Level::INFO,
                "Target DaemonSet does not use the '{}' update strategy. Skipping.",
                constants::UPDATE_STRATEGY_ON_DELETE
            );
            return Ok(ReconcileAction::Done);
        }

        let counters = RolloutCounters::of(&ds);
        if daemonset::is_up_to_date(&ds) {
            event!(Level::DEBUG, ?counters, "Target DaemonSet is up to date.");
            return Ok(ReconcileAction::Done);
        }
        event!(Level::INFO, ?counters, "Target DaemonSet rollout is in progress.");

        let pods = self.target_pods(&request.namespace, &target).await?;

        let target_revision = revision::current_revision(
            &self.client,
            &request.namespace,
            self.target.revision_label_selector,
        )
        .await
        .context(error::ResolveTargetRevisionSnafu { target: &target })?;

        let mut checks = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            let check = check::build_check(&self.client, dependency)
                .await
                .context(error::BuildCheckSnafu)?;
            checks.push(check);
        }

        let deleted = if pod::is_stable(&pods) {
            event!(
                Level::DEBUG,
                %target_revision,
                "All target pods are ready. Looking for an out-of-date pod to replace."
            );
            self.update_next_ready_pod(&pods, &target_revision, &checks)
                .await?
        } else {
            event!(
                Level::DEBUG,
                %target_revision,
                "Some target pods are not ready. Looking for an out-of-date pod among them."
            );
            self.update_next_not_ready_pod(&pods, &target_revision, &checks)
                .await?
        };

        match deleted {
            Some(pod_key) => event!(Level::INFO, pod = %pod_key, "Deleted out-of-date pod."),
            None => event!(Level::DEBUG, "No pod was deleted during this pass."),
        }

        Ok(ReconcileAction::Requeue)
    }

    /// Lists the target DaemonSet's pods. Pods which do not carry the target's labels are dropped, so that
    /// nothing outside the target can ever be selected for deletion.
    async fn target_pods(&self, namespace: &str, target: &str) -> Result<Vec<Pod>> {
        let pods = self
            .client
            .list_pods(namespace, self.target.pod_label_selector)
            .await
            .context(error::ListTargetPodsSnafu { target })?;

        Ok(pods
            .into_iter()
            .filter(|pod| {
                let matches = self.target_selector.matches(pod.metadata.labels.as_ref());
                if !matches {
                    event!(
                        Level::WARN,
                        pod = %pod.name_any(),
                        "Ignoring listed pod which does not match the target selector."
                    );
                }
                matches
            })
            .collect())
    }

    /// Used while every target pod is Ready: deletes the first out-of-date pod which every check admits.
    async fn update_next_ready_pod(
        &self,
        pods: &[Pod],
        target_revision: &str,
        checks: &[Box<dyn Check>],
    ) -> Result<Option<PodKey>> {
        for pod in pods {
            if is_current(pod, target_revision) {
                continue;
            }

            if self.admitted_by_all(pod, checks) {
                return self.delete_pod(pod).await.map(Some);
            }
        }

        Ok(None)
    }

    /// Used while some target pod is not Ready: only non-Ready, out-of-date pods are candidates, and nothing is
    /// deleted while any target pod is already terminating.
    async fn update_next_not_ready_pod(
        &self,
        pods: &[Pod],
        target_revision: &str,
        checks: &[Box<dyn Check>],
    ) -> Result<Option<PodKey>> {
        if let Some(terminating) = pods.iter().find(|pod| pod::is_terminating(pod)) {
            event!(
                Level::INFO,
                pod = %terminating.name_any(),
                "A target pod is already being deleted. Waiting for it to be replaced."
            );
            return Ok(None);
        }

        for pod in pods {
            if pod::is_ready_and_running(pod) {
                continue;
            }

            if is_current(pod, target_revision) {
                event!(
                    Level::DEBUG,
                    pod = %pod.name_any(),
                    "Pod is on the current revision but not ready yet."
                );
                continue;
            }

            if self.admitted_by_all(pod, checks) {
                return self.delete_pod(pod).await.map(Some);
            }
        }

        Ok(None)
    }

    /// Consults every check in order, stopping at the first denial.
    fn admitted_by_all(&self, pod: &Pod, checks: &[Box<dyn Check>]) -> bool {
        for check in checks {
            let decision = check.decide(pod);
            if !decision.is_allowed() {
                event!(
                    Level::INFO,
                    pod = %pod.name_any(),
                    check = check.name(),
                    %decision,
                    "Disruption denied."
                );
                self.metrics.record_denial(check.name());
                return false;
            }
        }
        true
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<PodKey> {
        let pod_key = PodKey::from_resource(pod);
        match self
            .client
            .delete_pod(&pod_key.namespace, &pod_key.name)
            .await
        {
            Ok(()) => self.metrics.record_deletion(),
            Err(e) if e.is_not_found() => {
                event!(Level::INFO, pod = %pod_key, "Pod was already deleted.");
            }
            Err(e) => {
                return Err(e).context(error::DeletePodSnafu {
                    pod: pod_key.to_string(),
                })
            }
        }

        Ok(pod_key)
    }
}

/// A pod is current if its template generation label equals the target revision. Pods without the label are
/// never current.
fn is_current(pod: &Pod, target_revision: &str) -> bool {
    pod::label(pod, constants::LABEL_POD_TEMPLATE_GENERATION) == Some(target_revision)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::*;
    use models::cluster::{ClusterError, MockClusterClient};

    use k8s_openapi::api::apps::v1::DaemonSet;
    use std::sync::{Arc, Mutex};

    /// Builds a mock cluster holding the given target DaemonSet and pods, with target revision "2", and Cilium
    /// agents at current revision "5".
    fn mock_cluster(ds: Option<DaemonSet>, targets: Vec<Pod>, agents: Vec<Pod>) -> MockClusterClient {
        let mut client = MockClusterClient::new();
        client
            .expect_get_daemonset()
            .returning(move |_, _| Ok(ds.clone()));
        client
            .expect_list_pods()
            .returning(move |namespace, _| match namespace {
                "kube-system" => Ok(targets.clone()),
                _ => Ok(agents.clone()),
            });
        client
            .expect_list_controller_revisions()
            .returning(|namespace, _| match namespace {
                "kube-system" => Ok(vec![
                    controller_revision("node-local-dns-1", 1),
                    controller_revision("node-local-dns-2", 2),
                ]),
                _ => Ok(vec![
                    controller_revision("agent-4", 4),
                    controller_revision("agent-5", 5),
                ]),
            });
        client
    }

    /// Records deleted pod names, answering every delete with `result`.
    fn record_deletes(
        client: &mut MockClusterClient,
        result: fn(&str, &str) -> models::cluster::error::Result<()>,
    ) -> Arc<Mutex<Vec<String>>> {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&deleted);
        client.expect_delete_pod().returning(move |namespace, name| {
            recorder.lock().unwrap().push(name.to_string());
            result(namespace, name)
        });
        deleted
    }

    fn reconciler(client: MockClusterClient) -> Reconciler<MockClusterClient> {
        reconciler_with_metrics(client, SafeUpdaterMetrics::from_global())
    }

    fn reconciler_with_metrics(
        client: MockClusterClient,
        metrics: SafeUpdaterMetrics,
    ) -> Reconciler<MockClusterClient> {
        Reconciler::new(
            client,
            RolloutTarget::node_local_dns(),
            check::default_dependencies(),
            metrics,
        )
        .unwrap()
    }

    fn request() -> ObjectKey {
        RolloutTarget::node_local_dns().key()
    }

    fn healthy_agents() -> Vec<Pod> {
        vec![
            cilium_agent("agent-a", "node-a", "5"),
            cilium_agent("agent-b", "node-b", "5"),
            cilium_agent("agent-c", "node-c", "5"),
        ]
    }

    #[tokio::test]
    async fn test_missing_daemonset_is_done() {
        let mut client = mock_cluster(None, vec![], vec![]);
        let deleted = record_deletes(&mut client, |_, _| Ok(()));

        let action = reconciler(client).reconcile(&request()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_daemonset_fetch_failure_is_error() {
        let mut client = MockClusterClient::new();
        client.expect_get_daemonset().returning(|namespace, name| {
            Err(ClusterError::GetDaemonSet {
                source: api_error(500),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        });
        client.expect_list_pods().never();

        let result = reconciler(client).reconcile(&request()).await;
        assert!(matches!(
            result,
            Err(error::Error::FetchTargetDaemonSet { .. })
        ));
    }

    #[tokio::test]
    async fn test_excluded_daemonsets_are_done() {
        let deleting = on_delete_daemonset(2, 1, 2).terminating();
        let rolling = rolling_update_daemonset(2, 1, 2);
        let up_to_date = on_delete_daemonset(2, 2, 2);

        for ds in [deleting, rolling, up_to_date] {
            let targets = vec![
                target_pod("nld-a", "node-a", Some("1"), true),
                target_pod("nld-b", "node-b", Some("1"), true),
            ];
            let mut client = mock_cluster(Some(ds), targets, healthy_agents());
            let deleted = record_deletes(&mut client, |_, _| Ok(()));

            let action = reconciler(client).reconcile(&request()).await.unwrap();
            assert_eq!(action, ReconcileAction::Done);
            assert!(deleted.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_stable_deletes_first_admitted_outdated_pod() {
        // nld-a is current, nld-b has no cilium agent on its node, nld-c and nld-d are both eligible.
        let targets = vec![
            target_pod("nld-a", "node-a", Some("2"), true),
            target_pod("nld-b", "node-z", Some("1"), true),
            target_pod("nld-c", "node-b", Some("1"), true),
            target_pod("nld-d", "node-c", Some("1"), true),
        ];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(4, 1, 4)),
            targets,
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |_, _| Ok(()));
        let recorded = RecordedMetrics::new();

        let action = reconciler_with_metrics(client, recorded.metrics.clone())
            .reconcile(&request())
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert_eq!(*deleted.lock().unwrap(), vec!["nld-c".to_string()]);
        assert_eq!(recorded.counter_total("safe_updater_pod_deletions"), 1.0);
        // nld-b was denied for want of an agent on its node.
        assert_eq!(recorded.counter_total("safe_updater_check_denials"), 1.0);
    }

    #[tokio::test]
    async fn test_stable_missing_generation_label_is_eligible() {
        let targets = vec![target_pod("nld-a", "node-a", None, true)];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(1, 0, 1)),
            targets,
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |_, _| Ok(()));

        let action = reconciler(client).reconcile(&request()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert_eq!(*deleted.lock().unwrap(), vec!["nld-a".to_string()]);
    }

    #[tokio::test]
    async fn test_all_denied_requeues_without_delete() {
        let targets = vec![
            target_pod("nld-a", "node-a", Some("1"), true),
            target_pod("nld-b", "node-b", Some("1"), true),
        ];
        let mut client = mock_cluster(Some(on_delete_daemonset(2, 0, 2)), targets, vec![]);
        let deleted = record_deletes(&mut client, |_, _| Ok(()));

        let action = reconciler(client).reconcile(&request()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unstable_prefers_not_ready_pods() {
        let targets = vec![
            target_pod("nld-a", "node-a", Some("1"), true),
            target_pod("nld-b", "node-b", Some("2"), false),
            target_pod("nld-c", "node-c", Some("1"), false),
        ];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(3, 1, 1)),
            targets,
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |_, _| Ok(()));
        let recorded = RecordedMetrics::new();

        let action = reconciler_with_metrics(client, recorded.metrics.clone())
            .reconcile(&request())
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert_eq!(*deleted.lock().unwrap(), vec!["nld-c".to_string()]);
        assert_eq!(recorded.counter_total("safe_updater_pod_deletions"), 1.0);
        // nld-b was denied for want of an agent on its node.
        assert_eq!(recorded.counter_total("safe_updater_check_denials"), 1.0);
    }

    #[tokio::test]
    async fn test_unstable_waits_for_terminating_pod() {
        // The terminating pod is Ready and listed after an eligible pod; nothing may be deleted regardless.
        let targets = vec![
            target_pod("nld-a", "node-a", Some("1"), false),
            target_pod("nld-b", "node-b", Some("1"), true).terminating(),
        ];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(2, 0, 1)),
            targets,
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |_, _| Ok(()));

        let action = reconciler(client).reconcile(&request()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unstable_never_deletes_ready_pods() {
        let targets = vec![
            target_pod("nld-a", "node-a", Some("1"), true),
            target_pod("nld-b", "node-b", Some("2"), false),
        ];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(2, 1, 1)),
            targets,
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |_, _| Ok(()));

        let action = reconciler(client).reconcile(&request()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let targets = vec![target_pod("nld-a", "node-a", Some("1"), true)];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(1, 0, 1)),
            targets,
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |namespace, name| {
            Err(ClusterError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        });

        let recorded = RecordedMetrics::new();
        let reconciler = reconciler_with_metrics(client, recorded.metrics.clone());
        for _ in 0..2 {
            let action = reconciler.reconcile(&request()).await.unwrap();
            assert_eq!(action, ReconcileAction::Requeue);
        }
        assert_eq!(deleted.lock().unwrap().len(), 2);
        // Nothing was actually deleted by these calls.
        assert_eq!(recorded.counter_total("safe_updater_pod_deletions"), 0.0);
    }

    #[tokio::test]
    async fn test_delete_failure_is_error() {
        let targets = vec![target_pod("nld-a", "node-a", Some("1"), true)];
        let mut client = mock_cluster(
            Some(on_delete_daemonset(1, 0, 1)),
            targets,
            healthy_agents(),
        );
        record_deletes(&mut client, |namespace, name| {
            Err(ClusterError::DeletePod {
                source: api_error(500),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        });

        let result = reconciler(client).reconcile(&request()).await;
        assert!(matches!(result, Err(error::Error::DeletePod { .. })));
    }

    #[tokio::test]
    async fn test_missing_target_revision_is_error() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_daemonset()
            .returning(|_, _| Ok(Some(on_delete_daemonset(1, 0, 1))));
        client
            .expect_list_pods()
            .returning(|_, _| Ok(vec![target_pod("nld-a", "node-a", Some("1"), true)]));
        client
            .expect_list_controller_revisions()
            .returning(|_, _| Ok(vec![]));
        client.expect_delete_pod().never();

        let result = reconciler(client).reconcile(&request()).await;
        match result {
            Err(error::Error::ResolveTargetRevision { source, .. }) => {
                assert!(source.is_empty_result())
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dependency_failure_is_error() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_daemonset()
            .returning(|_, _| Ok(Some(on_delete_daemonset(1, 0, 1))));
        client
            .expect_list_pods()
            .returning(|namespace, selector| match namespace {
                "kube-system" => Ok(vec![target_pod("nld-a", "node-a", Some("1"), true)]),
                _ => Err(ClusterError::ListPods {
                    source: api_error(500),
                    namespace: namespace.to_string(),
                    label_selector: selector.to_string(),
                }),
            });
        client
            .expect_list_controller_revisions()
            .returning(|_, _| Ok(vec![controller_revision("node-local-dns-2", 2)]));
        client.expect_delete_pod().never();

        let result = reconciler(client).reconcile(&request()).await;
        assert!(matches!(result, Err(error::Error::BuildCheck { .. })));
    }

    #[tokio::test]
    async fn test_foreign_pods_are_never_deleted() {
        let foreign = ready_pod("intruder", "kube-system", "node-a")
            .with_label("pod-template-generation", "1");
        let mut client = mock_cluster(
            Some(on_delete_daemonset(1, 0, 1)),
            vec![foreign],
            healthy_agents(),
        );
        let deleted = record_deletes(&mut client, |_, _| Ok(()));

        let action = reconciler(client).reconcile(&request()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue);
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_is_current() {
        let pod = target_pod("nld-a", "node-a", Some("2"), true);
        assert!(is_current(&pod, "2"));
        assert!(!is_current(&pod, "3"));
        assert!(!is_current(&target_pod("nld-b", "node-a", None, true), "2"));
    }
}
