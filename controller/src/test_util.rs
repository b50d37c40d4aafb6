//! Object builders and metric readers shared by the unit tests.
use crate::metrics::SafeUpdaterMetrics;
use models::constants::SAFE_UPDATER;

use chrono::{TimeZone, Utc};
use k8s_openapi::api::apps::v1::{
    ControllerRevision, DaemonSet, DaemonSetSpec, DaemonSetStatus, DaemonSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use kube::Resource;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub(crate) trait ObjectBuilder: Sized {
    fn with_label(self, key: &str, value: &str) -> Self;
    fn terminating(self) -> Self;
}

impl<K: Resource> ObjectBuilder for K {
    fn with_label(mut self, key: &str, value: &str) -> Self {
        self.meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        self
    }

    fn terminating(mut self) -> Self {
        self.meta_mut().deletion_timestamp =
            Some(Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        self
    }
}

fn pod(name: &str, namespace: &str, node: &str, phase: &str, ready: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: ready.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub(crate) fn ready_pod(name: &str, namespace: &str, node: &str) -> Pod {
    pod(name, namespace, node, "Running", "True")
}

pub(crate) fn pending_pod(name: &str, namespace: &str, node: &str) -> Pod {
    pod(name, namespace, node, "Pending", "False")
}

/// A node-local-dns pod, optionally labeled with its template generation.
pub(crate) fn target_pod(name: &str, node: &str, generation: Option<&str>, ready: bool) -> Pod {
    let pod = if ready {
        ready_pod(name, "kube-system", node)
    } else {
        pending_pod(name, "kube-system", node)
    }
    .with_label("k8s-app", "node-local-dns");

    match generation {
        Some(generation) => pod.with_label("pod-template-generation", generation),
        None => pod,
    }
}

pub(crate) fn cilium_agent(name: &str, node: &str, revision: &str) -> Pod {
    ready_pod(name, "d8-cni-cilium", node)
        .with_label("app", "agent")
        .with_label("controller-revision-hash", revision)
}

pub(crate) fn controller_revision(name: &str, revision: i64) -> ControllerRevision {
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        revision,
        ..Default::default()
    }
}

fn daemonset(strategy: &str, desired: i32, updated: i32, ready: i32) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            name: Some("node-local-dns".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some(strategy.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(DaemonSetStatus {
            desired_number_scheduled: desired,
            updated_number_scheduled: Some(updated),
            number_ready: ready,
            ..Default::default()
        }),
    }
}

/// The node-local-dns DaemonSet with the `OnDelete` strategy and the given status counters.
pub(crate) fn on_delete_daemonset(desired: i32, updated: i32, ready: i32) -> DaemonSet {
    daemonset("OnDelete", desired, updated, ready)
}

pub(crate) fn rolling_update_daemonset(desired: i32, updated: i32, ready: i32) -> DaemonSet {
    daemonset("RollingUpdate", desired, updated, ready)
}

pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "InternalError".to_string(),
        code,
    })
}

/// Metrics exported to a private registry, so that tests can read back what was recorded.
pub(crate) struct RecordedMetrics {
    pub metrics: SafeUpdaterMetrics,
    registry: Registry,
    _provider: SdkMeterProvider,
}

impl RecordedMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        RecordedMetrics {
            metrics: SafeUpdaterMetrics::new(provider.meter(SAFE_UPDATER)),
            registry,
            _provider: provider,
        }
    }

    /// The sum of all series of the counter named `name`.
    pub fn counter_total(&self, name: &str) -> f64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name().starts_with(name))
            .flat_map(|family| family.get_metric().iter())
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }
}
