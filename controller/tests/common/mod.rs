//! An in-memory cluster for scenario tests.
//!
//! State is loaded from multi-document YAML fixtures. Deleting a pod marks it with a fixed deletion timestamp
//! (as the API server does for pods with a grace period) so that the post-reconcile state can be compared
//! against golden files.
#![allow(dead_code)]

use models::cluster::{error, ClusterClient, ClusterError};
use models::selector::LabelSelector;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The deletion timestamp written by `FakeCluster::delete_pod`.
pub fn deletion_timestamp() -> Time {
    Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

pub fn fixture_dir(scenario: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(scenario)
}

#[derive(Debug, Default)]
struct ClusterState {
    daemonsets: Vec<DaemonSet>,
    pods: Vec<Pod>,
    revisions: Vec<ControllerRevision>,
    deleted: Vec<String>,
    /// When set, deleted pods disappear immediately instead of terminating.
    remove_on_delete: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

/// Objects read from a fixture file, by kind.
#[derive(Debug, Default)]
pub struct Objects {
    pub daemonsets: Vec<DaemonSet>,
    pub pods: Vec<Pod>,
    pub revisions: Vec<ControllerRevision>,
}

pub fn load_objects(path: &Path) -> Objects {
    let contents = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("unable to read fixture '{}': {}", path.display(), e));

    let mut objects = Objects::default();
    for document in serde_yaml::Deserializer::from_str(&contents) {
        let value = serde_yaml::Value::deserialize(document).unwrap();
        let kind = value
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "DaemonSet" => objects
                .daemonsets
                .push(serde_yaml::from_value(value).unwrap()),
            "Pod" => objects.pods.push(serde_yaml::from_value(value).unwrap()),
            "ControllerRevision" => objects
                .revisions
                .push(serde_yaml::from_value(value).unwrap()),
            other => panic!("unsupported kind '{}' in '{}'", other, path.display()),
        }
    }
    objects
}

fn selected<K: Resource>(object: &K, namespace: &str, selector: &LabelSelector) -> bool {
    object.meta().namespace.as_deref() == Some(namespace)
        && selector.matches(object.meta().labels.as_ref())
}

impl FakeCluster {
    pub fn from_objects(objects: Objects) -> Self {
        FakeCluster {
            state: Arc::new(Mutex::new(ClusterState {
                daemonsets: objects.daemonsets,
                pods: objects.pods,
                revisions: objects.revisions,
                ..Default::default()
            })),
        }
    }

    pub fn from_fixture(scenario: &str) -> Self {
        Self::from_objects(load_objects(&fixture_dir(scenario).join("state.yaml")))
    }

    pub fn remove_on_delete(self) -> Self {
        self.state.lock().unwrap().remove_on_delete = true;
        self
    }

    pub fn pods_in(&self, namespace: &str) -> Vec<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    /// Names of pods passed to `delete_pod`, in call order.
    pub fn delete_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_daemonset(
        &self,
        namespace: &str,
        name: &str,
    ) -> error::Result<Option<DaemonSet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .daemonsets
            .iter()
            .find(|ds| ds.namespace().as_deref() == Some(namespace) && ds.name_any() == name)
            .cloned())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> error::Result<Vec<Pod>> {
        let selector: LabelSelector = label_selector.parse().unwrap();
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|pod| selected(*pod, namespace, &selector))
            .cloned()
            .collect())
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> error::Result<Vec<ControllerRevision>> {
        let selector: LabelSelector = label_selector.parse().unwrap();
        Ok(self
            .state
            .lock()
            .unwrap()
            .revisions
            .iter()
            .filter(|revision| selected(*revision, namespace, &selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> error::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(name.to_string());

        let position = state
            .pods
            .iter()
            .position(|pod| pod.namespace().as_deref() == Some(namespace) && pod.name_any() == name);
        match position {
            None => Err(ClusterError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Some(index) if state.remove_on_delete => {
                state.pods.remove(index);
                Ok(())
            }
            Some(index) => {
                state.pods[index]
                    .metadata
                    .deletion_timestamp
                    .get_or_insert_with(deletion_timestamp);
                Ok(())
            }
        }
    }
}
