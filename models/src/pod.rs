//! Pure predicates over Pods, as observed by the rollout controller.
use crate::constants::{
    CONDITION_STATUS_TRUE, POD_CONDITION_READY, POD_PHASE_RUNNING,
};

use k8s_openapi::api::core::v1::Pod;

/// Returns true if the pod's phase is `Running` and its `Ready` condition is `True`.
pub fn is_ready_and_running(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };

    let running = status.phase.as_deref() == Some(POD_PHASE_RUNNING);
    let ready = status.conditions.as_ref().map_or(false, |conditions| {
        conditions.iter().any(|condition| {
            condition.type_ == POD_CONDITION_READY && condition.status == CONDITION_STATUS_TRUE
        })
    });

    running && ready
}

/// A set of pods is stable when every pod is Ready and Running. An empty set is stable.
pub fn is_stable(pods: &[Pod]) -> bool {
    pods.iter().all(is_ready_and_running)
}

/// Returns true if the pod has been marked for deletion.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// The node the pod is bound to, if it has been scheduled.
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
}

/// The value of a label on the pod, if present.
pub fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}
