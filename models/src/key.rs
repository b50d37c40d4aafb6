use kube::{Resource, ResourceExt};
use std::fmt;

/// The `(namespace, name)` identity of a namespaced Kubernetes object.
///
/// Reconcile requests are keyed by the target DaemonSet's `ObjectKey`; pods are identified the same way.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

/// Identity of a pod.
pub type PodKey = ObjectKey;

impl ObjectKey {
    pub fn new<S1: Into<String>, S2: Into<String>>(namespace: S1, name: S2) -> Self {
        ObjectKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key of an object read from the cluster. Objects without a namespace (which should
    /// never reach us, as everything we touch is namespaced) get an empty namespace.
    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        ObjectKey {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
