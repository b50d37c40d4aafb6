//! Per-pod admission checks against dependency DaemonSets.
//!
//! Before a target pod may be disrupted, every registered `Check` must allow it. Each check is constructed at
//! the top of a reconcile pass from a snapshot of its dependency (the dependency's pods and current revision)
//! and answers every `decide` call from that snapshot, so all decisions within a pass are consistent.
mod cilium;

pub use self::cilium::CniCiliumCheck;

use crate::revision::{self, RevisionError};
use models::cluster::{ClusterClient, ClusterError};
use models::constants;

use k8s_openapi::api::core::v1::Pod;
use snafu::{ResultExt, Snafu};
use std::fmt;
use tracing::{event, instrument, Level};

/// The outcome of a check for a single target pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The check does not object to disrupting the pod.
    Allowed,
    /// The pod must not be disrupted right now.
    Denied { reason: String },
}

impl Decision {
    pub fn denied<S: Into<String>>(reason: S) -> Self {
        Decision::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => write!(f, "allowed"),
            Decision::Denied { reason } => write!(f, "denied: {}", reason),
        }
    }
}

/// A per-pod admission decision over an immutable dependency snapshot.
pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    fn decide(&self, target_pod: &Pod) -> Decision;
}

/// The state of a dependency DaemonSet captured at the start of a reconcile pass.
#[derive(Clone, Debug)]
pub struct DependencySnapshot {
    pub pods: Vec<Pod>,
    pub revision: String,
}

/// Builds a check from a dependency snapshot.
pub type CheckConstructor = fn(&'static str, DependencySnapshot) -> Box<dyn Check>;

/// Describes a dependency DaemonSet and how to build the check that guards the target against it.
#[derive(Clone)]
pub struct DependencySpec {
    pub namespace: &'static str,
    pub pod_label_selector: &'static str,
    pub revision_label_selector: &'static str,
    pub display_name: &'static str,
    pub constructor: CheckConstructor,
}

impl fmt::Debug for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencySpec")
            .field("namespace", &self.namespace)
            .field("pod_label_selector", &self.pod_label_selector)
            .field("revision_label_selector", &self.revision_label_selector)
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl DependencySpec {
    /// The Cilium agent DaemonSet.
    pub fn cilium() -> Self {
        DependencySpec {
            namespace: constants::CILIUM_NAMESPACE,
            pod_label_selector: constants::CILIUM_POD_LABEL_SELECTOR,
            revision_label_selector: constants::CILIUM_CONTROLLER_REVISION_LABEL_SELECTOR,
            display_name: constants::CILIUM_CHECK_NAME,
            constructor: CniCiliumCheck::boxed,
        }
    }
}

/// The dependencies guarding the node-local-dns rollout, in evaluation order.
pub fn default_dependencies() -> Vec<DependencySpec> {
    vec![DependencySpec::cilium()]
}

/// Snapshots a dependency and constructs its check.
#[instrument(skip(client, dependency), fields(dependency = dependency.display_name), err)]
pub async fn build_check<C: ClusterClient>(
    client: &C,
    dependency: &DependencySpec,
) -> Result<Box<dyn Check>, CheckError> {
    let pods = client
        .list_pods(dependency.namespace, dependency.pod_label_selector)
        .await
        .context(ListDependencyPodsSnafu {
            dependency: dependency.display_name,
        })?;

    let revision = revision::current_revision(
        client,
        dependency.namespace,
        dependency.revision_label_selector,
    )
    .await
    .context(ResolveDependencyRevisionSnafu {
        dependency: dependency.display_name,
    })?;

    event!(
        Level::DEBUG,
        pods = pods.len(),
        %revision,
        "Captured dependency snapshot."
    );

    Ok((dependency.constructor)(
        dependency.display_name,
        DependencySnapshot { pods, revision },
    ))
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckError {
    #[snafu(display("Unable to list pods of dependency '{}': '{}'", dependency, source))]
    ListDependencyPods {
        source: ClusterError,
        dependency: String,
    },

    #[snafu(display("Unable to resolve revision of dependency '{}': '{}'", dependency, source))]
    ResolveDependencyRevision {
        source: RevisionError,
        dependency: String,
    },
}
