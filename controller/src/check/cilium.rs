use super::{Check, Decision, DependencySnapshot};
use models::constants::LABEL_CONTROLLER_REVISION_HASH;
use models::pod;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Allows disruption of a target pod only if the Cilium agent on the same node is Ready, Running and already on
/// the current Cilium revision.
///
/// Deleting a node-local-dns pod while the node has no healthy CNI agent (or while the agent is itself being
/// rolled) could leave the node without DNS until both come back, so any doubt results in a denial.
#[derive(Clone, Debug)]
pub struct CniCiliumCheck {
    name: &'static str,
    agent_pods: Vec<Pod>,
    current_revision: String,
}

impl CniCiliumCheck {
    pub fn new(name: &'static str, snapshot: DependencySnapshot) -> Self {
        CniCiliumCheck {
            name,
            agent_pods: snapshot.pods,
            current_revision: snapshot.revision,
        }
    }

    pub fn boxed(name: &'static str, snapshot: DependencySnapshot) -> Box<dyn Check> {
        Box::new(Self::new(name, snapshot))
    }
}

impl Check for CniCiliumCheck {
    fn name(&self) -> &str {
        self.name
    }

    fn decide(&self, target_pod: &Pod) -> Decision {
        let node_name = match pod::node_name(target_pod) {
            Some(node_name) => node_name,
            None => {
                return Decision::denied(format!(
                    "pod '{}' is not bound to a node",
                    target_pod.name_any()
                ))
            }
        };

        let mut agents_on_node = self
            .agent_pods
            .iter()
            .filter(|agent| pod::node_name(agent) == Some(node_name));

        let agent = match (agents_on_node.next(), agents_on_node.next()) {
            (None, _) => {
                return Decision::denied(format!("no cilium agent pod on node '{}'", node_name))
            }
            (Some(_), Some(_)) => {
                return Decision::denied(format!(
                    "more than one cilium agent pod on node '{}'",
                    node_name
                ))
            }
            (Some(agent), None) => agent,
        };

        if !pod::is_ready_and_running(agent) {
            return Decision::denied(format!(
                "cilium agent pod '{}' on node '{}' is not ready",
                agent.name_any(),
                node_name
            ));
        }

        let agent_revision = pod::label(agent, LABEL_CONTROLLER_REVISION_HASH);
        if agent_revision != Some(self.current_revision.as_str()) {
            return Decision::denied(format!(
                "cilium agent pod '{}' on node '{}' is at revision '{}', current revision is '{}'",
                agent.name_any(),
                node_name,
                agent_revision.unwrap_or_default(),
                self.current_revision
            ));
        }

        Decision::Allowed
    }
}
