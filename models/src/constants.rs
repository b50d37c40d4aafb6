/// Helper macro to build an equality label selector string at compile time. When given a key and a
/// value literal it returns `key=value`, so selectors and the label values they match can share a
/// single definition.
#[macro_export]
macro_rules! label_selector {
    ($key:literal, $value:literal) => {
        concat!($key, "=", $value)
    };
}

pub const SAFE_UPDATER: &str = "node-local-dns-safe-updater";

// Target DaemonSet identity
pub const TARGET_NAMESPACE: &str = "kube-system";
pub const TARGET_NAME: &str = "node-local-dns";
pub const TARGET_POD_LABEL_SELECTOR: &str = label_selector!("k8s-app", "node-local-dns");
pub const TARGET_CONTROLLER_REVISION_LABEL_SELECTOR: &str =
    label_selector!("k8s-app", "node-local-dns");

// Cilium agent DaemonSet, the CNI dependency of node-local-dns
pub const CILIUM_NAMESPACE: &str = "d8-cni-cilium";
pub const CILIUM_POD_LABEL_SELECTOR: &str = label_selector!("app", "agent");
pub const CILIUM_CONTROLLER_REVISION_LABEL_SELECTOR: &str = label_selector!("app", "agent");
pub const CILIUM_CHECK_NAME: &str = "cni-cilium";

// Label keys maintained by the DaemonSet controller on the pods it creates
pub const LABEL_POD_TEMPLATE_GENERATION: &str = "pod-template-generation";
pub const LABEL_CONTROLLER_REVISION_HASH: &str = "controller-revision-hash";

pub const UPDATE_STRATEGY_ON_DELETE: &str = "OnDelete";

// Pod status vocabulary
pub const POD_PHASE_RUNNING: &str = "Running";
pub const POD_CONDITION_READY: &str = "Ready";
pub const CONDITION_STATUS_TRUE: &str = "True";

// controller constants
pub const CONTROLLER_INTERNAL_PORT: i32 = 8080; // The port on which metrics and probes are served.
pub const LEADER_ELECTION_LEASE_NAME: &str = SAFE_UPDATER;
