use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to get DaemonSet '{}/{}': '{}'", namespace, name, source))]
    GetDaemonSet {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display(
        "Unable to list Pods in namespace '{}' matching '{}': '{}'",
        namespace,
        label_selector,
        source
    ))]
    ListPods {
        source: kube::Error,
        namespace: String,
        label_selector: String,
    },

    #[snafu(display(
        "Unable to list ControllerRevisions in namespace '{}' matching '{}': '{}'",
        namespace,
        label_selector,
        source
    ))]
    ListControllerRevisions {
        source: kube::Error,
        namespace: String,
        label_selector: String,
    },

    #[snafu(display("Unable to delete Pod '{}/{}': '{}'", namespace, name, source))]
    DeletePod {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("Pod '{}/{}' does not exist.", namespace, name))]
    PodNotFound { namespace: String, name: String },
}

impl Error {
    /// Returns true if the error reports that the object being acted upon no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PodNotFound { .. })
    }
}
