use crate::check::CheckError;
use crate::revision::RevisionError;
use models::cluster::ClusterError;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to fetch target DaemonSet '{}': '{}'", target, source))]
    FetchTargetDaemonSet { source: ClusterError, target: String },

    #[snafu(display("Unable to list pods of target DaemonSet '{}': '{}'", target, source))]
    ListTargetPods { source: ClusterError, target: String },

    #[snafu(display("Unable to resolve revision of target DaemonSet '{}': '{}'", target, source))]
    ResolveTargetRevision {
        source: RevisionError,
        target: String,
    },

    #[snafu(display("Unable to build check for dependency: '{}'", source))]
    BuildCheck { source: CheckError },

    #[snafu(display("Failed to delete pod '{}': '{}'", pod, source))]
    DeletePod { source: ClusterError, pod: String },

    #[snafu(display("Target label selector '{}' is invalid: '{}'", selector, source))]
    InvalidTargetSelector {
        source: models::selector::SelectorError,
        selector: String,
    },

    #[snafu(display("Reconcile of '{}' was cancelled.", target))]
    Cancelled { target: String },

    #[snafu(display("Initial list of target DaemonSet did not complete within {}s.", timeout_secs))]
    CacheSyncTimeout { timeout_secs: u64 },

    #[snafu(display("The watch on the target DaemonSet ended unexpectedly."))]
    WatchEnded,

    #[snafu(display("Leadership of lease '{}' was lost to another replica.", lease))]
    LeadershipLost { lease: String },

    #[snafu(display("Lease '{}' was not renewed within {}s.", lease, deadline_secs))]
    RenewDeadlineExceeded { lease: String, deadline_secs: u64 },
}
