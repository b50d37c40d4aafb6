//! Resolves the current template revision of a DaemonSet from its ControllerRevisions.
use models::cluster::{ClusterClient, ClusterError};

use k8s_openapi::api::apps::v1::ControllerRevision;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RevisionError {
    #[snafu(display("Unable to list ControllerRevisions: '{}'", source))]
    ListRevisions { source: ClusterError },

    #[snafu(display(
        "No ControllerRevisions in namespace '{}' match '{}'",
        namespace,
        label_selector
    ))]
    NoRevisions {
        namespace: String,
        label_selector: String,
    },
}

impl RevisionError {
    /// Returns true if the revision could not be resolved because nothing matched, rather than because the
    /// cluster could not be read.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::NoRevisions { .. })
    }
}

/// The highest `revision` among the given ControllerRevisions.
pub fn max_revision(revisions: &[ControllerRevision]) -> Option<i64> {
    revisions.iter().map(|revision| revision.revision).max()
}

/// Returns the current revision of the DaemonSet owning the ControllerRevisions selected by
/// `(namespace, label_selector)`, formatted as a decimal string.
#[instrument(skip(client), err)]
pub async fn current_revision<C: ClusterClient>(
    client: &C,
    namespace: &str,
    label_selector: &str,
) -> Result<String, RevisionError> {
    let revisions = client
        .list_controller_revisions(namespace, label_selector)
        .await
        .context(ListRevisionsSnafu)?;

    max_revision(&revisions)
        .map(|revision| revision.to_string())
        .context(NoRevisionsSnafu {
            namespace,
            label_selector,
        })
}
