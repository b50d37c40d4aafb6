//! Pure predicates over DaemonSets, as observed by the rollout controller.
use crate::constants::UPDATE_STRATEGY_ON_DELETE;

use k8s_openapi::api::apps::v1::DaemonSet;

/// The status counters the rollout controller reasons about.
///
/// Counters absent from the status (including an absent status) read as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RolloutCounters {
    pub desired: i32,
    pub updated: i32,
    pub ready: i32,
}

impl RolloutCounters {
    pub fn of(ds: &DaemonSet) -> Self {
        ds.status
            .as_ref()
            .map(|status| RolloutCounters {
                desired: status.desired_number_scheduled,
                updated: status.updated_number_scheduled.unwrap_or(0),
                ready: status.number_ready,
            })
            .unwrap_or_default()
    }
}

/// A DaemonSet is up to date when every desired pod is both updated and ready.
pub fn is_up_to_date(ds: &DaemonSet) -> bool {
    let counters = RolloutCounters::of(ds);
    counters.desired == counters.updated && counters.updated == counters.ready
}

/// Returns true if the DaemonSet's update strategy is `OnDelete`.
pub fn is_on_delete(ds: &DaemonSet) -> bool {
    ds.spec
        .as_ref()
        .and_then(|spec| spec.update_strategy.as_ref())
        .and_then(|strategy| strategy.type_.as_deref())
        == Some(UPDATE_STRATEGY_ON_DELETE)
}

/// Returns true if the DaemonSet has been marked for deletion.
pub fn is_being_deleted(ds: &DaemonSet) -> bool {
    ds.metadata.deletion_timestamp.is_some()
}

/// `status.updatedNumberScheduled`, if the DaemonSet controller has reported it.
pub fn updated_number_scheduled(ds: &DaemonSet) -> Option<i32> {
    ds.status
        .as_ref()
        .and_then(|status| status.updated_number_scheduled)
}
