use models::constants::SAFE_UPDATER;

use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};
use std::fmt;
use tracing::instrument;

const RESULT_KEY: &str = "result";
const CHECK_KEY: &str = "check";

/// Counters describing the rollout controller's activity.
#[derive(Clone)]
pub struct SafeUpdaterMetrics {
    reconcile_passes: Counter<u64>,
    pod_deletions: Counter<u64>,
    check_denials: Counter<u64>,
}

impl SafeUpdaterMetrics {
    #[instrument(skip(meter))]
    pub fn new(meter: Meter) -> Self {
        let reconcile_passes = meter
            .u64_counter("safe_updater_reconcile_passes")
            .with_description("Reconcile passes of the target DaemonSet, by result")
            .init();

        let pod_deletions = meter
            .u64_counter("safe_updater_pod_deletions")
            .with_description("Target pods deleted to advance the rollout")
            .init();

        let check_denials = meter
            .u64_counter("safe_updater_check_denials")
            .with_description("Target pods whose disruption was denied, by check")
            .init();

        SafeUpdaterMetrics {
            reconcile_passes,
            pod_deletions,
            check_denials,
        }
    }

    /// Instruments registered with the global meter provider. Before a provider is installed these are no-ops.
    pub fn from_global() -> Self {
        Self::new(global::meter(SAFE_UPDATER))
    }

    pub fn record_pass(&self, succeeded: bool) {
        let result = if succeeded { "ok" } else { "error" };
        self.reconcile_passes
            .add(1, &[KeyValue::new(RESULT_KEY, result)]);
    }

    pub fn record_deletion(&self) {
        self.pod_deletions.add(1, &[]);
    }

    pub fn record_denial(&self, check: &str) {
        self.check_denials
            .add(1, &[KeyValue::new(CHECK_KEY, check.to_string())]);
    }
}

impl fmt::Debug for SafeUpdaterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeUpdaterMetrics").finish_non_exhaustive()
    }
}
