//! Lease-based leader election.
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease may run the reconcile loop. A holder which has not
//! renewed within `RENEW_DEADLINE` stops leading, which is always before a standby may take the lease over.
use crate::error::{self, Result};
use models::constants::LEADER_ELECTION_LEASE_NAME;

use kube_leader_election::{LeaseLock, LeaseLockParams};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{event, Level};

/// How long a lease is valid without renewal.
pub const LEASE_TTL: Duration = Duration::from_secs(15);
/// How often the holder renews the lease, and how often standbys try to take it.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);
/// The holder gives up leadership if it has not renewed for this long. Must stay below `LEASE_TTL`.
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);

pub struct LeaderElector {
    lock: LeaseLock,
    holder_id: String,
}

impl LeaderElector {
    pub fn new(k8s_client: kube::Client, namespace: &str, holder_id: String) -> Self {
        let lock = LeaseLock::new(
            k8s_client,
            namespace,
            LeaseLockParams {
                holder_id: holder_id.clone(),
                lease_name: LEADER_ELECTION_LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        );
        LeaderElector { lock, holder_id }
    }

    async fn try_acquire_or_renew(
        &self,
    ) -> std::result::Result<bool, kube_leader_election::Error> {
        self.lock
            .try_acquire_or_renew()
            .await
            .map(|result| result.acquired_lease)
    }

    /// Blocks until this replica holds the lease.
    pub async fn acquire(&self) {
        event!(
            Level::INFO,
            holder_id = %self.holder_id,
            lease = LEADER_ELECTION_LEASE_NAME,
            "Waiting to acquire leadership."
        );
        loop {
            match timeout(RENEW_DEADLINE, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => {
                    event!(Level::INFO, holder_id = %self.holder_id, "Acquired leadership.");
                    return;
                }
                Ok(Ok(false)) => {
                    event!(Level::DEBUG, "Another replica is leader.");
                }
                Ok(Err(e)) => {
                    event!(Level::WARN, "Failed to acquire lease, will retry: '{}'", e);
                }
                Err(_) => {
                    event!(Level::WARN, "Timed out acquiring lease, will retry.");
                }
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    }

    /// Renews the lease until leadership is lost, which is reported as an error.
    pub async fn keep_renewing(&self) -> Result<()> {
        renew_until_lost(|| self.try_acquire_or_renew(), RENEW_INTERVAL, RENEW_DEADLINE).await
    }
}

/// Runs `attempt` every `interval` until it reports the lease lost, or until no attempt has succeeded for
/// `deadline`. An attempt still in flight when the deadline passes is abandoned.
pub(crate) async fn renew_until_lost<F, Fut, E>(
    mut attempt: F,
    interval: Duration,
    deadline: Duration,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: Display,
{
    let mut last_renewal = Instant::now();
    loop {
        tokio::time::sleep(interval).await;

        let remaining = deadline.saturating_sub(last_renewal.elapsed());
        match timeout(remaining, attempt()).await {
            Ok(Ok(true)) => last_renewal = Instant::now(),
            Ok(Ok(false)) => {
                return error::LeadershipLostSnafu {
                    lease: LEADER_ELECTION_LEASE_NAME,
                }
                .fail();
            }
            Ok(Err(e)) => event!(Level::WARN, "Failed to renew lease, will retry: '{}'", e),
            Err(_) => event!(Level::WARN, "Lease renewal did not complete in time."),
        }

        if last_renewal.elapsed() >= deadline {
            return error::RenewDeadlineExceededSnafu {
                lease: LEADER_ELECTION_LEASE_NAME,
                deadline_secs: deadline.as_secs(),
            }
            .fail();
        }
    }
}
