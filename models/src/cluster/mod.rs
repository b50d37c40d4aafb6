//! Read and delete access to the cluster objects the rollout controller works with.
//!
//! Everything the controller learns about the cluster goes through the `ClusterClient` trait, which allows
//! reconcile passes to be exercised against mocks and in-memory clusters.
mod client;
pub mod error;

pub use self::client::{ClusterClient, K8SClusterClient};
pub use self::error::Error as ClusterError;

#[cfg(feature = "mockall")]
pub use self::client::MockClusterClient;
