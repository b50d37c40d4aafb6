//! Cluster-facing types and helpers shared by the node-local-dns safe updater.
pub mod cluster;
pub mod constants;
pub mod daemonset;
pub mod key;
pub mod pod;
pub mod selector;
pub mod telemetry;
