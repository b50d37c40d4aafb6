pub mod check;
pub mod controller;
pub mod error;
pub mod filter;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod revision;
pub mod telemetry;

#[cfg(test)]
mod test_util;

pub use crate::controller::SafeUpdaterController;
pub use crate::error::Error;
pub use crate::reconciler::{ReconcileAction, Reconciler, RolloutTarget};
