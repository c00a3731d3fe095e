pub mod args;
pub mod collector;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod mutator;
pub mod reconcile;
pub mod reschedule;
pub mod scaling;
pub mod usage;

pub use error::{ErrorKind, ScalerError};
pub use metrics::SharedMetrics;
pub use reconcile::{CycleReport, ReconcileSettings, Reconciler};
