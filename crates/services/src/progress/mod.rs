mod rollup;
mod service;

// Public API of the progress subsystem.
pub use crate::error::ProgressError;
pub use service::{NodeProgress, ProgressService, RunOutcome};
