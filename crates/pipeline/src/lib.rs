//! Execution adapter for the external generation pipeline.
//!
//! The pipeline itself is a black box: a Python entry point that reads a
//! dataset, trains, samples, and writes a CSV artifact to a known path.
//! This crate owns everything around that process boundary:
//!
//! - [`params::RunParams`] — the CLI parameter contract.
//! - [`protocol`] — the line-based progress protocol parsed from the
//!   child's output stream.
//! - [`runner::SubprocessRunner`] — spawn, stream, watchdog timeout,
//!   cooperative cancellation, SIGTERM-then-SIGKILL termination.
//! - [`error::ExecutionError`] — the execution failure taxonomy.

pub mod error;
pub mod params;
pub mod protocol;
pub mod runner;

pub use error::ExecutionError;
pub use params::RunParams;
pub use runner::{PipelineOutcome, PipelineRunner, ProgressEvent, RunRequest, SubprocessRunner};
