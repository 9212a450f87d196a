//! Reconciliation driver for NotebookValidationJob
//!
//! - [`controller`]: the phase state machine, failure handling and context
//! - [`runner`]: executes notebooks in the chosen image
//! - [`pod_failure`]: diagnoses validation pods that cannot finish
//! - [`config`]: requeue timing and retry budget

#![deny(missing_docs)]

pub mod config;
pub mod controller;
mod phases;
pub mod pod_failure;
pub mod runner;

#[cfg(test)]
mod testing;

pub use config::ReconcileConfig;
pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use runner::{NotebookRunner, PodNotebookRunner, RunOutcome, RunnerSettings};
