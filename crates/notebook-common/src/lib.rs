//! Common types for the notebook validation operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod duration;
pub mod error;
pub mod events;
pub mod labels;
pub mod retry;
pub mod telemetry;

pub use error::{classify, ClassifiedError, Error, ErrorClass};

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "notebook-validation-controller";

/// Reporting component name for Kubernetes Events
pub const CONTROLLER_NAME: &str = "notebook-validation-controller";
