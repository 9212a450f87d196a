//! Image builds for notebook validation jobs
//!
//! - [`BuildStrategy`]: the backend contract, with [`S2iStrategy`] and
//!   [`TektonStrategy`] as implementations
//! - [`StrategyRegistry`]: selects a backend by the name on the job
//! - [`credentials`]: derives backend-shaped git secrets from user secrets
//! - [`resources`]: namespace tasks, service account grants and per-build
//!   workspace volumes
//!
//! All cluster access goes through [`BuildClient`].

#![deny(missing_docs)]

pub mod client;
pub mod credentials;
pub mod registry;
pub mod resources;
pub mod s2i;
pub mod settings;
pub mod strategy;
pub mod tekton;

#[cfg(test)]
mod testing;

pub use client::{BuildClient, KubeBuildClient};
pub use registry::StrategyRegistry;
pub use s2i::S2iStrategy;
pub use settings::BuildSettings;
pub use strategy::{select_latest, BuildInfo, BuildInfoPhase, BuildStrategy};
pub use tekton::TektonStrategy;
