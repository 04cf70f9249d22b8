#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod core;
mod error;
mod fingerprint;
mod graph;
mod manifest;
mod plan;
mod report;
mod scheduler;
mod task;
mod utils;

pub use crate::cache::{ArtifactCache, CacheStats, Lookup};
pub use crate::config::Config;
pub use crate::core::{Artifact, Hash32};
pub use crate::error::*;
pub use crate::fingerprint::{Fingerprint, Inputs};
pub use crate::graph::{TaskDef, TaskGraph};
pub use crate::manifest::{JsonManifest, ManifestEmitter, PackageDescriptor, Product};
pub use crate::plan::{CommandAction, Plan, PlanTask};
pub use crate::report::{RunOutcome, RunReport, SkipReason, TaskReport};
pub use crate::scheduler::Scheduler;
pub use crate::task::{Action, TaskContext, TaskStatus, action};
pub use crate::utils::as_overhead;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

pub use tokio_util::sync::CancellationToken;
