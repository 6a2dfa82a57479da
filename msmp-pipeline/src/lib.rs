//! msmp-pipeline library interface
//!
//! Staged trajectory analysis (features → tICA → k-means → Markov model)
//! where every stage resolves its artifact through a tiered cache before
//! falling back to computation, plus a streaming mode that chains all stage
//! estimators over the raw trajectories without touching the cache.

pub mod analysis;
pub mod cli;
pub mod data;
pub mod error;
pub mod estimators;
pub mod force;
pub mod model;
pub mod request;
pub mod resolver;
pub mod source;
pub mod stage;
pub mod store;
pub mod streaming;

pub use crate::error::{PipelineError, Result};
pub use crate::force::{ForceFlags, ForcePropagator, TierSkips};
pub use crate::request::{run_request, source_origin, ExecutionMode, Outcome, PipelineRequest, Provenance};
pub use crate::resolver::{Resolution, Resolver, Tier};
pub use crate::stage::{StageDescriptor, StageKind};
pub use crate::streaming::StreamingPipeline;
