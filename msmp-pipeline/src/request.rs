//! Top-level pipeline requests
//!
//! A request names the target stage, the parameter set, the force flags and
//! the execution mode. Cached mode goes through the [`Resolver`]; streaming
//! mode builds a [`StreamingPipeline`]. A single request never mixes the two.

use crate::data::Output;
use crate::estimators::Collaborators;
use crate::force::{ForceFlags, ForcePropagator};
use crate::model::Model;
use crate::resolver::{Resolver, Tier};
use crate::source::TrajectorySource;
use crate::stage::{StageDescriptor, StageKind};
use crate::store::ArtifactStore;
use crate::streaming::StreamingPipeline;
use crate::Result;
use msmp_common::PipelineParams;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Tiered cache resolution, persisting computed artifacts
    #[default]
    Cached,
    /// One chained pass over the source, no cache reads or writes
    Streaming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub target: StageKind,
    pub params: PipelineParams,
    pub forces: ForceFlags,
    pub mode: ExecutionMode,
}

impl PipelineRequest {
    pub fn new(target: StageKind, params: PipelineParams) -> Self {
        Self {
            target,
            params,
            forces: ForceFlags::default(),
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_forces(mut self, forces: ForceFlags) -> Self {
        self.forces = forces;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Where the target's artifacts came from
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    Cached {
        tier: Tier,
        trace: Vec<(StageKind, Tier)>,
    },
    Streamed,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub stage: StageKind,
    pub model: Model,
    pub output: Output,
    pub provenance: Provenance,
}

/// Fingerprint of everything the Feature stage reads besides its parameters:
/// the trajectory set and the collaborators' featurizer inputs
pub fn source_origin(source: &dyn TrajectorySource, collaborators: &dyn Collaborators) -> String {
    format!("{}|{}", source.fingerprint(), collaborators.fingerprint())
}

/// Run `request` against the given store, source and collaborators
pub fn run_request(
    request: &PipelineRequest,
    store: &dyn ArtifactStore,
    source: &dyn TrajectorySource,
    collaborators: &dyn Collaborators,
) -> Result<Outcome> {
    request.params.validate()?;
    let forces = ForcePropagator::for_pipeline(&request.forces);
    let origin = source_origin(source, collaborators);
    info!(target = %request.target, mode = ?request.mode, trajectories = source.len(), "Running pipeline request");

    match request.mode {
        ExecutionMode::Cached => {
            let descriptor = StageDescriptor::new(request.target, &request.params, &origin);
            let resolution = Resolver::new(store, source, collaborators).resolve(&descriptor, &forces)?;
            Ok(Outcome {
                stage: resolution.stage,
                model: resolution.model,
                output: resolution.output,
                provenance: Provenance::Cached {
                    tier: resolution.tier,
                    trace: resolution.trace,
                },
            })
        }
        ExecutionMode::Streaming => {
            let streamed =
                StreamingPipeline::build(request.target, &request.params, &origin, &forces, source, store)
                    .parametrize(collaborators)?;
            Ok(Outcome {
                stage: request.target,
                model: streamed.model,
                output: streamed.output,
                provenance: Provenance::Streamed,
            })
        }
    }
}
