//! Tiered artifact resolution
//!
//! For each stage, from strongest to weakest trust:
//!
//! 1. stored Output (plus its Model and any statistic needed to restrict it)
//! 2. stored Model applied to freshly resolved upstream Output
//! 3. full computation: resolve upstream, fit, apply, persist
//!
//! A tier is skipped when the force propagator says so. Missing or
//! unreadable artifacts make a tier unavailable and resolution falls through;
//! only a failing full computation aborts. Nothing is persisted unless
//! tier 3 completes, and tier 2 never writes.

use crate::data::{Block, Output};
use crate::estimators::{fit_output, Collaborators};
use crate::force::ForcePropagator;
use crate::model::Model;
use crate::source::{for_each_chunk, TrajectorySource};
use crate::stage::{StageDescriptor, StageKind};
use crate::store::{ArtifactStore, ArtifactStoreExt, Lookup};
use crate::{PipelineError, Result};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// How a stage's artifact was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    StoredOutput,
    StoredModel,
    Computed,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::StoredOutput => "storage",
            Tier::StoredModel => "model",
            Tier::Computed => "calculation",
        })
    }
}

/// Resolved model and restricted output of the target stage
#[derive(Debug, Clone)]
pub struct Resolution {
    pub stage: StageKind,
    pub model: Model,
    pub output: Output,
    pub tier: Tier,
    /// Tier used by every stage that was resolved, upstream first
    pub trace: Vec<(StageKind, Tier)>,
}

/// Input of a stage: raw trajectories for Feature, upstream Output otherwise
enum StageInput {
    Raw,
    Upstream(Output),
}

pub struct Resolver<'a> {
    store: &'a dyn ArtifactStore,
    source: &'a dyn TrajectorySource,
    collaborators: &'a dyn Collaborators,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a dyn ArtifactStore,
        source: &'a dyn TrajectorySource,
        collaborators: &'a dyn Collaborators,
    ) -> Self {
        Self {
            store,
            source,
            collaborators,
        }
    }

    pub fn resolve(&self, target: &StageDescriptor, forces: &ForcePropagator) -> Result<Resolution> {
        let mut trace = Vec::new();
        let (model, output, tier) = self.resolve_stage(target, forces, &mut trace)?;
        Ok(Resolution {
            stage: target.kind(),
            model,
            output,
            tier,
            trace,
        })
    }

    fn resolve_stage(
        &self,
        stage: &StageDescriptor,
        forces: &ForcePropagator,
        trace: &mut Vec<(StageKind, Tier)>,
    ) -> Result<(Model, Output, Tier)> {
        let kind = stage.kind();
        let skips = forces.skips(kind.ordinal());

        if skips.skip_output_tier {
            debug!(stage = %kind, "Output tier skipped by force flags");
        } else {
            match self.load_stored(stage) {
                Lookup::Hit((model, output)) => {
                    info!(stage = %kind, key = %stage.key(), "{} from storage", kind);
                    trace.push((kind, Tier::StoredOutput));
                    return Ok((model, output, Tier::StoredOutput));
                }
                Lookup::Miss => debug!(stage = %kind, "No stored output"),
                Lookup::Corrupt(reason) => {
                    warn!(stage = %kind, key = %stage.key(), reason = %reason, "Stored output unreadable, falling back")
                }
            }
        }

        let mut input = None;
        if skips.skip_model_tier {
            debug!(stage = %kind, "Model tier skipped by force flags");
        } else {
            match self.store.get_model(stage.key()) {
                Lookup::Hit(model) => {
                    let upstream = self.resolve_input(stage, forces, trace)?;
                    match self.apply(&model, &upstream, stage) {
                        Ok(full) => {
                            let output = stage.restrict(full, restricting_statistic(stage, &model));
                            info!(stage = %kind, key = %stage.key(), "{} from model", kind);
                            trace.push((kind, Tier::StoredModel));
                            return Ok((model, output, Tier::StoredModel));
                        }
                        Err(e) => {
                            warn!(stage = %kind, error = %e, "Stored model does not fit upstream data, falling back");
                            input = Some(upstream);
                        }
                    }
                }
                Lookup::Miss => debug!(stage = %kind, "No stored model"),
                Lookup::Corrupt(reason) => {
                    warn!(stage = %kind, key = %stage.key(), reason = %reason, "Stored model unreadable, falling back")
                }
            }
        }

        let input = match input {
            Some(input) => input,
            None => self.resolve_input(stage, forces, trace)?,
        };
        let (model, output) = self.compute(stage, &input)?;
        info!(stage = %kind, key = %stage.key(), "{} from calculation", kind);
        trace.push((kind, Tier::Computed));
        Ok((model, output, Tier::Computed))
    }

    /// Tier 1 needs the model, the committed output and the restricting
    /// statistic; any of them missing makes the whole tier a miss. The output
    /// must cover every source trajectory and must have been committed with
    /// the model and statistic currently stored.
    fn load_stored(&self, stage: &StageDescriptor) -> Lookup<(Model, Output)> {
        let key = stage.key();
        let manifest = match self.store.get_output_manifest(key) {
            Lookup::Hit(manifest) => manifest,
            Lookup::Miss => return Lookup::Miss,
            Lookup::Corrupt(reason) => return Lookup::Corrupt(reason),
        };
        if manifest.trajectories != self.source.len() {
            debug!(
                stage = %stage.kind(),
                stored = manifest.trajectories,
                trajectories = self.source.len(),
                "Stored output covers a different trajectory set"
            );
            return Lookup::Miss;
        }

        let statistics: Vec<&str> = stage.required_statistic().into_iter().collect();
        match self.store.model_digest(key, &statistics) {
            Lookup::Hit(digest) if manifest.model_digest.as_deref() == Some(digest.as_str()) => {}
            Lookup::Hit(_) => {
                return Lookup::Corrupt("output was committed with a different model".to_string())
            }
            Lookup::Miss => return Lookup::Miss,
            Lookup::Corrupt(reason) => return Lookup::Corrupt(reason),
        }

        self.store.get_model(key).and_then(|model| {
            let statistic = match stage.required_statistic() {
                Some(name) => match self.store.get_statistic(key, name) {
                    Lookup::Hit(values) => Some(values),
                    Lookup::Miss => return Lookup::Miss,
                    Lookup::Corrupt(reason) => return Lookup::Corrupt(reason),
                },
                None => None,
            };
            self.store
                .read_output(key, &manifest)
                .map(|full| (model, stage.restrict(full, statistic.as_deref())))
        })
    }

    fn resolve_input(
        &self,
        stage: &StageDescriptor,
        forces: &ForcePropagator,
        trace: &mut Vec<(StageKind, Tier)>,
    ) -> Result<StageInput> {
        match stage.upstream() {
            None => Ok(StageInput::Raw),
            Some(upstream) => self
                .resolve_stage(upstream, forces, trace)
                .map(|(_, output, _)| StageInput::Upstream(output))
                .map_err(|e| e.into_upstream(upstream.kind())),
        }
    }

    /// Apply `model` to the whole stage input, full width
    fn apply(&self, model: &Model, input: &StageInput, stage: &StageDescriptor) -> Result<Output> {
        match input {
            StageInput::Upstream(output) => model.apply_output(output),
            StageInput::Raw => {
                let chunk_size = stage.params().chunk_size;
                let mut trajectories = Vec::with_capacity(self.source.len());
                for index in 0..self.source.len() {
                    let mut blocks = Vec::new();
                    for_each_chunk(self.source, index, chunk_size, |frames| {
                        blocks.push(model.apply(Block::Continuous(frames).view())?);
                        Ok(())
                    })?;
                    trajectories.push(Block::concat(blocks)?);
                }
                Ok(Output::new(trajectories))
            }
        }
    }

    fn fit(&self, stage: &StageDescriptor, input: &StageInput) -> Result<Model> {
        let chunk_size = stage.params().chunk_size;
        let mut estimator = self.collaborators.estimator(stage)?;
        match input {
            StageInput::Upstream(output) => fit_output(estimator, output, chunk_size),
            StageInput::Raw => {
                for pass in 0..estimator.passes() {
                    estimator.begin_pass(pass)?;
                    for index in 0..self.source.len() {
                        for_each_chunk(self.source, index, chunk_size, |frames| {
                            estimator.partial_fit(index, Block::Continuous(frames).view())
                        })?;
                    }
                }
                estimator.finish()
            }
        }
    }

    /// Tier 3: fit, apply, persist, restrict
    ///
    /// Statistics and model are written first; the output manifest, bound to
    /// their digest, is the single commit of the stage.
    fn compute(&self, stage: &StageDescriptor, input: &StageInput) -> Result<(Model, Output)> {
        let kind = stage.kind();
        let model = self.fit(stage, input).map_err(|e| e.within(kind))?;
        let full = self.apply(&model, input, stage).map_err(|e| e.within(kind))?;

        let key = stage.key();
        for (name, values) in model.statistics() {
            self.store.put_statistic(key, name, values)?;
        }
        self.store.put_model(key, &model)?;
        let statistics: Vec<&str> = stage.required_statistic().into_iter().collect();
        let digest = match self.store.model_digest(key, &statistics) {
            Lookup::Hit(digest) => digest,
            Lookup::Miss => {
                return Err(PipelineError::Store(format!("{}: model entries vanished after write", key)))
            }
            Lookup::Corrupt(reason) => return Err(PipelineError::Store(reason)),
        };
        self.store.commit_output(key, &full, Some(digest))?;
        debug!(stage = %kind, key = %key, trajectories = full.len(), "Persisted artifacts");

        let output = stage.restrict(full, restricting_statistic(stage, &model));
        Ok((model, output))
    }
}

fn restricting_statistic<'m>(stage: &StageDescriptor, model: &'m Model) -> Option<&'m [f64]> {
    stage.required_statistic().and_then(|name| model.statistic(name))
}
