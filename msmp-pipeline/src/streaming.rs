//! Streaming execution
//!
//! All stages from the input through the target are chained over one
//! trajectory source. Each link is fitted on chunks pushed through the
//! already fitted links before it, and the final Output is assembled chunk by
//! chunk, so no intermediate stage is ever materialised. The artifact store
//! is only consulted once, to reuse stored Feature output as the source.

use crate::data::{Block, Output};
use crate::estimators::Collaborators;
use crate::force::ForcePropagator;
use crate::model::Model;
use crate::source::{for_each_chunk, StoredOutputSource, TrajectorySource};
use crate::stage::{StageDescriptor, StageKind};
use crate::store::ArtifactStore;
use crate::{PipelineError, Result};
use msmp_common::PipelineParams;
use tracing::{debug, info, warn};

struct Link {
    descriptor: StageDescriptor,
    model: Option<Model>,
}

/// Parametrized chain of stages over a single source
pub struct StreamingPipeline<'a> {
    source: Box<dyn TrajectorySource + 'a>,
    links: Vec<Link>,
    chunk_size: usize,
    target: StageKind,
}

/// Fitted target model and its Output
#[derive(Debug, Clone)]
pub struct StreamedOutput {
    pub model: Model,
    pub output: Output,
}

struct BorrowedSource<'a>(&'a dyn TrajectorySource);

impl TrajectorySource for BorrowedSource<'_> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn id(&self, index: usize) -> String {
        self.0.id(index)
    }

    fn n_coordinates(&self) -> usize {
        self.0.n_coordinates()
    }

    fn chunks(&self, index: usize, chunk_size: usize) -> Result<crate::source::ChunkIter<'_>> {
        self.0.chunks(index, chunk_size)
    }

    fn fingerprint(&self) -> String {
        self.0.fingerprint()
    }
}

impl<'a> StreamingPipeline<'a> {
    /// Chain Feature (or stored features) through `target`
    ///
    /// Stored Feature output replaces the featurizer link when it exists,
    /// covers every raw trajectory and the Feature stage is not forced.
    pub fn build(
        target: StageKind,
        params: &PipelineParams,
        origin: &str,
        forces: &ForcePropagator,
        raw: &'a dyn TrajectorySource,
        store: &'a dyn ArtifactStore,
    ) -> Self {
        let chain = StageDescriptor::chain(target, params, origin);
        let feature_forced = forces.skips(StageKind::Feature.ordinal()).skip_output_tier;

        let stored = if target != StageKind::Feature && !feature_forced {
            StoredOutputSource::open(store, chain[0].key()).filter(|features| {
                let complete = features.len() == raw.len();
                if !complete {
                    warn!(
                        stored = features.len(),
                        trajectories = raw.len(),
                        "Stored features do not cover the trajectories, featurizing"
                    );
                }
                complete
            })
        } else {
            None
        };

        let (source, first): (Box<dyn TrajectorySource + 'a>, usize) = match stored {
            Some(features) => {
                info!(trajectories = features.len(), "Add stored features to pipeline");
                (Box::new(features), 1)
            }
            None => {
                info!(trajectories = raw.len(), "Add featurizer to pipeline");
                (Box::new(BorrowedSource(raw)), 0)
            }
        };

        let links = chain
            .into_iter()
            .skip(first)
            .map(|descriptor| Link {
                descriptor,
                model: None,
            })
            .collect();

        Self {
            source,
            links,
            chunk_size: params.chunk_size,
            target,
        }
    }

    /// Stages that will be fitted, in order
    pub fn stages(&self) -> Vec<StageKind> {
        self.links.iter().map(|l| l.descriptor.kind()).collect()
    }

    /// Fit every link in order, then stream the target Output
    pub fn parametrize(mut self, collaborators: &dyn Collaborators) -> Result<StreamedOutput> {
        for position in 0..self.links.len() {
            let model = self.fit_link(position, collaborators)?;
            self.links[position].model = Some(model);
        }

        let mut trajectories = Vec::with_capacity(self.source.len());
        for index in 0..self.source.len() {
            let mut blocks = Vec::new();
            for_each_chunk(self.source.as_ref(), index, self.chunk_size, |frames| {
                blocks.push(self.transform(Block::Continuous(frames), self.links.len())?);
                Ok(())
            })?;
            trajectories.push(Block::concat(blocks)?);
        }

        let model = self
            .links
            .pop()
            .and_then(|link| link.model)
            .ok_or_else(|| PipelineError::InvalidInput("streaming pipeline has no stages".to_string()))?;
        info!(stage = %self.target, trajectories = trajectories.len(), "Streamed output");
        Ok(StreamedOutput {
            model,
            output: Output::new(trajectories),
        })
    }

    fn fit_link(&self, position: usize, collaborators: &dyn Collaborators) -> Result<Model> {
        let descriptor = &self.links[position].descriptor;
        let kind = descriptor.kind();
        let mut estimator = collaborators.estimator(descriptor)?;

        for pass in 0..estimator.passes() {
            estimator.begin_pass(pass)?;
            for index in 0..self.source.len() {
                for_each_chunk(self.source.as_ref(), index, self.chunk_size, |frames| {
                    let block = self.transform(Block::Continuous(frames), position)?;
                    estimator.partial_fit(index, block.view())
                })
                .map_err(|e| e.within(kind))?;
            }
        }

        let model = estimator.finish()?;
        debug!(stage = %kind, "Fitted streaming link");
        Ok(model)
    }

    /// Push a source block through the first `depth` fitted links
    fn transform(&self, block: Block, depth: usize) -> Result<Block> {
        let mut block = block;
        for link in &self.links[..depth] {
            let model = link.model.as_ref().ok_or_else(|| {
                PipelineError::InvalidInput(format!("{} link is not fitted", link.descriptor.kind()))
            })?;
            let applied = model
                .apply(block.view())
                .map_err(|e| e.within(link.descriptor.kind()))?;
            block = link.descriptor.restrict_block(applied, model);
        }
        Ok(block)
    }
}
