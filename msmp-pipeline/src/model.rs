//! Fitted stage models
//!
//! A model maps one chunk of upstream data to this stage's data. Applying it
//! chunk by chunk or to a whole trajectory at once gives the same rows.

use crate::data::{Block, Chunk, Output};
use crate::estimators::featurizer::FeaturizerModel;
use crate::estimators::kmeans::KMeansModel;
use crate::estimators::markov::MarkovModel;
use crate::estimators::tica::TicaModel;
use crate::stage::{StageKind, CUMVAR_STATISTIC};
use crate::{PipelineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Model {
    Featurizer(FeaturizerModel),
    Tica(TicaModel),
    KMeans(KMeansModel),
    Markov(MarkovModel),
}

impl Model {
    /// Stage this model belongs to
    pub fn stage(&self) -> StageKind {
        match self {
            Model::Featurizer(_) => StageKind::Feature,
            Model::Tica(_) => StageKind::Reduction,
            Model::KMeans(_) => StageKind::Clustering,
            Model::Markov(_) => StageKind::ModelEstimation,
        }
    }

    pub fn apply(&self, chunk: Chunk<'_>) -> Result<Block> {
        match (self, chunk) {
            (Model::Featurizer(m), Chunk::Continuous(frames)) => m.transform(frames).map(Block::Continuous),
            (Model::Tica(m), Chunk::Continuous(features)) => m.transform(features).map(Block::Continuous),
            (Model::KMeans(m), Chunk::Continuous(points)) => m.assign(points).map(Block::Discrete),
            (Model::Markov(m), Chunk::Discrete(states)) => Ok(Block::Continuous(m.frame_weights(states))),
            (model, _) => Err(PipelineError::InvalidInput(format!(
                "{} model cannot be applied to {} data",
                model.stage(),
                if chunk.continuous().is_some() { "continuous" } else { "discrete" }
            ))),
        }
    }

    /// Apply to every trajectory of an upstream Output
    pub fn apply_output(&self, upstream: &Output) -> Result<Output> {
        upstream
            .trajectories()
            .iter()
            .map(|block| self.apply(block.view()))
            .collect::<Result<Vec<_>>>()
            .map(Output::new)
    }

    /// Named auxiliary statistic carried by the model
    pub fn statistic(&self, name: &str) -> Option<&[f64]> {
        self.statistics()
            .into_iter()
            .find(|(stat, _)| *stat == name)
            .map(|(_, values)| values)
    }

    /// All auxiliary statistics, persisted next to the model
    pub fn statistics(&self) -> Vec<(&'static str, &[f64])> {
        match self {
            Model::Tica(m) => vec![(CUMVAR_STATISTIC, m.cumvar()), ("eigenvalues", m.eigenvalues())],
            Model::Markov(m) => vec![("stationary", m.stationary())],
            Model::Featurizer(_) | Model::KMeans(_) => Vec::new(),
        }
    }
}
