//! Stage estimators
//!
//! Each stage is fitted by feeding its upstream data chunk by chunk into an
//! [`Estimator`] and calling [`Estimator::finish`]. The resolver's full
//! computation and the streaming pipeline drive the same estimators, so both
//! modes accumulate identical statistics.

pub mod featurizer;
pub mod kmeans;
pub mod linalg;
pub mod markov;
pub mod tica;

use crate::data::{Chunk, Output};
use crate::model::Model;
use crate::stage::{StageDescriptor, StageKind, FEATURE_SELECTION};
use crate::Result;

use featurizer::{FeaturizerEstimator, Topology};
use kmeans::KMeansEstimator;
use markov::MarkovEstimator;
use tica::TicaEstimator;

/// Incremental fitter for one stage
pub trait Estimator: Send {
    fn stage(&self) -> StageKind;

    /// Number of passes over the upstream data (0 = fitted without data)
    fn passes(&self) -> usize {
        1
    }

    /// Called before every pass
    fn begin_pass(&mut self, _pass: usize) -> Result<()> {
        Ok(())
    }

    /// Consume the next chunk of trajectory `trajectory`
    ///
    /// Chunks of one trajectory arrive in frame order.
    fn partial_fit(&mut self, trajectory: usize, chunk: Chunk<'_>) -> Result<()>;

    fn finish(self: Box<Self>) -> Result<Model>;
}

/// Full-computation collaborators of every stage
pub trait Collaborators: Send + Sync {
    /// A fresh, unfitted estimator for `stage`
    fn estimator(&self, stage: &StageDescriptor) -> Result<Box<dyn Estimator>>;

    /// Identity of the featurizer's inputs beyond its parameters (empty if
    /// none); becomes part of every artifact key
    fn fingerprint(&self) -> String {
        String::new()
    }
}

/// Built-in numeric estimators: CA distances, tICA, k-means, Markov model
#[derive(Debug, Clone)]
pub struct StandardCollaborators {
    topology: Topology,
}

impl StandardCollaborators {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

impl Collaborators for StandardCollaborators {
    fn estimator(&self, stage: &StageDescriptor) -> Result<Box<dyn Estimator>> {
        let params = stage.params();
        Ok(match stage.kind() {
            StageKind::Feature => Box::new(FeaturizerEstimator::new(self.topology.clone())),
            StageKind::Reduction => Box::new(TicaEstimator::new(params.lag, true)),
            StageKind::Clustering => Box::new(KMeansEstimator::new(
                params.kclusters,
                params.kmeans_max_iter,
                params.kmeans_tolerance,
                params.kmeans_stride,
            )),
            StageKind::ModelEstimation => Box::new(MarkovEstimator::new(params.msmlag)),
        })
    }

    /// Atoms the featurizer selects from the topology
    fn fingerprint(&self) -> String {
        let selected: Vec<String> = self
            .topology
            .select(FEATURE_SELECTION)
            .iter()
            .map(|index| index.to_string())
            .collect();
        format!("atoms={};{}={}", self.topology.n_atoms(), FEATURE_SELECTION, selected.join(","))
    }
}

/// Fit `estimator` on an in-memory Output, `chunk_size` frames at a time
pub fn fit_output(mut estimator: Box<dyn Estimator>, upstream: &Output, chunk_size: usize) -> Result<Model> {
    for pass in 0..estimator.passes() {
        estimator.begin_pass(pass)?;
        for (trajectory, block) in upstream.trajectories().iter().enumerate() {
            for chunk in block.chunks(chunk_size) {
                estimator.partial_fit(trajectory, chunk)?;
            }
        }
    }
    estimator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Block;
    use msmp_common::PipelineParams;
    use ndarray::array;

    #[test]
    fn test_standard_collaborators_match_stage() {
        let collaborators = StandardCollaborators::new(Topology::default());
        for kind in StageKind::ALL {
            let descriptor = StageDescriptor::new(kind, &PipelineParams::default(), "");
            assert_eq!(collaborators.estimator(&descriptor).unwrap().stage(), kind);
        }
    }

    #[test]
    fn test_fingerprint_names_selected_atoms() {
        let topology: Topology = toml::from_str(
            r#"
            [[atoms]]
            name = "N"
            [[atoms]]
            name = "CA"
            [[atoms]]
            name = "CA"
            "#,
        )
        .unwrap();
        let collaborators = StandardCollaborators::new(topology);
        assert_eq!(collaborators.fingerprint(), "atoms=3;CA=1,2");
        assert_ne!(
            collaborators.fingerprint(),
            StandardCollaborators::new(Topology::default()).fingerprint()
        );
    }

    #[test]
    fn test_fit_output_is_chunk_size_independent() {
        let upstream = Output::new(vec![
            Block::Discrete(vec![0, 0, 1, 1, 0, 1, 1, 1]),
            Block::Discrete(vec![1, 0, 0, 1]),
        ]);
        let whole = fit_output(Box::new(MarkovEstimator::new(1)), &upstream, 100).unwrap();
        let chunked = fit_output(Box::new(MarkovEstimator::new(1)), &upstream, 3).unwrap();
        assert_eq!(whole, chunked);

        let points = Output::new(vec![Block::Continuous(array![[0.0], [0.1], [5.0], [5.1]])]);
        let kmeans = fit_output(Box::new(KMeansEstimator::new(2, 10, 1e-6, 1)), &points, 1).unwrap();
        assert_eq!(kmeans.stage(), StageKind::Clustering);
    }
}
