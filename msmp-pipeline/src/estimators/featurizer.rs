//! Pairwise CA distance features
//!
//! Frames are rows of `3 * n_atoms` coordinates (x, y, z per atom, topology
//! order). The featurizer emits the Euclidean distance of every pair of
//! selected atoms `(i, j)`, `i < j`, in topology order.

use super::Estimator;
use crate::data::Chunk;
use crate::model::Model;
use crate::stage::{StageKind, FEATURE_SELECTION};
use crate::{PipelineError, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One atom of the topology file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub name: String,
    #[serde(default)]
    pub residue: String,
}

/// Atom table shared by all trajectories
///
/// ```toml
/// [[atoms]]
/// name = "CA"
/// residue = "ALA"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub atoms: Vec<Atom>,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            PipelineError::InvalidInput(format!("Failed to parse topology {}: {}", path.display(), e))
        })
    }

    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    /// Columns per frame in a raw trajectory
    pub fn n_coordinates(&self) -> usize {
        3 * self.atoms.len()
    }

    /// Indices of atoms with the given name
    pub fn select(&self, name: &str) -> Vec<usize> {
        self.atoms
            .iter()
            .enumerate()
            .filter(|(_, atom)| atom.name == name)
            .map(|(index, _)| index)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturizerModel {
    n_atoms: usize,
    selected: Vec<usize>,
}

impl FeaturizerModel {
    /// Distances between all atoms named `CA`
    pub fn from_topology(topology: &Topology) -> Result<Self> {
        let selected = topology.select(FEATURE_SELECTION);
        if selected.len() < 2 {
            return Err(PipelineError::computation(
                StageKind::Feature,
                format!(
                    "need at least two {} atoms, topology has {}",
                    FEATURE_SELECTION,
                    selected.len()
                ),
            ));
        }
        Ok(Self {
            n_atoms: topology.n_atoms(),
            selected,
        })
    }

    pub fn n_features(&self) -> usize {
        let n = self.selected.len();
        n * (n - 1) / 2
    }

    pub fn transform(&self, frames: ArrayView2<f32>) -> Result<Array2<f32>> {
        if frames.ncols() != 3 * self.n_atoms {
            return Err(PipelineError::InvalidInput(format!(
                "frame has {} coordinates, topology needs {}",
                frames.ncols(),
                3 * self.n_atoms
            )));
        }

        let mut features = Array2::<f32>::zeros((frames.nrows(), self.n_features()));
        for (row, frame) in frames.rows().into_iter().enumerate() {
            let mut column = 0;
            for (a, &i) in self.selected.iter().enumerate() {
                for &j in &self.selected[a + 1..] {
                    let mut sum = 0.0f64;
                    for axis in 0..3 {
                        let d = f64::from(frame[3 * i + axis]) - f64::from(frame[3 * j + axis]);
                        sum += d * d;
                    }
                    features[[row, column]] = sum.sqrt() as f32;
                    column += 1;
                }
            }
        }
        Ok(features)
    }
}

/// Fitted from the topology alone
#[derive(Debug)]
pub struct FeaturizerEstimator {
    topology: Topology,
}

impl FeaturizerEstimator {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }
}

impl Estimator for FeaturizerEstimator {
    fn stage(&self) -> StageKind {
        StageKind::Feature
    }

    fn passes(&self) -> usize {
        0
    }

    fn partial_fit(&mut self, _trajectory: usize, _chunk: Chunk<'_>) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Model> {
        FeaturizerModel::from_topology(&self.topology).map(Model::Featurizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn topology(names: &[&str]) -> Topology {
        Topology {
            atoms: names
                .iter()
                .map(|name| Atom {
                    name: name.to_string(),
                    residue: "ALA".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_distances_between_selected_atoms() {
        let model = FeaturizerModel::from_topology(&topology(&["CA", "CB", "CA", "CA"])).unwrap();
        assert_eq!(model.n_features(), 3);

        let frames = array![[
            0.0, 0.0, 0.0, // CA
            9.0, 9.0, 9.0, // CB, ignored
            3.0, 4.0, 0.0, // CA
            0.0, 0.0, 2.0, // CA
        ]];
        let features = model.transform(frames.view()).unwrap();
        let expected = [5.0, 2.0, 29f32.sqrt()];
        for (got, want) in features.row(0).iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_too_few_atoms_is_computation_error() {
        let err = FeaturizerModel::from_topology(&topology(&["CA", "N"])).unwrap_err();
        assert!(matches!(err, PipelineError::Computation { stage: StageKind::Feature, .. }));
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let model = FeaturizerModel::from_topology(&topology(&["CA", "CA"])).unwrap();
        assert!(model.transform(Array2::zeros((1, 5)).view()).is_err());
        assert_eq!(model.transform(Array2::zeros((0, 6)).view()).unwrap().nrows(), 0);
    }

    #[test]
    fn test_topology_from_toml() {
        let parsed: Topology =
            toml::from_str("[[atoms]]\nname = \"CA\"\nresidue = \"GLY\"\n\n[[atoms]]\nname = \"N\"\n").unwrap();
        assert_eq!(parsed.n_atoms(), 2);
        assert_eq!(parsed.select("CA"), vec![0]);
        assert_eq!(parsed.n_coordinates(), 6);
    }
}
