//! Shared fixtures for pipeline integration tests
//!
//! Trajectories of four CA atoms hopping between three conformations with a
//! little positional noise, so every stage has clear structure to find.

#![allow(dead_code)]

use msmp_common::PipelineParams;
use msmp_pipeline::estimators::featurizer::{Atom, Topology};
use msmp_pipeline::estimators::{Collaborators, Estimator, StandardCollaborators};
use msmp_pipeline::source::{ChunkIter, MemorySource, TrajectorySource};
use msmp_pipeline::{Result, StageDescriptor, StageKind};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

pub const N_ATOMS: usize = 4;

/// Probability of leaving the current conformation at each frame
const SWITCH_PROBABILITY: f64 = 0.03;
const NOISE: f32 = 0.05;

pub fn topology() -> Topology {
    Topology {
        atoms: (0..N_ATOMS)
            .map(|i| Atom {
                name: "CA".to_string(),
                residue: format!("GLY{}", i + 1),
            })
            .collect(),
    }
}

/// Parameters sized for the synthetic data; chunk size does not divide the
/// trajectory lengths
pub fn params() -> PipelineParams {
    PipelineParams {
        lag: 2,
        var_cutoff: 0.95,
        ndims: None,
        kclusters: 3,
        msmlag: 1,
        kmeans_stride: 1,
        chunk_size: 37,
        ..Default::default()
    }
}

fn conformation(state: usize) -> [[f32; 3]; N_ATOMS] {
    let bend = state as f32 * 1.5;
    [
        [0.0, 0.0, 0.0],
        [3.8, 0.0, 0.0],
        [7.6, bend, 0.0],
        [11.4 - bend, 2.0 * bend, 0.5 * bend],
    ]
}

/// `count` trajectories of `frames` frames each, reproducible from `seed`
pub fn trajectories(count: usize, frames: usize, seed: u64) -> Vec<Array2<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|t| {
            let mut state = t % 3;
            let mut frames_out = Array2::<f32>::zeros((frames, 3 * N_ATOMS));
            for mut row in frames_out.rows_mut() {
                if rng.gen_bool(SWITCH_PROBABILITY) {
                    state = (state + rng.gen_range(1..3)) % 3;
                }
                let positions = conformation(state);
                for (column, value) in row.iter_mut().enumerate() {
                    *value = positions[column / 3][column % 3] + rng.gen_range(-NOISE..NOISE);
                }
            }
            frames_out
        })
        .collect()
}

pub fn source() -> MemorySource {
    MemorySource::new(trajectories(3, 240, 7)).unwrap()
}

/// Source that reports the same fingerprint whatever it holds
pub struct FixedIdentity(pub MemorySource);

impl TrajectorySource for FixedIdentity {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn id(&self, index: usize) -> String {
        self.0.id(index)
    }

    fn n_coordinates(&self) -> usize {
        self.0.n_coordinates()
    }

    fn chunks(&self, index: usize, chunk_size: usize) -> msmp_pipeline::Result<ChunkIter<'_>> {
        self.0.chunks(index, chunk_size)
    }

    fn fingerprint(&self) -> String {
        "fixed".to_string()
    }
}

/// Standard estimators, counting every estimator handed out per stage
pub struct CountingCollaborators {
    inner: StandardCollaborators,
    calls: Mutex<Vec<StageKind>>,
}

impl CountingCollaborators {
    pub fn new() -> Self {
        Self {
            inner: StandardCollaborators::new(topology()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<StageKind> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Collaborators for CountingCollaborators {
    fn estimator(&self, stage: &StageDescriptor) -> Result<Box<dyn Estimator>> {
        self.calls.lock().unwrap().push(stage.kind());
        self.inner.estimator(stage)
    }

    fn fingerprint(&self) -> String {
        self.inner.fingerprint()
    }
}
