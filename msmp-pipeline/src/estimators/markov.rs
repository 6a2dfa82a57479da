//! Reversible Markov state model
//!
//! Transition counts at lag `msmlag` are symmetrised (`C + Cᵀ`), which gives
//! a detailed-balance estimate whose stationary distribution is proportional
//! to the row sums. The stage output weights every frame by the stationary
//! probability of its state divided by that state's visit count, so the
//! weights of the fitting data sum to one.

use super::linalg::symmetric_eigen;
use super::Estimator;
use crate::data::Chunk;
use crate::model::Model;
use crate::stage::StageKind;
use crate::{PipelineError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkovModel {
    lag: usize,
    /// Symmetrised transition counts
    counts: Array2<f64>,
    transition_matrix: Array2<f64>,
    stationary: Vec<f64>,
    visits: Vec<u64>,
}

impl MarkovModel {
    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn n_states(&self) -> usize {
        self.stationary.len()
    }

    pub fn stationary(&self) -> &[f64] {
        &self.stationary
    }

    pub fn transition_matrix(&self) -> &Array2<f64> {
        &self.transition_matrix
    }

    /// One weight per frame; states never visited while fitting weigh zero
    pub fn frame_weights(&self, states: &[u32]) -> Array2<f32> {
        Array2::from_shape_fn((states.len(), 1), |(t, _)| {
            let state = states[t] as usize;
            match (self.stationary.get(state), self.visits.get(state)) {
                (Some(&pi), Some(&visits)) if visits > 0 => (pi / visits as f64) as f32,
                _ => 0.0,
            }
        })
    }

    /// Leading `nits` implied timescales, `-lag·dt / ln|λ_i|` for i ≥ 2
    pub fn timescales(&self, nits: usize, dt: f64) -> Result<Vec<f64>> {
        let active: Vec<usize> = (0..self.n_states())
            .filter(|&i| self.stationary[i] > 0.0)
            .collect();
        let row_sums: Vec<f64> = active
            .iter()
            .map(|&i| self.counts.row(i).sum())
            .collect();

        // Similar to T under detailed balance, hence same spectrum
        let similar = Array2::from_shape_fn((active.len(), active.len()), |(a, b)| {
            self.counts[[active[a], active[b]]] / (row_sums[a] * row_sums[b]).sqrt()
        });
        let (eigenvalues, _) = symmetric_eigen(similar.view())
            .map_err(|e| PipelineError::computation(StageKind::ModelEstimation, e))?;

        let mut magnitudes: Vec<f64> = eigenvalues.iter().map(|l| l.abs()).collect();
        magnitudes.sort_by(|a, b| b.total_cmp(a));
        Ok(magnitudes
            .into_iter()
            .skip(1)
            .take(nits)
            .map(|l| {
                if l >= 1.0 {
                    f64::INFINITY
                } else {
                    -(self.lag as f64) * dt / l.ln()
                }
            })
            .collect())
    }
}

#[derive(Debug)]
pub struct MarkovEstimator {
    lag: usize,
    counts: BTreeMap<(u32, u32), u64>,
    visits: Vec<u64>,
    current: Option<usize>,
    tail: Vec<u32>,
}

impl MarkovEstimator {
    pub fn new(lag: usize) -> Self {
        Self {
            lag,
            counts: BTreeMap::new(),
            visits: Vec::new(),
            current: None,
            tail: Vec::new(),
        }
    }
}

impl Estimator for MarkovEstimator {
    fn stage(&self) -> StageKind {
        StageKind::ModelEstimation
    }

    fn partial_fit(&mut self, trajectory: usize, chunk: Chunk<'_>) -> Result<()> {
        let states = chunk.discrete().ok_or_else(|| {
            PipelineError::InvalidInput("Markov model needs discrete input".to_string())
        })?;
        if self.current != Some(trajectory) {
            self.current = Some(trajectory);
            self.tail.clear();
        }

        for &state in states {
            let index = state as usize;
            if index >= self.visits.len() {
                self.visits.resize(index + 1, 0);
            }
            self.visits[index] += 1;
        }

        let mut joined = std::mem::take(&mut self.tail);
        joined.extend_from_slice(states);
        if joined.len() > self.lag {
            for (&from, &to) in joined.iter().zip(&joined[self.lag..]) {
                *self.counts.entry((from, to)).or_insert(0) += 1;
            }
        }
        let keep = joined.len().saturating_sub(self.lag);
        self.tail = joined.split_off(keep);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Model> {
        if self.counts.is_empty() {
            return Err(PipelineError::computation(
                StageKind::ModelEstimation,
                format!("no transitions at lag {}", self.lag),
            ));
        }

        let n = self.visits.len();
        let mut counts = Array2::<f64>::zeros((n, n));
        for (&(from, to), &count) in &self.counts {
            counts[[from as usize, to as usize]] += count as f64;
            counts[[to as usize, from as usize]] += count as f64;
        }

        let row_sums: Vec<f64> = counts.rows().into_iter().map(|row| row.sum()).collect();
        let total: f64 = row_sums.iter().sum();
        let stationary: Vec<f64> = row_sums.iter().map(|r| r / total).collect();
        let transition_matrix = Array2::from_shape_fn((n, n), |(i, j)| {
            if row_sums[i] > 0.0 {
                counts[[i, j]] / row_sums[i]
            } else if i == j {
                1.0
            } else {
                0.0
            }
        });

        debug!(lag = self.lag, states = n, "Fitted Markov model");
        Ok(Model::Markov(MarkovModel {
            lag: self.lag,
            counts,
            transition_matrix,
            stationary,
            visits: self.visits,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit(lag: usize, trajectories: &[&[u32]]) -> MarkovModel {
        let mut estimator = Box::new(MarkovEstimator::new(lag));
        for (index, states) in trajectories.iter().enumerate() {
            estimator.partial_fit(index, Chunk::Discrete(states)).unwrap();
        }
        match estimator.finish().unwrap() {
            Model::Markov(model) => model,
            other => panic!("unexpected model {other:?}"),
        }
    }

    #[test]
    fn test_rows_are_stochastic() {
        let model = fit(1, &[&[0, 0, 1, 1, 2, 2, 0], &[2, 1, 0]]);
        for row in model.transition_matrix().rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((model.stationary().iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_frame_weights_sum_to_one() {
        let states: &[u32] = &[0, 0, 0, 1, 1, 0, 0, 1];
        let model = fit(2, &[states]);
        let weights = model.frame_weights(states);
        assert_eq!(weights.dim(), (8, 1));
        assert!((weights.sum() - 1.0).abs() < 1e-6);
        assert_eq!(model.frame_weights(&[7]).sum(), 0.0);
    }

    #[test]
    fn test_slow_exchange_has_long_timescale() {
        let mut states = vec![0u32; 100];
        states.extend(vec![1u32; 100]);
        states.extend(vec![0u32; 100]);
        let model = fit(1, &[&states]);

        let timescales = model.timescales(1, 1.0).unwrap();
        assert_eq!(timescales.len(), 1);
        assert!(timescales[0] > 10.0);
    }

    #[test]
    fn test_no_transitions_is_error() {
        let mut estimator = Box::new(MarkovEstimator::new(5));
        estimator.partial_fit(0, Chunk::Discrete(&[0, 1])).unwrap();
        assert!(estimator.finish().is_err());
    }
}
