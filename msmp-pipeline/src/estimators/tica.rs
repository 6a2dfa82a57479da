//! Time-lagged independent component analysis
//!
//! Instantaneous and lagged covariances are accumulated in one pass over all
//! `(x_t, x_{t+lag})` frame pairs, symmetrised, and the generalised problem
//! `C_t v = λ C_0 v` is solved by whitening `C_0` first. With kinetic-map
//! scaling each projected coordinate is multiplied by its eigenvalue.

use super::linalg::{canonical_signs, symmetric_eigen};
use super::Estimator;
use crate::data::Chunk;
use crate::model::Model;
use crate::stage::StageKind;
use crate::{PipelineError, Result};
use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Eigenvalues of `C_0` below this fraction of the largest are discarded
const WHITENING_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicaModel {
    lag: usize,
    kinetic_map: bool,
    mean: Array1<f64>,
    /// Input dimension × output dimension
    eigenvectors: Array2<f64>,
    eigenvalues: Vec<f64>,
    cumvar: Vec<f64>,
}

impl TicaModel {
    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Cumulative kinetic variance per output dimension, ending at 1
    pub fn cumvar(&self) -> &[f64] {
        &self.cumvar
    }

    pub fn input_dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn output_dimension(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn transform(&self, features: ArrayView2<f32>) -> Result<Array2<f32>> {
        if features.ncols() != self.input_dimension() {
            return Err(PipelineError::InvalidInput(format!(
                "tICA model expects {} features, got {}",
                self.input_dimension(),
                features.ncols()
            )));
        }
        let centred = features.mapv(f64::from) - &self.mean;
        let mut projected = centred.dot(&self.eigenvectors);
        if self.kinetic_map {
            projected *= &Array1::from(self.eigenvalues.clone());
        }
        Ok(projected.mapv(|v| v as f32))
    }
}

/// Accumulates covariances chunk by chunk
///
/// The last `lag` frames of the current trajectory are carried over so that
/// pairs straddling a chunk boundary are counted exactly once.
#[derive(Debug)]
pub struct TicaEstimator {
    lag: usize,
    kinetic_map: bool,
    pairs: usize,
    sum_x: Array1<f64>,
    sum_y: Array1<f64>,
    xx: Array2<f64>,
    yy: Array2<f64>,
    xy: Array2<f64>,
    current: Option<usize>,
    tail: Array2<f64>,
}

impl TicaEstimator {
    pub fn new(lag: usize, kinetic_map: bool) -> Self {
        Self {
            lag,
            kinetic_map,
            pairs: 0,
            sum_x: Array1::zeros(0),
            sum_y: Array1::zeros(0),
            xx: Array2::zeros((0, 0)),
            yy: Array2::zeros((0, 0)),
            xy: Array2::zeros((0, 0)),
            current: None,
            tail: Array2::zeros((0, 0)),
        }
    }

    fn ensure_dimension(&mut self, dim: usize) -> Result<()> {
        if self.current.is_none() && self.sum_x.is_empty() {
            self.sum_x = Array1::zeros(dim);
            self.sum_y = Array1::zeros(dim);
            self.xx = Array2::zeros((dim, dim));
            self.yy = Array2::zeros((dim, dim));
            self.xy = Array2::zeros((dim, dim));
            return Ok(());
        }
        if dim != self.sum_x.len() {
            return Err(PipelineError::InvalidInput(format!(
                "tICA input width changed from {} to {}",
                self.sum_x.len(),
                dim
            )));
        }
        Ok(())
    }

    fn computation(message: impl Into<String>) -> PipelineError {
        PipelineError::computation(StageKind::Reduction, message)
    }
}

impl Estimator for TicaEstimator {
    fn stage(&self) -> StageKind {
        StageKind::Reduction
    }

    fn partial_fit(&mut self, trajectory: usize, chunk: Chunk<'_>) -> Result<()> {
        let frames = chunk.continuous().ok_or_else(|| {
            PipelineError::InvalidInput("tICA needs continuous input".to_string())
        })?;
        let dim = frames.ncols();
        self.ensure_dimension(dim)?;

        if self.current != Some(trajectory) {
            self.current = Some(trajectory);
            self.tail = Array2::zeros((0, dim));
        }

        let incoming = frames.mapv(f64::from);
        let joined = concatenate(Axis(0), &[self.tail.view(), incoming.view()])
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        let n = joined.nrows();

        if n > self.lag {
            let x = joined.slice(s![..n - self.lag, ..]);
            let y = joined.slice(s![self.lag.., ..]);
            self.sum_x += &x.sum_axis(Axis(0));
            self.sum_y += &y.sum_axis(Axis(0));
            self.xx += &x.t().dot(&x);
            self.yy += &y.t().dot(&y);
            self.xy += &x.t().dot(&y);
            self.pairs += n - self.lag;
        }

        self.tail = joined.slice(s![n.saturating_sub(self.lag).., ..]).to_owned();
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Model> {
        if self.pairs == 0 {
            return Err(Self::computation(format!(
                "no frame pairs at lag {}; trajectories are too short",
                self.lag
            )));
        }

        let norm = 2.0 * self.pairs as f64;
        let mean = (&self.sum_x + &self.sum_y) / norm;
        let column = mean.view().insert_axis(Axis(1));
        let outer = column.dot(&column.t());

        let c0 = (&self.xx + &self.yy) / norm - &outer;
        let ct = (&self.xy + &self.xy.t()) / norm - &outer;
        let c0 = (&c0 + &c0.t()) / 2.0;

        let (variances, basis) = symmetric_eigen(c0.view()).map_err(Self::computation)?;
        let largest = variances.first().copied().unwrap_or(0.0);
        if largest <= 0.0 {
            return Err(Self::computation("input has no variance"));
        }
        let kept: Vec<usize> = (0..variances.len())
            .filter(|&i| variances[i] > WHITENING_EPSILON * largest)
            .collect();
        let scale: Array1<f64> = kept.iter().map(|&i| 1.0 / variances[i].sqrt()).collect();
        let whitening = basis.select(Axis(1), &kept) * &scale.insert_axis(Axis(0));

        let projected = whitening.t().dot(&ct).dot(&whitening);
        let projected = (&projected + &projected.t()) / 2.0;
        let (eigenvalues, rotation) = symmetric_eigen(projected.view()).map_err(Self::computation)?;

        let mut eigenvectors = whitening.dot(&rotation);
        canonical_signs(&mut eigenvectors);
        let cumvar = cumulative_kinetic_variance(&eigenvalues);

        debug!(
            lag = self.lag,
            pairs = self.pairs,
            input = mean.len(),
            output = eigenvalues.len(),
            "Fitted tICA"
        );

        Ok(Model::Tica(TicaModel {
            lag: self.lag,
            kinetic_map: self.kinetic_map,
            mean,
            eigenvectors,
            eigenvalues,
            cumvar,
        }))
    }
}

/// `cumsum(λ²) / Σλ²`
fn cumulative_kinetic_variance(eigenvalues: &[f64]) -> Vec<f64> {
    let total: f64 = eigenvalues.iter().map(|l| l * l).sum();
    let n = eigenvalues.len();
    if total <= 0.0 {
        return (1..=n).map(|i| i as f64 / n as f64).collect();
    }
    let mut running = 0.0;
    eigenvalues
        .iter()
        .map(|l| {
            running += l * l;
            running / total
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Block, Output};
    use crate::estimators::fit_output;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Column 0 switches between two wells every 40 frames, column 1 is noise
    fn two_state_data(frames: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((frames, 2), |(t, c)| {
            let noise: f32 = rng.gen_range(-0.1..0.1);
            if c == 0 {
                if (t / 40) % 2 == 0 { -1.0 + noise } else { 1.0 + noise }
            } else {
                10.0 * noise
            }
        })
    }

    fn fit(output: &Output, chunk_size: usize) -> TicaModel {
        match fit_output(Box::new(TicaEstimator::new(2, true)), output, chunk_size).unwrap() {
            Model::Tica(model) => model,
            other => panic!("unexpected model {other:?}"),
        }
    }

    #[test]
    fn test_slow_coordinate_comes_first() {
        let output = Output::new(vec![Block::Continuous(two_state_data(400, 7))]);
        let model = fit(&output, 1000);

        assert_eq!(model.output_dimension(), 2);
        assert!(model.eigenvalues()[0] > 0.8);
        assert!(model.eigenvalues()[0] > model.eigenvalues()[1]);
        assert!((model.cumvar().last().unwrap() - 1.0).abs() < 1e-12);

        let transformed = model.transform(output.trajectories()[0].view().continuous().unwrap()).unwrap();
        assert_eq!(transformed.dim(), (400, 2));
    }

    #[test]
    fn test_chunking_does_not_change_the_fit() {
        let output = Output::new(vec![
            Block::Continuous(two_state_data(300, 1)),
            Block::Continuous(two_state_data(200, 2)),
        ]);
        let whole = fit(&output, 10_000);
        let chunked = fit(&output, 7);

        for (a, b) in whole.eigenvalues().iter().zip(chunked.eigenvalues()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_short_trajectories_fail() {
        let output = Output::new(vec![Block::Continuous(two_state_data(2, 3))]);
        let err = fit_output(Box::new(TicaEstimator::new(2, true)), &output, 100).unwrap_err();
        assert!(matches!(err, PipelineError::Computation { stage: StageKind::Reduction, .. }));
    }

    #[test]
    fn test_cumulative_kinetic_variance() {
        let cumvar = cumulative_kinetic_variance(&[0.9, 0.3, 0.0]);
        assert!((cumvar[0] - 0.81 / 0.9).abs() < 1e-12);
        assert!((cumvar[2] - 1.0).abs() < 1e-12);
        assert_eq!(cumulative_kinetic_variance(&[0.0, 0.0]), vec![0.5, 1.0]);
    }
}
