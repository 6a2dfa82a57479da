//! k-means clustering
//!
//! Fitting keeps every `stride`-th frame of each trajectory, seeds the
//! centres with evenly spaced samples and runs Lloyd iterations until the
//! largest centre shift drops to `tolerance` or `max_iter` is reached.

use super::linalg::squared_distance;
use super::Estimator;
use crate::data::Chunk;
use crate::model::Model;
use crate::stage::StageKind;
use crate::{PipelineError, Result};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    /// One centre per row
    centers: Array2<f64>,
}

impl KMeansModel {
    pub fn new(centers: Array2<f64>) -> Self {
        Self { centers }
    }

    pub fn centers(&self) -> &Array2<f64> {
        &self.centers
    }

    pub fn n_clusters(&self) -> usize {
        self.centers.nrows()
    }

    /// Index of the nearest centre per frame (lowest index on ties)
    pub fn assign(&self, points: ArrayView2<f32>) -> Result<Vec<u32>> {
        if points.ncols() != self.centers.ncols() {
            return Err(PipelineError::InvalidInput(format!(
                "k-means model expects {} dimensions, got {}",
                self.centers.ncols(),
                points.ncols()
            )));
        }
        Ok(points
            .rows()
            .into_iter()
            .map(|row| nearest(&self.centers, &row.mapv(f64::from).view()) as u32)
            .collect())
    }
}

fn nearest(centers: &Array2<f64>, point: &ndarray::ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (index, center) in centers.rows().into_iter().enumerate() {
        let distance = squared_distance(center, *point);
        if distance < best_distance {
            best = index;
            best_distance = distance;
        }
    }
    best
}

#[derive(Debug)]
pub struct KMeansEstimator {
    k: usize,
    max_iter: usize,
    tolerance: f64,
    stride: usize,
    samples: Vec<Vec<f64>>,
    /// Frames seen so far per trajectory
    seen: HashMap<usize, usize>,
}

impl KMeansEstimator {
    pub fn new(k: usize, max_iter: usize, tolerance: f64, stride: usize) -> Self {
        Self {
            k,
            max_iter,
            tolerance,
            stride: stride.max(1),
            samples: Vec::new(),
            seen: HashMap::new(),
        }
    }
}

impl Estimator for KMeansEstimator {
    fn stage(&self) -> StageKind {
        StageKind::Clustering
    }

    fn partial_fit(&mut self, trajectory: usize, chunk: Chunk<'_>) -> Result<()> {
        let points = chunk.continuous().ok_or_else(|| {
            PipelineError::InvalidInput("k-means needs continuous input".to_string())
        })?;
        if let Some(first) = self.samples.first() {
            if first.len() != points.ncols() {
                return Err(PipelineError::InvalidInput(format!(
                    "k-means input width changed from {} to {}",
                    first.len(),
                    points.ncols()
                )));
            }
        }

        let seen = self.seen.entry(trajectory).or_insert(0);
        for row in points.rows() {
            if *seen % self.stride == 0 {
                self.samples.push(row.iter().map(|&v| f64::from(v)).collect());
            }
            *seen += 1;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Model> {
        let n = self.samples.len();
        if self.k == 0 || n < self.k {
            return Err(PipelineError::computation(
                StageKind::Clustering,
                format!("{} samples cannot form {} clusters", n, self.k),
            ));
        }

        let dim = self.samples[0].len();
        let flat: Vec<f64> = self.samples.iter().flatten().copied().collect();
        let samples = Array2::from_shape_vec((n, dim), flat)
            .map_err(|e| PipelineError::computation(StageKind::Clustering, e.to_string()))?;

        let seeds: Vec<usize> = (0..self.k).map(|i| i * n / self.k).collect();
        let mut centers = samples.select(Axis(0), &seeds);
        let mut labels = vec![0usize; n];
        let mut iterations = 0;

        for _ in 0..self.max_iter {
            iterations += 1;
            for (label, sample) in labels.iter_mut().zip(samples.rows()) {
                *label = nearest(&centers, &sample);
            }

            let mut sums = Array2::<f64>::zeros((self.k, dim));
            let mut counts = vec![0usize; self.k];
            for (&label, sample) in labels.iter().zip(samples.rows()) {
                let mut row = sums.row_mut(label);
                row += &sample;
                counts[label] += 1;
            }

            let mut shift: f64 = 0.0;
            for (cluster, &count) in counts.iter().enumerate() {
                // Empty clusters keep their centre
                if count == 0 {
                    continue;
                }
                let updated = sums.row(cluster).mapv(|v| v / count as f64);
                shift = shift.max(squared_distance(updated.view(), centers.row(cluster)).sqrt());
                centers.row_mut(cluster).assign(&updated);
            }
            if shift <= self.tolerance {
                break;
            }
        }

        debug!(k = self.k, samples = n, iterations, "Fitted k-means");
        Ok(Model::KMeans(KMeansModel { centers }))
    }
}
