//! Post-hoc analysis of resolved outputs
//!
//! - VAMP-2 scores of discrete trajectories, plain and cross-validated
//! - cluster-count sweeps scored by cross-validated VAMP-2, with a 90%
//!   interval per cluster count
//! - implied-timescale scans over Markov model lag times, with bootstrap
//!   mean and standard deviation from resampled trajectories
//! - 2-D histograms of consecutive tIC pairs
//!
//! Results are plain serde structs; callers write them with
//! [`msmp_common::fsutil::write_json_atomic`].

use crate::data::{Block, Chunk, Output};
use crate::estimators::kmeans::KMeansEstimator;
use crate::estimators::linalg::{inverse_sqrt, symmetric_eigen};
use crate::estimators::markov::MarkovEstimator;
use crate::estimators::{fit_output, Estimator};
use crate::model::Model;
use crate::stage::StageKind;
use crate::{PipelineError, Result};
use msmp_common::PipelineParams;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cluster counts scanned by the k-means score sweep
pub const CLUSTER_COUNTS: [usize; 10] = [2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

/// Markov model lag times scanned for implied timescales
pub const ITS_LAGS: [usize; 13] = [25, 50, 100, 250, 500, 750, 1000, 1250, 1500, 1750, 2000, 2250, 2500];

/// Default number of implied timescales per lag
pub const ITS_COUNT: usize = 20;

/// Singular values kept when scoring, capped by the cluster count
pub const MAX_SCORE_K: usize = 10;

/// Coverage of the interval reported per cluster count
pub const SCORE_CONFIDENCE: f64 = 0.9;

const SCORE_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTable {
    pub cluster_counts: Vec<usize>,
    /// One row of sample scores per cluster count
    pub scores: Vec<Vec<f64>>,
    /// `[lower, upper]` bounds holding [`SCORE_CONFIDENCE`] of each row,
    /// `None` for rows without scores
    pub confidence: Vec<Option<[f64; 2]>>,
}

impl ScoreTable {
    pub fn new(cluster_counts: Vec<usize>, scores: Vec<Vec<f64>>) -> Self {
        let confidence = scores
            .iter()
            .map(|row| confidence_interval(row, SCORE_CONFIDENCE).map(|(lo, hi)| [lo, hi]))
            .collect();
        Self {
            cluster_counts,
            scores,
            confidence,
        }
    }

    pub fn means(&self) -> Vec<f64> {
        self.scores
            .iter()
            .map(|row| row.iter().sum::<f64>() / row.len().max(1) as f64)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItsTable {
    pub lags: Vec<usize>,
    /// Time per frame
    pub dt: f64,
    /// One row of timescales per lag
    pub timescales: Vec<Vec<f64>>,
    /// Bootstrap samples drawn per lag (0 = no error estimate)
    pub samples: usize,
    /// Mean of each timescale over the bootstrap samples
    pub sample_mean: Vec<Vec<f64>>,
    /// Standard deviation of each timescale over the bootstrap samples
    pub sample_std: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicaHistogram {
    /// Zero-based index of the first tIC
    pub offset: usize,
    pub labels: [String; 2],
    pub x_edges: Vec<f64>,
    pub y_edges: Vec<f64>,
    /// `counts[i][j]` for x bin `i`, y bin `j`
    pub counts: Vec<Vec<u64>>,
    /// `-ln p` shifted to a minimum of zero, `None` for empty bins
    pub free_energy: Vec<Vec<Option<f64>>>,
}

/// Instantaneous, lagged and cross covariances of state indicators
struct StateCovariances {
    c00: Array1<f64>,
    ctt: Array1<f64>,
    c0t: Array2<f64>,
}

impl StateCovariances {
    fn estimate(dtrajs: &[&[u32]], lag: usize, n_states: usize) -> Option<Self> {
        let mut c00 = Array1::<f64>::zeros(n_states);
        let mut ctt = Array1::<f64>::zeros(n_states);
        let mut c0t = Array2::<f64>::zeros((n_states, n_states));
        let mut pairs = 0usize;

        for states in dtrajs {
            if states.len() <= lag {
                continue;
            }
            for (&from, &to) in states.iter().zip(&states[lag..]) {
                c00[from as usize] += 1.0;
                ctt[to as usize] += 1.0;
                c0t[[from as usize, to as usize]] += 1.0;
                pairs += 1;
            }
        }
        if pairs == 0 {
            return None;
        }
        let norm = pairs as f64;
        Some(Self {
            c00: c00 / norm,
            ctt: ctt / norm,
            c0t: c0t / norm,
        })
    }

    /// `C00^{-1/2} C0t Ctt^{-1/2}` with empty states zeroed
    fn koopman(&self) -> Array2<f64> {
        let left = self.c00.mapv(inverse_root);
        let right = self.ctt.mapv(inverse_root);
        let mut k = self.c0t.clone();
        for ((i, j), value) in k.indexed_iter_mut() {
            *value *= left[i] * right[j];
        }
        k
    }
}

fn inverse_root(x: f64) -> f64 {
    if x > SCORE_EPSILON {
        1.0 / x.sqrt()
    } else {
        0.0
    }
}

fn n_states(dtrajs: &[&[u32]]) -> usize {
    dtrajs
        .iter()
        .flat_map(|states| states.iter())
        .max()
        .map(|&max| max as usize + 1)
        .unwrap_or(0)
}

fn no_pairs(lag: usize) -> PipelineError {
    PipelineError::computation(
        StageKind::ModelEstimation,
        format!("no frame pairs at lag {}", lag),
    )
}

fn linalg_error(message: String) -> PipelineError {
    PipelineError::computation(StageKind::ModelEstimation, message)
}

/// Sum of the `score_k` largest squared singular values of the Koopman matrix
pub fn vamp2_score(dtrajs: &[&[u32]], lag: usize, score_k: usize) -> Result<f64> {
    let covariances = StateCovariances::estimate(dtrajs, lag, n_states(dtrajs)).ok_or_else(|| no_pairs(lag))?;
    let k = covariances.koopman();
    let (squared, _) = symmetric_eigen(k.t().dot(&k).view()).map_err(linalg_error)?;
    Ok(squared.iter().take(score_k).map(|s| s.max(0.0)).sum())
}

/// VAMP-2 score of `test` under the singular functions fitted on `train`
pub fn vamp2_cv_score(train: &[&[u32]], test: &[&[u32]], lag: usize, score_k: usize) -> Result<f64> {
    let states = n_states(train).max(n_states(test));
    let fitted = StateCovariances::estimate(train, lag, states).ok_or_else(|| no_pairs(lag))?;
    let validation = StateCovariances::estimate(test, lag, states).ok_or_else(|| no_pairs(lag))?;

    let k = fitted.koopman();
    let (squared, right) = symmetric_eigen(k.t().dot(&k).view()).map_err(linalg_error)?;
    let kept: Vec<usize> = (0..squared.len())
        .filter(|&i| squared[i] > SCORE_EPSILON)
        .take(score_k)
        .collect();
    if kept.is_empty() {
        return Ok(0.0);
    }

    let right = right.select(Axis(1), &kept);
    let sigma: Array1<f64> = kept.iter().map(|&i| squared[i].sqrt()).collect();
    let left = k.dot(&right) / &sigma.view().insert_axis(Axis(0));

    // Singular functions in state space
    let u = scale_rows(&left, &fitted.c00.mapv(inverse_root));
    let v = scale_rows(&right, &fitted.ctt.mapv(inverse_root));

    let a = u.t().dot(&scale_rows(&u, &validation.c00));
    let b = u.t().dot(&validation.c0t).dot(&v);
    let c = v.t().dot(&scale_rows(&v, &validation.ctt));

    let a_root = inverse_sqrt(a.view(), SCORE_EPSILON).map_err(linalg_error)?;
    let c_root = inverse_sqrt(c.view(), SCORE_EPSILON).map_err(linalg_error)?;
    let whitened = a_root.dot(&b).dot(&c_root);
    Ok(whitened.iter().map(|x| x * x).sum())
}

fn scale_rows(matrix: &Array2<f64>, factors: &Array1<f64>) -> Array2<f64> {
    matrix * &factors.view().insert_axis(Axis(1))
}

/// Cross-validated VAMP-2 scores of a k-means discretisation with `k` centres
///
/// k-means is fitted once on all trajectories; each sample then draws a
/// fresh random half/half split of the discrete trajectories. A single
/// trajectory is split into its two halves instead.
pub fn score_cluster_count<R: Rng + ?Sized>(
    data: &[ArrayView2<f32>],
    k: usize,
    samples: usize,
    params: &PipelineParams,
    rng: &mut R,
) -> Result<Vec<f64>> {
    let upstream = Output::new(data.iter().map(|d| Block::Continuous(d.to_owned())).collect());
    let estimator = KMeansEstimator::new(k, params.kmeans_max_iter, params.kmeans_tolerance, params.kmeans_stride);
    let model = fit_output(Box::new(estimator), &upstream, params.chunk_size)?;
    let discrete = model.apply_output(&upstream)?;
    let dtrajs = discrete
        .discrete()
        .ok_or_else(|| PipelineError::InvalidInput("k-means produced continuous output".to_string()))?;

    let pieces: Vec<&[u32]> = if dtrajs.len() >= 2 {
        dtrajs
    } else {
        dtrajs
            .iter()
            .flat_map(|states| {
                let (first, second) = states.split_at(states.len() / 2);
                [first, second]
            })
            .collect()
    };

    let score_k = k.min(MAX_SCORE_K);
    let validation_size = (pieces.len() / 2).max(1);
    let mut scores = Vec::with_capacity(samples);
    for _ in 0..samples {
        let mut order: Vec<usize> = (0..pieces.len()).collect();
        order.shuffle(rng);
        let (test_idx, train_idx) = order.split_at(validation_size.min(order.len()));
        let test: Vec<&[u32]> = test_idx.iter().map(|&i| pieces[i]).collect();
        let train: Vec<&[u32]> = train_idx.iter().map(|&i| pieces[i]).collect();
        scores.push(vamp2_cv_score(&train, &test, params.msmlag, score_k)?);
    }
    debug!(k, samples, "Scored cluster count");
    Ok(scores)
}

/// [`score_cluster_count`] for every entry of `cluster_counts`
pub fn score_kmeans<R: Rng + ?Sized>(
    data: &[ArrayView2<f32>],
    cluster_counts: &[usize],
    samples: usize,
    params: &PipelineParams,
    rng: &mut R,
) -> Result<ScoreTable> {
    let scores = cluster_counts
        .iter()
        .map(|&k| score_cluster_count(data, k, samples, params, &mut *rng))
        .collect::<Result<Vec<_>>>()?;
    Ok(ScoreTable::new(cluster_counts.to_vec(), scores))
}

/// Smallest and largest value of the central `level` fraction of `samples`,
/// interpolating linearly between order statistics
pub fn confidence_interval(samples: &[f64], level: f64) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let tail = (1.0 - level.clamp(0.0, 1.0)) / 2.0;
    Some((quantile(&sorted, tail), quantile(&sorted, 1.0 - tail)))
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let fraction = position - below as f64;
    sorted[below] + (sorted[above] - sorted[below]) * fraction
}

/// Implied timescales of the reversible Markov model at each lag
///
/// Lags without any frame pair are reported with an empty row. With
/// `samples > 0`, each lag is re-estimated on `samples` bootstrap draws of
/// the trajectories (with replacement) and the per-timescale mean and
/// standard deviation are reported; a draw that cannot be estimated is
/// skipped. Rows are cut where no draw provides that timescale.
pub fn its_scan<R: Rng + ?Sized>(
    dtrajs: &[&[u32]],
    lags: &[usize],
    nits: usize,
    dt: f64,
    samples: usize,
    rng: &mut R,
) -> Result<ItsTable> {
    let mut timescales = Vec::with_capacity(lags.len());
    let mut sample_mean = Vec::with_capacity(lags.len());
    let mut sample_std = Vec::with_capacity(lags.len());
    for &lag in lags {
        let row = timescales_at(dtrajs, lag, nits, dt)?;

        let mut draws = Vec::new();
        if !row.is_empty() {
            for _ in 0..samples {
                let resampled: Vec<&[u32]> = (0..dtrajs.len())
                    .map(|_| dtrajs[rng.gen_range(0..dtrajs.len())])
                    .collect();
                match timescales_at(&resampled, lag, nits, dt) {
                    Ok(draw) if !draw.is_empty() => draws.push(draw),
                    Ok(_) => {}
                    Err(e) => debug!(lag, error = %e, "Bootstrap draw not estimable"),
                }
            }
        }
        let (mean, std) = moments(&draws);
        sample_mean.push(mean);
        sample_std.push(std);
        timescales.push(row);
    }
    Ok(ItsTable {
        lags: lags.to_vec(),
        dt,
        timescales,
        samples,
        sample_mean,
        sample_std,
    })
}

fn timescales_at(dtrajs: &[&[u32]], lag: usize, nits: usize, dt: f64) -> Result<Vec<f64>> {
    let mut estimator = Box::new(MarkovEstimator::new(lag));
    for (index, states) in dtrajs.iter().enumerate() {
        estimator.partial_fit(index, Chunk::Discrete(states))?;
    }
    match estimator.finish() {
        Ok(Model::Markov(model)) => model.timescales(nits, dt),
        Ok(_) => Ok(Vec::new()),
        Err(e) => {
            debug!(lag, error = %e, "No implied timescales at lag");
            Ok(Vec::new())
        }
    }
}

/// Per-index mean and population standard deviation over rows of
/// different lengths
fn moments(draws: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let mut mean = Vec::new();
    let mut std = Vec::new();
    for index in 0.. {
        let values: Vec<f64> = draws.iter().filter_map(|d| d.get(index).copied()).collect();
        if values.is_empty() {
            break;
        }
        let n = values.len() as f64;
        let m = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n;
        mean.push(m);
        std.push(variance.sqrt());
    }
    (mean, std)
}

/// Histograms of tIC pairs `(offset, offset + 1)` for each offset that fits
/// in the output width
pub fn tica_histograms(output: &Output, offsets: &[usize], bins: usize) -> Result<Vec<TicaHistogram>> {
    let trajectories = output
        .continuous()
        .ok_or_else(|| PipelineError::InvalidInput("tIC histograms need continuous output".to_string()))?;
    let bins = bins.max(1);
    let width = output.n_columns();

    let mut histograms = Vec::new();
    for &offset in offsets.iter().filter(|&&o| o + 1 < width) {
        let points: Vec<(f64, f64)> = trajectories
            .iter()
            .flat_map(|t| t.rows().into_iter().map(move |row| (f64::from(row[offset]), f64::from(row[offset + 1]))))
            .collect();
        if points.is_empty() {
            continue;
        }

        let x_edges = edges(points.iter().map(|p| p.0), bins);
        let y_edges = edges(points.iter().map(|p| p.1), bins);
        let mut counts = vec![vec![0u64; bins]; bins];
        for &(x, y) in &points {
            counts[bin_of(x, &x_edges)][bin_of(y, &y_edges)] += 1;
        }

        let total = points.len() as f64;
        let raw: Vec<Vec<Option<f64>>> = counts
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&c| (c > 0).then(|| -(c as f64 / total).ln()))
                    .collect()
            })
            .collect();
        let minimum = raw.iter().flatten().flatten().copied().fold(f64::INFINITY, f64::min);
        let free_energy = raw
            .into_iter()
            .map(|row| row.into_iter().map(|f| f.map(|f| f - minimum)).collect())
            .collect();

        histograms.push(TicaHistogram {
            offset,
            labels: [format!("tIC {}", offset + 1), format!("tIC {}", offset + 2)],
            x_edges,
            y_edges,
            counts,
            free_energy,
        });
    }
    Ok(histograms)
}

fn edges(values: impl Iterator<Item = f64>, bins: usize) -> Vec<f64> {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let span = if hi > lo { hi - lo } else { 1.0 };
    (0..=bins).map(|i| lo + span * i as f64 / bins as f64).collect()
}

fn bin_of(value: f64, edges: &[f64]) -> usize {
    let bins = edges.len() - 1;
    let span = edges[bins] - edges[0];
    let position = ((value - edges[0]) / span * bins as f64) as usize;
    position.min(bins - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn metastable(switch_every: usize, frames: usize) -> Vec<u32> {
        (0..frames).map(|t| ((t / switch_every) % 2) as u32).collect()
    }

    #[test]
    fn test_vamp2_of_metastable_chain() {
        let states = metastable(50, 1000);
        let score = vamp2_score(&[&states], 1, 2).unwrap();
        // constant singular function contributes 1, the slow process close to 1
        assert!(score > 1.9 && score <= 2.0 + 1e-9);

        let single = vamp2_score(&[&states], 1, 1).unwrap();
        assert!((single - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cv_score_on_identical_halves() {
        let states = metastable(20, 400);
        let score = vamp2_cv_score(&[&states], &[&states], 1, 2).unwrap();
        let direct = vamp2_score(&[&states], 1, 2).unwrap();
        assert!((score - direct).abs() < 1e-6);
    }

    #[test]
    fn test_score_kmeans_shapes() {
        let a = Array2::<f32>::from_shape_fn((200, 1), |(t, _)| if (t / 25) % 2 == 0 { 0.0 } else { 5.0 });
        let b = Array2::<f32>::from_shape_fn((200, 1), |(t, _)| if (t / 30) % 2 == 0 { 5.0 } else { 0.0 });
        let params = PipelineParams {
            kmeans_stride: 1,
            msmlag: 1,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let table = score_kmeans(&[a.view(), b.view()], &[2], 3, &params, &mut rng).unwrap();

        assert_eq!(table.scores.len(), 1);
        assert_eq!(table.scores[0].len(), 3);
        assert!(table.means()[0] > 1.5);
        let [lo, hi] = table.confidence[0].unwrap();
        assert!(lo <= table.means()[0] && table.means()[0] <= hi);
    }

    #[test]
    fn test_its_scan_skips_impossible_lags() {
        let states = metastable(100, 600);
        let mut rng = StdRng::seed_from_u64(3);
        let table = its_scan(&[&states], &[1, 10, 1000], 1, 0.02, 0, &mut rng).unwrap();
        assert_eq!(table.timescales.len(), 3);
        assert_eq!(table.timescales[0].len(), 1);
        assert!(table.timescales[0][0] > 0.0);
        assert!(table.timescales[2].is_empty());
        // No bootstrap requested
        assert_eq!(table.sample_mean, vec![Vec::<f64>::new(); 3]);
        assert_eq!(table.sample_std, vec![Vec::<f64>::new(); 3]);
    }

    #[test]
    fn test_its_bootstrap_of_single_trajectory_has_no_spread() {
        let states = metastable(100, 600);
        let mut rng = StdRng::seed_from_u64(5);
        let table = its_scan(&[&states], &[1, 1000], 1, 0.02, 8, &mut rng).unwrap();

        let point = table.timescales[0][0];
        assert_eq!(table.samples, 8);
        assert!((table.sample_mean[0][0] - point).abs() <= 1e-9 * point.abs());
        assert!(table.sample_std[0][0].abs() <= 1e-9 * point.abs());
        assert!(table.sample_mean[1].is_empty());
    }

    #[test]
    fn test_its_bootstrap_spreads_over_trajectories() {
        let slow = metastable(100, 800);
        let fast = metastable(10, 800);
        let mut rng = StdRng::seed_from_u64(9);
        let table = its_scan(&[&slow, &fast], &[1], 1, 1.0, 30, &mut rng).unwrap();

        let slow_only = its_scan(&[&slow], &[1], 1, 1.0, 0, &mut rng).unwrap().timescales[0][0];
        let fast_only = its_scan(&[&fast], &[1], 1, 1.0, 0, &mut rng).unwrap().timescales[0][0];
        let mean = table.sample_mean[0][0];
        assert!(table.sample_std[0][0] > 0.0);
        assert!(mean > fast_only && mean < slow_only, "{} not in ({}, {})", mean, fast_only, slow_only);
    }

    #[test]
    fn test_confidence_interval() {
        let samples: Vec<f64> = (0..=100).rev().map(f64::from).collect();
        let (lo, hi) = confidence_interval(&samples, 0.9).unwrap();
        assert!((lo - 5.0).abs() < 1e-9 && (hi - 95.0).abs() < 1e-9);
        assert_eq!(confidence_interval(&[2.5], 0.9), Some((2.5, 2.5)));
        assert_eq!(confidence_interval(&[], 0.9), None);

        let (lo, hi) = confidence_interval(&[1.0, 2.0], 0.9).unwrap();
        assert!((lo - 1.05).abs() < 1e-9 && (hi - 1.95).abs() < 1e-9);
    }

    #[test]
    fn test_score_table_interval_per_row() {
        let table = ScoreTable::new(vec![2, 4], vec![vec![1.0, 1.5, 2.0], Vec::new()]);
        assert_eq!(table.confidence.len(), 2);
        let [lo, hi] = table.confidence[0].unwrap();
        assert!(lo >= 1.0 && hi <= 2.0 && lo < hi);
        assert_eq!(table.confidence[1], None);
    }

    #[test]
    fn test_tica_histograms() {
        let output = Output::new(vec![Block::Continuous(array![
            [0.0f32, 0.0, 1.0],
            [1.0, 1.0, 0.0],
            [0.5, 0.2, 0.3]
        ])]);
        let histograms = tica_histograms(&output, &[0, 2], 2).unwrap();
        assert_eq!(histograms.len(), 1);

        let h = &histograms[0];
        assert_eq!(h.labels, ["tIC 1".to_string(), "tIC 2".to_string()]);
        let total: u64 = h.counts.iter().flatten().sum();
        assert_eq!(total, 3);
        assert_eq!(h.counts[0][0], 1);
        assert_eq!(h.counts[1][0], 1);
        assert_eq!(h.counts[1][1], 1);
        assert!(h.free_energy[0][1].is_none());
        assert_eq!(h.free_energy[1][1], Some(0.0));
    }
}
