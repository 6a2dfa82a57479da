//! Pipeline parameter set
//!
//! One structure carries every parameter that shapes a pipeline run. It is
//! loaded from the `[pipeline]` table of the TOML config, overridden from the
//! command line, and passed explicitly to every stage.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Parameters for all pipeline stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    /// Lag time (frames) of the dimensionality reduction (tICA)
    ///
    /// Valid range: >= 1
    /// Default: 2
    pub lag: usize,

    /// Cumulative-variance threshold for keeping reduced dimensions
    ///
    /// Valid range: (0.0, 1.0]
    /// Default: 0.95
    pub var_cutoff: f64,

    /// Maximum number of reduced dimensions handed downstream
    ///
    /// Valid range: >= 1, or unset for no cap
    /// Default: unset
    pub ndims: Option<usize>,

    /// Number of k-means cluster centres
    ///
    /// Valid range: >= 1
    /// Default: 2
    pub kclusters: usize,

    /// Lag time (frames) of the Markov state model
    ///
    /// Valid range: >= 1
    /// Default: 2
    pub msmlag: usize,

    /// Maximum Lloyd iterations for k-means
    ///
    /// Default: 500
    pub kmeans_max_iter: usize,

    /// Only every n-th frame is used to fit k-means
    ///
    /// Valid range: >= 1
    /// Default: 50
    pub kmeans_stride: usize,

    /// Convergence threshold on the largest centre shift
    ///
    /// Default: 1e-5
    pub kmeans_tolerance: f64,

    /// Frames per batch in streaming mode
    ///
    /// Valid range: >= 1
    /// Default: 1000
    pub chunk_size: usize,

    /// Physical time between frames (ns), used for implied timescales
    ///
    /// Default: 0.02
    pub dt_traj: f64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            lag: 2,
            var_cutoff: 0.95,
            ndims: None,
            kclusters: 2,
            msmlag: 2,
            kmeans_max_iter: 500,
            kmeans_stride: 50,
            kmeans_tolerance: 1e-5,
            chunk_size: 1000,
            dt_traj: 0.02,
        }
    }
}

impl PipelineParams {
    /// Check every parameter against its valid range
    pub fn validate(&self) -> Result<()> {
        if self.lag == 0 {
            return Err(Error::InvalidInput("lag must be >= 1".to_string()));
        }
        if !(self.var_cutoff > 0.0 && self.var_cutoff <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "var_cutoff must be in (0, 1], got {}",
                self.var_cutoff
            )));
        }
        if self.ndims == Some(0) {
            return Err(Error::InvalidInput("ndims must be >= 1".to_string()));
        }
        if self.kclusters == 0 {
            return Err(Error::InvalidInput("kclusters must be >= 1".to_string()));
        }
        if self.msmlag == 0 {
            return Err(Error::InvalidInput("msmlag must be >= 1".to_string()));
        }
        if self.kmeans_stride == 0 {
            return Err(Error::InvalidInput("kmeans_stride must be >= 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be >= 1".to_string()));
        }
        if !(self.dt_traj > 0.0) {
            return Err(Error::InvalidInput("dt_traj must be > 0".to_string()));
        }
        Ok(())
    }

    /// Maximum kept dimensions, `usize::MAX` when uncapped
    pub fn max_dimensions(&self) -> usize {
        self.ndims.unwrap_or(usize::MAX)
    }
}
