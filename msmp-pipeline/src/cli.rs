//! Command line surface of the `msmp` binary
//!
//! Options mirror the analysis scripts: trajectory discovery, per-stage
//! parameters overriding the `[pipeline]` TOML table, force flags and the
//! streaming switch. Each subcommand resolves one stage and post-processes it.

use crate::analysis::ITS_COUNT;
use crate::force::ForceFlags;
use crate::request::{ExecutionMode, PipelineRequest};
use crate::stage::StageKind;
use clap::{Parser, Subcommand};
use msmp_common::PipelineParams;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "msmp", version)]
#[clap(about = "Tiered, cached Markov state model pipeline for MD trajectories")]
pub struct Cli {
    /// Trajectory path prefix (directory and leading file name part)
    #[clap(short = 'p', long, default_value = "./", global = true)]
    pub prefix: String,

    /// Trajectory file name suffix
    #[clap(short = 's', long, default_value = "traj.txt", global = true)]
    pub suffix: String,

    /// Topology file (TOML atom table)
    #[clap(short = 't', long, default_value = "topology.toml", global = true)]
    pub top: PathBuf,

    /// Output directory for analysis results
    #[clap(short = 'd', long, default_value = "./", global = true)]
    pub directory: PathBuf,

    /// Artifact store directory (overrides MSMP_STORE_DIR and the config file)
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,

    /// Configuration file (default: OS config dir)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// tICA lag time in frames
    #[clap(short = 'l', long, global = true)]
    pub lag: Option<usize>,

    /// Number of k-means cluster centres
    #[clap(short = 'k', long, global = true)]
    pub kclusters: Option<usize>,

    /// Markov model lag time in frames
    #[clap(long, global = true)]
    pub msmlag: Option<usize>,

    /// Maximum number of tICs handed to clustering
    #[clap(long, global = true)]
    pub ndims: Option<usize>,

    /// Cumulative kinetic variance to retain
    #[clap(long, global = true)]
    pub var_cutoff: Option<f64>,

    /// Samples per cluster count when scoring k-means
    #[clap(long, default_value = "2", global = true)]
    pub smplen: usize,

    /// First tIC shown by observe-tica
    #[clap(long, default_value = "0", global = true)]
    pub offset: usize,

    #[clap(long, global = true)]
    pub force_calc_feat: bool,

    #[clap(long, global = true)]
    pub force_calc_tica: bool,

    #[clap(long, global = true)]
    pub force_model_tica: bool,

    #[clap(long, global = true)]
    pub force_calc_clustering: bool,

    #[clap(long, global = true)]
    pub force_model_clustering: bool,

    #[clap(long, global = true)]
    pub force_calc_msm: bool,

    /// Stream all stages in one chained pass instead of using the cache
    #[clap(long, global = true)]
    pub pipeline: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Resolve one stage and print a summary
    Resolve {
        #[clap(long, default_value = "model-estimation")]
        stage: StageKind,
    },
    /// Histogram consecutive tIC pairs
    ObserveTica {
        #[clap(long, default_value = "50")]
        bins: usize,
    },
    /// Cross-validated VAMP-2 scores over k-means cluster counts
    ScoreKmeans {
        #[clap(long, default_value = "42")]
        seed: u64,
    },
    /// Implied timescales over Markov model lag times
    ScanIts {
        #[clap(long, default_value_t = ITS_COUNT)]
        nits: usize,
        /// Bootstrap draws per lag for error bars (0 = none)
        #[clap(long, default_value = "50")]
        bootstrap: usize,
        #[clap(long, default_value = "42")]
        seed: u64,
    },
}

impl Command {
    /// Stage whose output the command consumes
    pub fn target(&self) -> StageKind {
        match self {
            Command::Resolve { stage } => *stage,
            Command::ObserveTica { .. } | Command::ScoreKmeans { .. } => StageKind::Reduction,
            Command::ScanIts { .. } => StageKind::Clustering,
        }
    }
}

impl Cli {
    /// Configured parameters with command line overrides applied
    pub fn params(&self, configured: &PipelineParams) -> PipelineParams {
        let mut params = configured.clone();
        if let Some(lag) = self.lag {
            params.lag = lag;
        }
        if let Some(k) = self.kclusters {
            params.kclusters = k;
        }
        if let Some(msmlag) = self.msmlag {
            params.msmlag = msmlag;
        }
        if self.ndims.is_some() {
            params.ndims = self.ndims;
        }
        if let Some(cutoff) = self.var_cutoff {
            params.var_cutoff = cutoff;
        }
        params
    }

    pub fn forces(&self) -> ForceFlags {
        let mut flags = ForceFlags::new();
        flags.set_recompute(StageKind::Feature, self.force_calc_feat);
        flags.set_recompute(StageKind::Reduction, self.force_calc_tica);
        flags.set_remodel(StageKind::Reduction, self.force_model_tica);
        flags.set_recompute(StageKind::Clustering, self.force_calc_clustering);
        flags.set_remodel(StageKind::Clustering, self.force_model_clustering);
        flags.set_recompute(StageKind::ModelEstimation, self.force_calc_msm);
        flags
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.pipeline {
            ExecutionMode::Streaming
        } else {
            ExecutionMode::Cached
        }
    }

    pub fn request(&self, configured: &PipelineParams) -> PipelineRequest {
        PipelineRequest::new(self.command.target(), self.params(configured))
            .with_forces(self.forces())
            .with_mode(self.mode())
    }
}
