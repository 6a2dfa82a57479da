//! Stage descriptors
//!
//! A descriptor identifies one pipeline step: its ordinal, its parameters and
//! its upstream chain, which ends at the origin (the fingerprint of the input
//! trajectories and featurizer inputs). The artifact key is derived from
//! exactly those, so two descriptors with equal parameters and equal upstream
//! chains over the same input share cached artifacts.

use crate::data::{Block, Output};
use crate::model::Model;
use crate::store::ArtifactKey;
use crate::{PipelineError, Result};
use msmp_common::PipelineParams;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Name of the auxiliary statistic stored next to the Reduction model
pub const CUMVAR_STATISTIC: &str = "cumvar";

/// Atom selection used by the Feature stage
pub const FEATURE_SELECTION: &str = "CA";

/// Pipeline steps in upstream → downstream order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Feature,
    Reduction,
    Clustering,
    ModelEstimation,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Feature,
        StageKind::Reduction,
        StageKind::Clustering,
        StageKind::ModelEstimation,
    ];

    /// Position in the pipeline (0 = Feature)
    pub fn ordinal(self) -> usize {
        match self {
            StageKind::Feature => 0,
            StageKind::Reduction => 1,
            StageKind::Clustering => 2,
            StageKind::ModelEstimation => 3,
        }
    }

    pub fn from_ordinal(ordinal: usize) -> Option<StageKind> {
        Self::ALL.get(ordinal).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Feature => "feature",
            StageKind::Reduction => "reduction",
            StageKind::Clustering => "clustering",
            StageKind::ModelEstimation => "model-estimation",
        }
    }

    pub fn upstream(self) -> Option<StageKind> {
        self.ordinal().checked_sub(1).and_then(Self::from_ordinal)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "feature" | "features" | "feat" => Ok(StageKind::Feature),
            "reduction" | "tica" => Ok(StageKind::Reduction),
            "clustering" | "kmeans" => Ok(StageKind::Clustering),
            "model-estimation" | "msm" => Ok(StageKind::ModelEstimation),
            other => Err(PipelineError::InvalidInput(format!("unknown stage '{}'", other))),
        }
    }
}

/// Kept dimensionality of the Reduction output
///
/// `min(max_dimensions, k)` where `k` is the 1-based count of the first entry
/// of the cumulative-variance curve that reaches `var_cutoff`. A curve that
/// never reaches the cutoff keeps every dimension.
pub fn select_dimensions(cumvar: &[f64], var_cutoff: f64, max_dimensions: usize) -> usize {
    let by_variance = cumvar
        .iter()
        .position(|&v| v >= var_cutoff)
        .map(|index| index + 1)
        .unwrap_or(cumvar.len());
    by_variance.min(max_dimensions)
}

/// One step of the pipeline with its parameters and upstream chain
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    kind: StageKind,
    params: PipelineParams,
    upstream: Option<Box<StageDescriptor>>,
    key: ArtifactKey,
}

impl StageDescriptor {
    /// Descriptor for `kind`, with its full upstream chain rooted at `origin`
    pub fn new(kind: StageKind, params: &PipelineParams, origin: &str) -> Self {
        let upstream = kind
            .upstream()
            .map(|up| Box::new(StageDescriptor::new(up, params, origin)));
        let key = derive_key(kind, params, upstream.as_deref(), origin);
        debug!(stage = %kind, key = %key, "Derived artifact key");
        Self {
            kind,
            params: params.clone(),
            upstream,
            key,
        }
    }

    /// Descriptors from Feature through `target`, indexed by ordinal
    pub fn chain(target: StageKind, params: &PipelineParams, origin: &str) -> Vec<StageDescriptor> {
        StageKind::ALL[..=target.ordinal()]
            .iter()
            .map(|&kind| StageDescriptor::new(kind, params, origin))
            .collect()
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn upstream(&self) -> Option<&StageDescriptor> {
        self.upstream.as_deref()
    }

    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Parameters that change the stored artifact of this stage
    pub fn artifact_params(&self) -> Vec<(&'static str, String)> {
        artifact_params(self.kind, &self.params)
    }

    /// Parameters that change what this stage hands downstream, but not what
    /// it stores (the stored Reduction output is always full width)
    pub fn view_params(&self) -> Vec<(&'static str, String)> {
        match self.kind {
            StageKind::Reduction => vec![
                ("var_cutoff", self.params.var_cutoff.to_string()),
                (
                    "ndims",
                    self.params
                        .ndims
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "all".to_string()),
                ),
            ],
            _ => Vec::new(),
        }
    }

    /// Auxiliary statistic needed to restrict stored output, if any
    pub fn required_statistic(&self) -> Option<&'static str> {
        match self.kind {
            StageKind::Reduction => Some(CUMVAR_STATISTIC),
            _ => None,
        }
    }

    /// Number of leading columns kept for downstream use, `None` = all
    pub fn kept_columns(&self, statistic: Option<&[f64]>) -> Option<usize> {
        match (self.kind, statistic) {
            (StageKind::Reduction, Some(cumvar)) => Some(select_dimensions(
                cumvar,
                self.params.var_cutoff,
                self.params.max_dimensions(),
            )),
            _ => None,
        }
    }

    /// Restrict full-width output to what downstream consumes
    pub fn restrict(&self, output: Output, statistic: Option<&[f64]>) -> Output {
        match self.kept_columns(statistic) {
            Some(n) => output.truncate_columns(n),
            None => output,
        }
    }

    /// Restrict one streamed block using the statistic of a fitted model
    pub fn restrict_block(&self, block: Block, model: &Model) -> Block {
        let statistic = self
            .required_statistic()
            .and_then(|name| model.statistic(name));
        match self.kept_columns(statistic) {
            Some(n) => block.truncate_columns(n),
            None => block,
        }
    }

    /// Identity of this stage's restricted output as seen by downstream keys
    fn lineage(&self) -> String {
        let view: Vec<String> = self
            .view_params()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}[{}]", self.key, view.join(";"))
    }
}

fn artifact_params(kind: StageKind, p: &PipelineParams) -> Vec<(&'static str, String)> {
    match kind {
        StageKind::Feature => vec![
            ("featurizer", "pairwise_distances".to_string()),
            ("selection", FEATURE_SELECTION.to_string()),
        ],
        StageKind::Reduction => vec![
            ("lag", p.lag.to_string()),
            ("kinetic_map", "true".to_string()),
        ],
        StageKind::Clustering => vec![
            ("k", p.kclusters.to_string()),
            ("max_iter", p.kmeans_max_iter.to_string()),
            ("stride", p.kmeans_stride.to_string()),
            ("tolerance", p.kmeans_tolerance.to_string()),
        ],
        StageKind::ModelEstimation => vec![("msmlag", p.msmlag.to_string())],
    }
}

/// Deterministic key: stage name, ordinal, parameters in fixed order, and the
/// lineage of the upstream stage (the origin for Feature)
fn derive_key(
    kind: StageKind,
    params: &PipelineParams,
    upstream: Option<&StageDescriptor>,
    origin: &str,
) -> ArtifactKey {
    let own: Vec<String> = artifact_params(kind, params)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let canonical = format!(
        "{}:{}|{}|upstream={}",
        kind.ordinal(),
        kind.name(),
        own.join(";"),
        upstream
            .map(|u| u.lineage())
            .unwrap_or_else(|| format!("source[{}]", origin))
    );

    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    ArtifactKey::new(format!("{}-{}-{}", kind.ordinal(), kind.name(), hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "3a7f";

    #[test]
    fn test_select_dimensions_by_cutoff() {
        let cumvar = [0.5, 0.8, 0.95, 0.99];
        assert_eq!(select_dimensions(&cumvar, 0.9, usize::MAX), 3);
    }

    #[test]
    fn test_select_dimensions_capped() {
        let cumvar = [0.5, 0.8, 0.95, 0.99];
        assert_eq!(select_dimensions(&cumvar, 0.9, 2), 2);
    }

    #[test]
    fn test_select_dimensions_never_reached_keeps_all() {
        let cumvar = [0.5, 0.8, 0.95, 0.99];
        assert_eq!(select_dimensions(&cumvar, 1.0, usize::MAX), 4);
        assert_eq!(select_dimensions(&[], 0.9, 5), 0);
    }

    #[test]
    fn test_chain_is_ordered_and_linked() {
        let chain = StageDescriptor::chain(StageKind::Clustering, &PipelineParams::default(), ORIGIN);
        let kinds: Vec<StageKind> = chain.iter().map(|d| d.kind()).collect();
        assert_eq!(
            kinds,
            vec![StageKind::Feature, StageKind::Reduction, StageKind::Clustering]
        );
        assert_eq!(chain[2].upstream().unwrap().key(), chain[1].key());
        assert!(chain[0].upstream().is_none());
    }

    #[test]
    fn test_keys_are_deterministic() {
        let params = PipelineParams::default();
        let a = StageDescriptor::new(StageKind::ModelEstimation, &params, ORIGIN);
        let b = StageDescriptor::new(StageKind::ModelEstimation, &params, ORIGIN);
        assert_eq!(a.key(), b.key());
        assert!(a.key().as_str().starts_with("3-model-estimation-"));
    }

    #[test]
    fn test_upstream_params_change_downstream_keys() {
        let base = PipelineParams::default();
        let other_lag = PipelineParams {
            lag: 5,
            ..base.clone()
        };
        let other_cutoff = PipelineParams {
            var_cutoff: 0.8,
            ..base.clone()
        };

        let reduction = StageDescriptor::new(StageKind::Reduction, &base, ORIGIN);
        let clustering = StageDescriptor::new(StageKind::Clustering, &base, ORIGIN);

        // lag changes the Reduction artifact itself
        assert_ne!(
            reduction.key(),
            StageDescriptor::new(StageKind::Reduction, &other_lag, ORIGIN).key()
        );
        // var_cutoff only changes the restricted view, so the Reduction key holds...
        assert_eq!(
            reduction.key(),
            StageDescriptor::new(StageKind::Reduction, &other_cutoff, ORIGIN).key()
        );
        // ...but everything downstream of it moves
        assert_ne!(
            clustering.key(),
            StageDescriptor::new(StageKind::Clustering, &other_cutoff, ORIGIN).key()
        );
    }

    #[test]
    fn test_downstream_params_leave_upstream_keys() {
        let base = PipelineParams::default();
        let more_clusters = PipelineParams {
            kclusters: 32,
            ..base.clone()
        };
        assert_eq!(
            StageDescriptor::new(StageKind::Reduction, &base, ORIGIN).key(),
            StageDescriptor::new(StageKind::Reduction, &more_clusters, ORIGIN).key()
        );
    }

    #[test]
    fn test_origin_changes_every_key() {
        let params = PipelineParams::default();
        for kind in StageKind::ALL {
            assert_ne!(
                StageDescriptor::new(kind, &params, ORIGIN).key(),
                StageDescriptor::new(kind, &params, "other-trajectories").key(),
                "{} key ignores the origin",
                kind
            );
        }
    }

    #[test]
    fn test_stage_kind_parsing() {
        assert_eq!("tica".parse::<StageKind>().unwrap(), StageKind::Reduction);
        assert_eq!(
            "model_estimation".parse::<StageKind>().unwrap(),
            StageKind::ModelEstimation
        );
        assert!("plot".parse::<StageKind>().is_err());
        assert_eq!(StageKind::Clustering.upstream(), Some(StageKind::Reduction));
        assert_eq!(StageKind::Feature.upstream(), None);
    }
}
