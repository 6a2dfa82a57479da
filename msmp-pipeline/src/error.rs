//! Error types for msmp-pipeline
//!
//! Cache misses and unreadable artifacts are not errors; they are reported
//! through [`crate::store::Lookup`]. Everything here is fatal for the
//! resolution that raised it.

use crate::stage::StageKind;
use thiserror::Error;

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The full-computation collaborator of a stage failed
    #[error("Computation failed in {stage} stage: {message}")]
    Computation { stage: StageKind, message: String },

    /// An upstream stage could not be resolved
    #[error("Upstream {stage} stage could not be resolved: {source}")]
    UpstreamResolution {
        stage: StageKind,
        #[source]
        source: Box<PipelineError>,
    },

    /// Persisting a freshly computed artifact failed
    #[error("Artifact store error: {0}")]
    Store(String),

    /// Invalid request or data shape
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// msmp-common error
    #[error("Common error: {0}")]
    Common(#[from] msmp_common::Error),
}

/// Convenience Result type using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Shorthand for a computation failure
    pub fn computation(stage: StageKind, message: impl Into<String>) -> Self {
        Self::Computation {
            stage,
            message: message.into(),
        }
    }

    /// Report this error as the failure of upstream stage `stage`
    ///
    /// An error that already is an upstream failure passes through untouched,
    /// so a failure deep in the chain keeps naming the stage that broke.
    pub fn into_upstream(self, stage: StageKind) -> Self {
        match self {
            e @ Self::UpstreamResolution { .. } => e,
            other => Self::UpstreamResolution {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Attribute a failure inside `stage`'s own computation to that stage
    ///
    /// Computation and upstream failures already name their stage and are
    /// kept as they are.
    pub fn within(self, stage: StageKind) -> Self {
        match self {
            e @ (Self::Computation { .. } | Self::UpstreamResolution { .. }) => e,
            other => Self::computation(stage, other.to_string()),
        }
    }

    /// The innermost error, skipping upstream wrappers
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            Self::UpstreamResolution { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
