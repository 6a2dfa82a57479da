//! # MSMP Common Library
//!
//! Shared code for the msmp pipeline crates including:
//! - Error type used across the workspace
//! - TOML configuration loading and atomic write-back
//! - Pipeline parameter set with validation
//! - Atomic file replacement helpers
//! - Tracing subscriber initialisation

pub mod config;
pub mod error;
pub mod fsutil;
pub mod logging;
pub mod params;

pub use error::{Error, Result};
pub use params::PipelineParams;
