//! Force flags and their cascade
//!
//! Callers set force-recompute or force-remodel per stage. The propagator
//! turns those into, for every stage, which cache tiers must be skipped:
//!
//! - `skip_output_tier[j]` = force-recompute or force-remodel on any stage
//!   `i <= j`
//! - `skip_model_tier[j]`  = the same condition
//!
//! A refitted model produces new output, so everything downstream of it is
//! refitted too. Flags on stages downstream of `j` never affect `j`.

use crate::stage::StageKind;
use std::collections::BTreeSet;

/// Per-stage force-recompute and force-remodel requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForceFlags {
    recompute: BTreeSet<StageKind>,
    remodel: BTreeSet<StageKind>,
}

impl ForceFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `stage`'s cache (and everything downstream of it) as invalid
    pub fn with_recompute(mut self, stage: StageKind) -> Self {
        self.recompute.insert(stage);
        self
    }

    /// Treat `stage`'s fitted model (and everything downstream of it) as
    /// invalid
    pub fn with_remodel(mut self, stage: StageKind) -> Self {
        self.remodel.insert(stage);
        self
    }

    pub fn set_recompute(&mut self, stage: StageKind, on: bool) {
        if on {
            self.recompute.insert(stage);
        } else {
            self.recompute.remove(&stage);
        }
    }

    pub fn set_remodel(&mut self, stage: StageKind, on: bool) {
        if on {
            self.remodel.insert(stage);
        } else {
            self.remodel.remove(&stage);
        }
    }

    pub fn recompute(&self, stage: StageKind) -> bool {
        self.recompute.contains(&stage)
    }

    pub fn remodel(&self, stage: StageKind) -> bool {
        self.remodel.contains(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.recompute.is_empty() && self.remodel.is_empty()
    }
}

/// Cache tiers a stage must bypass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSkips {
    pub skip_output_tier: bool,
    pub skip_model_tier: bool,
}

/// Effective tier skips for every stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcePropagator {
    skips: Vec<TierSkips>,
}

impl ForcePropagator {
    /// Propagate `flags` over the stages `stages` (ordered upstream first)
    pub fn propagate(stages: &[StageKind], flags: &ForceFlags) -> Self {
        let mut forced = false;
        let skips = stages
            .iter()
            .map(|&stage| {
                forced |= flags.recompute(stage) || flags.remodel(stage);
                TierSkips {
                    skip_output_tier: forced,
                    skip_model_tier: forced,
                }
            })
            .collect();
        Self { skips }
    }

    /// Propagate over the whole four-stage pipeline
    pub fn for_pipeline(flags: &ForceFlags) -> Self {
        Self::propagate(&StageKind::ALL, flags)
    }

    /// Skips for the stage at `ordinal`; stages beyond the propagated range
    /// are never forced
    pub fn skips(&self, ordinal: usize) -> TierSkips {
        self.skips.get(ordinal).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.skips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skips.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORCED: TierSkips = TierSkips {
        skip_output_tier: true,
        skip_model_tier: true,
    };

    #[test]
    fn test_no_flags_trust_everything() {
        let propagator = ForcePropagator::for_pipeline(&ForceFlags::new());
        for ordinal in 0..4 {
            assert_eq!(propagator.skips(ordinal), TierSkips::default());
        }
    }

    #[test]
    fn test_feature_recompute_cascades_downstream() {
        let flags = ForceFlags::new().with_recompute(StageKind::Feature);
        let propagator = ForcePropagator::propagate(
            &[StageKind::Feature, StageKind::Reduction, StageKind::Clustering],
            &flags,
        );

        assert_eq!(propagator.skips(0), FORCED);
        assert_eq!(propagator.skips(1), FORCED);
        assert_eq!(propagator.skips(2), FORCED);
    }

    #[test]
    fn test_remodel_cascades_downstream() {
        let flags = ForceFlags::new().with_remodel(StageKind::Reduction);
        let propagator = ForcePropagator::for_pipeline(&flags);

        assert_eq!(propagator.skips(0), TierSkips::default());
        assert_eq!(propagator.skips(1), FORCED);
        assert_eq!(propagator.skips(2), FORCED);
        assert_eq!(propagator.skips(3), FORCED);
    }

    #[test]
    fn test_downstream_flag_does_not_reach_upstream() {
        let flags = ForceFlags::new()
            .with_recompute(StageKind::Clustering)
            .with_remodel(StageKind::ModelEstimation);
        let propagator = ForcePropagator::for_pipeline(&flags);

        assert_eq!(propagator.skips(0), TierSkips::default());
        assert_eq!(propagator.skips(1), TierSkips::default());
        assert_eq!(propagator.skips(2), FORCED);
        assert_eq!(propagator.skips(3), FORCED);
    }

    #[test]
    fn test_out_of_range_is_not_forced() {
        let flags = ForceFlags::new().with_recompute(StageKind::Feature);
        let propagator = ForcePropagator::propagate(&[StageKind::Feature], &flags);
        assert_eq!(propagator.len(), 1);
        assert_eq!(propagator.skips(3), TierSkips::default());
    }

    #[test]
    fn test_set_and_clear_flags() {
        let mut flags = ForceFlags::new();
        flags.set_recompute(StageKind::Reduction, true);
        flags.set_remodel(StageKind::Clustering, true);
        assert!(flags.recompute(StageKind::Reduction));
        assert!(flags.remodel(StageKind::Clustering));

        flags.set_recompute(StageKind::Reduction, false);
        flags.set_remodel(StageKind::Clustering, false);
        assert!(flags.is_empty());
    }
}
