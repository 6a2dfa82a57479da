//! Streaming execution compared with cached resolution

mod helpers;

use helpers::{params, source, trajectories, CountingCollaborators, FixedIdentity};
use msmp_pipeline::data::Output;
use msmp_pipeline::source::MemorySource;
use msmp_pipeline::store::MemoryArtifactStore;
use msmp_pipeline::{
    run_request, source_origin, ExecutionMode, ForceFlags, ForcePropagator, Outcome, PipelineRequest,
    Provenance, StageKind, StreamingPipeline,
};

fn cached(store: &MemoryArtifactStore, target: StageKind) -> Outcome {
    let request = PipelineRequest::new(target, params());
    run_request(&request, store, &source(), &CountingCollaborators::new()).unwrap()
}

fn streamed(
    store: &MemoryArtifactStore,
    collaborators: &CountingCollaborators,
    target: StageKind,
    forces: ForceFlags,
) -> Outcome {
    let request = PipelineRequest::new(target, params())
        .with_forces(forces)
        .with_mode(ExecutionMode::Streaming);
    run_request(&request, store, &source(), collaborators).unwrap()
}

fn assert_close(left: &Output, right: &Output, tolerance: f32) {
    let left = left.continuous().unwrap();
    let right = right.continuous().unwrap();
    assert_eq!(left.len(), right.len());
    for (a, b) in left.iter().zip(right.iter()) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tolerance, "{} vs {}", x, y);
        }
    }
}

#[test]
fn test_streamed_reduction_matches_cached() {
    let expected = cached(&MemoryArtifactStore::new(), StageKind::Reduction);

    let store = MemoryArtifactStore::new();
    let outcome = streamed(&store, &CountingCollaborators::new(), StageKind::Reduction, ForceFlags::new());

    assert_eq!(outcome.provenance, Provenance::Streamed);
    assert_eq!(outcome.output.n_columns(), expected.output.n_columns());
    assert_close(&outcome.output, &expected.output, 1e-5);
}

#[test]
fn test_streamed_chain_matches_cached_and_writes_nothing() {
    let expected_clusters = cached(&MemoryArtifactStore::new(), StageKind::Clustering);
    let expected_msm = cached(&MemoryArtifactStore::new(), StageKind::ModelEstimation);

    let store = MemoryArtifactStore::new();
    let collaborators = CountingCollaborators::new();
    let clusters = streamed(&store, &collaborators, StageKind::Clustering, ForceFlags::new());
    let msm = streamed(&store, &collaborators, StageKind::ModelEstimation, ForceFlags::new());

    assert_eq!(clusters.output.discrete(), expected_clusters.output.discrete());
    assert_eq!(msm.model, expected_msm.model);
    assert_close(&msm.output, &expected_msm.output, 1e-6);

    assert_eq!(store.writes(), 0);
    assert!(store.is_empty());
}

#[test]
fn test_stored_features_replace_featurizer() {
    let store = MemoryArtifactStore::new();
    let expected = cached(&store, StageKind::Clustering);
    let writes = store.writes();

    let collaborators = CountingCollaborators::new();
    let outcome = streamed(&store, &collaborators, StageKind::Clustering, ForceFlags::new());

    assert_eq!(collaborators.calls(), vec![StageKind::Reduction, StageKind::Clustering]);
    assert_eq!(store.writes(), writes);
    assert_eq!(outcome.output.discrete(), expected.output.discrete());
}

#[test]
fn test_forced_features_are_streamed_from_raw() {
    let store = MemoryArtifactStore::new();
    cached(&store, StageKind::Feature);

    let collaborators = CountingCollaborators::new();
    let forces = ForceFlags::new().with_recompute(StageKind::Feature);
    streamed(&store, &collaborators, StageKind::Reduction, forces);

    assert_eq!(collaborators.calls(), vec![StageKind::Feature, StageKind::Reduction]);
}

#[test]
fn test_pipeline_stages_in_order() {
    let store = MemoryArtifactStore::new();
    let raw = source();
    let forces = ForcePropagator::for_pipeline(&ForceFlags::new());
    let origin = source_origin(&raw, &CountingCollaborators::new());

    let pipeline =
        StreamingPipeline::build(StageKind::ModelEstimation, &params(), &origin, &forces, &raw, &store);

    assert_eq!(pipeline.stages(), StageKind::ALL.to_vec());
}

#[test]
fn test_stored_features_of_fewer_trajectories_are_not_reused() {
    let store = MemoryArtifactStore::new();
    let collaborators = CountingCollaborators::new();
    let three = FixedIdentity(MemorySource::new(trajectories(3, 240, 7)).unwrap());
    run_request(&PipelineRequest::new(StageKind::Feature, params()), &store, &three, &collaborators).unwrap();

    collaborators.reset();
    let five = FixedIdentity(MemorySource::new(trajectories(5, 240, 7)).unwrap());
    let request = PipelineRequest::new(StageKind::Reduction, params()).with_mode(ExecutionMode::Streaming);
    let outcome = run_request(&request, &store, &five, &collaborators).unwrap();

    assert_eq!(outcome.output.len(), 5);
    assert_eq!(collaborators.calls(), vec![StageKind::Feature, StageKind::Reduction]);
}

#[test]
fn test_feature_target_streams_raw_features() {
    let store = MemoryArtifactStore::new();
    let expected = cached(&MemoryArtifactStore::new(), StageKind::Feature);

    let outcome = streamed(&store, &CountingCollaborators::new(), StageKind::Feature, ForceFlags::new());

    assert_eq!(outcome.output, expected.output);
    assert_eq!(outcome.output.n_columns(), 6);
}
