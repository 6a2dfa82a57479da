//! msmp - tiered, cached Markov state model pipeline
//!
//! Resolves the requested stage through the artifact store (or streams it
//! when `--pipeline` is given) and writes the analysis results as JSON into
//! the output directory.

use anyhow::{Context, Result};
use clap::Parser;
use msmp_common::config::{default_config_path, load_toml_config, resolve_store_dir};
use msmp_common::fsutil::write_json_atomic;
use msmp_common::logging::init_tracing;
use msmp_common::PipelineParams;
use msmp_pipeline::analysis::{
    confidence_interval, its_scan, score_cluster_count, tica_histograms, ScoreTable, CLUSTER_COUNTS,
    ITS_LAGS, SCORE_CONFIDENCE,
};
use msmp_pipeline::cli::{Cli, Command};
use msmp_pipeline::estimators::featurizer::Topology;
use msmp_pipeline::estimators::StandardCollaborators;
use msmp_pipeline::source::TextTrajectorySource;
use msmp_pipeline::store::FsArtifactStore;
use msmp_pipeline::{run_request, Outcome, Provenance};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Number of consecutive tIC pairs histogrammed by observe-tica
const TICA_PAIRS: usize = 6;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_toml_config(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    init_tracing(&config.logging).context("Failed to initialise logging")?;

    info!("Starting msmp version {}", env!("CARGO_PKG_VERSION"));

    let request = cli.request(&config.pipeline);
    request.params.validate().context("Invalid pipeline parameters")?;

    let store_dir = resolve_store_dir(cli.store.as_deref(), &config);
    info!("Artifact store: {}", store_dir.display());
    let store = FsArtifactStore::new(store_dir);

    let topology = Topology::load(&cli.top)
        .with_context(|| format!("Failed to load topology {}", cli.top.display()))?;
    let source = TextTrajectorySource::discover(&cli.prefix, &cli.suffix, topology.n_coordinates())
        .context("Failed to discover trajectories")?;
    info!("Found {} trajectories", source.paths().len());
    let collaborators = StandardCollaborators::new(topology);

    let outcome = run_request(&request, &store, &source, &collaborators)?;
    report(&outcome);

    std::fs::create_dir_all(&cli.directory)
        .with_context(|| format!("Failed to create {}", cli.directory.display()))?;

    match &cli.command {
        Command::Resolve { .. } => {}
        Command::ObserveTica { bins } => observe_tica(&cli, &request.params, &outcome, *bins)?,
        Command::ScoreKmeans { seed } => score_kmeans(&cli, &request.params, outcome, *seed).await?,
        Command::ScanIts { nits, bootstrap, seed } => {
            scan_its(&cli, &request.params, &outcome, *nits, *bootstrap, *seed)?
        }
    }

    info!("Done");
    Ok(())
}

fn report(outcome: &Outcome) {
    let origin = match &outcome.provenance {
        Provenance::Cached { tier, trace } => {
            for (stage, tier) in trace {
                println!("{:<18} {}", stage.to_string(), tier);
            }
            tier.to_string()
        }
        Provenance::Streamed => "pipeline".to_string(),
    };
    println!(
        "{} from {}: {} trajectories, {} frames, {} columns",
        outcome.stage,
        origin,
        outcome.output.len(),
        outcome.output.total_frames(),
        outcome.output.n_columns()
    );
}

fn observe_tica(cli: &Cli, params: &PipelineParams, outcome: &Outcome, bins: usize) -> Result<()> {
    let offsets: Vec<usize> = (cli.offset..).step_by(2).take(TICA_PAIRS).collect();
    let histograms = tica_histograms(&outcome.output, &offsets, bins)?;
    let path = cli.directory.join(format!("1_tica-{}-{}.json", params.lag, cli.offset));
    write_result(&path, &histograms)?;
    info!("Wrote {} tIC histograms", histograms.len());
    Ok(())
}

async fn score_kmeans(cli: &Cli, params: &PipelineParams, outcome: Outcome, seed: u64) -> Result<()> {
    let data: Arc<Vec<Array2<f32>>> = Arc::new(
        outcome
            .output
            .continuous()
            .context("Reduction output is not continuous")?
            .into_iter()
            .map(|view| view.to_owned())
            .collect(),
    );

    let mut tasks = JoinSet::new();
    for (position, &k) in CLUSTER_COUNTS.iter().enumerate() {
        let data = Arc::clone(&data);
        let params = params.clone();
        let samples = cli.smplen;
        tasks.spawn_blocking(move || {
            let views: Vec<_> = data.iter().map(|d| d.view()).collect();
            let mut rng = StdRng::seed_from_u64(seed ^ k as u64);
            (position, score_cluster_count(&views, k, samples, &params, &mut rng))
        });
    }

    // Cluster counts that cannot be scored keep an empty row
    let mut scores = vec![Vec::new(); CLUSTER_COUNTS.len()];
    while let Some(joined) = tasks.join_next().await {
        let (position, result) = joined.context("Scoring task panicked")?;
        let k = CLUSTER_COUNTS[position];
        match result {
            Ok(row) => {
                match confidence_interval(&row, SCORE_CONFIDENCE) {
                    Some((lo, hi)) => info!("k = {}: mean VAMP-2 {:.4} [{:.4}, {:.4}]", k, mean(&row), lo, hi),
                    None => info!("k = {}: no VAMP-2 samples", k),
                }
                scores[position] = row;
            }
            Err(e) => warn!("k = {}: not scored: {}", k, e),
        }
    }

    let table = ScoreTable::new(CLUSTER_COUNTS.to_vec(), scores);
    let path = cli.directory.join(format!(
        "2_kmeans_score-{}-{}-{}.json",
        params.lag,
        dims_label(params),
        params.msmlag
    ));
    write_result(&path, &table)
}

fn scan_its(
    cli: &Cli,
    params: &PipelineParams,
    outcome: &Outcome,
    nits: usize,
    bootstrap: usize,
    seed: u64,
) -> Result<()> {
    let dtrajs = outcome
        .output
        .discrete()
        .context("Clustering output is not discrete")?;
    let mut rng = StdRng::seed_from_u64(seed);
    let table = its_scan(&dtrajs, &ITS_LAGS, nits, params.dt_traj, bootstrap, &mut rng)?;
    let path = cli.directory.join(format!(
        "msm_timescales-{}-{}-{}.json",
        params.lag,
        dims_label(params),
        params.kclusters
    ));
    write_result(&path, &table)
}

fn dims_label(params: &PipelineParams) -> String {
    params
        .ndims
        .map(|n| n.to_string())
        .unwrap_or_else(|| "all".to_string())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

fn write_result<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    write_json_atomic(path, value).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}
