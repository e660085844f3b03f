use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cache::{DistanceCache, JsonlDistanceCache, SqliteDistanceCache};
use crate::cli::{CacheBackend, DataPaths};
use crate::dataset::{
    AgentResultFile, annotation_path, dialogue_snapshots, group_dialogues, load_annotation,
    load_predictions,
};
use crate::error::EvalError;
use crate::geocoding::{DistanceEvaluator, DistanceOutcome, Geocoder};
use crate::granularity::Granularity;
use crate::ground_truth::LocationSnapshot;
use crate::metrics::DistanceThresholdCounts;
use crate::model::GroundTruthLocation;
use crate::report::GeocodingDistanceRow;

pub(super) struct DistanceSettings<'a> {
    pub paths: &'a DataPaths,
    pub locations: &'a HashMap<String, GroundTruthLocation>,
    pub cache_dir: &'a Path,
    pub cache_backend: CacheBackend,
    pub recompute: bool,
}

pub(super) fn open_cache(
    backend: CacheBackend,
    cache_dir: &Path,
    cache_name: &str,
) -> Result<Box<dyn DistanceCache>> {
    let cache: Box<dyn DistanceCache> = match backend {
        CacheBackend::Jsonl => Box::new(JsonlDistanceCache::open(
            &JsonlDistanceCache::cache_path(cache_dir, cache_name),
        )?),
        CacheBackend::Sqlite => Box::new(SqliteDistanceCache::open(
            &SqliteDistanceCache::db_path(cache_dir),
            cache_name,
        )?),
    };
    Ok(cache)
}

/// Experiment 3: how close a geocoder gets from what each agent let through.
/// Agents at the exact-GPS granularity are not part of this experiment.
pub(super) fn geocoding_distance(
    agents: &[AgentResultFile],
    settings: &DistanceSettings<'_>,
    geocoder: &dyn Geocoder,
) -> Result<(BTreeMap<Granularity, Vec<GeocodingDistanceRow>>, Vec<String>)> {
    info!(
        agents = agents.len(),
        backend = settings.cache_backend.as_str(),
        recompute = settings.recompute,
        "running geocoding distance"
    );

    let mut results: BTreeMap<Granularity, Vec<GeocodingDistanceRow>> = Granularity::ALL
        .into_iter()
        .filter(|g| *g != Granularity::ExactGpsCoordinates)
        .map(|g| (g, Vec::new()))
        .collect();
    let mut skipped = Vec::new();

    for agent in agents {
        if agent.granularity == Granularity::ExactGpsCoordinates {
            info!(model = %agent.model, "skipping exact-gps agent for geocoding distance");
            skipped.push(format!(
                "{} skipped for geocoding distance: exact_gps_coordinates",
                agent.model
            ));
            continue;
        }

        let mut cache = open_cache(settings.cache_backend, settings.cache_dir, &agent.model)?;
        let counts = agent_distances(agent, settings, cache.as_mut(), geocoder)
            .with_context(|| format!("failed to measure geocoding distance for {}", agent.model))?;

        info!(
            model = %agent.model,
            group = agent.group.as_str(),
            measured = counts.all,
            cache_entries = cache.entry_count()?,
            "measured agent"
        );

        results
            .entry(agent.granularity)
            .or_default()
            .push(GeocodingDistanceRow {
                model: agent.model.clone(),
                group: agent.group,
                counts,
            });
    }

    Ok((results, skipped))
}

fn agent_distances(
    agent: &AgentResultFile,
    settings: &DistanceSettings<'_>,
    cache: &mut dyn DistanceCache,
    geocoder: &dyn Geocoder,
) -> Result<DistanceThresholdCounts> {
    let predictions = load_predictions(&agent.path)?;
    let dialogues = group_dialogues(&predictions)?;

    let mut evaluator = DistanceEvaluator::new(cache, geocoder, settings.recompute);
    let mut counts = DistanceThresholdCounts::default();
    let mut no_guess = 0_usize;
    let mut no_ground_truth = 0_usize;

    for dialogue in &dialogues {
        let ground_truth = settings.locations.get(&dialogue.image_id).ok_or_else(|| {
            EvalError::data(format!(
                "no ground-truth location for image {}",
                dialogue.image_id
            ))
        })?;

        let path = annotation_path(&settings.paths.annotations_dir, &dialogue.image_id);
        let annotation = load_annotation(&path)?;
        let snapshots = dialogue_snapshots(&annotation)?;
        if dialogue.included.len() < snapshots.len() {
            return Err(EvalError::data(format!(
                "dialogue {} has {} assistant turns but only {} moderation decisions",
                dialogue.image_id,
                snapshots.len(),
                dialogue.included.len()
            ))
            .into());
        }

        let turns: Vec<(LocationSnapshot, bool)> = snapshots
            .into_iter()
            .zip(dialogue.included.iter().copied())
            .collect();
        let outcome = evaluator.evaluate(&dialogue.image_id, &turns, ground_truth)?;
        match outcome {
            DistanceOutcome::NoGuess => no_guess += 1,
            DistanceOutcome::NoGroundTruth => no_ground_truth += 1,
            DistanceOutcome::Measured(_) | DistanceOutcome::NoCandidates => {}
        }
        counts.record(outcome.distance_km());
    }

    debug!(
        model = %agent.model,
        dialogues = dialogues.len(),
        no_guess,
        no_ground_truth,
        "finished agent dialogues"
    );
    Ok(counts)
}
