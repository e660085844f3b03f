use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cache::{DistanceCache, JsonlDistanceCache, SqliteDistanceCache, list_jsonl_caches};
use crate::cli::StatusArgs;
use crate::dataset::{discover_all_agent_results, ground_truth_labels_path, list_annotation_files};
use crate::granularity::Granularity;
use crate::report::AgentGroup;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub annotations: Option<usize>,
    pub dialogue_ground_truth_files: Option<usize>,
    pub label_rows: Vec<(Granularity, Option<usize>)>,
    pub agents: usize,
    pub jsonl_caches: Vec<(String, usize)>,
    pub sqlite_caches: Vec<(String, usize)>,
}

pub fn run(args: StatusArgs) -> Result<()> {
    info!(
        annotations_dir = %args.paths.annotations_dir.display(),
        distance_cache_dir = %args.distance_cache_dir.display(),
        "status requested"
    );
    let summary = collect_status(&args)?;
    info!(
        annotations = ?summary.annotations,
        dialogue_ground_truth_files = ?summary.dialogue_ground_truth_files,
        label_files = summary.label_rows.iter().filter(|(_, rows)| rows.is_some()).count(),
        agents = summary.agents,
        jsonl_caches = summary.jsonl_caches.len(),
        sqlite_caches = summary.sqlite_caches.len(),
        "status summary"
    );
    Ok(())
}

pub fn collect_status(args: &StatusArgs) -> Result<StatusSummary> {
    let mut summary = StatusSummary::default();

    if args.paths.annotations_dir.exists() {
        let count = list_annotation_files(&args.paths.annotations_dir)?.len();
        info!(path = %args.paths.annotations_dir.display(), annotations = count, "annotations");
        summary.annotations = Some(count);
    } else {
        warn!(path = %args.paths.annotations_dir.display(), "annotations directory missing");
    }

    let results_dir = &args.paths.ground_truth_results_dir;
    if results_dir.exists() {
        let count = count_files(results_dir, "ground_truths_", ".jsonl")?;
        info!(path = %results_dir.display(), dialogues = count, "per-dialogue ground truth");
        summary.dialogue_ground_truth_files = Some(count);
    } else {
        warn!(path = %results_dir.display(), "ground-truth results missing; run ground-truth first");
    }

    for granularity in Granularity::ALL {
        let path = ground_truth_labels_path(&args.paths.ground_truth_labels_dir, granularity);
        let rows = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let rows = raw.lines().filter(|line| !line.trim().is_empty()).count();
            info!(granularity = %granularity, rows, "ground-truth labels");
            Some(rows)
        } else {
            warn!(path = %path.display(), "ground-truth labels missing");
            None
        };
        summary.label_rows.push((granularity, rows));
    }

    let agents = discover_all_agent_results(&[
        (AgentGroup::Baseline, args.baselines_dir.as_path()),
        (AgentGroup::Prompted, args.prompted_dir.as_path()),
        (AgentGroup::Finetuned, args.finetuned_dir.as_path()),
    ])?;
    for agent in &agents {
        info!(
            model = %agent.model,
            group = agent.group.as_str(),
            granularity = %agent.granularity,
            path = %agent.path.display(),
            "agent results"
        );
    }
    if agents.is_empty() {
        warn!("no agent result files found");
    }
    summary.agents = agents.len();

    for path in list_jsonl_caches(&args.distance_cache_dir)? {
        let cache = JsonlDistanceCache::open(&path)?;
        let entries = cache.entry_count()?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        info!(cache = %name, entries, "jsonl distance cache");
        summary.jsonl_caches.push((name, entries));
    }

    let db_path = SqliteDistanceCache::db_path(&args.distance_cache_dir);
    if db_path.exists() {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        summary.sqlite_caches = sqlite_cache_counts(&conn)?;
        for (name, entries) in &summary.sqlite_caches {
            info!(cache = %name, entries, "sqlite distance cache");
        }
    }

    if summary.jsonl_caches.is_empty() && summary.sqlite_caches.is_empty() {
        warn!(path = %args.distance_cache_dir.display(), "no distance caches found");
    }

    Ok(summary)
}

fn count_files(dir: &Path, prefix: &str, suffix: &str) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(suffix) {
            count += 1;
        }
    }
    Ok(count)
}

fn sqlite_cache_counts(conn: &Connection) -> Result<Vec<(String, usize)>> {
    let mut stmt = conn
        .prepare(
            "SELECT cache_name, COUNT(DISTINCT image_id) FROM distance_results \
             GROUP BY cache_name ORDER BY cache_name",
        )
        .context("failed to prepare distance cache summary")?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((name, count as usize))
        })
        .context("failed to query distance cache summary")?;

    let mut counts = Vec::new();
    for row in rows {
        counts.push(row.context("failed to read distance cache summary row")?);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::DistanceCacheEntry;
    use crate::cli::{Cli, Commands};
    use crate::geocoding::RevealedLocation;
    use crate::model::GroundTruthLocation;

    fn status_args(root: &Path) -> StatusArgs {
        let path = |name: &str| root.join(name).to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "geomod-eval".to_string(),
            "status".to_string(),
            "--annotations-dir".to_string(),
            path("annotations"),
            "--ground-truth-results-dir".to_string(),
            path("results"),
            "--ground-truth-labels-dir".to_string(),
            path("labels"),
            "--baselines-dir".to_string(),
            path("baselines"),
            "--prompted-dir".to_string(),
            path("prompted"),
            "--finetuned-dir".to_string(),
            path("finetuned"),
            "--distance-cache-dir".to_string(),
            path("cache"),
        ])
        .unwrap();
        let Commands::Status(args) = cli.command else {
            panic!("expected status");
        };
        args
    }

    fn entry(image_id: &str) -> DistanceCacheEntry {
        DistanceCacheEntry {
            image_id: image_id.to_string(),
            points: Vec::new(),
            confidences: Vec::new(),
            centroid: None,
            distance: Some(12.5),
            ground_truth: GroundTruthLocation::default(),
            revealed: RevealedLocation::default(),
        }
    }

    #[test]
    fn empty_workspace_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let summary = collect_status(&status_args(dir.path())).unwrap();

        assert_eq!(summary.annotations, None);
        assert_eq!(summary.dialogue_ground_truth_files, None);
        assert!(summary.label_rows.iter().all(|(_, rows)| rows.is_none()));
        assert_eq!(summary.agents, 0);
        assert!(summary.jsonl_caches.is_empty());
        assert!(summary.sqlite_caches.is_empty());
    }

    #[test]
    fn counts_artifacts_and_cache_entries() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let args = status_args(root);

        fs::create_dir_all(root.join("annotations")).unwrap();
        fs::write(root.join("annotations").join("annotation_a.json"), "{}").unwrap();
        fs::create_dir_all(root.join("results")).unwrap();
        fs::write(root.join("results").join("ground_truths_a.jsonl"), "").unwrap();
        fs::create_dir_all(root.join("labels")).unwrap();
        fs::write(
            ground_truth_labels_path(&root.join("labels"), Granularity::City),
            format!(
                "{}\n{}\n",
                json!({"question_id": "a_1", "ground_truth": "No"}),
                json!({"question_id": "a_2", "ground_truth": "Yes"})
            ),
        )
        .unwrap();
        fs::create_dir_all(root.join("prompted")).unwrap();
        fs::write(root.join("prompted").join("m_granularity=city.jsonl"), "").unwrap();

        let cache_dir: PathBuf = root.join("cache");
        let mut jsonl =
            JsonlDistanceCache::open(&JsonlDistanceCache::cache_path(&cache_dir, "m_city")).unwrap();
        jsonl.put(&entry("a")).unwrap();
        jsonl.put(&entry("a")).unwrap();
        let mut sqlite =
            SqliteDistanceCache::open(&SqliteDistanceCache::db_path(&cache_dir), "m_city").unwrap();
        sqlite.put(&entry("a")).unwrap();
        sqlite.put(&entry("b")).unwrap();
        drop(sqlite);

        let summary = collect_status(&args).unwrap();

        assert_eq!(summary.annotations, Some(1));
        assert_eq!(summary.dialogue_ground_truth_files, Some(1));
        assert!(summary.label_rows.contains(&(Granularity::City, Some(2))));
        assert!(summary.label_rows.contains(&(Granularity::Country, None)));
        assert_eq!(summary.agents, 1);
        assert_eq!(
            summary.jsonl_caches,
            vec![("api_distance_results_m_city.jsonl".to_string(), 1)]
        );
        assert_eq!(summary.sqlite_caches, vec![("m_city".to_string(), 2)]);
    }
}
