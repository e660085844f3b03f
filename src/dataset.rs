//! Readers for the dataset, agent outputs and derived ground-truth files.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::{EvalError, EvalResult};
use crate::granularity::Granularity;
use crate::ground_truth::{GroundTruthRecord, LocationSnapshot};
use crate::model::{
    AnnotationRecord, GroundTruthLabelRecord, GroundTruthLocation, ModerationLabel,
    PredictionRecord, QuestionId,
};
use crate::report::AgentGroup;

/// Reads one JSON value per non-blank line. A malformed line is a schema
/// error naming the file and line.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|err| {
            EvalError::schema(format!("{}:{}", path.display(), idx + 1), err.to_string())
        })?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> EvalResult<T> {
    let raw = fs::read(path).map_err(|source| EvalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| EvalError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_predictions(path: &Path) -> Result<Vec<PredictionRecord>> {
    read_jsonl(path)
}

pub fn ground_truth_labels_path(labels_dir: &Path, granularity: Granularity) -> PathBuf {
    labels_dir.join(format!("ground_truth_granularity={granularity}.jsonl"))
}

pub fn load_ground_truth_labels(
    labels_dir: &Path,
    granularity: Granularity,
) -> Result<HashMap<String, ModerationLabel>> {
    let path = ground_truth_labels_path(labels_dir, granularity);
    let records: Vec<GroundTruthLabelRecord> = read_jsonl(&path)?;

    let mut labels = HashMap::with_capacity(records.len());
    for record in records {
        let label = ModerationLabel::parse(&record.ground_truth, &record.question_id)?;
        labels.insert(record.question_id, label);
    }
    Ok(labels)
}

pub fn dialogue_ground_truth_path(results_dir: &Path, image_id: &str) -> PathBuf {
    results_dir.join(format!("ground_truths_{image_id}.jsonl"))
}

pub fn load_dialogue_ground_truth(
    results_dir: &Path,
    image_id: &str,
) -> Result<Vec<GroundTruthRecord>> {
    let path = dialogue_ground_truth_path(results_dir, image_id);
    if !path.exists() {
        return Err(EvalError::data(format!(
            "no ground-truth records for dialogue {image_id} ({})",
            path.display()
        ))
        .into());
    }
    read_jsonl(&path)
}

pub fn annotation_path(annotations_dir: &Path, image_id: &str) -> PathBuf {
    annotations_dir.join(format!("annotation_{image_id}.json"))
}

pub fn load_annotation(path: &Path) -> Result<AnnotationRecord> {
    Ok(read_json(path)?)
}

/// Snapshots of the assistant turns, in order. Turn `k` is the `k`-th
/// assistant message.
pub fn dialogue_snapshots(annotation: &AnnotationRecord) -> EvalResult<Vec<LocationSnapshot>> {
    let image_id = annotation.image_id();
    annotation
        .messages
        .iter()
        .filter(|message| message.role == "assistant")
        .enumerate()
        .map(|(idx, message)| -> EvalResult<LocationSnapshot> {
            let context = format!("{image_id} turn {}", idx + 1);
            let location_data = message
                .location_data
                .as_ref()
                .ok_or_else(|| EvalError::schema(&context, "assistant message lacks location_data"))?;
            LocationSnapshot::from_location_data(location_data, &context)
        })
        .collect()
}

/// Lists the `.json` annotation files in a stable order.
pub fn list_annotation_files(annotations_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(annotations_dir)
        .with_context(|| format!("failed to read {}", annotations_dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", annotations_dir.display()))?
            .path();
        let is_annotation = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_annotation && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn load_ground_truth_locations(path: &Path) -> Result<HashMap<String, GroundTruthLocation>> {
    Ok(read_json(path)?)
}

/// Moderation decisions of one dialogue; `included[k]` is turn `k + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueDecisions {
    pub image_id: String,
    pub included: Vec<bool>,
}

/// Groups predictions into dialogues by consecutive runs of the same image id.
///
/// Each dialogue's turns must arrive as `1, 2, ...`; a decision whose turn
/// number disagrees with its position is rejected.
pub fn group_dialogues(predictions: &[PredictionRecord]) -> EvalResult<Vec<DialogueDecisions>> {
    let mut dialogues: Vec<DialogueDecisions> = Vec::new();

    for prediction in predictions {
        let question = QuestionId::parse(&prediction.question_id)?;
        let included = prediction.included()?;
        let continues = dialogues
            .last()
            .is_some_and(|current| current.image_id == question.image_id);
        if !continues {
            dialogues.push(DialogueDecisions {
                image_id: question.image_id.clone(),
                included: Vec::new(),
            });
        }
        let Some(current) = dialogues.last_mut() else {
            continue;
        };

        let position = current.included.len() + 1;
        if question.turn != position {
            return Err(EvalError::schema(
                prediction.question_id.clone(),
                format!("decision for turn {} found at position {position}", question.turn),
            ));
        }
        current.included.push(included);
    }

    Ok(dialogues)
}

/// A `<model>_granularity=<granularity>.jsonl` decisions file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResultFile {
    /// `<model>_<granularity>`.
    pub model: String,
    pub group: AgentGroup,
    pub granularity: Granularity,
    pub path: PathBuf,
}

fn agent_filename_pattern() -> Result<Regex> {
    Regex::new(r"^(?P<model>.*?)_granularity=(?P<granularity>.+)\.jsonl$")
        .context("failed to compile agent result filename regex")
}

pub fn parse_agent_filename(filename: &str, pattern: &Regex) -> Result<(String, Granularity)> {
    let captures = pattern
        .captures(filename)
        .with_context(|| format!("granularity not found in filename: {filename}"))?;
    let model = captures
        .name("model")
        .map(|m| m.as_str())
        .context("missing model capture")?;
    let granularity: Granularity = captures
        .name("granularity")
        .map(|m| m.as_str())
        .context("missing granularity capture")?
        .parse()?;
    Ok((format!("{model}_{granularity}"), granularity))
}

/// Every `.jsonl` file in `dir`, sorted by model name. A missing directory
/// yields nothing; a `.jsonl` without the granularity marker is an error.
pub fn discover_agent_results(dir: &Path, group: AgentGroup) -> Result<Vec<AgentResultFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let pattern = agent_filename_pattern()?;

    let mut results = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !filename.ends_with(".jsonl") {
            continue;
        }
        let (model, granularity) = parse_agent_filename(filename, &pattern)?;
        results.push(AgentResultFile {
            model,
            group,
            granularity,
            path,
        });
    }

    results.sort_by(|a, b| a.model.cmp(&b.model));
    Ok(results)
}

/// Concatenates the three result directories. The same model name in two
/// directories is rejected since the group would be ambiguous.
pub fn discover_all_agent_results(dirs: &[(AgentGroup, &Path)]) -> Result<Vec<AgentResultFile>> {
    let mut all = Vec::new();
    let mut seen = HashMap::<String, AgentGroup>::new();
    for (group, dir) in dirs {
        for result in discover_agent_results(dir, *group)? {
            if let Some(previous) = seen.insert(result.model.clone(), *group) {
                bail!(
                    "model {} appears in both {} and {} results",
                    result.model,
                    previous.as_str(),
                    group.as_str()
                );
            }
            all.push(result);
        }
    }
    Ok(all)
}
