use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::{DataPaths, GroundTruthArgs};
use crate::dataset::{
    dialogue_ground_truth_path, dialogue_snapshots, ground_truth_labels_path,
    list_annotation_files, load_annotation,
};
use crate::granularity::Granularity;
use crate::ground_truth::derive_dialogue_records;
use crate::model::{GroundTruthLabelRecord, ModerationLabel, QuestionId};
use crate::util::{ensure_directory, write_jsonl};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundTruthSummary {
    pub dialogues: usize,
    pub turns: usize,
    pub revealed_by_granularity: BTreeMap<Granularity, usize>,
}

pub fn run(args: GroundTruthArgs) -> Result<()> {
    let summary = generate_ground_truth(&args.paths)?;

    for (granularity, revealed) in &summary.revealed_by_granularity {
        info!(granularity = %granularity, revealed, turns = summary.turns, "ground-truth labels");
    }
    info!(
        dialogues = summary.dialogues,
        turns = summary.turns,
        "ground-truth generation completed"
    );
    Ok(())
}

/// Writes one per-turn record file per dialogue and one label file per
/// granularity. Existing files are replaced.
pub fn generate_ground_truth(paths: &DataPaths) -> Result<GroundTruthSummary> {
    ensure_directory(&paths.ground_truth_results_dir)?;
    ensure_directory(&paths.ground_truth_labels_dir)?;

    let annotation_files = list_annotation_files(&paths.annotations_dir)?;
    info!(
        annotations = annotation_files.len(),
        dir = %paths.annotations_dir.display(),
        "generating ground truth"
    );

    let mut labels: BTreeMap<Granularity, Vec<GroundTruthLabelRecord>> = Granularity::ALL
        .into_iter()
        .map(|granularity| (granularity, Vec::new()))
        .collect();
    let mut summary = GroundTruthSummary {
        revealed_by_granularity: Granularity::ALL.into_iter().map(|g| (g, 0)).collect(),
        ..GroundTruthSummary::default()
    };

    for path in annotation_files {
        let annotation = load_annotation(&path)?;
        let image_id = annotation.image_id();
        let snapshots = dialogue_snapshots(&annotation)
            .with_context(|| format!("invalid annotation {}", path.display()))?;
        let records = derive_dialogue_records(&snapshots)
            .with_context(|| format!("failed to derive ground truth for {image_id}"))?;

        let records_path = dialogue_ground_truth_path(&paths.ground_truth_results_dir, &image_id);
        write_jsonl(&records_path, &records)?;
        debug!(image_id = %image_id, turns = snapshots.len(), "wrote dialogue ground truth");

        for record in &records {
            if record.ground_truth {
                *summary
                    .revealed_by_granularity
                    .entry(record.granularity)
                    .or_default() += 1;
            }
            labels
                .entry(record.granularity)
                .or_default()
                .push(GroundTruthLabelRecord {
                    question_id: QuestionId::format(&image_id, record.dialogue_turn_no),
                    ground_truth: ModerationLabel::from_revealed(record.ground_truth)
                        .as_str()
                        .to_string(),
                });
        }

        summary.dialogues += 1;
        summary.turns += snapshots.len();
    }

    for (granularity, rows) in &labels {
        let path = ground_truth_labels_path(&paths.ground_truth_labels_dir, *granularity);
        write_jsonl(&path, rows)?;
        info!(path = %path.display(), rows = rows.len(), "wrote ground-truth labels");
    }

    Ok(summary)
}
