use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::dataset::{AgentResultFile, load_ground_truth_labels, load_predictions};
use crate::granularity::Granularity;
use crate::metrics::{BootstrapConfig, bootstrap_f1_error_bars, compute_basic_metrics};
use crate::model::ModerationLabel;
use crate::report::BasicMetricsRow;

/// Experiment 1: precision, recall and F1 per agent, with bootstrap error bars.
pub(super) fn basic_metrics(
    agents: &[AgentResultFile],
    labels_dir: &Path,
    config: BootstrapConfig,
) -> Result<BTreeMap<Granularity, Vec<BasicMetricsRow>>> {
    info!(agents = agents.len(), "running basic metrics");

    let mut results: BTreeMap<Granularity, Vec<BasicMetricsRow>> =
        Granularity::ALL.into_iter().map(|g| (g, Vec::new())).collect();
    let mut labels_by_granularity = HashMap::<Granularity, HashMap<String, ModerationLabel>>::new();

    for agent in agents {
        let labels = match labels_by_granularity.entry(agent.granularity) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                load_ground_truth_labels(labels_dir, agent.granularity).with_context(|| {
                    format!("failed to load {} ground-truth labels", agent.granularity)
                })?,
            ),
        };

        let predictions = load_predictions(&agent.path)?;
        let scores = compute_basic_metrics(&predictions, labels)
            .with_context(|| format!("failed to score {}", agent.model))?;
        let bootstrap = bootstrap_f1_error_bars(&predictions, labels, config)
            .with_context(|| format!("failed to bootstrap {}", agent.model))?;

        info!(
            model = %agent.model,
            group = agent.group.as_str(),
            predictions = predictions.len(),
            precision = scores.precision,
            recall = scores.recall,
            f1 = scores.f1,
            bootstrap_mean_f1 = bootstrap.mean_f1,
            bootstrap_std_f1 = bootstrap.std_f1,
            "scored agent"
        );

        results
            .entry(agent.granularity)
            .or_default()
            .push(BasicMetricsRow {
                model: agent.model.clone(),
                group: agent.group,
                scores,
                bootstrap,
            });
    }

    Ok(results)
}
