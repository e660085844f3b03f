use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::classifier::{build_turns, classify_dialogue};
use crate::dataset::{AgentResultFile, group_dialogues, load_dialogue_ground_truth, load_predictions};
use crate::granularity::Granularity;
use crate::metrics::PrivacyUtilityTally;
use crate::report::PrivacyUtilityRow;

/// Experiment 2: withheld and leaked proportions per agent.
pub(super) fn privacy_utility(
    agents: &[AgentResultFile],
    ground_truth_results_dir: &Path,
) -> Result<BTreeMap<Granularity, Vec<PrivacyUtilityRow>>> {
    info!(agents = agents.len(), "running privacy-utility tradeoff");

    let mut results: BTreeMap<Granularity, Vec<PrivacyUtilityRow>> =
        Granularity::ALL.into_iter().map(|g| (g, Vec::new())).collect();

    for agent in agents {
        let tally = tally_agent(agent, ground_truth_results_dir)
            .with_context(|| format!("failed to classify dialogues for {}", agent.model))?;

        if tally.withheld_total == 0 {
            warn!(model = %agent.model, "no dialogue could withhold; withheld proportion is 0");
        }
        if tally.leaked_total == 0 {
            warn!(model = %agent.model, "no dialogue revealed the target; leaked proportion is 0");
        }
        info!(
            model = %agent.model,
            group = agent.group.as_str(),
            withheld = tally.withheld,
            withheld_total = tally.withheld_total,
            leaked = tally.leaked,
            leaked_total = tally.leaked_total,
            "classified agent"
        );

        results
            .entry(agent.granularity)
            .or_default()
            .push(PrivacyUtilityRow {
                model: agent.model.clone(),
                group: agent.group,
                withheld_proportion: tally.withheld_proportion(),
                leaked_proportion: tally.leaked_proportion(),
                withheld_total: tally.withheld_total,
                leaked_total: tally.leaked_total,
            });
    }

    Ok(results)
}

fn tally_agent(agent: &AgentResultFile, ground_truth_results_dir: &Path) -> Result<PrivacyUtilityTally> {
    let predictions = load_predictions(&agent.path)?;
    let dialogues = group_dialogues(&predictions)?;

    let mut tally = PrivacyUtilityTally::default();
    for dialogue in &dialogues {
        let records = load_dialogue_ground_truth(ground_truth_results_dir, &dialogue.image_id)?;
        let turns = build_turns(&records, &dialogue.included, &dialogue.image_id)?;
        let outcome = classify_dialogue(&turns, agent.granularity);
        debug!(
            model = %agent.model,
            image_id = %dialogue.image_id,
            leaked = ?outcome.leaked,
            withheld = ?outcome.withheld,
            "classified dialogue"
        );
        tally.record(outcome);
    }

    Ok(tally)
}
