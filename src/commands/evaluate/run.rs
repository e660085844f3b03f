use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::info;

use super::basic::basic_metrics;
use super::distance::{DistanceSettings, geocoding_distance};
use super::privacy::privacy_utility;
use crate::cli::EvaluateArgs;
use crate::dataset::{AgentResultFile, discover_all_agent_results, load_ground_truth_locations};
use crate::geocoding::{GeoapifyGeocoder, Geocoder};
use crate::metrics::BootstrapConfig;
use crate::model::{EvaluationRunManifest, ResultFileEntry};
use crate::report::{
    AgentGroup, EvaluationReport, write_basic_metrics_table, write_geocoding_distance_table,
    write_privacy_utility_table,
};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

const MANIFEST_VERSION: u32 = 1;

pub(super) struct EvaluationOutput {
    pub report: EvaluationReport,
    pub report_path: PathBuf,
    pub manifest_path: PathBuf,
}

pub(crate) fn run(args: EvaluateArgs) -> Result<()> {
    ensure_experiment_selected(&args)?;

    let geocoder = if args.run_geocoding_distance() {
        let api_key = args.geoapify_api_key.as_deref().unwrap_or_default();
        Some(
            GeoapifyGeocoder::new(api_key, Duration::from_millis(args.geocoder_timeout_ms))
                .context("geocoding distance needs --geoapify-api-key or GEOAPIFY_API_KEY")?,
        )
    } else {
        None
    };

    let output = execute(&args, geocoder.as_ref().map(|g| g as &dyn Geocoder))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    write_tables(&mut out, &args, &output.report).context("failed to write report tables")?;
    out.flush().context("failed to flush report tables")?;

    info!(
        report = %output.report_path.display(),
        manifest = %output.manifest_path.display(),
        "evaluation completed"
    );
    Ok(())
}

fn ensure_experiment_selected(args: &EvaluateArgs) -> Result<()> {
    if !args.run_basic_metrics() && !args.run_privacy_utility() && !args.run_geocoding_distance() {
        bail!("no experiment selected; pass --basic-metrics, --privacy-utility, --geocoding-distance or --all");
    }
    Ok(())
}

/// Runs the selected experiments and persists the JSON report and manifest.
/// `geocoder` must be present when the geocoding experiment is selected.
pub(super) fn execute(args: &EvaluateArgs, geocoder: Option<&dyn Geocoder>) -> Result<EvaluationOutput> {
    ensure_experiment_selected(args)?;

    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let agents = discover_all_agent_results(&[
        (AgentGroup::Baseline, args.baselines_dir.as_path()),
        (AgentGroup::Prompted, args.prompted_dir.as_path()),
        (AgentGroup::Finetuned, args.finetuned_dir.as_path()),
    ])?;
    info!(run_id = %run_id, agents = agents.len(), "discovered agent results");

    let mut report = EvaluationReport::default();
    let mut experiments = Vec::new();
    let mut warnings = Vec::new();
    if agents.is_empty() {
        warnings.push("no agent result files found".to_string());
    }

    let bootstrap = BootstrapConfig {
        num_samples: args.bootstrap_samples,
        sample_size: args.bootstrap_sample_size,
        seed: args
            .bootstrap_seed
            .unwrap_or_else(|| BootstrapConfig::default().seed),
    };

    if args.run_basic_metrics() {
        experiments.push("basic_metrics".to_string());
        report.basic_metrics =
            basic_metrics(&agents, &args.paths.ground_truth_labels_dir, bootstrap)?;
    }

    if args.run_privacy_utility() {
        experiments.push("privacy_utility".to_string());
        report.privacy_utility = privacy_utility(&agents, &args.paths.ground_truth_results_dir)?;
    }

    if args.run_geocoding_distance() {
        experiments.push("geocoding_distance".to_string());
        let Some(geocoder) = geocoder else {
            bail!("geocoding distance selected without a geocoder");
        };
        let locations = load_ground_truth_locations(&args.ground_truth_location_path)?;
        ensure_directory(&args.distance_cache_dir)?;
        let settings = DistanceSettings {
            paths: &args.paths,
            locations: &locations,
            cache_dir: &args.distance_cache_dir,
            cache_backend: args.cache_backend,
            recompute: args.recompute_geocoding,
        };
        let (rows, skipped) = geocoding_distance(&agents, &settings, geocoder)?;
        report.geocoding_distance = rows;
        warnings.extend(skipped);
    }

    ensure_directory(&args.report_dir)?;
    let report_path = args.report_dir.join(format!("evaluation_report_{run_id}.json"));
    write_json_pretty(&report_path, &report)?;

    let manifest = EvaluationRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: run_id.clone(),
        started_at,
        completed_at: now_utc_string(),
        experiments,
        bootstrap_samples: bootstrap.num_samples,
        bootstrap_sample_size: bootstrap.sample_size,
        bootstrap_seed: bootstrap.seed,
        cache_backend: args.cache_backend.as_str().to_string(),
        recompute_geocoding: args.recompute_geocoding,
        result_files: result_file_entries(&agents)?,
        warnings,
    };
    let manifest_path = args.report_dir.join(format!("evaluation_manifest_{run_id}.json"));
    write_json_pretty(&manifest_path, &manifest)?;

    Ok(EvaluationOutput {
        report,
        report_path,
        manifest_path,
    })
}

fn result_file_entries(agents: &[AgentResultFile]) -> Result<Vec<ResultFileEntry>> {
    agents
        .iter()
        .map(|agent| -> Result<ResultFileEntry> {
            Ok(ResultFileEntry {
                model: agent.model.clone(),
                group: agent.group.as_str().to_string(),
                granularity: agent.granularity.to_string(),
                path: agent.path.display().to_string(),
                sha256: sha256_file(&agent.path)?,
            })
        })
        .collect()
}

pub(super) fn write_tables<W: Write>(
    out: &mut W,
    args: &EvaluateArgs,
    report: &EvaluationReport,
) -> io::Result<()> {
    if args.run_basic_metrics() {
        write_basic_metrics_table(out, &report.basic_metrics)?;
    }
    if args.run_privacy_utility() {
        write_privacy_utility_table(out, &report.privacy_utility)?;
    }
    if args.run_geocoding_distance() {
        write_geocoding_distance_table(out, &report.geocoding_distance)?;
    }
    Ok(())
}
