use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::metrics::{DEFAULT_BOOTSTRAP_SAMPLES, DEFAULT_BOOTSTRAP_SAMPLE_SIZE};

#[derive(Parser, Debug)]
#[command(
    name = "geomod-eval",
    version,
    about = "Evaluate location-moderation agents on image-geolocation dialogues"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Derive per-turn ground truth from the dialogue annotations.
    GroundTruth(GroundTruthArgs),
    /// Score agent moderation decisions.
    Evaluate(EvaluateArgs),
    /// Summarize derived artifacts and caches.
    Status(StatusArgs),
}

/// Locations of the dataset and derived ground truth.
#[derive(Args, Debug, Clone)]
pub struct DataPaths {
    #[arg(long, default_value = "gptgeochat/human/test/annotations")]
    pub annotations_dir: PathBuf,

    #[arg(long, default_value = "gptgeochat/human/ground_truth_results")]
    pub ground_truth_results_dir: PathBuf,

    #[arg(long, default_value = "moderation_decisions_ground_truth")]
    pub ground_truth_labels_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct GroundTruthArgs {
    #[command(flatten)]
    pub paths: DataPaths,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CacheBackend {
    Jsonl,
    Sqlite,
}

impl CacheBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub paths: DataPaths,

    #[arg(long, default_value_t = false)]
    pub basic_metrics: bool,

    #[arg(long, default_value_t = false)]
    pub privacy_utility: bool,

    #[arg(long, default_value_t = false)]
    pub geocoding_distance: bool,

    #[arg(long, default_value_t = false)]
    pub all: bool,

    #[arg(long, default_value_t = false)]
    pub recompute_geocoding: bool,

    #[arg(long, default_value = "moderation_decisions_baselines")]
    pub baselines_dir: PathBuf,

    #[arg(long, default_value = "moderation_decisions_prompted")]
    pub prompted_dir: PathBuf,

    #[arg(long, default_value = "moderation_decisions_finetuned")]
    pub finetuned_dir: PathBuf,

    #[arg(long, default_value = "ground_truth_location_data.json")]
    pub ground_truth_location_path: PathBuf,

    #[arg(long, default_value = "api_distance_responses")]
    pub distance_cache_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = CacheBackend::Jsonl)]
    pub cache_backend: CacheBackend,

    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_SAMPLES)]
    pub bootstrap_samples: usize,

    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_SAMPLE_SIZE)]
    pub bootstrap_sample_size: usize,

    #[arg(long)]
    pub bootstrap_seed: Option<u64>,

    #[arg(long, env = "GEOAPIFY_API_KEY", hide_env_values = true)]
    pub geoapify_api_key: Option<String>,

    #[arg(long, default_value_t = 10_000)]
    pub geocoder_timeout_ms: u64,

    #[arg(long, default_value = "evaluation_reports")]
    pub report_dir: PathBuf,
}

impl EvaluateArgs {
    pub fn run_basic_metrics(&self) -> bool {
        self.basic_metrics || self.all
    }

    pub fn run_privacy_utility(&self) -> bool {
        self.privacy_utility || self.all
    }

    pub fn run_geocoding_distance(&self) -> bool {
        self.geocoding_distance || self.all
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub paths: DataPaths,

    #[arg(long, default_value = "moderation_decisions_baselines")]
    pub baselines_dir: PathBuf,

    #[arg(long, default_value = "moderation_decisions_prompted")]
    pub prompted_dir: PathBuf,

    #[arg(long, default_value = "moderation_decisions_finetuned")]
    pub finetuned_dir: PathBuf,

    #[arg(long, default_value = "api_distance_responses")]
    pub distance_cache_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_all_enables_every_experiment() {
        let cli = Cli::try_parse_from(["geomod-eval", "evaluate", "--all"]).unwrap();
        let Commands::Evaluate(args) = cli.command else {
            panic!("expected evaluate");
        };
        assert!(args.run_basic_metrics());
        assert!(args.run_privacy_utility());
        assert!(args.run_geocoding_distance());
        assert_eq!(args.bootstrap_samples, 500);
        assert_eq!(args.bootstrap_sample_size, 750);
        assert_eq!(args.cache_backend, CacheBackend::Jsonl);
    }

    #[test]
    fn ground_truth_accepts_custom_directories() {
        let cli = Cli::try_parse_from([
            "geomod-eval",
            "ground-truth",
            "--annotations-dir",
            "data/annotations",
        ])
        .unwrap();
        let Commands::GroundTruth(args) = cli.command else {
            panic!("expected ground-truth");
        };
        assert_eq!(args.paths.annotations_dir, PathBuf::from("data/annotations"));
        assert_eq!(
            args.paths.ground_truth_labels_dir,
            PathBuf::from("moderation_decisions_ground_truth")
        );
    }

    #[test]
    fn clap_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
