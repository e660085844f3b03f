use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EvalError, EvalResult};

/// Binary moderation label. `Yes` means the turn should be moderated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ModerationLabel {
    Yes,
    No,
}

impl ModerationLabel {
    pub fn parse(raw: &str, context: &str) -> EvalResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            _ => Err(EvalError::schema(
                context,
                format!("label must be Yes or No, found {raw:?}"),
            )),
        }
    }

    pub fn from_revealed(revealed: bool) -> Self {
        if revealed { Self::Yes } else { Self::No }
    }

    pub fn is_positive(self) -> bool {
        self == Self::Yes
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "Yes",
            Self::No => "No",
        }
    }
}

/// One line of an agent's moderation decisions file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub question_id: String,
    pub predicted: String,
}

impl PredictionRecord {
    pub fn label(&self) -> EvalResult<ModerationLabel> {
        ModerationLabel::parse(&self.predicted, &self.question_id)
    }

    /// The agent let the turn through when it did not ask for moderation.
    pub fn included(&self) -> EvalResult<bool> {
        Ok(!self.label()?.is_positive())
    }
}

/// One line of a per-granularity ground-truth label file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthLabelRecord {
    pub question_id: String,
    pub ground_truth: String,
}

/// `<image_id>_<turn>` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionId {
    pub image_id: String,
    pub turn: usize,
}

impl QuestionId {
    pub fn parse(raw: &str) -> EvalResult<Self> {
        let (image_id, turn) = raw.rsplit_once('_').ok_or_else(|| {
            EvalError::schema(raw, "question_id must look like <image_id>_<turn>")
        })?;
        let turn = turn
            .parse::<usize>()
            .map_err(|_| EvalError::schema(raw, format!("invalid turn number: {turn:?}")))?;
        if image_id.is_empty() || turn == 0 {
            return Err(EvalError::schema(raw, "question_id has an empty image id or turn 0"));
        }
        Ok(Self {
            image_id: image_id.to_string(),
            turn,
        })
    }

    pub fn format(image_id: &str, turn: usize) -> String {
        format!("{image_id}_{turn}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationMessage {
    pub role: String,
    #[serde(default)]
    pub location_data: Option<Value>,
}

/// Dialogue annotation as delivered by the dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationRecord {
    pub image_path: String,
    pub messages: Vec<AnnotationMessage>,
}

impl AnnotationRecord {
    /// File stem of `image_path`.
    pub fn image_id(&self) -> String {
        let filename = self.image_path.rsplit('/').next().unwrap_or(&self.image_path);
        filename
            .strip_suffix(".jpg")
            .or_else(|| filename.rsplit_once('.').map(|(stem, _)| stem))
            .unwrap_or(filename)
            .to_string()
    }
}

/// True location of an image from `ground_truth_location_data.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthLocation {
    #[serde(default, deserialize_with = "deserialize_coordinate")]
    pub latitude: String,
    #[serde(default, deserialize_with = "deserialize_coordinate")]
    pub longitude: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl GroundTruthLocation {
    pub fn coordinates(&self, image_id: &str) -> EvalResult<Option<(f64, f64)>> {
        if self.latitude.is_empty() || self.longitude.is_empty() {
            return Ok(None);
        }
        let parse = |raw: &str| {
            raw.parse::<f64>().map_err(|_| {
                EvalError::schema(image_id, format!("ground-truth coordinate is not numeric: {raw:?}"))
            })
        };
        Ok(Some((parse(&self.latitude)?, parse(&self.longitude)?)))
    }
}

fn deserialize_coordinate<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "coordinate must be a string or number, found {other}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultFileEntry {
    pub model: String,
    pub group: String,
    pub granularity: String,
    pub path: String,
    pub sha256: String,
}

/// Written next to the report tables for every `evaluate` run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub started_at: String,
    pub completed_at: String,
    pub experiments: Vec<String>,
    pub bootstrap_samples: usize,
    pub bootstrap_sample_size: usize,
    pub bootstrap_seed: u64,
    pub cache_backend: String,
    pub recompute_geocoding: bool,
    pub result_files: Vec<ResultFileEntry>,
    pub warnings: Vec<String>,
}
