use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::granularity::Granularity;
use crate::metrics::{BinaryScores, BootstrapSummary, DistanceThresholdCounts};

/// Where an agent's results came from; decides table order and tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentGroup {
    Baseline,
    Prompted,
    Finetuned,
}

impl AgentGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Prompted => "prompted",
            Self::Finetuned => "finetuned",
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Baseline => "(baseline)",
            Self::Prompted => "(prompted agent)",
            Self::Finetuned => "(finetuned agent)",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BasicMetricsRow {
    pub model: String,
    pub group: AgentGroup,
    #[serde(flatten)]
    pub scores: BinaryScores,
    #[serde(flatten)]
    pub bootstrap: BootstrapSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrivacyUtilityRow {
    pub model: String,
    pub group: AgentGroup,
    pub withheld_proportion: f64,
    pub leaked_proportion: f64,
    pub withheld_total: usize,
    pub leaked_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeocodingDistanceRow {
    pub model: String,
    pub group: AgentGroup,
    pub counts: DistanceThresholdCounts,
}

/// Everything one `evaluate` run produced, keyed by granularity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub basic_metrics: BTreeMap<Granularity, Vec<BasicMetricsRow>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub privacy_utility: BTreeMap<Granularity, Vec<PrivacyUtilityRow>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub geocoding_distance: BTreeMap<Granularity, Vec<GeocodingDistanceRow>>,
}

trait ReportRow {
    fn model(&self) -> &str;
    fn group(&self) -> AgentGroup;
}

macro_rules! impl_report_row {
    ($($row:ty),*) => {
        $(impl ReportRow for $row {
            fn model(&self) -> &str {
                &self.model
            }

            fn group(&self) -> AgentGroup {
                self.group
            }
        })*
    };
}

impl_report_row!(BasicMetricsRow, PrivacyUtilityRow, GeocodingDistanceRow);

/// Baselines, then prompted agents, then finetuned agents; by name within a group.
fn ordered<R: ReportRow>(rows: &[R]) -> Vec<&R> {
    let mut ordered: Vec<&R> = rows.iter().collect();
    ordered.sort_by(|a, b| a.group().cmp(&b.group()).then_with(|| a.model().cmp(b.model())));
    ordered
}

/// Model name without its `_<granularity>` suffix.
pub fn display_model_name(model: &str, granularity: Granularity) -> &str {
    model
        .strip_suffix(granularity.as_str())
        .and_then(|rest| rest.strip_suffix('_'))
        .unwrap_or(model)
}

fn agent_cell<R: ReportRow>(row: &R, granularity: Granularity) -> String {
    format!(
        "{} {}",
        row.group().tag(),
        display_model_name(row.model(), granularity)
    )
}

struct TextTable<'a> {
    title: &'a str,
    headers: Vec<String>,
    widths: Vec<usize>,
}

impl TextTable<'_> {
    fn rule(&self) -> String {
        "=".repeat(self.widths.iter().sum::<usize>() + self.widths.len().saturating_sub(1))
    }

    fn write_line<W: Write>(&self, out: &mut W, cells: &[String]) -> io::Result<()> {
        let line = cells
            .iter()
            .zip(&self.widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "{}", line.trim_end())
    }

    fn write<W: Write>(
        &self,
        out: &mut W,
        sections: &[(Granularity, Vec<Vec<String>>)],
    ) -> io::Result<()> {
        let rule = self.rule();
        writeln!(out, "{rule}")?;
        writeln!(out, "{}", self.title)?;
        writeln!(out, "{rule}")?;

        for (granularity, rows) in sections {
            writeln!(out, "{rule}")?;
            writeln!(out, "Granularity: {}", granularity.display_name())?;
            writeln!(out, "{rule}")?;
            self.write_line(out, &self.headers)?;
            writeln!(out, "{rule}")?;
            for row in rows {
                self.write_line(out, row)?;
            }
            writeln!(out, "{rule}")?;
            writeln!(out)?;
        }
        Ok(())
    }
}

pub fn write_basic_metrics_table<W: Write>(
    out: &mut W,
    results: &BTreeMap<Granularity, Vec<BasicMetricsRow>>,
) -> io::Result<()> {
    let table = TextTable {
        title: "Experiment #1: Basic Metrics",
        headers: ["Agent", "Recall", "Precision", "F1", "Bootstrap F1"]
            .map(String::from)
            .to_vec(),
        widths: vec![65, 10, 10, 10, 20],
    };

    let sections: Vec<(Granularity, Vec<Vec<String>>)> = results
        .iter()
        .map(|(granularity, rows)| {
            let lines = ordered(rows)
                .into_iter()
                .map(|row| {
                    vec![
                        agent_cell(row, *granularity),
                        format!("{:.2}", row.scores.recall),
                        format!("{:.2}", row.scores.precision),
                        format!("{:.2}", row.scores.f1),
                        format!("{:.2} +/- {:.2}", row.bootstrap.mean_f1, row.bootstrap.std_f1),
                    ]
                })
                .collect();
            (*granularity, lines)
        })
        .collect();

    table.write(out, &sections)
}

pub fn write_privacy_utility_table<W: Write>(
    out: &mut W,
    results: &BTreeMap<Granularity, Vec<PrivacyUtilityRow>>,
) -> io::Result<()> {
    let table = TextTable {
        title: "Experiment #2: Privacy-Utility Tradeoff",
        headers: ["Agent", "Withheld Proportion", "Leaked Proportion"]
            .map(String::from)
            .to_vec(),
        widths: vec![60, 20, 20],
    };

    let sections: Vec<(Granularity, Vec<Vec<String>>)> = results
        .iter()
        .map(|(granularity, rows)| {
            let lines = ordered(rows)
                .into_iter()
                .map(|row| {
                    vec![
                        agent_cell(row, *granularity),
                        format!("{:.2}", row.withheld_proportion),
                        format!("{:.2}", row.leaked_proportion),
                    ]
                })
                .collect();
            (*granularity, lines)
        })
        .collect();

    table.write(out, &sections)
}

fn format_threshold(threshold_km: f64) -> String {
    if threshold_km.fract() == 0.0 {
        format!("Within {threshold_km:.0} Km")
    } else {
        format!("Within {threshold_km} Km")
    }
}

pub fn write_geocoding_distance_table<W: Write>(
    out: &mut W,
    results: &BTreeMap<Granularity, Vec<GeocodingDistanceRow>>,
) -> io::Result<()> {
    let thresholds = DistanceThresholdCounts::default();
    let mut headers = vec!["Agent".to_string()];
    headers.extend(
        thresholds
            .thresholds
            .iter()
            .map(|bucket| format_threshold(bucket.threshold_km)),
    );
    let mut widths = vec![65];
    widths.extend(std::iter::repeat_n(15, thresholds.thresholds.len()));

    let table = TextTable {
        title: "Experiment #3: Geocoding Distance Error",
        headers,
        widths,
    };

    let sections: Vec<(Granularity, Vec<Vec<String>>)> = results
        .iter()
        .map(|(granularity, rows)| {
            let lines = ordered(rows)
                .into_iter()
                .map(|row| {
                    let mut cells = vec![agent_cell(row, *granularity)];
                    cells.extend(
                        row.counts
                            .percentages()
                            .into_iter()
                            .map(|(_, percent)| format!("{percent:.1} %")),
                    );
                    cells
                })
                .collect();
            (*granularity, lines)
        })
        .collect();

    table.write(out, &sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn privacy_row(model: &str, group: AgentGroup) -> PrivacyUtilityRow {
        PrivacyUtilityRow {
            model: model.to_string(),
            group,
            withheld_proportion: 0.25,
            leaked_proportion: 0.5,
            withheld_total: 4,
            leaked_total: 2,
        }
    }

    #[test]
    fn rows_are_ordered_by_group_then_name() {
        let rows = vec![
            privacy_row("b_city", AgentGroup::Finetuned),
            privacy_row("z_city", AgentGroup::Baseline),
            privacy_row("a_city", AgentGroup::Prompted),
            privacy_row("c_city", AgentGroup::Baseline),
        ];
        let names: Vec<&str> = ordered(&rows).into_iter().map(|row| row.model.as_str()).collect();
        assert_eq!(names, vec!["c_city", "z_city", "a_city", "b_city"]);
    }

    #[test]
    fn display_name_strips_only_the_granularity_suffix() {
        assert_eq!(display_model_name("gpt4_city", Granularity::City), "gpt4");
        assert_eq!(
            display_model_name("llava_exact_location_name", Granularity::ExactLocationName),
            "llava"
        );
        assert_eq!(display_model_name("velocity", Granularity::City), "velocity");
    }

    #[test]
    fn privacy_table_renders_tagged_rows() {
        let mut results = BTreeMap::new();
        results.insert(
            Granularity::City,
            vec![privacy_row("gpt4_city", AgentGroup::Prompted)],
        );

        let mut out = Vec::new();
        write_privacy_utility_table(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Experiment #2: Privacy-Utility Tradeoff"));
        assert!(text.contains("Granularity: City"));
        assert!(text.contains("(prompted agent) gpt4"));
        assert!(text.contains("0.25"));
        assert!(text.contains("0.50"));
    }

    #[test]
    fn distance_table_lists_every_threshold() {
        let mut counts = DistanceThresholdCounts::default();
        counts.record(Some(0.05));
        counts.record(Some(10_000.0));
        let mut results = BTreeMap::new();
        results.insert(
            Granularity::Country,
            vec![GeocodingDistanceRow {
                model: "m_country".to_string(),
                group: AgentGroup::Baseline,
                counts,
            }],
        );

        let mut out = Vec::new();
        write_geocoding_distance_table(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Within 0.1 Km"));
        assert!(text.contains("Within 2500 Km"));
        assert!(text.contains("50.0 %"));
    }
}
