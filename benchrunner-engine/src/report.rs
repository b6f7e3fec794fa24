//! Benchmark reports and their renderings.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytesize::ByteSize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use serde::{Serialize, Serializer};

use crate::collector::MetricsSummary;
use crate::error::{Error, Result};
use crate::scenario::{DataStream, GeneratorSpec, Scenario};
use crate::stats::{DataStreamStats, DiskUsage, PipelineStatsMap, StatsRecord};

/// A typed benchmark value.
#[derive(Clone, Debug, PartialEq)]
pub enum BenchValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(u64),
    Duration(Duration),
}

impl BenchValue {
    /// Parses a value as reported by the load-test driver.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if let Ok(integer) = trimmed.parse() {
            return Self::Integer(integer);
        }
        if let Ok(float) = trimmed.parse::<f64>()
            && float.is_finite()
        {
            return Self::Float(float);
        }
        Self::Text(value.to_owned())
    }
}

impl fmt::Display for BenchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Bytes(value) => write!(f, "{}", ByteSize(*value)),
            Self::Duration(value) => write!(f, "{}", humantime::format_duration(*value)),
        }
    }
}

impl Serialize for BenchValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Float(value) => serializer.serialize_f64(*value),
            Self::Text(value) => serializer.serialize_str(value),
            Self::Bytes(value) => serializer.serialize_u64(*value),
            Self::Duration(value) => serializer.collect_str(&humantime::format_duration(*value)),
        }
    }
}

/// One row of the driver's CSV report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RallyStat {
    pub metric: String,
    pub task: String,
    pub value: BenchValue,
    pub unit: String,
}

impl RallyStat {
    /// The header row of the driver's report.
    pub fn is_header(&self) -> bool {
        self.metric == "Metric"
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportInfo {
    pub benchmark: String,
    pub description: String,
    pub run_id: String,
    pub package: String,
    pub start_ts: i64,
    pub end_ts: i64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub generated_corpora_file: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportParameters {
    pub package_version: String,
    pub data_stream: DataStream,
    pub corpora: Option<GeneratorSpec>,
}

/// The result of a rally benchmark.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub info: ReportInfo,
    pub parameters: ReportParameters,
    pub cluster_name: Option<String>,
    pub nodes: usize,
    pub data_stream_stats: Option<DataStreamStats>,
    pub ingest_pipeline_stats: BTreeMap<String, PipelineStatsMap>,
    pub disk_usage: Option<BTreeMap<String, DiskUsage>>,
    pub total_hits: i64,
    pub rally_stats: Vec<RallyStat>,
}

impl Report {
    pub fn new(
        benchmark: &str,
        corpora_file: &str,
        scenario: &Scenario,
        summary: MetricsSummary,
        rally_stats: Vec<RallyStat>,
    ) -> Self {
        let elapsed = (summary.collection_end_ts - summary.collection_start_ts).max(0);

        Self {
            info: ReportInfo {
                benchmark: benchmark.to_owned(),
                description: scenario.description.clone(),
                run_id: summary.run_id,
                package: scenario.package.clone(),
                start_ts: summary.collection_start_ts,
                end_ts: summary.collection_end_ts,
                duration: Duration::from_secs(elapsed as u64),
                generated_corpora_file: corpora_file.to_owned(),
            },
            parameters: ReportParameters {
                package_version: scenario.version.clone(),
                data_stream: scenario.data_stream.clone(),
                corpora: scenario.corpora.generator.clone(),
            },
            cluster_name: summary.cluster_name,
            nodes: summary.nodes,
            data_stream_stats: summary.data_stream_stats,
            ingest_pipeline_stats: summary.ingest_pipeline_stats,
            disk_usage: summary.disk_usage,
            total_hits: summary.total_hits,
            rally_stats,
        }
    }

    /// Renders the report as a series of tables.
    pub fn to_human(&self) -> String {
        let mut out = String::new();
        let info = &self.info;

        out.push_str(&render_table(
            "info",
            [
                ("benchmark", info.benchmark.clone()),
                ("description", info.description.clone()),
                ("run ID", info.run_id.clone()),
                ("package", info.package.clone()),
                ("start ts (s)", info.start_ts.to_string()),
                ("end ts (s)", info.end_ts.to_string()),
                ("duration", humantime::format_duration(info.duration).to_string()),
                ("generated corpora file", info.generated_corpora_file.clone()),
            ],
        ));

        let mut parameters = vec![
            ("package version", self.parameters.package_version.clone()),
            ("data_stream.name", self.parameters.data_stream.name.clone()),
        ];
        if let Some(generator) = &self.parameters.corpora {
            parameters.extend([
                ("corpora.generator.total_events", generator.total_events.to_string()),
                ("corpora.generator.template.path", generator.template.path.clone()),
                ("corpora.generator.template.raw", generator.template.raw.clone()),
                ("corpora.generator.template.type", generator.template.kind.clone()),
                ("corpora.generator.config.path", generator.config.path.clone()),
                ("corpora.generator.config.raw", raw_asset(&generator.config.raw)),
                ("corpora.generator.fields.path", generator.fields.path.clone()),
                ("corpora.generator.fields.raw", raw_asset(&generator.fields.raw)),
            ]);
        }
        out.push_str(&render_table("parameters", parameters));

        out.push_str(&render_table(
            "cluster info",
            [
                ("name", self.cluster_name.clone().unwrap_or_default()),
                ("nodes", self.nodes.to_string()),
            ],
        ));

        if let Some(stats) = &self.data_stream_stats {
            out.push_str(&render_table(
                "data stream stats",
                [
                    ("data stream", stats.data_stream.clone()),
                    ("approx total docs ingested", self.total_hits.to_string()),
                    ("backing indices", stats.backing_indices.to_string()),
                    ("store size bytes", stats.store_size_bytes.to_string()),
                    ("maximum ts (ms)", stats.maximum_timestamp.to_string()),
                ],
            ));
        }

        for (index, usage) in self.disk_usage.iter().flatten() {
            let fields = &usage.all_fields;
            let bytes = |value: u64| BenchValue::Bytes(value).to_string();
            out.push_str(&render_table(
                &format!("disk usage for index {index} (for all fields)"),
                [
                    ("total", bytes(fields.total_in_bytes)),
                    ("inverted_index.total", bytes(fields.inverted_index.total_in_bytes)),
                    ("inverted_index.stored_fields", bytes(fields.stored_fields_in_bytes)),
                    ("inverted_index.doc_values", bytes(fields.doc_values_in_bytes)),
                    ("inverted_index.points", bytes(fields.points_in_bytes)),
                    ("inverted_index.norms", bytes(fields.norms_in_bytes)),
                    ("inverted_index.term_vectors", bytes(fields.term_vectors_in_bytes)),
                    ("inverted_index.knn_vectors", bytes(fields.knn_vectors_in_bytes)),
                ],
            ));
        }

        for (node, pipelines) in &self.ingest_pipeline_stats {
            for (pipeline, stats) in pipelines {
                if stats.stats.count == 0 {
                    continue;
                }

                let mut rows = vec![("Totals".to_owned(), totals(&stats.stats))];
                for processor in &stats.processors {
                    let label = if processor.extra.is_empty() {
                        processor.kind.clone()
                    } else {
                        format!("{} ({})", processor.kind, processor.extra)
                    };
                    rows.push((label, totals(&processor.stats)));
                }

                out.push_str(&render_table(
                    &format!("pipeline {pipeline} stats in node {node}"),
                    rows,
                ));
            }
        }

        let rally_stats = self
            .rally_stats
            .iter()
            .filter(|stat| !stat.is_header())
            .map(|stat| {
                let value = if stat.unit.is_empty() {
                    stat.value.to_string()
                } else {
                    format!("{} {}", stat.value, stat.unit)
                };
                (stat.metric.clone(), value)
            });
        out.push_str(&render_table("rally stats", rally_stats));

        out
    }

    /// Renders the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|cause| Error::json("rendering JSON report", cause))
    }

    /// Wraps the report into a human rendering plus a JSON file under `rally/<run id>/`.
    pub fn into_reportable(self) -> Result<Reportable> {
        let package = self.info.package.clone();
        let json = self.to_json()?;

        Ok(Reportable::Multi {
            package: package.clone(),
            parts: vec![
                Reportable::Human {
                    package: package.clone(),
                    body: self.to_human(),
                },
                Reportable::File {
                    package,
                    filename: format!("rally/{}/report.json", self.info.run_id),
                    body: json.into_bytes(),
                },
            ],
        })
    }
}

fn raw_asset(raw: &serde_json::Map<String, serde_json::Value>) -> String {
    if raw.is_empty() {
        return String::new();
    }
    serde_json::Value::Object(raw.clone()).to_string()
}

fn totals(stats: &StatsRecord) -> String {
    let time = Duration::from_millis(stats.time_in_millis.max(0) as u64);
    format!(
        "Count: {} | Failed: {} | Time: {}",
        stats.count,
        stats.failed,
        humantime::format_duration(time)
    )
}

/// Renders a titled two-column table with right-aligned values.
fn render_table<K, V>(title: &str, rows: impl IntoIterator<Item = (K, V)>) -> String
where
    K: Into<String>,
    V: Into<String>,
{
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new(title)]);

    for (key, value) in rows {
        table.add_row(vec![Cell::new(key.into()), Cell::new(value.into())]);
    }
    if let Some(column) = table.column_mut(1) {
        column.set_cell_alignment(CellAlignment::Right);
    }

    format!("{table}\n")
}

/// A rendered report, ready to be written to an output sink.
#[derive(Clone, Debug, PartialEq)]
pub enum Reportable {
    /// Text meant for the terminal.
    Human { package: String, body: String },
    /// A file to be written below the results directory.
    File {
        package: String,
        filename: String,
        body: Vec<u8>,
    },
    /// Several reports produced by one run.
    Multi {
        package: String,
        parts: Vec<Reportable>,
    },
}

impl Reportable {
    pub fn package(&self) -> &str {
        match self {
            Self::Human { package, .. }
            | Self::File { package, .. }
            | Self::Multi { package, .. } => package,
        }
    }

    /// The report contents. Empty for [`Reportable::Multi`].
    pub fn report(&self) -> &[u8] {
        match self {
            Self::Human { body, .. } => body.as_bytes(),
            Self::File { body, .. } => body,
            Self::Multi { .. } => &[],
        }
    }

    /// The target file name, for file reports.
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::File { filename, .. } => Some(filename),
            _ => None,
        }
    }

    /// Flattens nested multi reports into their parts.
    pub fn split(self) -> Vec<Reportable> {
        match self {
            Self::Multi { parts, .. } => parts.into_iter().flat_map(Self::split).collect(),
            other => vec![other],
        }
    }
}
