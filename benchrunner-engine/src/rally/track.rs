//! Track files for the load-test driver.
//!
//! Tracks are rendered from one of two templates. Values are substituted at `[[.Key]]` markers;
//! `{{ ... }}` expressions are left in place for the driver to evaluate.

use serde_json::{Value, json};

use crate::error::{Error, Result};

const TSDB_TRACK_TEMPLATE: &str = r#"{% import "rally.helpers" as rally with context %}
{
    "version": 2,
    "description": "Track for [[.DataStream]]",
    "datastream": [
        {
            "name": "[[.DataStream]]",
            "body": "[[.CorpusFilename]]"
        }
    ],
    "corpora": [
        {
            "name": "[[.CorpusFilename]]",
            "documents": [
                {
                    "target-data-stream": "[[.DataStream]]",
                    "source-file": "[[.CorpusFilename]]",
                    "document-count": [[.CorpusDocsCount]],
                    "uncompressed-bytes": [[.CorpusSizeInBytes]]
                }
            ]
        }
    ],
    "schedule": [
        {
            "operation": {
                "operation-type": "create-composable-template",
                "template": "[[.ComposableTemplate]]",
                "body": [[.IndexTemplate]]
            },
            "clients": 1
        },
        {
            "operation": {
                "operation-type": "bulk",
                "bulk-size": {{bulk_size | default(5000)}},
                "ingest-percentage": {{ingest_percentage | default(100)}}
            },
            "clients": {{bulk_indexing_clients | default(8)}}
        },
        {
            "operation": {
                "operation-type": "delete-composable-template",
                "template": "[[.ComposableTemplate]]",
                "only-if-exists": true,
                "delete-matching-indices": false,
                "index_patterns": ["[[.IndexPattern]]"]
            },
            "clients": 1
        }
    ]
}"#;

const TRACK_TEMPLATE: &str = r#"{% import "rally.helpers" as rally with context %}
{
    "version": 2,
    "description": "Track for [[.DataStream]]",
    "datastream": [
        {
            "name": "[[.DataStream]]",
            "body": "[[.CorpusFilename]]"
        }
    ],
    "corpora": [
        {
            "name": "[[.CorpusFilename]]",
            "documents": [
                {
                    "target-data-stream": "[[.DataStream]]",
                    "source-file": "[[.CorpusFilename]]",
                    "document-count": [[.CorpusDocsCount]],
                    "uncompressed-bytes": [[.CorpusSizeInBytes]]
                }
            ]
        }
    ],
    "schedule": [
        {
            "operation": {
                "operation-type": "bulk",
                "bulk-size": {{bulk_size | default(500)}},
                "ingest-percentage": {{ingest_percentage | default(100)}}
            },
            "clients": {{bulk_indexing_clients | default(1)}}
        }
    ]
}"#;

/// Inputs of a rendered track.
#[derive(Clone, Debug, Default)]
pub struct TrackParams<'a> {
    pub data_stream: &'a str,
    /// File name of the corpus, relative to the track.
    pub corpus_filename: &'a str,
    pub corpus_docs_count: u64,
    pub corpus_size_in_bytes: u64,
    /// Serialized composable template installed before indexing. Time-series data streams only.
    pub index_template: Option<&'a str>,
}

/// Renders the track for `params`.
///
/// Time-series data streams get a track that installs `index_template` before indexing and
/// removes it afterwards.
pub fn render_track(params: &TrackParams<'_>) -> Result<String> {
    let (template, index_template) = match params.index_template {
        Some(index_template) => (TSDB_TRACK_TEMPLATE, index_template),
        None => (TRACK_TEMPLATE, ""),
    };

    let docs_count = params.corpus_docs_count.to_string();
    let size = params.corpus_size_in_bytes.to_string();
    render(
        template,
        &[
            ("DataStream", params.data_stream),
            ("CorpusFilename", params.corpus_filename),
            ("CorpusDocsCount", &docs_count),
            ("CorpusSizeInBytes", &size),
            ("ComposableTemplate", params.data_stream),
            ("IndexPattern", params.data_stream),
            ("IndexTemplate", index_template),
        ],
    )
}

/// Substitutes every `[[.Key]]` marker in `template`.
fn render(template: &str, values: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("[[") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("]]")
            .ok_or_else(|| Error::Data("unclosed action in track template".to_owned()))?;

        let key = after[..end].trim();
        let key = key.strip_prefix('.').unwrap_or(key);
        let value = values
            .iter()
            .find_map(|(name, value)| (*name == key).then_some(*value))
            .ok_or_else(|| Error::Data(format!("unknown key `{key}` in track template")))?;

        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Turns the simulated index template of a time-series data stream into one that applies to the
/// benchmark data stream, accepting documents with any timestamp in this century.
pub fn rewrite_index_template(mut simulated: Value, index_template: &str) -> Result<Value> {
    let template = simulated
        .as_object_mut()
        .ok_or_else(|| {
            Error::Data(format!(
                "simulated template {index_template} is not an object"
            ))
        })?;

    template.insert("priority".to_owned(), json!(1000));
    template.insert(
        "index_patterns".to_owned(),
        json!([format!("{index_template}-ep")]),
    );
    template.remove("overlapping");

    let index_settings = template
        .get_mut("template")
        .and_then(|template| template.get_mut("settings"))
        .and_then(|settings| settings.get_mut("index"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            Error::Data(format!(
                "simulated template {index_template} has no template.settings.index"
            ))
        })?;

    index_settings.insert(
        "time_series".to_owned(),
        json!({
            "start_time": "2000-01-01T00:00:00Z",
            "end_time": "2099-12-31T23:59:59Z",
        }),
    );

    Ok(simulated)
}
