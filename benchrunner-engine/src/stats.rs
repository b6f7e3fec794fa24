//! Typed models of the cluster statistics captured around a benchmark run.
//!
//! The parse functions in this module take raw response bodies of the stats APIs so that every
//! [`BackingStore`](crate::store::BackingStore) implementation shares one decoding path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{StoreError, StoreResult};

/// Counters of a measurable entity such as a pipeline or processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsRecord {
    pub count: i64,
    pub current: i64,
    pub failed: i64,
    pub time_in_millis: i64,
}

impl StatsRecord {
    /// Returns the counters accumulated between `start` and `self`.
    ///
    /// `current` is a gauge and is not carried over.
    pub fn since(&self, start: &Self) -> Self {
        Self {
            count: self.count - start.count,
            current: 0,
            failed: self.failed - start.failed,
            time_in_millis: self.time_in_millis - start.time_in_millis,
        }
    }
}

/// Stats of a single processor in a pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessorStats {
    #[serde(rename = "type")]
    pub kind: String,
    /// The part after `:` in compound identifiers such as `pipeline:inner`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra: String,
    #[serde(default)]
    pub conditional: bool,
    pub stats: StatsRecord,
}

/// Stats of a pipeline and its processors, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineStats {
    #[serde(flatten)]
    pub stats: StatsRecord,
    #[serde(default)]
    pub processors: Vec<ProcessorStats>,
}

/// Pipeline stats keyed by pipeline name.
pub type PipelineStatsMap = BTreeMap<String, PipelineStats>;

/// Size and extent of a data stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DataStreamStats {
    pub data_stream: String,
    pub backing_indices: u64,
    pub store_size_bytes: u64,
    pub maximum_timestamp: i64,
}

/// Node statistics of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodesStats {
    pub cluster_name: String,
    /// Stats keyed by node id.
    pub nodes: BTreeMap<String, NodeStats>,
}

/// Statistics of a single node. Sections other than the name are kept as returned.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NodeStats {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub sections: serde_json::Map<String, serde_json::Value>,
}

/// Disk usage of a single index, for all fields combined.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiskUsage {
    pub store_size_in_bytes: u64,
    pub all_fields: FieldsDiskUsage,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FieldsDiskUsage {
    pub total_in_bytes: u64,
    pub inverted_index: InvertedIndexUsage,
    pub stored_fields_in_bytes: u64,
    pub doc_values_in_bytes: u64,
    pub points_in_bytes: u64,
    pub norms_in_bytes: u64,
    pub term_vectors_in_bytes: u64,
    pub knn_vectors_in_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InvertedIndexUsage {
    pub total_in_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProcessor {
    #[serde(rename = "type")]
    kind: String,
    stats: StatsRecord,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPipelineStats {
    #[serde(flatten)]
    stats: StatsRecord,
    processors: Vec<BTreeMap<String, RawProcessor>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIngest {
    pipelines: BTreeMap<String, RawPipelineStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIngestNode {
    ingest: RawIngest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIngestResponse {
    nodes: BTreeMap<String, RawIngestNode>,
}

#[derive(Debug, Deserialize)]
struct DataStreamStatsResponse {
    #[serde(default)]
    data_streams: Vec<DataStreamStats>,
}

/// Unwraps a processor given as `{ "<type>[:<extra>]": { "type": ..., "stats": ... } }`.
fn extract_processor(wrapped: BTreeMap<String, RawProcessor>) -> StoreResult<ProcessorStats> {
    let keys: Vec<String> = wrapped.keys().cloned().collect();
    let mut entries = wrapped.into_iter();
    let (identifier, raw) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(StoreError::Unexpected(format!(
                "can't extract processor stats, need a single key in the processor identifier, got {}: {keys:?}",
                keys.len()
            )));
        }
    };
    let (kind, extra) = match identifier.split_once(':') {
        Some((kind, extra)) => (kind.to_owned(), extra.to_owned()),
        None => (identifier.clone(), String::new()),
    };

    let conditional = if raw.kind == kind {
        false
    } else if raw.kind == "conditional" {
        true
    } else {
        return Err(StoreError::Unexpected(format!(
            "can't understand processor identifier '{identifier}' with type '{}'",
            raw.kind
        )));
    };

    Ok(ProcessorStats {
        kind,
        extra,
        conditional,
        stats: raw.stats,
    })
}

fn extract_pipeline(raw: RawPipelineStats) -> StoreResult<PipelineStats> {
    let processors = raw
        .processors
        .into_iter()
        .enumerate()
        .map(|(index, wrapped)| {
            extract_processor(wrapped).map_err(|error| {
                StoreError::Unexpected(format!("extracting processor {index}: {error}"))
            })
        })
        .collect::<StoreResult<_>>()?;

    Ok(PipelineStats {
        stats: raw.stats,
        processors,
    })
}

/// Parses a `nodes.*.ingest.pipelines` response, keeping pipelines whose name starts with
/// `prefix`. The result is keyed by node id.
pub fn parse_pipeline_stats(
    body: &[u8],
    prefix: &str,
) -> StoreResult<BTreeMap<String, PipelineStatsMap>> {
    let response: RawIngestResponse = serde_json::from_slice(body).map_err(|cause| {
        StoreError::Serde {
            context: "error decoding node stats response".to_owned(),
            cause,
        }
    })?;

    let mut stats = BTreeMap::new();
    for (node, raw) in response.nodes {
        let mut pipelines = PipelineStatsMap::new();
        for (name, pipeline) in raw.ingest.pipelines {
            if !name.starts_with(prefix) {
                continue;
            }
            let pipeline = extract_pipeline(pipeline).map_err(|error| {
                StoreError::Unexpected(format!("converting pipeline {name}: {error}"))
            })?;
            pipelines.insert(name, pipeline);
        }
        stats.insert(node, pipelines);
    }

    Ok(stats)
}

/// Parses a data stream stats response and returns the entry for `data_stream`.
pub fn parse_data_stream_stats(body: &[u8], data_stream: &str) -> StoreResult<DataStreamStats> {
    let response: DataStreamStatsResponse =
        serde_json::from_slice(body).map_err(|cause| StoreError::Serde {
            context: "error decoding data stream stats response".to_owned(),
            cause,
        })?;

    response
        .data_streams
        .into_iter()
        .find(|stats| stats.data_stream == data_stream)
        .ok_or_else(|| {
            StoreError::Unexpected(format!("no stats returned for data stream {data_stream}"))
        })
}

/// Parses a disk usage response into per-index usage, skipping `_shards` and similar keys.
pub fn parse_disk_usage(body: &[u8]) -> StoreResult<BTreeMap<String, DiskUsage>> {
    let response: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(body).map_err(|cause| StoreError::Serde {
            context: "error decoding disk usage response".to_owned(),
            cause,
        })?;

    response
        .into_iter()
        .filter(|(index, _)| !index.starts_with('_'))
        .map(|(index, usage)| {
            serde_json::from_value(usage)
                .map(|usage| (index.clone(), usage))
                .map_err(|cause| StoreError::Serde {
                    context: format!("error decoding disk usage of index {index}"),
                    cause,
                })
        })
        .collect()
}
