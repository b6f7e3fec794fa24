//! Metrics collection around a benchmark run.
//!
//! A [`Collector`] captures a snapshot of cluster, data stream and ingest pipeline statistics
//! when it starts, and a second one when it is stopped. Both snapshots, and optionally
//! intermediate ones, are published to the metrics store. [`summarize`] reduces the two
//! captures to the deltas reported for the run.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::scenario::Scenario;
use crate::stats::{
    DataStreamStats, DiskUsage, NodesStats, PipelineStats, PipelineStatsMap, ProcessorStats,
};
use crate::store::{BackingStore, StoreResult, create_action};

/// Identifies the benchmark run a document or metrics event belongs to.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BenchMeta {
    pub info: BenchInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Scenario>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BenchInfo {
    pub benchmark: String,
    pub run_id: String,
}

impl BenchMeta {
    pub fn new(benchmark: &str, run_id: &str) -> Self {
        Self {
            info: BenchInfo {
                benchmark: benchmark.to_owned(),
                run_id: run_id.to_owned(),
            },
            parameter: None,
        }
    }

    /// Attaches the scenario parameters to the metadata.
    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.parameter = Some(scenario);
        self
    }
}

/// Statistics captured at one point in time. Each part is `None` if it could not be fetched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub data_stream: Option<DataStreamStats>,
    pub nodes: Option<NodesStats>,
    /// Ingest pipeline stats keyed by node id.
    pub pipelines: Option<BTreeMap<String, PipelineStatsMap>>,
    /// Disk usage per backing index. Only captured at the end of a run.
    pub disk_usage: Option<BTreeMap<String, DiskUsage>>,
    pub total_hits: u64,
}

/// Deltas between the start and end captures of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub run_id: String,
    pub cluster_name: Option<String>,
    pub nodes: usize,
    pub collection_start_ts: i64,
    pub collection_end_ts: i64,
    pub data_stream_stats: Option<DataStreamStats>,
    /// Per node, per pipeline deltas.
    pub ingest_pipeline_stats: BTreeMap<String, PipelineStatsMap>,
    pub disk_usage: Option<BTreeMap<String, DiskUsage>>,
    pub total_hits: i64,
}

/// Settings of a [`Collector`].
#[derive(Debug)]
pub struct CollectorOptions {
    /// The store under benchmark.
    pub store: Arc<dyn BackingStore>,
    /// Where snapshots are published. Nothing is published without one.
    pub metrics_store: Option<Arc<dyn BackingStore>>,
    pub data_stream: String,
    pub pipeline_prefix: String,
    pub run_id: String,
    pub metadata: BenchMeta,
    /// Publish intermediate snapshots at this interval while running.
    pub interval: Option<Duration>,
}

#[derive(Debug)]
struct Shared {
    options: CollectorOptions,
    end_captures: AtomicUsize,
}

/// Captures metrics before and after a benchmark run.
#[derive(Debug)]
pub struct Collector {
    shared: Arc<Shared>,
    start: Option<MetricsSnapshot>,
    stopped: AtomicBool,
    stop_signal: CancellationToken,
    task: Mutex<Option<JoinHandle<MetricsSnapshot>>>,
    end: OnceLock<MetricsSnapshot>,
}

impl Collector {
    pub fn new(options: CollectorOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                end_captures: AtomicUsize::new(0),
            }),
            start: None,
            stopped: AtomicBool::new(false),
            stop_signal: CancellationToken::new(),
            task: Mutex::new(None),
            end: OnceLock::new(),
        }
    }

    /// Name of the metrics store index snapshots are published to.
    pub fn metrics_index(&self) -> String {
        let options = &self.shared.options;
        format!("bench-metrics-{}-{}", options.data_stream, options.run_id)
    }

    /// Captures the start snapshot and spawns the background task.
    ///
    /// The end snapshot is captured once [`stop`](Self::stop) is called or `token` is cancelled.
    pub async fn start(&mut self, token: &CancellationToken) {
        if self.start.is_some() {
            tracing::warn!("metrics collector already started");
            return;
        }

        self.create_metrics_index().await;

        let start = self.shared.capture(false).await;
        let metrics_index = self.metrics_index();
        self.shared.publish(&metrics_index, &start).await;
        self.start = Some(start);

        let shared = self.shared.clone();
        let stop_signal = self.stop_signal.clone();
        let token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = shared.options.interval.map(|interval| {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let tick = async {
                    match ticker.as_mut() {
                        Some(ticker) => ticker.tick().await,
                        None => std::future::pending::<tokio::time::Instant>().await,
                    }
                };

                tokio::select! {
                    _ = stop_signal.cancelled() => break,
                    _ = token.cancelled() => break,
                    _ = tick => {
                        let snapshot = shared.snapshot().await;
                        shared.publish(&metrics_index, &snapshot).await;
                    }
                }
            }

            let end = shared.capture(true).await;
            shared.publish(&metrics_index, &end).await;
            end
        });

        *self.task.lock().await = Some(handle);
    }

    /// Stops collection and waits until the end snapshot is captured.
    ///
    /// Safe to call concurrently and repeatedly; the end capture runs once.
    pub async fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_signal.cancel();
        }

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            match handle.await {
                Ok(end) => {
                    let _ = self.end.set(end);
                }
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "metrics collection task failed"
                    );
                }
            }
        }
    }

    /// Number of times the end snapshot was captured.
    pub fn end_captures(&self) -> usize {
        self.shared.end_captures.load(Ordering::SeqCst)
    }

    pub fn start_snapshot(&self) -> Option<&MetricsSnapshot> {
        self.start.as_ref()
    }

    pub fn end_snapshot(&self) -> Option<&MetricsSnapshot> {
        self.end.get()
    }

    /// Summarizes the run. Fails unless the collector was started and stopped.
    pub fn summary(&self) -> Result<MetricsSummary> {
        match (self.start.as_ref(), self.end.get()) {
            (Some(start), Some(end)) => Ok(summarize(&self.shared.options.run_id, start, end)),
            _ => Err(Error::Data(
                "metrics collection has not been started and stopped".to_owned(),
            )),
        }
    }

    async fn create_metrics_index(&self) {
        let Some(metrics_store) = &self.shared.options.metrics_store else {
            return;
        };

        let index = self.metrics_index();
        tracing::debug!(index, "creating index in metricstore");
        if let Err(error) = metrics_store.create_index(&index, &metrics_index_body()).await {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                index,
                "could not create metrics index"
            );
        }
    }
}

impl Shared {
    /// Data stream and node stats only.
    async fn snapshot(&self) -> MetricsSnapshot {
        let store = &self.options.store;
        MetricsSnapshot {
            timestamp: unix_now(),
            nodes: log_missing(store.nodes_stats().await, "could not get node stats"),
            data_stream: log_missing(
                store.data_stream_stats(&self.options.data_stream).await,
                "could not get data stream stats",
            ),
            ..Default::default()
        }
    }

    async fn capture(&self, end: bool) -> MetricsSnapshot {
        let store = &self.options.store;
        let data_stream = &self.options.data_stream;

        if let Err(error) = store.refresh(data_stream).await {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                data_stream,
                end,
                "unable to refresh data stream"
            );
        }

        let disk_usage = if end {
            log_missing(
                store.disk_usage(data_stream).await,
                "could not get disk usage metrics",
            )
        } else {
            None
        };
        let total_hits = match store.count(data_stream).await {
            Ok(hits) => hits,
            Err(error) => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    "could not get total hits"
                );
                0
            }
        };

        let mut snapshot = self.snapshot().await;
        snapshot.disk_usage = disk_usage;
        snapshot.total_hits = total_hits;
        snapshot.pipelines = log_missing(
            store
                .pipeline_stats_by_prefix(&self.options.pipeline_prefix)
                .await,
            "could not get ingest pipeline metrics",
        );

        if end {
            self.end_captures.fetch_add(1, Ordering::SeqCst);
        }
        snapshot
    }

    async fn publish(&self, index: &str, snapshot: &MetricsSnapshot) {
        let Some(metrics_store) = &self.options.metrics_store else {
            return;
        };

        let mut body = String::new();
        for event in events(snapshot, &self.options.metadata) {
            body.push_str(&create_action(index));
            body.push_str(&event.to_string());
            body.push('\n');
        }

        match metrics_store.bulk(Bytes::from(body)).await {
            Ok(response) if response.errors => tracing::error!(
                index,
                failed = response.failed_items(),
                "error indexing events in metricstore"
            ),
            Ok(_) => {}
            Err(error) => tracing::error!(
                error = &error as &dyn std::error::Error,
                index,
                "error indexing events in metricstore"
            ),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

fn log_missing<T>(result: StoreResult<T>, message: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(error = %error, source = ?error.source(), "{message}");
            None
        }
    }
}

fn metrics_index_body() -> Value {
    json!({
        "settings": { "number_of_replicas": 0 },
        "mappings": {
            "date_detection": false,
            "dynamic_templates": [{
                "strings_as_keyword": {
                    "match_mapping_type": "string",
                    "mapping": { "type": "keyword", "ignore_above": 1024 }
                }
            }],
            "properties": { "@timestamp": { "type": "date" } }
        }
    })
}

fn merge(event: &mut Value, value: impl Serialize) {
    if let (Some(event), Ok(Value::Object(fields))) =
        (event.as_object_mut(), serde_json::to_value(value))
    {
        event.extend(fields);
    }
}

/// Builds one event per node plus one data stream event from `snapshot`.
fn events(snapshot: &MetricsSnapshot, metadata: &BenchMeta) -> Vec<Value> {
    let timestamp = snapshot.timestamp * 1000;
    let mut events = Vec::new();

    if let Some(nodes) = &snapshot.nodes {
        for (id, stats) in &nodes.nodes {
            let node_name = if stats.name.is_empty() { id } else { &stats.name };
            let mut event = json!({
                "@timestamp": timestamp,
                "cluster_name": nodes.cluster_name,
                "node_name": node_name,
            });
            merge(&mut event, &stats.sections);
            merge(&mut event, json!({ "benchmark_metadata": metadata }));
            events.push(event);
        }
    }

    let mut event = json!({ "@timestamp": timestamp });
    if let Some(data_stream) = &snapshot.data_stream {
        merge(&mut event, data_stream);
    }
    merge(&mut event, json!({ "benchmark_metadata": metadata }));
    events.push(event);

    events
}

fn pipeline_delta(
    node: &str,
    name: &str,
    start: &PipelineStats,
    end: &PipelineStats,
) -> PipelineStats {
    let processors = end
        .processors
        .iter()
        .enumerate()
        .filter_map(|(index, end_processor)| {
            let Some(start_processor) = start.processors.get(index) else {
                tracing::debug!(
                    node,
                    pipeline = name,
                    index,
                    "processor not found in initial metrics"
                );
                return None;
            };
            Some(ProcessorStats {
                kind: end_processor.kind.clone(),
                extra: end_processor.extra.clone(),
                conditional: end_processor.conditional,
                stats: end_processor.stats.since(&start_processor.stats),
            })
        })
        .collect();

    PipelineStats {
        stats: end.stats.since(&start.stats),
        processors,
    }
}

/// Computes the deltas between a start and an end capture.
///
/// Nodes and pipelines that only appear at the end are skipped. The cluster name comes from the
/// start capture; node count, data stream stats and disk usage from the end capture.
pub fn summarize(run_id: &str, start: &MetricsSnapshot, end: &MetricsSnapshot) -> MetricsSummary {
    let mut ingest_pipeline_stats = BTreeMap::new();

    for (node, end_pipelines) in end.pipelines.iter().flatten() {
        let Some(start_pipelines) = start.pipelines.as_ref().and_then(|p| p.get(node)) else {
            tracing::debug!(node, "node not found in initial metrics");
            continue;
        };

        let mut deltas = PipelineStatsMap::new();
        for (name, end_stats) in end_pipelines {
            let Some(start_stats) = start_pipelines.get(name) else {
                tracing::debug!(
                    node,
                    pipeline = name,
                    "pipeline not found in node initial metrics"
                );
                continue;
            };
            deltas.insert(name.clone(), pipeline_delta(node, name, start_stats, end_stats));
        }
        ingest_pipeline_stats.insert(node.clone(), deltas);
    }

    MetricsSummary {
        run_id: run_id.to_owned(),
        cluster_name: start.nodes.as_ref().map(|nodes| nodes.cluster_name.clone()),
        nodes: end.nodes.as_ref().map_or(0, |nodes| nodes.nodes.len()),
        collection_start_ts: start.timestamp,
        collection_end_ts: end.timestamp,
        data_stream_stats: end.data_stream.clone(),
        ingest_pipeline_stats,
        disk_usage: end.disk_usage.clone(),
        total_hits: end.total_hits as i64 - start.total_hits as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{NodeStats, StatsRecord};

    fn record(count: i64, failed: i64, time_in_millis: i64) -> StatsRecord {
        StatsRecord {
            count,
            current: 0,
            failed,
            time_in_millis,
        }
    }

    fn pipelines(entries: &[(&str, &str, StatsRecord)]) -> BTreeMap<String, PipelineStatsMap> {
        let mut nodes: BTreeMap<String, PipelineStatsMap> = BTreeMap::new();
        for (node, pipeline, stats) in entries {
            nodes.entry((*node).to_owned()).or_default().insert(
                (*pipeline).to_owned(),
                PipelineStats {
                    stats: *stats,
                    processors: vec![ProcessorStats {
                        kind: "set".into(),
                        stats: *stats,
                        ..Default::default()
                    }],
                },
            );
        }
        nodes
    }

    #[test]
    fn summarizes_deltas() {
        let start = MetricsSnapshot {
            timestamp: 100,
            pipelines: Some(pipelines(&[("n1", "p", record(10, 1, 100))])),
            total_hits: 5,
            nodes: Some(NodesStats {
                cluster_name: "start-cluster".into(),
                nodes: BTreeMap::new(),
            }),
            ..Default::default()
        };
        let end = MetricsSnapshot {
            timestamp: 160,
            pipelines: Some(pipelines(&[
                ("n1", "p", record(50, 3, 400)),
                ("n1", "new", record(7, 0, 7)),
                ("n2", "p", record(1, 0, 1)),
            ])),
            total_hits: 45,
            nodes: Some(NodesStats {
                cluster_name: "end-cluster".into(),
                nodes: [("a", "n1"), ("b", "n2")]
                    .into_iter()
                    .map(|(id, name)| {
                        (id.to_owned(), NodeStats {
                            name: name.to_owned(),
                            ..Default::default()
                        })
                    })
                    .collect(),
            }),
            ..Default::default()
        };

        let summary = summarize("run", &start, &end);

        assert_eq!(summary.cluster_name.as_deref(), Some("start-cluster"));
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.total_hits, 40);
        assert_eq!((summary.collection_start_ts, summary.collection_end_ts), (100, 160));

        assert_eq!(summary.ingest_pipeline_stats.len(), 1);
        let node = &summary.ingest_pipeline_stats["n1"];
        assert_eq!(node.len(), 1);
        assert_eq!(node["p"].stats, record(40, 2, 300));
        assert_eq!(node["p"].processors[0].stats, record(40, 2, 300));
    }

    #[test]
    fn skips_processors_missing_at_start() {
        let mut start = pipelines(&[("n", "p", record(1, 0, 1))]);
        start.get_mut("n").unwrap().get_mut("p").unwrap().processors.clear();
        let end = pipelines(&[("n", "p", record(3, 0, 3))]);

        let summary = summarize(
            "run",
            &MetricsSnapshot {
                pipelines: Some(start),
                ..Default::default()
            },
            &MetricsSnapshot {
                pipelines: Some(end),
                ..Default::default()
            },
        );

        let pipeline = &summary.ingest_pipeline_stats["n"]["p"];
        assert_eq!(pipeline.stats.count, 2);
        assert!(pipeline.processors.is_empty());
    }

    #[test]
    fn missing_captures_summarize_empty() {
        let summary = summarize("run", &MetricsSnapshot::default(), &MetricsSnapshot::default());
        assert_eq!(summary.cluster_name, None);
        assert_eq!(summary.nodes, 0);
        assert!(summary.ingest_pipeline_stats.is_empty());
    }

    #[test]
    fn builds_node_and_data_stream_events() {
        let snapshot = MetricsSnapshot {
            timestamp: 2,
            data_stream: Some(DataStreamStats {
                data_stream: "logs-a-ep".into(),
                backing_indices: 1,
                ..Default::default()
            }),
            nodes: Some(NodesStats {
                cluster_name: "bench".into(),
                nodes: [(
                    "id-1".to_owned(),
                    serde_json::from_value(json!({ "name": "es-01", "jvm": { "uptime": 1 } }))
                        .unwrap(),
                )]
                .into_iter()
                .collect(),
            }),
            ..Default::default()
        };
        let metadata = BenchMeta::new("bench", "run-1");

        let events = events(&snapshot, &metadata);
        assert_eq!(events.len(), 2);

        assert_eq!(events[0]["@timestamp"], 2000);
        assert_eq!(events[0]["cluster_name"], "bench");
        assert_eq!(events[0]["node_name"], "es-01");
        assert_eq!(events[0]["jvm"]["uptime"], 1);
        assert_eq!(events[0]["benchmark_metadata"]["info"]["run_id"], "run-1");

        assert_eq!(events[1]["data_stream"], "logs-a-ep");
        assert_eq!(events[1]["backing_indices"], 1);
        assert!(events[1]["benchmark_metadata"].get("parameter").is_none());
    }
}
