use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use benchrunner_engine::collector::{BenchMeta, Collector, CollectorOptions};
use benchrunner_engine::stats::{
    DataStreamStats, NodesStats, PipelineStats, PipelineStatsMap, StatsRecord,
};
use benchrunner_engine::store::InMemoryStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const DATA_STREAM: &str = "logs-nginx.access-ep";
const PIPELINE: &str = "logs-nginx.access-1.20.0";

fn pipelines(count: i64) -> BTreeMap<String, PipelineStatsMap> {
    let pipeline = PipelineStats {
        stats: StatsRecord {
            count,
            current: 0,
            failed: 0,
            time_in_millis: count * 2,
        },
        processors: Vec::new(),
    };
    let mut node = PipelineStatsMap::new();
    node.insert(PIPELINE.to_owned(), pipeline);
    BTreeMap::from([("node-1".to_owned(), node)])
}

fn stores() -> (InMemoryStore, InMemoryStore) {
    let store = InMemoryStore::new();
    store.set_nodes_stats(Some(NodesStats {
        cluster_name: "bench".into(),
        nodes: BTreeMap::new(),
    }));
    store.set_data_stream_stats(DataStreamStats {
        data_stream: DATA_STREAM.into(),
        backing_indices: 1,
        ..Default::default()
    });
    store.push_pipeline_stats(pipelines(10));
    store.push_pipeline_stats(pipelines(25));
    (store, InMemoryStore::new())
}

fn collector(
    store: &InMemoryStore,
    metrics: &InMemoryStore,
    interval: Option<Duration>,
) -> Collector {
    Collector::new(CollectorOptions {
        store: Arc::new(store.clone()),
        metrics_store: Some(Arc::new(metrics.clone())),
        data_stream: DATA_STREAM.to_owned(),
        pipeline_prefix: PIPELINE.to_owned(),
        run_id: "run-1".to_owned(),
        metadata: BenchMeta::new("access-benchmark", "run-1"),
        interval,
    })
}

#[tokio::test(start_paused = true)]
async fn concurrent_stops_capture_once() {
    let (store, metrics) = stores();
    store.insert_documents(DATA_STREAM, [json!({ "message": "before" })]);

    let mut collector = collector(&store, &metrics, Some(Duration::from_secs(1)));
    let token = CancellationToken::new();
    collector.start(&token).await;
    assert!(collector.summary().is_err());

    store.insert_documents(DATA_STREAM, (0..3).map(|i| json!({ "message": i })));
    tokio::time::sleep(Duration::from_millis(2500)).await;

    futures::join!(collector.stop(), collector.stop());
    assert_eq!(collector.end_captures(), 1);

    let summary = collector.summary().unwrap();
    assert_eq!(summary.cluster_name.as_deref(), Some("bench"));
    assert_eq!(summary.total_hits, 3);
    assert_eq!(summary.ingest_pipeline_stats["node-1"][PIPELINE].stats.count, 15);

    // Start and end captures plus two intermediate snapshots.
    assert_eq!(metrics.calls("bulk"), 4);
    assert!(metrics.created_index(&collector.metrics_index()).is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_ends_collection() {
    let (store, metrics) = stores();
    let mut collector = collector(&store, &metrics, None);
    let token = CancellationToken::new();

    collector.start(&token).await;
    token.cancel();
    collector.stop().await;
    collector.stop().await;

    assert_eq!(collector.end_captures(), 1);
    assert!(collector.end_snapshot().is_some());
    assert_eq!(metrics.calls("bulk"), 2);
}
