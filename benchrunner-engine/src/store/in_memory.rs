//! In-memory store for tests and dry runs.
//!
//! This provides a [`BackingStore`] that keeps documents per index in memory and answers stats
//! requests with canned responses. The store is [`Clone`] so tests can hold a handle for direct
//! inspection while a runner owns another copy.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};

use super::{BackingStore, BulkResponse, SearchHit, SearchPage, StoreError, StoreResult};
use crate::stats::{DataStreamStats, DiskUsage, NodesStats, PipelineStatsMap};

#[derive(Debug, Default)]
struct State {
    indices: BTreeMap<String, Vec<Value>>,
    created: BTreeMap<String, Value>,
    mappings: BTreeMap<String, Value>,
    index_templates: BTreeMap<String, Value>,
    nodes_stats: Option<NodesStats>,
    data_stream_stats: BTreeMap<String, DataStreamStats>,
    disk_usage: BTreeMap<String, BTreeMap<String, DiskUsage>>,
    pipeline_stats: VecDeque<BTreeMap<String, PipelineStatsMap>>,
    failing_indices: BTreeSet<String>,
    scrolls: BTreeMap<String, VecDeque<Vec<SearchHit>>>,
    next_scroll: usize,
    calls: BTreeMap<&'static str, usize>,
}

impl State {
    fn record(&mut self, operation: &'static str) {
        *self.calls.entry(operation).or_default() += 1;
    }
}

/// A [`BackingStore`] keeping everything in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the documents stored in `index`.
    pub fn documents(&self, index: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state.indices.get(index).cloned().unwrap_or_default()
    }

    /// Stores `documents` in `index`, bypassing the bulk API.
    pub fn insert_documents(&self, index: &str, documents: impl IntoIterator<Item = Value>) {
        let mut state = self.state.lock().unwrap();
        state
            .indices
            .entry(index.to_owned())
            .or_default()
            .extend(documents);
    }

    /// Returns how often `operation` was called, by trait method name.
    pub fn calls(&self, operation: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(operation).copied().unwrap_or_default()
    }

    /// Returns the body `index` was created with, if it was created through the store.
    pub fn created_index(&self, index: &str) -> Option<Value> {
        self.state.lock().unwrap().created.get(index).cloned()
    }

    /// Makes every bulk item targeting `index` fail.
    pub fn fail_bulk(&self, index: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_indices.insert(index.to_owned());
    }

    pub fn set_mapping(&self, index: &str, mapping: Value) {
        let mut state = self.state.lock().unwrap();
        state.mappings.insert(index.to_owned(), mapping);
    }

    /// Sets the response of [`simulate_index_template`](BackingStore::simulate_index_template).
    pub fn set_index_template(&self, name: &str, template: Value) {
        let mut state = self.state.lock().unwrap();
        state.index_templates.insert(name.to_owned(), template);
    }

    pub fn set_nodes_stats(&self, stats: Option<NodesStats>) {
        self.state.lock().unwrap().nodes_stats = stats;
    }

    pub fn set_data_stream_stats(&self, stats: DataStreamStats) {
        let mut state = self.state.lock().unwrap();
        state
            .data_stream_stats
            .insert(stats.data_stream.clone(), stats);
    }

    pub fn set_disk_usage(&self, index: &str, usage: BTreeMap<String, DiskUsage>) {
        let mut state = self.state.lock().unwrap();
        state.disk_usage.insert(index.to_owned(), usage);
    }

    /// Queues a pipeline stats response.
    ///
    /// Each call to [`pipeline_stats_by_prefix`](BackingStore::pipeline_stats_by_prefix) takes
    /// the next queued response; the last one keeps being returned.
    pub fn push_pipeline_stats(&self, stats: BTreeMap<String, PipelineStatsMap>) {
        self.state.lock().unwrap().pipeline_stats.push_back(stats);
    }

    fn next_page(state: &mut State, scroll_id: String) -> SearchPage {
        let Some(pages) = state.scrolls.get_mut(&scroll_id) else {
            return SearchPage::default();
        };

        match pages.pop_front() {
            Some(hits) => SearchPage {
                scroll_id: Some(scroll_id),
                hits,
            },
            None => {
                state.scrolls.remove(&scroll_id);
                SearchPage {
                    scroll_id: Some(scroll_id),
                    hits: Vec::new(),
                }
            }
        }
    }
}

/// Splits a bulk body into `(index, document)` pairs.
fn parse_bulk(body: &[u8]) -> StoreResult<Vec<(String, Value)>> {
    let text = std::str::from_utf8(body)
        .map_err(|error| StoreError::Unexpected(format!("bulk body is not utf-8: {error}")))?;

    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let mut operations = Vec::new();

    while let Some(action) = lines.next() {
        let action: Value = serde_json::from_str(action).map_err(|cause| StoreError::Serde {
            context: "invalid bulk action line".to_owned(),
            cause,
        })?;

        let index = ["create", "index"]
            .iter()
            .find_map(|kind| action.get(kind))
            .and_then(|target| target.get("_index"))
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Unexpected(format!("unsupported bulk action: {action}")))?
            .to_owned();

        let document = lines
            .next()
            .ok_or_else(|| StoreError::Unexpected("bulk action without document".to_owned()))?;
        let document = serde_json::from_str(document).map_err(|cause| StoreError::Serde {
            context: "invalid bulk document".to_owned(),
            cause,
        })?;

        operations.push((index, document));
    }

    Ok(operations)
}

#[async_trait::async_trait]
impl BackingStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn bulk(&self, body: Bytes) -> StoreResult<BulkResponse> {
        let operations = parse_bulk(&body)?;

        let mut state = self.state.lock().unwrap();
        state.record("bulk");

        let mut response = BulkResponse::default();
        for (index, document) in operations {
            if state.failing_indices.contains(&index) {
                response.errors = true;
                response.items.push(json!({ "create": {
                    "_index": index,
                    "status": 400,
                    "error": { "type": "document_parsing_exception", "reason": "injected failure" },
                }}));
                continue;
            }

            state.indices.entry(index.clone()).or_default().push(document);
            response
                .items
                .push(json!({ "create": { "_index": index, "status": 201 } }));
        }

        Ok(response)
    }

    async fn delete_by_query(&self, index: &str) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record("delete_by_query");
        if let Some(documents) = state.indices.get_mut(index) {
            documents.clear();
        }
        Ok(())
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.record("count");
        Ok(state.indices.get(index).map_or(0, |docs| docs.len() as u64))
    }

    async fn refresh(&self, _index: &str) -> StoreResult<()> {
        self.state.lock().unwrap().record("refresh");
        Ok(())
    }

    async fn simulate_index_template(&self, name: &str) -> StoreResult<Value> {
        let mut state = self.state.lock().unwrap();
        state.record("simulate_index_template");
        state
            .index_templates
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Status {
                status: 404,
                body: format!("index template matching [{name}] not found"),
            })
    }

    async fn get_mapping(&self, index: &str) -> StoreResult<Value> {
        let mut state = self.state.lock().unwrap();
        state.record("get_mapping");
        let mappings = state
            .mappings
            .get(index)
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(json!({ index: { "mappings": mappings } }))
    }

    async fn create_index(&self, index: &str, body: &Value) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record("create_index");
        if !state.created.contains_key(index) {
            state.created.insert(index.to_owned(), body.clone());
            state.indices.entry(index.to_owned()).or_default();
        }
        Ok(())
    }

    async fn search_scroll(
        &self,
        index: &str,
        size: usize,
        _keep_alive: Duration,
    ) -> StoreResult<SearchPage> {
        let mut state = self.state.lock().unwrap();
        state.record("search_scroll");

        let hits: Vec<SearchHit> = state
            .indices
            .get(index)
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(position, document)| SearchHit {
                id: position.to_string(),
                source: document.as_object().cloned().unwrap_or_default(),
            })
            .collect();

        let pages = hits.chunks(size.max(1)).map(<[_]>::to_vec).collect();
        state.next_scroll += 1;
        let scroll_id = format!("scroll-{}", state.next_scroll);
        state.scrolls.insert(scroll_id.clone(), pages);

        Ok(Self::next_page(&mut state, scroll_id))
    }

    async fn scroll(&self, scroll_id: &str, _keep_alive: Duration) -> StoreResult<SearchPage> {
        let mut state = self.state.lock().unwrap();
        state.record("scroll");
        Ok(Self::next_page(&mut state, scroll_id.to_owned()))
    }

    async fn nodes_stats(&self) -> StoreResult<NodesStats> {
        let mut state = self.state.lock().unwrap();
        state.record("nodes_stats");
        state
            .nodes_stats
            .clone()
            .ok_or_else(|| StoreError::Unexpected("node stats unavailable".to_owned()))
    }

    async fn data_stream_stats(&self, data_stream: &str) -> StoreResult<DataStreamStats> {
        let mut state = self.state.lock().unwrap();
        state.record("data_stream_stats");
        state
            .data_stream_stats
            .get(data_stream)
            .cloned()
            .ok_or_else(|| {
                StoreError::Unexpected(format!("no stats returned for data stream {data_stream}"))
            })
    }

    async fn disk_usage(&self, index: &str) -> StoreResult<BTreeMap<String, DiskUsage>> {
        let mut state = self.state.lock().unwrap();
        state.record("disk_usage");
        state
            .disk_usage
            .get(index)
            .cloned()
            .ok_or_else(|| StoreError::Unexpected(format!("no disk usage for index {index}")))
    }

    async fn pipeline_stats_by_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<BTreeMap<String, PipelineStatsMap>> {
        let mut state = self.state.lock().unwrap();
        state.record("pipeline_stats_by_prefix");

        let stats = if state.pipeline_stats.len() > 1 {
            state.pipeline_stats.pop_front()
        } else {
            state.pipeline_stats.front().cloned()
        };
        let Some(mut stats) = stats else {
            return Err(StoreError::Unexpected("pipeline stats unavailable".to_owned()));
        };

        for pipelines in stats.values_mut() {
            pipelines.retain(|name, _| name.starts_with(prefix));
        }
        Ok(stats)
    }
}
