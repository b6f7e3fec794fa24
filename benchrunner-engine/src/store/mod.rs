//! Clients for the backing store under benchmark and the metrics store.
//!
//! Runners and the collector only talk to a store through the [`BackingStore`] trait.
//! [`HttpStore`] speaks the Elasticsearch REST API; [`InMemoryStore`] keeps documents and canned
//! statistics in memory for tests and dry runs.

use std::collections::BTreeMap;
use std::fmt::Debug;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::stats::{DataStreamStats, DiskUsage, NodesStats, PipelineStatsMap};

mod http;
mod in_memory;

pub use http::{HttpStore, HttpStoreConfig};
pub use in_memory::InMemoryStore;

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("benchrunner/", env!("CARGO_PKG_VERSION"));

/// Errors returned by a [`BackingStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network errors and errors building or sending requests.
    #[error("reqwest error: {context}")]
    Reqwest {
        context: String,
        #[source]
        cause: reqwest::Error,
    },

    /// The store answered with a non-success status.
    #[error("unexpected response status {status}: {body}")]
    Status { status: u16, body: String },

    /// Errors related to de/serialization of request and response bodies.
    #[error("serde error: {context}")]
    Serde {
        context: String,
        #[source]
        cause: serde_json::Error,
    },

    /// A response that decoded fine but does not have the expected shape.
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Summary of a bulk request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

impl BulkResponse {
    /// Number of items the store rejected.
    pub fn failed_items(&self) -> usize {
        self.items
            .iter()
            .filter(|item| {
                item.as_object()
                    .and_then(|actions| actions.values().next())
                    .is_some_and(|result| result.get("error").is_some())
            })
            .count()
    }
}

/// A single search hit.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: serde_json::Map<String, serde_json::Value>,
}

/// One page of a scrolled search.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchPage {
    pub scroll_id: Option<String>,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    #[serde(default)]
    hits: SearchHits,
}

#[derive(Debug, Default, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

impl From<SearchResponse> for SearchPage {
    fn from(response: SearchResponse) -> Self {
        Self {
            scroll_id: response.scroll_id.filter(|id| !id.is_empty()),
            hits: response.hits.hits,
        }
    }
}

/// Operations the benchmark runners need from an Elasticsearch-compatible store.
#[async_trait::async_trait]
pub trait BackingStore: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Sends a newline-delimited bulk request. Every document must be preceded by an action line.
    async fn bulk(&self, body: Bytes) -> StoreResult<BulkResponse>;

    /// Deletes all documents in `index`. A missing index is not an error.
    async fn delete_by_query(&self, index: &str) -> StoreResult<()>;

    /// Counts the documents in `index`. A missing index counts as empty.
    async fn count(&self, index: &str) -> StoreResult<u64>;

    /// Makes recent writes to `index` visible to search.
    async fn refresh(&self, index: &str) -> StoreResult<()>;

    /// Returns the settings, mappings and aliases the index template `name` would apply.
    async fn simulate_index_template(&self, name: &str) -> StoreResult<serde_json::Value>;

    /// Returns the mappings of `index`, keyed by concrete index name.
    async fn get_mapping(&self, index: &str) -> StoreResult<serde_json::Value>;

    /// Creates `index` with `body`. An index that already exists is not an error.
    async fn create_index(&self, index: &str, body: &serde_json::Value) -> StoreResult<()>;

    /// Opens a scrolled `match_all` search over `index`.
    async fn search_scroll(
        &self,
        index: &str,
        size: usize,
        keep_alive: std::time::Duration,
    ) -> StoreResult<SearchPage>;

    /// Fetches the next page of a scrolled search.
    async fn scroll(
        &self,
        scroll_id: &str,
        keep_alive: std::time::Duration,
    ) -> StoreResult<SearchPage>;

    /// Returns node statistics of the cluster.
    async fn nodes_stats(&self) -> StoreResult<NodesStats>;

    /// Returns size and extent of `data_stream`.
    async fn data_stream_stats(&self, data_stream: &str) -> StoreResult<DataStreamStats>;

    /// Returns the disk usage of every backing index of `index`.
    async fn disk_usage(&self, index: &str) -> StoreResult<BTreeMap<String, DiskUsage>>;

    /// Returns the stats of pipelines whose name starts with `prefix`, keyed by node id.
    async fn pipeline_stats_by_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<BTreeMap<String, PipelineStatsMap>>;
}

/// Formats `{"create":{"_index":"<index>"}}` followed by a newline.
pub fn create_action(index: &str) -> String {
    let action = serde_json::json!({ "create": { "_index": index } });
    format!("{action}\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn counts_failed_items() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                { "create": { "status": 201 } },
                { "create": { "status": 400, "error": { "type": "mapper_parsing_exception" } } },
                { "create": { "status": 429, "error": { "type": "es_rejected_execution_exception" } } }
            ]
        }))
        .unwrap();

        assert!(response.errors);
        assert_eq!(response.failed_items(), 2);
    }

    #[test]
    fn empty_scroll_id_ends_paging() {
        let response: SearchResponse = serde_json::from_value(json!({
            "_scroll_id": "",
            "hits": { "hits": [ { "_id": "1", "_source": { "a": 1 } } ] }
        }))
        .unwrap();

        let page = SearchPage::from(response);
        assert_eq!(page.scroll_id, None);
        assert_eq!(page.hits[0].id, "1");
        assert_eq!(page.hits[0].source["a"], 1);
    }

    #[test]
    fn formats_create_action() {
        assert_eq!(
            create_action("logs-a-ep"),
            "{\"create\":{\"_index\":\"logs-a-ep\"}}\n"
        );
    }
}
