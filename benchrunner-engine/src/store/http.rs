use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, RequestBuilder, StatusCode, header};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{BackingStore, BulkResponse, SearchPage, SearchResponse, StoreError, StoreResult};
use crate::stats::{self, DataStreamStats, DiskUsage, NodesStats, PipelineStatsMap};

/// Connection settings of an [`HttpStore`].
#[derive(Default)]
pub struct HttpStoreConfig {
    /// Base URL, such as `https://127.0.0.1:9200`.
    pub host: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Accept any TLS certificate presented by the store.
    pub skip_tls_verify: bool,
}

impl fmt::Debug for HttpStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStoreConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("skip_tls_verify", &self.skip_tls_verify)
            .finish()
    }
}

/// A [`BackingStore`] speaking the Elasticsearch REST API.
pub struct HttpStore {
    client: reqwest::Client,
    host: String,
    username: Option<String>,
    password: Option<SecretString>,
}

impl fmt::Debug for HttpStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStore")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(super::USER_AGENT)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|cause| StoreError::Reqwest {
                context: "failed to build http client".to_owned(),
                cause,
            })?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_owned(),
            username: config.username.filter(|username| !username.is_empty()),
            password: config.password,
        })
    }

    /// The base URL requests are sent to.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}/{path}", self.host));
        match &self.username {
            Some(username) => builder.basic_auth(
                username,
                self.password.as_ref().map(|password| password.expose_secret()),
            ),
            None => builder,
        }
    }

    /// Sends the request and returns the status together with the full response body.
    async fn execute(
        &self,
        builder: RequestBuilder,
        context: &str,
    ) -> StoreResult<(StatusCode, Bytes)> {
        let response = builder.send().await.map_err(|cause| StoreError::Reqwest {
            context: context.to_owned(),
            cause,
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|cause| StoreError::Reqwest {
            context: format!("{context}: failed to read response body"),
            cause,
        })?;

        tracing::trace!(%status, context, "store response");
        Ok((status, body))
    }

    async fn execute_ok(&self, builder: RequestBuilder, context: &str) -> StoreResult<Bytes> {
        let (status, body) = self.execute(builder, context).await?;
        check_status(status, body)
    }
}

fn check_status(status: StatusCode, body: Bytes) -> StoreResult<Bytes> {
    if status.is_success() {
        return Ok(body);
    }
    Err(StoreError::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn decode<T: DeserializeOwned>(body: &[u8], context: &str) -> StoreResult<T> {
    serde_json::from_slice(body).map_err(|cause| StoreError::Serde {
        context: context.to_owned(),
        cause,
    })
}

/// Formats a keep-alive as a whole number of seconds.
fn keep_alive_param(keep_alive: Duration) -> String {
    format!("{}s", keep_alive.as_secs().max(1))
}

#[async_trait::async_trait]
impl BackingStore for HttpStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn bulk(&self, body: Bytes) -> StoreResult<BulkResponse> {
        let builder = self
            .request(Method::POST, "_bulk")
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let body = self.execute_ok(builder, "bulk request failed").await?;
        decode(&body, "error decoding bulk response")
    }

    async fn delete_by_query(&self, index: &str) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, &format!("{index}/_delete_by_query"))
            .query(&[("conflicts", "proceed"), ("refresh", "true")])
            .json(&json!({ "query": { "match_all": {} } }));

        let (status, body) = self.execute(builder, "delete by query failed").await?;
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(index, "nothing to delete, index does not exist");
            return Ok(());
        }
        check_status(status, body)?;
        Ok(())
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        #[derive(serde::Deserialize)]
        struct CountResponse {
            count: u64,
        }

        let builder = self
            .request(Method::GET, &format!("{index}/_count"))
            .query(&[("ignore_unavailable", "true")]);

        let (status, body) = self.execute(builder, "count request failed").await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let body = check_status(status, body)?;
        let response: CountResponse = decode(&body, "error decoding count response")?;
        Ok(response.count)
    }

    async fn refresh(&self, index: &str) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, &format!("{index}/_refresh"))
            .query(&[("ignore_unavailable", "true")]);
        self.execute_ok(builder, "refresh request failed").await?;
        Ok(())
    }

    async fn simulate_index_template(&self, name: &str) -> StoreResult<serde_json::Value> {
        let builder = self.request(Method::POST, &format!("_index_template/_simulate/{name}"));
        let body = self
            .execute_ok(builder, "error simulating index template")
            .await?;
        decode(&body, "error decoding simulated index template")
    }

    async fn get_mapping(&self, index: &str) -> StoreResult<serde_json::Value> {
        let builder = self.request(Method::GET, &format!("{index}/_mapping"));
        let body = self.execute_ok(builder, "error getting mapping").await?;
        decode(&body, "error decoding mapping")
    }

    async fn create_index(&self, index: &str, body: &serde_json::Value) -> StoreResult<()> {
        let builder = self.request(Method::PUT, index).json(body);
        let (status, response) = self.execute(builder, "create index request failed").await?;

        if status == StatusCode::BAD_REQUEST
            && String::from_utf8_lossy(&response).contains("resource_already_exists_exception")
        {
            tracing::debug!(index, "index already exists");
            return Ok(());
        }
        check_status(status, response)?;
        Ok(())
    }

    async fn search_scroll(
        &self,
        index: &str,
        size: usize,
        keep_alive: Duration,
    ) -> StoreResult<SearchPage> {
        let builder = self
            .request(Method::POST, &format!("{index}/_search"))
            .query(&[
                ("scroll", keep_alive_param(keep_alive)),
                ("size", size.to_string()),
            ])
            .json(&json!({ "query": { "match_all": {} } }));

        let body = self.execute_ok(builder, "search request failed").await?;
        let response: SearchResponse = decode(&body, "error decoding search response")?;
        Ok(response.into())
    }

    async fn scroll(&self, scroll_id: &str, keep_alive: Duration) -> StoreResult<SearchPage> {
        let builder = self.request(Method::POST, "_search/scroll").json(&json!({
            "scroll": keep_alive_param(keep_alive),
            "scroll_id": scroll_id,
        }));

        let body = self.execute_ok(builder, "scroll request failed").await?;
        let response: SearchResponse = decode(&body, "error decoding scroll response")?;
        Ok(response.into())
    }

    async fn nodes_stats(&self) -> StoreResult<NodesStats> {
        let builder = self.request(Method::GET, "_nodes/stats");
        let body = self.execute_ok(builder, "node stats request failed").await?;
        decode(&body, "error decoding node stats")
    }

    async fn data_stream_stats(&self, data_stream: &str) -> StoreResult<DataStreamStats> {
        let builder = self.request(Method::GET, &format!("_data_stream/{data_stream}/_stats"));
        let body = self
            .execute_ok(builder, "data stream stats request failed")
            .await?;
        stats::parse_data_stream_stats(&body, data_stream)
    }

    async fn disk_usage(&self, index: &str) -> StoreResult<BTreeMap<String, DiskUsage>> {
        let builder = self
            .request(Method::POST, &format!("{index}/_disk_usage"))
            .query(&[("run_expensive_tasks", "true")]);
        let body = self.execute_ok(builder, "disk usage request failed").await?;
        stats::parse_disk_usage(&body)
    }

    async fn pipeline_stats_by_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<BTreeMap<String, PipelineStatsMap>> {
        let builder = self
            .request(Method::GET, "_nodes/stats/ingest")
            .query(&[("filter_path", "nodes.*.ingest.pipelines")]);
        let body = self
            .execute_ok(builder, "pipeline stats request failed")
            .await?;
        stats::parse_pipeline_stats(&body, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_password() {
        let config = HttpStoreConfig {
            host: "https://localhost:9200/".into(),
            username: Some("elastic".into()),
            password: Some(SecretString::from("changeme")),
            skip_tls_verify: true,
        };

        let debug = format!("{config:?}");
        assert!(!debug.contains("changeme"), "{debug}");
        assert!(debug.contains("[redacted]"), "{debug}");

        let store = HttpStore::new(config).unwrap();
        assert_eq!(store.host(), "https://localhost:9200");
        assert!(!format!("{store:?}").contains("changeme"));
    }

    #[test]
    fn empty_username_disables_auth() {
        let store = HttpStore::new(HttpStoreConfig {
            host: "http://localhost:9200".into(),
            username: Some(String::new()),
            ..Default::default()
        })
        .unwrap();

        let request = store.request(Method::GET, "_count").build().unwrap();
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
        assert_eq!(request.url().as_str(), "http://localhost:9200/_count");
    }

    #[test]
    fn keep_alive_in_seconds() {
        assert_eq!(keep_alive_param(Duration::from_secs(60)), "60s");
        assert_eq!(keep_alive_param(Duration::from_millis(10)), "1s");
    }

    #[test]
    fn non_success_status_keeps_body() {
        let error = check_status(StatusCode::BAD_REQUEST, Bytes::from_static(b"boom")).unwrap_err();
        assert!(matches!(error, StoreError::Status { status: 400, ref body } if body == "boom"));
    }
}
