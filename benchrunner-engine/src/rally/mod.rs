//! One-shot corpus benchmarks replayed by the external load-test driver.
//!
//! A rally benchmark installs the package, generates (or copies) a corpus, renders a track that
//! bulk-loads the corpus into the benchmark data stream and hands it to `esrally`. Metrics are
//! collected around the race and reconciled into a [`Report`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::cleanup::CleanupChain;
use crate::collector::{BenchMeta, Collector, CollectorOptions};
use crate::error::{Error, Result};
use crate::generator::{Generator, GeneratorAssets, GeneratorFactory};
use crate::installer::PackageInstaller;
use crate::package::{DataStreamManifest, DataStreamTarget, PackageManifest};
use crate::report::{Report, Reportable};
use crate::runner::{BenchType, Runner};
use crate::scenario::{self, Scenario};
use crate::store::BackingStore;
use crate::wait::wait_until_true;

mod corpus;
mod driver;
mod track;

pub use corpus::{copy_corpus, count_lines, write_corpus};
pub use driver::{DEFAULT_EXECUTABLE, Race, RallyDriver, read_report};
pub use track::{TrackParams, render_track, rewrite_index_template};

const PERSIST_TRACK: &str = "persist-track";
const REMOVE_PACKAGE: &str = "remove-package";
const WIPE_DATA_STREAM: &str = "wipe-data-stream";
const CLEAR_CORPUS_FILES: &str = "clear-corpus-files";
const REMOVE_RUN_DIR: &str = "remove-run-dir";

/// Interval between checks that old documents are gone.
const CLEAR_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long to wait for old documents to disappear.
const CLEAR_TIMEOUT: Duration = Duration::from_secs(120);

const REINDEX_PAGE_SIZE: usize = 10_000;
const REINDEX_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Settings of a [`RallyRunner`].
#[derive(Debug)]
pub struct RallyOptions {
    pub store: Arc<dyn BackingStore>,
    /// Receives collected metrics and, when reindexing, the benchmark documents.
    pub metrics_store: Option<Arc<dyn BackingStore>>,
    pub installer: Arc<dyn PackageInstaller>,
    pub generator_factory: Arc<dyn GeneratorFactory>,
    pub driver: RallyDriver,
    /// Scenario name, the file stem below `_dev/benchmark/rally`.
    pub bench_name: String,
    pub package_root: PathBuf,
    /// Each run gets its own directory below this one.
    pub work_dir: PathBuf,
    /// Use this corpus instead of generating one.
    pub corpus_at_path: Option<PathBuf>,
    /// Keep a copy of the track and corpus here after the run.
    pub rally_track_output_dir: Option<PathBuf>,
    /// Prepare the track but do not run the driver.
    pub dry_run: bool,
    /// Copy the benchmark documents to the metrics store.
    pub reindex_data: bool,
    /// Pause before tearing down.
    pub defer_cleanup: Duration,
    pub metrics_interval: Option<Duration>,
    /// Install this package name and version from the registry instead of the local package.
    pub package_from_registry: Option<(String, String)>,
}

/// Runs one rally benchmark scenario.
#[derive(Debug)]
pub struct RallyRunner {
    options: RallyOptions,
    run_id: String,
    run_dir: PathBuf,
    scenario: Scenario,
    target: Option<DataStreamTarget>,
    index_template_body: Option<String>,
    generator: Option<Box<dyn Generator>>,
    corpus_file: Option<PathBuf>,
    cleanup: CleanupChain,
}

impl RallyRunner {
    pub fn new(options: RallyOptions) -> Self {
        Self {
            options,
            run_id: String::new(),
            run_dir: PathBuf::new(),
            scenario: Scenario::default(),
            target: None,
            index_template_body: None,
            generator: None,
            corpus_file: None,
            cleanup: CleanupChain::new(&[
                PERSIST_TRACK,
                REMOVE_PACKAGE,
                WIPE_DATA_STREAM,
                CLEAR_CORPUS_FILES,
                REMOVE_RUN_DIR,
            ]),
        }
    }

    /// Identifier of the current run. Empty before set up.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory holding the corpus, track and driver report of the current run.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn target(&self) -> Result<&DataStreamTarget> {
        self.target
            .as_ref()
            .ok_or_else(|| Error::Config("rally benchmark has not been set up".to_owned()))
    }

    async fn install_package(&mut self, package: &PackageManifest) -> Result<()> {
        let (name, version) = match &self.options.package_from_registry {
            Some((name, version)) => {
                self.scenario.package = name.clone();
                self.scenario.version = version.clone();
                (name.clone(), version.clone())
            }
            None => (package.name.clone(), package.version.clone()),
        };

        tracing::debug!(package = %name, %version, "installing package");
        self.options.installer.install(&name, &version).await?;

        let installer = self.options.installer.clone();
        self.cleanup.register(REMOVE_PACKAGE, move || async move {
            tracing::debug!(package = %name, "removing benchmark package");
            installer.uninstall(&name, &version).await
        });

        Ok(())
    }

    async fn simulate_index_template(&self, index_template: &str) -> Result<String> {
        let simulated = self
            .options
            .store
            .simulate_index_template(index_template)
            .await
            .map_err(|cause| {
                Error::store(
                    format!("error simulating template from composable template: {index_template}"),
                    cause,
                )
            })?;

        let rewritten = rewrite_index_template(simulated, index_template)?;
        serde_json::to_string(&rewritten)
            .map_err(|cause| Error::json("error serializing simulated template", cause))
    }

    async fn wipe_data_stream(&mut self, token: &CancellationToken) -> Result<()> {
        let data_stream = self.target()?.runtime_data_stream.clone();
        let store = self.options.store.clone();

        tracing::debug!(data_stream, "deleting old data in data stream");
        {
            let store = store.clone();
            let data_stream = data_stream.clone();
            self.cleanup.register(WIPE_DATA_STREAM, move || async move {
                tracing::debug!(data_stream, "deleting data in data stream");
                store.delete_by_query(&data_stream).await.map_err(|cause| {
                    Error::store(format!("error deleting data in data stream {data_stream}"), cause)
                })
            });
        }

        store.delete_by_query(&data_stream).await.map_err(|cause| {
            Error::store(format!("error deleting old data in data stream {data_stream}"), cause)
        })?;

        let cleared = wait_until_true(token, CLEAR_POLL_INTERVAL, CLEAR_TIMEOUT, || {
            let store = store.clone();
            let data_stream = data_stream.clone();
            async move {
                store
                    .count(&data_stream)
                    .await
                    .map(|hits| hits == 0)
                    .map_err(|cause| {
                        Error::store(format!("error counting documents in {data_stream}"), cause)
                    })
            }
        })
        .await?;

        if !cleared {
            return Err(Error::Data("unable to clear previous data".to_owned()));
        }
        Ok(())
    }

    /// Generates or copies the corpus and returns the number of documents in it.
    fn prepare_corpus(&mut self) -> Result<u64> {
        let (path, count) = match (&self.options.corpus_at_path, self.generator.take()) {
            (Some(source), _) => {
                tracing::debug!(source = %source.display(), "reading corpus data");
                copy_corpus(source, &self.run_dir)?
            }
            (None, Some(generator)) => {
                tracing::debug!(dir = %self.run_dir.display(), "generating corpus data");
                write_corpus(generator, &self.run_dir)?
            }
            (None, None) => {
                return Err(Error::Config(format!(
                    "benchmark {} has no corpus generator and no corpus was given",
                    self.options.bench_name
                )));
            }
        };

        self.register_clear_files(vec![path.clone()]);
        self.corpus_file = Some(path);
        Ok(count)
    }

    fn register_clear_files(&mut self, files: Vec<PathBuf>) {
        self.cleanup
            .register(CLEAR_CORPUS_FILES, move || remove_files(files));
    }

    /// Writes the track and reserves the driver report file.
    async fn create_track(&mut self, docs_count: u64) -> Result<(PathBuf, PathBuf)> {
        let target = self.target()?;
        let data_stream = target.runtime_data_stream.clone();
        let index_template = target
            .is_time_series
            .then(|| self.index_template_body.clone())
            .flatten();
        let corpus = self
            .corpus_file
            .clone()
            .ok_or_else(|| Error::Data("no corpus file".to_owned()))?;

        let corpus_size = tokio::fs::metadata(&corpus)
            .await
            .map_err(|cause| {
                Error::io(
                    format!("error with stat on corpus file {}", corpus.display()),
                    cause,
                )
            })?
            .len();
        let corpus_filename = corpus
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_owned();

        let track = render_track(&TrackParams {
            data_stream: &data_stream,
            corpus_filename: &corpus_filename,
            corpus_docs_count: docs_count,
            corpus_size_in_bytes: corpus_size,
            index_template: index_template.as_deref(),
        })?;

        let (_, track_file) = corpus::create_temp_file(&self.run_dir, "track-", ".json")?;
        tokio::fs::write(&track_file, track)
            .await
            .map_err(|cause| Error::io("cannot save track content to file", cause))?;
        let (_, report_file) = corpus::create_temp_file(&self.run_dir, "report-", ".csv")?;

        if let Some(output_dir) = self.options.rally_track_output_dir.clone() {
            let track_file = track_file.clone();
            let corpus = corpus.clone();
            self.cleanup.register(PERSIST_TRACK, move || async move {
                persist_track(&output_dir, &data_stream, &track_file, &corpus).await
            });
        }

        self.register_clear_files(vec![corpus, track_file.clone(), report_file.clone()]);
        Ok((track_file, report_file))
    }

    async fn run_benchmark(
        &mut self,
        token: &CancellationToken,
        collector: &Collector,
    ) -> Result<Option<Reportable>> {
        let docs_count = self.prepare_corpus()?;
        if docs_count == 0 {
            return Err(Error::Data(
                "can't find documents in the corpus for data stream".to_owned(),
            ));
        }

        let (track_file, report_file) = self.create_track(docs_count).await?;

        if self.options.dry_run {
            tracing::info!(
                track = %track_file.display(),
                "dry run: rally benchmark not executed"
            );
            return Ok(None);
        }

        let race = Race {
            run_id: &self.run_id,
            track: &track_file,
            report: &report_file,
        };
        let rally_stats = self.options.driver.race(&race, token).await?;

        collector.stop().await;
        let summary = collector.summary()?;

        self.reindex_data(token).await?;

        let corpus_file = self
            .corpus_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let report = Report::new(
            &self.options.bench_name,
            &corpus_file,
            &self.scenario,
            summary,
            rally_stats,
        );
        report.into_reportable().map(Some)
    }

    /// Copies every document of the benchmark data stream into the metrics store.
    async fn reindex_data(&self, token: &CancellationToken) -> Result<()> {
        if !self.options.reindex_data {
            return Ok(());
        }
        let Some(metrics_store) = &self.options.metrics_store else {
            return Err(Error::Config(
                "the option to reindex data is set, but the metricstore was not initialized"
                    .to_owned(),
            ));
        };

        let store = &self.options.store;
        let data_stream = &self.target()?.runtime_data_stream;

        tracing::debug!(data_stream, "getting original mappings");
        let mappings = store
            .get_mapping(data_stream)
            .await
            .map_err(|cause| Error::store("error getting mapping", cause))?;
        let mapping = single_mapping(mappings)?;

        let index = format!("bench-reindex-{data_stream}-{}", self.run_id);
        tracing::debug!(index, "creating index in metricstore");
        metrics_store
            .create_index(&index, &json!({
                "settings": { "number_of_replicas": 0 },
                "mappings": mapping,
            }))
            .await
            .map_err(|cause| Error::store(format!("could not create index {index}"), cause))?;

        let metadata = serde_json::to_value(
            BenchMeta::new(&self.options.bench_name, &self.run_id)
                .with_scenario(self.scenario.clone()),
        )
        .map_err(|cause| Error::json("error serializing benchmark metadata", cause))?;

        tracing::debug!("starting scrolling of events");
        let mut page = store
            .search_scroll(data_stream, REINDEX_PAGE_SIZE, REINDEX_KEEP_ALIVE)
            .await
            .map_err(|cause| Error::store("error executing search", cause))?;

        while !page.hits.is_empty() {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut body = String::new();
            for hit in page.hits {
                let mut source = hit.source;
                source.insert("benchmark_metadata".to_owned(), metadata.clone());

                let action = json!({ "index": { "_index": index, "_id": hit.id } });
                body.push_str(&action.to_string());
                body.push('\n');
                body.push_str(&Value::Object(source).to_string());
                body.push('\n');
            }

            tracing::debug!(index, "bulk request of reindexed events");
            let response = metrics_store
                .bulk(Bytes::from(body))
                .await
                .map_err(|cause| Error::store("error performing the bulk index request", cause))?;
            if response.errors {
                return Err(Error::Data(format!("{} failed", response.failed_items())));
            }

            let scroll_id = page
                .scroll_id
                .ok_or_else(|| Error::Data("error getting scroll ID".to_owned()))?;
            page = store
                .scroll(&scroll_id, REINDEX_KEEP_ALIVE)
                .await
                .map_err(|cause| Error::store("error executing scroll", cause))?;
        }

        tracing::debug!(index, "reindexing operation finished");
        Ok(())
    }
}

/// Extracts the mapping from a get-mapping response covering exactly one index.
fn single_mapping(response: Value) -> Result<Value> {
    let Value::Object(indices) = response else {
        return Err(Error::Data("mapping response is not an object".to_owned()));
    };
    if indices.len() != 1 {
        return Err(Error::Data(format!(
            "exactly 1 mapping was expected, got {}",
            indices.len()
        )));
    }

    Ok(indices
        .into_iter()
        .next()
        .and_then(|(_, index)| index.get("mappings").cloned())
        .unwrap_or_else(|| json!({})))
}

/// Removes every file in `files`, even after a failed removal.
async fn remove_files(files: Vec<PathBuf>) -> Result<()> {
    let mut failed = Vec::new();
    let mut first_cause = None;

    for file in files {
        if let Err(cause) = tokio::fs::remove_file(&file).await {
            tracing::debug!(
                file = %file.display(),
                error = &cause as &dyn std::error::Error,
                "cannot remove file"
            );
            failed.push(file.display().to_string());
            first_cause.get_or_insert(cause);
        }
    }

    match first_cause {
        Some(cause) => Err(Error::io(format!("cannot remove {}", failed.join(", ")), cause)),
        None => Ok(()),
    }
}

async fn persist_track(
    output_dir: &Path,
    data_stream: &str,
    track: &Path,
    corpus: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|cause| Error::io("cannot create rally track output dir", cause))?;

    let persisted_track = output_dir.join(format!("track-{data_stream}.json"));
    tokio::fs::copy(track, &persisted_track)
        .await
        .map_err(|cause| Error::io("cannot copy rally track to output dir", cause))?;

    let corpus_name = corpus.file_name().unwrap_or_default();
    if let Err(cause) = tokio::fs::copy(corpus, output_dir.join(corpus_name)).await {
        if let Err(error) = tokio::fs::remove_file(&persisted_track).await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "cannot remove persisted rally track"
            );
        }
        return Err(Error::io("cannot copy rally corpus to output dir", cause));
    }

    tracing::info!(dir = %output_dir.display(), "rally track and corpus saved");
    Ok(())
}

#[async_trait::async_trait]
impl Runner for RallyRunner {
    fn bench_type(&self) -> BenchType {
        BenchType::Rally
    }

    async fn set_up(&mut self, token: &CancellationToken) -> Result<()> {
        self.run_id = uuid::Uuid::new_v4().to_string();
        self.run_dir = self.options.work_dir.join(&self.run_id);
        tokio::fs::create_dir_all(&self.run_dir)
            .await
            .map_err(|cause| {
                Error::io(format!("could not create run dir {}", self.run_dir.display()), cause)
            })?;

        let run_dir = self.run_dir.clone();
        self.cleanup.register(REMOVE_RUN_DIR, move || async move {
            tokio::fs::remove_dir(&run_dir).await.map_err(|cause| {
                Error::io(format!("cannot remove run dir {}", run_dir.display()), cause)
            })
        });

        let root = self.options.package_root.clone();
        let package = PackageManifest::read(&root)?;
        self.scenario = scenario::read_scenario(
            &root,
            &self.options.bench_name,
            &package.name,
            &package.version,
        )?;

        self.install_package(&package).await?;

        if let Some(spec) = &self.scenario.corpora.generator
            && self.options.corpus_at_path.is_none()
        {
            let assets = GeneratorAssets::resolve(
                spec,
                self.scenario.template_kind(),
                &scenario::scenario_dir(&root),
            )?;
            let generator = self
                .options
                .generator_factory
                .build(&assets, Some(spec.total_events))?;
            self.generator = Some(generator);
        }

        let data_stream = DataStreamManifest::read(&root, &self.scenario.data_stream.name)?;
        let target = DataStreamTarget::new(&package, &data_stream, &self.scenario.version);

        if target.is_time_series {
            let body = self.simulate_index_template(&target.index_template).await?;
            self.index_template_body = Some(body);
        }
        self.target = Some(target);

        self.wipe_data_stream(token).await
    }

    async fn run(&mut self, token: &CancellationToken) -> Result<Option<Reportable>> {
        let target = self.target()?;
        let mut collector = Collector::new(CollectorOptions {
            store: self.options.store.clone(),
            metrics_store: self.options.metrics_store.clone(),
            data_stream: target.runtime_data_stream.clone(),
            pipeline_prefix: target.pipeline_prefix.clone(),
            run_id: self.run_id.clone(),
            metadata: BenchMeta::new(&self.options.bench_name, &self.run_id)
                .with_scenario(self.scenario.clone()),
            interval: self.options.metrics_interval,
        });
        collector.start(token).await;

        let outcome = self.run_benchmark(token, &collector).await;
        collector.stop().await;
        outcome
    }

    async fn tear_down(&mut self, token: &CancellationToken) -> Result<()> {
        if !self.options.defer_cleanup.is_zero() {
            tracing::debug!(
                defer = %humantime::format_duration(self.options.defer_cleanup),
                "waiting before tearing down"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.defer_cleanup) => {}
                _ = token.cancelled() => {}
            }
        }

        if let Some(generator) = self.generator.take()
            && let Err(error) = generator.close()
        {
            tracing::warn!(error = &error as &dyn std::error::Error, "could not close generator");
        }

        self.cleanup.run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_mapping() {
        let mapping = single_mapping(json!({
            ".ds-logs-nginx.access-ep-000001": { "mappings": { "dynamic": false } }
        }))
        .unwrap();
        assert_eq!(mapping, json!({ "dynamic": false }));

        let error = single_mapping(json!({ "a": {}, "b": {} })).unwrap_err();
        assert!(matches!(error, Error::Data(message) if message.contains("got 2")));
    }

    #[tokio::test]
    async fn persists_track_and_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("track-1.json");
        let corpus = dir.path().join("corpus-1");
        std::fs::write(&track, "{}").unwrap();
        std::fs::write(&corpus, "{}\n").unwrap();

        let output = dir.path().join("out");
        persist_track(&output, "logs-a.b-ep", &track, &corpus).await.unwrap();

        assert!(output.join("track-logs-a.b-ep.json").is_file());
        assert!(output.join("corpus-1").is_file());
    }

    #[tokio::test]
    async fn persisting_without_corpus_removes_track_copy() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("track-1.json");
        std::fs::write(&track, "{}").unwrap();

        let output = dir.path().join("out");
        let missing = dir.path().join("missing");
        let result = persist_track(&output, "logs-a.b-ep", &track, &missing).await;

        assert!(result.is_err());
        assert!(!output.join("track-logs-a.b-ep.json").exists());
    }
}
