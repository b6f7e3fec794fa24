//! Continuous ingestion at a fixed rate.
//!
//! A stream benchmark runs one task per scenario that sends `events_per_period` generated
//! documents to the benchmark data stream every period, until the run is stopped. With a
//! backfill window, another task per scenario first fills the window with historical documents.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cleanup::CleanupChain;
use crate::collector::BenchMeta;
use crate::error::{Error, Result};
use crate::generator::{Emitted, Generator, GeneratorAssets, GeneratorFactory, backfill_budget};
use crate::installer::PackageInstaller;
use crate::package::{DataStreamManifest, DataStreamTarget, PackageManifest};
use crate::report::Reportable;
use crate::runner::{BenchType, Runner};
use crate::scenario::{self, Scenario};
use crate::store::{self, BackingStore};
use crate::wait::wait_until_true;

const REMOVE_PACKAGE: &str = "remove-package";
const WIPE_DATA_STREAMS: &str = "wipe-data-streams";

const CLEAR_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLEAR_TIMEOUT: Duration = Duration::from_secs(120);

/// Backfill bulk requests carry at most this many periods worth of documents.
const BACKFILL_PERIODS_PER_REQUEST: u64 = 10;

/// Settings of a [`StreamRunner`].
#[derive(Debug)]
pub struct StreamOptions {
    pub store: Arc<dyn BackingStore>,
    pub installer: Arc<dyn PackageInstaller>,
    pub generator_factory: Arc<dyn GeneratorFactory>,
    /// Scenario to run. All `*-benchmark.yml` scenarios of the package run when empty.
    pub bench_name: String,
    pub package_root: PathBuf,
    /// Window of historical documents to ingest before streaming. Zero disables backfill.
    pub backfill: Duration,
    pub events_per_period: u64,
    pub period_duration: Duration,
    /// Wipe the data streams before the run, and remove the package and data afterwards.
    pub perform_cleanup: bool,
    /// Date field spread over the backfill window.
    pub timestamp_field: String,
}

/// Streams generated documents for every scenario of a package.
#[derive(Debug)]
pub struct StreamRunner {
    options: StreamOptions,
    run_id: String,
    /// Benchmark name recorded on documents; the package name when every scenario runs.
    benchmark: String,
    scenarios: BTreeMap<String, Scenario>,
    data_streams: BTreeMap<String, String>,
    generators: BTreeMap<String, Box<dyn Generator>>,
    backfill_generators: BTreeMap<String, Box<dyn Generator>>,
    cleanup: CleanupChain,
}

/// State shared by all streaming tasks of a run.
#[derive(Debug)]
struct StreamContext {
    store: Arc<dyn BackingStore>,
    metadata: Value,
    events_per_period: u64,
    period: Duration,
}

/// Documents collected for a single bulk request.
#[derive(Debug, Default)]
struct Batch {
    body: Vec<u8>,
    documents: u64,
    ended: bool,
}

impl StreamRunner {
    pub fn new(options: StreamOptions) -> Self {
        Self {
            options,
            run_id: String::new(),
            benchmark: String::new(),
            scenarios: BTreeMap::new(),
            data_streams: BTreeMap::new(),
            generators: BTreeMap::new(),
            backfill_generators: BTreeMap::new(),
            cleanup: CleanupChain::new(&[REMOVE_PACKAGE, WIPE_DATA_STREAMS]),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runtime data stream per scenario.
    pub fn data_streams(&self) -> &BTreeMap<String, String> {
        &self.data_streams
    }

    fn validate(&self) -> Result<()> {
        if self.options.events_per_period == 0 {
            return Err(Error::Config(
                "events per period must be greater than zero".to_owned(),
            ));
        }
        if self.options.period_duration.is_zero() {
            return Err(Error::Config(
                "period duration must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    async fn install_package(&mut self, package: &PackageManifest) -> Result<()> {
        tracing::debug!(package = %package.name, version = %package.version, "installing package");
        self.options
            .installer
            .install(&package.name, &package.version)
            .await?;

        let installer = self.options.installer.clone();
        let name = package.name.clone();
        let version = package.version.clone();
        self.cleanup.register(REMOVE_PACKAGE, move || async move {
            tracing::debug!(package = %name, "removing benchmark package");
            installer.uninstall(&name, &version).await
        });
        Ok(())
    }

    fn collect_generators(&mut self) -> Result<()> {
        let root = &self.options.package_root;
        let factory = &self.options.generator_factory;

        for (name, scenario) in &self.scenarios {
            let spec = scenario.corpora.generator.as_ref().ok_or_else(|| {
                Error::Config(format!("scenario {name} has no corpus generator"))
            })?;
            let assets = GeneratorAssets::resolve(
                spec,
                scenario.template_kind(),
                &scenario::scenario_dir(root),
            )?;

            let live = factory.build(&assets, None)?;
            self.generators.insert(name.clone(), live);

            if self.options.backfill.is_zero() {
                continue;
            }

            let budget = backfill_budget(
                self.options.backfill,
                self.options.period_duration,
                self.options.events_per_period,
            );
            let assets = assets.with_backfill(&self.options.timestamp_field, self.options.backfill);
            let backfill = factory.build(&assets, Some(budget))?;
            self.backfill_generators.insert(name.clone(), backfill);
        }

        Ok(())
    }

    async fn wipe_data_streams(&mut self, token: &CancellationToken) -> Result<()> {
        let store = self.options.store.clone();
        let data_streams: Vec<String> = self.data_streams.values().cloned().collect();

        {
            let store = store.clone();
            let data_streams = data_streams.clone();
            self.cleanup.register(WIPE_DATA_STREAMS, move || async move {
                delete_documents(store.as_ref(), &data_streams).await
            });
        }

        tracing::debug!("deleting old data in data streams");
        delete_documents(store.as_ref(), &data_streams).await?;

        let cleared = wait_until_true(token, CLEAR_POLL_INTERVAL, CLEAR_TIMEOUT, || {
            let store = store.clone();
            let data_streams = data_streams.clone();
            async move {
                total_hits(store.as_ref(), &data_streams)
                    .await
                    .map(|total| total == 0)
            }
        })
        .await?;

        if !cleared {
            return Err(Error::Data("unable to clear previous data".to_owned()));
        }
        Ok(())
    }

    fn close_generators(&mut self) {
        let generators = std::mem::take(&mut self.generators);
        let backfill = std::mem::take(&mut self.backfill_generators);
        for (scenario, generator) in generators.into_iter().chain(backfill) {
            close_generator(&scenario, generator);
        }
    }
}

async fn delete_documents(store: &dyn BackingStore, data_streams: &[String]) -> Result<()> {
    for data_stream in data_streams {
        tracing::debug!(data_stream, "deleting data in data stream");
        store.delete_by_query(data_stream).await.map_err(|cause| {
            Error::store(format!("error deleting data in data stream {data_stream}"), cause)
        })?;
    }
    Ok(())
}

async fn total_hits(store: &dyn BackingStore, data_streams: &[String]) -> Result<u64> {
    let mut total = 0;
    for data_stream in data_streams {
        total += store.count(data_stream).await.map_err(|cause| {
            Error::store(format!("error counting documents in {data_stream}"), cause)
        })?;
    }
    Ok(total)
}

fn close_generator(scenario: &str, generator: Box<dyn Generator>) {
    if let Err(error) = generator.close() {
        tracing::warn!(
            scenario,
            error = &error as &dyn std::error::Error,
            "could not close generator"
        );
    }
}

/// Collects up to `limit` documents from `generator` into a bulk body.
fn collect_batch(
    generator: &mut dyn Generator,
    scenario: &str,
    index: &str,
    metadata: &Value,
    limit: u64,
) -> Result<Batch> {
    let action = store::create_action(index);
    let mut batch = Batch::default();
    let mut buf = Vec::new();

    while batch.documents < limit {
        buf.clear();
        if generator.emit(&mut buf)? == Emitted::EndOfStream {
            batch.ended = true;
            break;
        }

        let mut event: Map<String, Value> = serde_json::from_slice(&buf).map_err(|cause| {
            tracing::debug!(document = %String::from_utf8_lossy(&buf), "malformed document");
            Error::json(
                format!(
                    "failed to parse generated event, \
                     check your benchmark template for scenario {scenario}"
                ),
                cause,
            )
        })?;
        event.insert("benchmark_metadata".to_owned(), metadata.clone());

        batch.body.extend_from_slice(action.as_bytes());
        serde_json::to_writer(&mut batch.body, &event)
            .map_err(|cause| Error::json("error serializing event", cause))?;
        batch.body.push(b'\n');
        batch.documents += 1;
    }

    Ok(batch)
}

async fn send_bulk(store: &dyn BackingStore, index: &str, batch: Batch) -> Result<()> {
    tracing::debug!(index, documents = batch.documents, "bulk request");
    let response = store
        .bulk(Bytes::from(batch.body))
        .await
        .map_err(|cause| Error::store("error performing bulk request", cause))?;

    if response.errors {
        tracing::debug!(index, items = ?response.items, "error in bulk request");
        return Err(Error::Data(format!("{} failed", response.failed_items())));
    }
    Ok(())
}

async fn send_cancellable(
    context: &StreamContext,
    index: &str,
    batch: Batch,
    token: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = send_bulk(context.store.as_ref(), index, batch) => result,
    }
}

/// Sends `events_per_period` documents every period until cancelled.
async fn stream_live(
    context: Arc<StreamContext>,
    scenario: String,
    index: String,
    mut generator: Box<dyn Generator>,
    token: CancellationToken,
) -> Result<()> {
    let result = send_periodically(&context, &scenario, &index, generator.as_mut(), &token).await;
    close_generator(&scenario, generator);
    result
}

async fn send_periodically(
    context: &StreamContext,
    scenario: &str,
    index: &str,
    generator: &mut dyn Generator,
    token: &CancellationToken,
) -> Result<()> {
    let period = context.period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = ticker.tick() => {}
        }

        let batch = collect_batch(
            generator,
            scenario,
            index,
            &context.metadata,
            context.events_per_period,
        )?;
        if batch.documents > 0 {
            send_cancellable(context, index, batch, token).await?;
        }
    }
}

/// Sends the whole backfill budget in bulk requests of bounded size.
async fn stream_backfill(
    context: Arc<StreamContext>,
    scenario: String,
    index: String,
    mut generator: Box<dyn Generator>,
    token: CancellationToken,
) -> Result<()> {
    tracing::debug!(scenario, index, "sending backfill events");
    let result = send_all(&context, &scenario, &index, generator.as_mut(), &token).await;
    close_generator(&scenario, generator);
    result
}

async fn send_all(
    context: &StreamContext,
    scenario: &str,
    index: &str,
    generator: &mut dyn Generator,
    token: &CancellationToken,
) -> Result<()> {
    let limit = context
        .events_per_period
        .saturating_mul(BACKFILL_PERIODS_PER_REQUEST);

    loop {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let batch = collect_batch(generator, scenario, index, &context.metadata, limit)?;
        let ended = batch.ended;
        if batch.documents > 0 {
            send_cancellable(context, index, batch, token).await?;
        }
        if ended {
            return Ok(());
        }
    }
}

#[async_trait::async_trait]
impl Runner for StreamRunner {
    fn bench_type(&self) -> BenchType {
        BenchType::Stream
    }

    async fn set_up(&mut self, token: &CancellationToken) -> Result<()> {
        self.validate()?;
        self.run_id = uuid::Uuid::new_v4().to_string();

        let root = self.options.package_root.clone();
        let package = PackageManifest::read(&root)?;
        let bench_name = Some(self.options.bench_name.as_str()).filter(|name| !name.is_empty());
        self.benchmark = bench_name.unwrap_or(&package.name).to_owned();
        self.scenarios =
            scenario::read_scenarios(&root, bench_name, &package.name, &package.version)?;
        if self.scenarios.is_empty() {
            return Err(Error::Config(format!(
                "no benchmark scenarios found in {}",
                scenario::scenario_dir(&root).display()
            )));
        }

        self.install_package(&package).await?;
        self.collect_generators()?;

        for (name, scenario) in &self.scenarios {
            let manifest = DataStreamManifest::read(&root, &scenario.data_stream.name)?;
            let target = DataStreamTarget::new(&package, &manifest, &scenario.version);
            self.data_streams.insert(name.clone(), target.runtime_data_stream);
        }

        if !self.options.perform_cleanup {
            return Ok(());
        }
        self.wipe_data_streams(token).await
    }

    async fn run(&mut self, token: &CancellationToken) -> Result<Option<Reportable>> {
        let token = token.child_token();
        let metadata = serde_json::to_value(BenchMeta::new(&self.benchmark, &self.run_id))
            .map_err(|cause| Error::json("error serializing benchmark metadata", cause))?;
        let context = Arc::new(StreamContext {
            store: self.options.store.clone(),
            metadata,
            events_per_period: self.options.events_per_period,
            period: self.options.period_duration,
        });

        tracing::debug!(run_id = %self.run_id, "streaming data");
        let mut tasks = JoinSet::new();
        for (scenario, generator) in std::mem::take(&mut self.generators) {
            let index = self.data_streams.get(&scenario).cloned().unwrap_or_default();
            tasks.spawn(stream_live(context.clone(), scenario, index, generator, token.clone()));
        }
        for (scenario, generator) in std::mem::take(&mut self.backfill_generators) {
            let index = self.data_streams.get(&scenario).cloned().unwrap_or_default();
            tasks.spawn(stream_backfill(
                context.clone(),
                scenario,
                index,
                generator,
                token.clone(),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|error| {
                Err(Error::Data(format!("streaming task failed: {error}")))
            });
            let Err(error) = result else {
                continue;
            };

            token.cancel();
            if !error.is_cancelled() && first_error.is_none() {
                tracing::error!(error = &error as &dyn std::error::Error, "streaming failed");
                first_error = Some(error);
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        token.cancelled().await;
        Err(Error::Cancelled)
    }

    async fn tear_down(&mut self, _token: &CancellationToken) -> Result<()> {
        self.close_generators();

        if !self.options.perform_cleanup {
            self.cleanup.discard();
            return Ok(());
        }

        self.cleanup.run().await?;
        Ok(())
    }
}
