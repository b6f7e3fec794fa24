use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use benchrunner_engine::generator::{GeneratorFactory, TemplateGeneratorFactory};
use benchrunner_engine::installer::{FleetInstaller, PackageInstaller};
use benchrunner_engine::rally::{RallyDriver, RallyOptions, RallyRunner};
use benchrunner_engine::store::{BackingStore, HttpStore};
use benchrunner_engine::stream::{StreamOptions, StreamRunner};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::observability;
use crate::output::{ResultsDir, Stdout};
use crate::registry::Registry;

/// Runs data-ingestion benchmarks of a package against a running stack.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Rally(RallyCommand),
    Stream(StreamCommand),
    Version(VersionCommand),
}

/// generate a corpus for a benchmark scenario and replay it with esrally
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "rally")]
struct RallyCommand {
    /// root directory of the package under benchmark
    #[argh(option, default = "PathBuf::from(\".\")")]
    package_root: PathBuf,

    /// name of the benchmark scenario to run
    #[argh(option)]
    benchmark: String,

    /// use the corpus at this path instead of generating one
    #[argh(option)]
    corpus_at_path: Option<PathBuf>,

    /// prepare corpus and track without running esrally
    #[argh(switch)]
    dry_run: bool,

    /// copy the benchmark documents to the metric store
    #[argh(switch)]
    reindex_to_metricstore: bool,

    /// keep a copy of the track and corpus in this directory
    #[argh(option)]
    rally_track_output_dir: Option<PathBuf>,

    /// pause before cleaning up, such as "5m"
    #[argh(option, from_str_fn(parse_duration))]
    defer_cleanup: Option<Duration>,

    /// interval of intermediate metrics collection
    #[argh(option, from_str_fn(parse_duration), default = "Duration::from_secs(1)")]
    metrics_interval: Duration,

    /// install "<name>-<version>" from the package registry instead of the local package
    #[argh(option, from_str_fn(parse_registry_package))]
    package_from_registry: Option<(String, String)>,
}

/// continuously stream generated events of benchmark scenarios
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "stream")]
struct StreamCommand {
    /// root directory of the package under benchmark
    #[argh(option, default = "PathBuf::from(\".\")")]
    package_root: PathBuf,

    /// name of the benchmark scenario to stream, all scenarios when omitted
    #[argh(option)]
    benchmark: Option<String>,

    /// amount of past data to ingest before streaming live events
    #[argh(option, from_str_fn(parse_duration), default = "Duration::from_secs(15 * 60)")]
    backfill: Duration,

    /// number of events sent per period
    #[argh(option, default = "10")]
    events_per_period: u64,

    /// length of a period, such as "10s"
    #[argh(option, from_str_fn(parse_duration), default = "Duration::from_secs(10)")]
    period_duration: Duration,

    /// remove the package and streamed data when stopped
    #[argh(switch)]
    perform_cleanup: bool,

    /// field holding the event timestamp, rewritten for backfill
    #[argh(option, default = "String::from(\"timestamp\")")]
    timestamp_field: String,
}

impl StreamCommand {
    fn validate(&self) -> Result<()> {
        if self.events_per_period == 0 {
            anyhow::bail!("--events-per-period cannot be zero or negative");
        }
        if self.period_duration.is_zero() {
            anyhow::bail!("--period-duration cannot be zero or negative");
        }
        Ok(())
    }
}

/// print the benchrunner version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| format!("invalid duration {value:?}: {error}"))
}

fn parse_registry_package(value: &str) -> Result<(String, String), String> {
    match value.split_once('-') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            Ok((name.to_owned(), version.to_owned()))
        }
        _ => Err(format!("expected <name>-<version>, got {value:?}")),
    }
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("benchrunner {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if let Command::Stream(stream) = &args.command {
        stream.validate()?;
    }

    let config = Config::load(args.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let registry = build_registry(&config, args.command)?;
    runtime.block_on(run_until_departure(registry))
}

/// Runs the registry, cancelling it on SIGINT or SIGTERM.
///
/// Teardown still runs to completion after a signal.
async fn run_until_departure(registry: Registry) -> Result<()> {
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        elegant_departure::get_shutdown_guard().wait().await;
        tracing::info!("Stopping benchmark ...");
        cancel.cancel();
    });

    let run = registry.run(&token);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        _ = async { elegant_departure::tokio::depart().on_termination().on_sigint().await } => {}
    }

    run.await
}

fn build_registry(config: &Config, command: Command) -> Result<Registry> {
    let store: Arc<dyn BackingStore> = Arc::new(
        HttpStore::new(config.elasticsearch.store_config())
            .context("failed to create the store client")?,
    );
    let installer: Arc<dyn PackageInstaller> = Arc::new(
        FleetInstaller::new(config.kibana.fleet_config())
            .context("failed to create the package installer")?,
    );
    let generator_factory: Arc<dyn GeneratorFactory> = Arc::new(TemplateGeneratorFactory::new());

    let registry = Registry::new()
        .with_output(Stdout)
        .with_output(ResultsDir::new(&config.results_dir));

    let registry = match command {
        Command::Rally(rally) => {
            let metrics_store = config
                .metricstore
                .as_ref()
                .map(|metricstore| HttpStore::new(metricstore.store_config()))
                .transpose()
                .context("failed to create the metric store client")?
                .map(|store| Arc::new(store) as Arc<dyn BackingStore>);

            let es = &config.elasticsearch;
            let driver = RallyDriver {
                executable: config.rally.executable.clone(),
                username: es.username.clone(),
                password: es.secret_password(),
                ..RallyDriver::new(&es.host)
            };

            registry.with_runner(RallyRunner::new(RallyOptions {
                store,
                metrics_store,
                installer,
                generator_factory,
                driver,
                bench_name: rally.benchmark,
                package_root: rally.package_root,
                work_dir: config.work_dir.clone(),
                corpus_at_path: rally.corpus_at_path,
                rally_track_output_dir: rally.rally_track_output_dir,
                dry_run: rally.dry_run,
                reindex_data: rally.reindex_to_metricstore,
                defer_cleanup: rally.defer_cleanup.unwrap_or(config.rally.defer_cleanup),
                metrics_interval: Some(rally.metrics_interval)
                    .filter(|interval| !interval.is_zero()),
                package_from_registry: rally.package_from_registry,
            }))
        }
        Command::Stream(stream) => registry.with_runner(StreamRunner::new(StreamOptions {
            store,
            installer,
            generator_factory,
            bench_name: stream.benchmark.unwrap_or_default(),
            package_root: stream.package_root,
            backfill: stream.backfill,
            events_per_period: stream.events_per_period,
            period_duration: stream.period_duration,
            perform_cleanup: stream.perform_cleanup,
            timestamp_field: stream.timestamp_field,
        })),
        Command::Version(_) => registry,
    };

    Ok(registry)
}
