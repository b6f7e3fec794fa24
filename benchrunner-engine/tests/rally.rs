use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use benchrunner_engine::Error;
use benchrunner_engine::generator::TemplateGeneratorFactory;
use benchrunner_engine::rally::{RallyDriver, RallyOptions, RallyRunner};
use benchrunner_engine::report::Reportable;
use benchrunner_engine::runner::{self, Runner};
use benchrunner_engine::store::InMemoryStore;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod common;

use common::{PackageFixture, RecordingInstaller};

struct Setup {
    fixture: PackageFixture,
    work_dir: TempDir,
    store: InMemoryStore,
    installer: RecordingInstaller,
}

impl Setup {
    fn new(fixture: PackageFixture) -> Self {
        Self {
            fixture,
            work_dir: tempfile::tempdir().unwrap(),
            store: InMemoryStore::new(),
            installer: RecordingInstaller::default(),
        }
    }

    fn options(&self, bench_name: &str) -> RallyOptions {
        RallyOptions {
            store: Arc::new(self.store.clone()),
            metrics_store: None,
            installer: Arc::new(self.installer.clone()),
            generator_factory: Arc::new(TemplateGeneratorFactory::with_seed(1)),
            driver: RallyDriver::new("http://127.0.0.1:9200"),
            bench_name: bench_name.to_owned(),
            package_root: self.fixture.root().to_path_buf(),
            work_dir: self.work_dir.path().to_path_buf(),
            corpus_at_path: None,
            rally_track_output_dir: None,
            dry_run: true,
            reindex_data: false,
            defer_cleanup: Duration::ZERO,
            metrics_interval: None,
            package_from_registry: None,
        }
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn access_package(total_events: u64) -> PackageFixture {
    PackageFixture::new()
        .with_data_stream("access")
        .with_scenario("access-benchmark", "access", total_events)
}

#[tokio::test]
async fn dry_run_prepares_track_and_cleans_up() {
    let setup = Setup::new(access_package(20));
    let output_dir = tempfile::tempdir().unwrap();

    let mut options = setup.options("access-benchmark");
    options.rally_track_output_dir = Some(output_dir.path().to_path_buf());
    let mut runner = RallyRunner::new(options);
    let token = CancellationToken::new();

    runner.set_up(&token).await.unwrap();
    let run_dir = runner.run_dir().to_path_buf();
    assert!(run_dir.starts_with(setup.work_dir.path()));

    let report = runner.run(&token).await.unwrap();
    assert!(report.is_none());

    let files = files_in(&run_dir);
    assert_eq!(files.len(), 3, "{files:?}");
    assert!(files.iter().any(|name| name.starts_with("corpus-")));
    assert!(files.iter().any(|name| name.starts_with("track-") && name.ends_with(".json")));
    assert!(files.iter().any(|name| name.starts_with("report-") && name.ends_with(".csv")));

    runner.tear_down(&token).await.unwrap();

    assert!(!run_dir.exists());
    let persisted = files_in(output_dir.path());
    assert_eq!(persisted.len(), 2, "{persisted:?}");
    assert!(persisted.contains(&"track-logs-nginx.access-ep.json".to_owned()));

    let corpus_name = persisted
        .iter()
        .find(|name| name.starts_with("corpus-"))
        .unwrap();
    let corpus = std::fs::read_to_string(output_dir.path().join(corpus_name)).unwrap();
    assert_eq!(corpus.lines().count(), 20);

    let track =
        std::fs::read_to_string(output_dir.path().join("track-logs-nginx.access-ep.json"))
            .unwrap();
    assert!(track.contains(r#""document-count": 20"#));
    assert!(track.contains(&format!(r#""source-file": "{corpus_name}""#)));

    let operations: Vec<_> = setup
        .installer
        .calls()
        .into_iter()
        .map(|(operation, _, _)| operation)
        .collect();
    assert_eq!(operations, ["install", "uninstall"]);
}

#[tokio::test]
async fn uses_existing_corpus() {
    let setup = Setup::new(
        PackageFixture::new()
            .with_data_stream("access")
            .with_plain_scenario("access-benchmark", "access"),
    );
    let corpus = setup.work_dir.path().join("existing.ndjson");
    std::fs::write(&corpus, "{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n").unwrap();

    let mut options = setup.options("access-benchmark");
    options.corpus_at_path = Some(corpus.clone());
    let mut runner = RallyRunner::new(options);
    let token = CancellationToken::new();

    runner.set_up(&token).await.unwrap();
    runner.run(&token).await.unwrap();

    let run_dir = runner.run_dir().to_path_buf();
    let copied = files_in(&run_dir)
        .into_iter()
        .find(|name| name.starts_with("corpus-"))
        .unwrap();
    assert_eq!(
        std::fs::read(run_dir.join(copied)).unwrap(),
        std::fs::read(&corpus).unwrap()
    );

    runner.tear_down(&token).await.unwrap();
    assert!(corpus.exists());
}

#[tokio::test]
async fn empty_corpus_is_an_error() {
    let setup = Setup::new(access_package(0));
    let mut runner = RallyRunner::new(setup.options("access-benchmark"));

    let error = runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(&error, Error::Data(message) if message.contains("can't find documents")),
        "{error:?}"
    );
    assert!(!runner.run_dir().exists());
}

#[tokio::test]
async fn missing_generator_and_corpus_is_a_config_error() {
    let setup = Setup::new(
        PackageFixture::new()
            .with_data_stream("access")
            .with_plain_scenario("access-benchmark", "access"),
    );
    let mut runner = RallyRunner::new(setup.options("access-benchmark"));

    let error = runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Config(_)), "{error:?}");
}

#[tokio::test]
async fn registry_package_replaces_local_one() {
    let setup = Setup::new(access_package(5));
    let mut options = setup.options("access-benchmark");
    options.package_from_registry = Some(("nginx".to_owned(), "2.0.0".to_owned()));
    let mut runner = RallyRunner::new(options);

    runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap();

    let calls = setup.installer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], ("install".to_owned(), "nginx".to_owned(), "2.0.0".to_owned()));
    assert_eq!(calls[1], ("uninstall".to_owned(), "nginx".to_owned(), "2.0.0".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn old_data_must_be_cleared() {
    let setup = Setup::new(access_package(5));
    let mut runner = RallyRunner::new(setup.options("access-benchmark"));
    let token = CancellationToken::new();

    runner.set_up(&token).await.unwrap();
    assert_eq!(setup.store.calls("delete_by_query"), 1);

    runner.tear_down(&token).await.unwrap();
    assert_eq!(setup.store.calls("delete_by_query"), 2);
}

/// Writes a stand-in for `esrally` that only produces a CSV report.
#[cfg(unix)]
fn fake_esrally(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let driver = dir.join("fake-esrally");
    std::fs::write(
        &driver,
        r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --report-file=*) report="${arg#--report-file=}" ;;
  esac
done
printf 'Metric,Task,Value,Unit\nMedian Throughput,index-append,1234.5,docs/s\n' > "$report"
"#,
    )
    .unwrap();
    std::fs::set_permissions(&driver, std::fs::Permissions::from_mode(0o755)).unwrap();
    driver.display().to_string()
}

#[cfg(unix)]
#[tokio::test]
async fn races_with_the_driver() {
    let setup = Setup::new(access_package(10));

    let mut options = setup.options("access-benchmark");
    options.dry_run = false;
    options.driver.executable = fake_esrally(setup.work_dir.path());
    let mut runner = RallyRunner::new(options);

    let report = runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    let run_id = runner.run_id().to_owned();
    let parts = report.split();
    assert_eq!(parts.len(), 2);

    let Reportable::Human { package, body } = &parts[0] else {
        panic!("expected a human report first");
    };
    assert_eq!(package, "nginx");
    assert!(body.contains("Median Throughput"));
    assert!(body.contains("1234.5 docs/s"));

    assert_eq!(
        parts[1].filename(),
        Some(format!("rally/{run_id}/report.json").as_str())
    );
    let json: serde_json::Value = serde_json::from_slice(parts[1].report()).unwrap();
    assert_eq!(json["info"]["run_id"], run_id.as_str());
    assert_eq!(json["info"]["benchmark"], "access-benchmark");
}

#[cfg(unix)]
#[tokio::test]
async fn reindexes_benchmark_documents() {
    const DATA_STREAM: &str = "logs-nginx.access-ep";

    let setup = Setup::new(access_package(10));
    let metrics = InMemoryStore::new();
    let mapping = json!({ "properties": { "message": { "type": "keyword" } } });
    setup.store.set_mapping(DATA_STREAM, mapping.clone());

    let mut options = setup.options("access-benchmark");
    options.dry_run = false;
    options.driver.executable = fake_esrally(setup.work_dir.path());
    options.metrics_store = Some(Arc::new(metrics.clone()));
    options.reindex_data = true;
    let mut runner = RallyRunner::new(options);
    let token = CancellationToken::new();

    runner.set_up(&token).await.unwrap();
    // Stands in for the documents the driver indexes during the race.
    setup.store.insert_documents(
        DATA_STREAM,
        (0..12).map(|i| json!({ "message": format!("event {i}") })),
    );
    runner.run(&token).await.unwrap().unwrap();
    runner.tear_down(&token).await.unwrap();

    let index = format!("bench-reindex-{DATA_STREAM}-{}", runner.run_id());
    let documents = metrics.documents(&index);
    assert_eq!(documents.len(), 12);
    assert_eq!(documents[0]["message"], "event 0");
    assert_eq!(
        documents[0]["benchmark_metadata"]["info"]["run_id"],
        runner.run_id()
    );
    assert_eq!(metrics.created_index(&index).unwrap()["mappings"], mapping);
    assert!(setup.store.documents(DATA_STREAM).is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn reindex_requires_a_metric_store() {
    let setup = Setup::new(access_package(5));
    let mut options = setup.options("access-benchmark");
    options.dry_run = false;
    options.driver.executable = fake_esrally(setup.work_dir.path());
    options.reindex_data = true;
    let mut runner = RallyRunner::new(options);

    let error = runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(&error, Error::Config(message) if message.contains("metricstore")),
        "{error:?}"
    );
}

#[tokio::test]
async fn time_series_track_installs_rewritten_template() {
    let setup = Setup::new(
        PackageFixture::new()
            .with_time_series_data_stream("pod")
            .with_scenario("pod-benchmark", "pod", 4),
    );
    setup.store.set_index_template(
        "metrics-nginx.pod",
        json!({
            "template": { "settings": { "index": { "mode": "time_series" } } },
            "overlapping": [{ "name": "metrics", "index_patterns": ["metrics-*"] }],
        }),
    );
    let output_dir = tempfile::tempdir().unwrap();

    let mut options = setup.options("pod-benchmark");
    options.rally_track_output_dir = Some(output_dir.path().to_path_buf());
    let mut runner = RallyRunner::new(options);

    runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(setup.store.calls("simulate_index_template"), 1);
    let track = std::fs::read_to_string(output_dir.path().join("track-metrics-nginx.pod-ep.json"))
        .unwrap();
    assert!(track.contains("create-composable-template"));
    assert!(track.contains(r#""template": "metrics-nginx.pod-ep""#));
    assert!(track.contains(r#""priority":1000"#));
    assert!(track.contains(r#""index_patterns":["metrics-nginx.pod-ep"]"#));
    assert!(track.contains(r#""start_time":"2000-01-01T00:00:00Z""#));
    assert!(!track.contains("overlapping"));
}

#[tokio::test]
async fn missing_index_template_fails_set_up() {
    let setup = Setup::new(
        PackageFixture::new()
            .with_time_series_data_stream("pod")
            .with_scenario("pod-benchmark", "pod", 4),
    );
    let mut runner = RallyRunner::new(setup.options("pod-benchmark"));

    let error = runner::execute(&mut runner, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Store { .. }), "{error:?}");
    assert!(!runner.run_dir().exists());
}

#[tokio::test(start_paused = true)]
async fn cancelled_defer_still_cleans_up() {
    let setup = Setup::new(access_package(5));
    let mut options = setup.options("access-benchmark");
    options.defer_cleanup = Duration::from_secs(3600);
    let mut runner = RallyRunner::new(options);
    let token = CancellationToken::new();

    runner.set_up(&token).await.unwrap();
    let run_dir = runner.run_dir().to_path_buf();

    let stopper = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.cancel();
    });

    let started = Instant::now();
    runner.tear_down(&token).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));

    let operations: Vec<_> = setup
        .installer
        .calls()
        .into_iter()
        .map(|(operation, _, _)| operation)
        .collect();
    assert_eq!(operations, ["install", "uninstall"]);
    assert_eq!(setup.store.calls("delete_by_query"), 2);
    assert!(!run_dir.exists());
}

#[tokio::test]
async fn removes_remaining_files_after_failed_removal() {
    let setup = Setup::new(access_package(5));
    let mut runner = RallyRunner::new(setup.options("access-benchmark"));
    let token = CancellationToken::new();

    runner.set_up(&token).await.unwrap();
    runner.run(&token).await.unwrap();

    let run_dir = runner.run_dir().to_path_buf();
    let corpus = files_in(&run_dir)
        .into_iter()
        .find(|name| name.starts_with("corpus-"))
        .unwrap();
    std::fs::remove_file(run_dir.join(&corpus)).unwrap();

    let error = runner.tear_down(&token).await.unwrap_err();
    assert!(matches!(error, Error::Cleanup(_)), "{error:?}");
    assert!(error.to_string().contains(&corpus), "{error}");
    assert!(!run_dir.exists());
}
