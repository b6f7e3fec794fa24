//! Package fixtures and test doubles shared by the runner tests.
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use benchrunner_engine::Result;
use benchrunner_engine::installer::PackageInstaller;
use tempfile::TempDir;

pub const PACKAGE: &str = "nginx";
pub const VERSION: &str = "1.20.0";

/// A package directory with a manifest and any number of data streams and scenarios.
pub struct PackageFixture {
    dir: TempDir,
}

impl PackageFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("manifest.yml"),
            format!("name: {PACKAGE}\nversion: {VERSION}\ntitle: Nginx\n"),
        )
        .unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn with_data_stream(self, name: &str) -> Self {
        let dir = self.root().join("data_stream").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("manifest.yml"), "type: logs\ntitle: Logs\n").unwrap();
        self
    }

    pub fn with_time_series_data_stream(self, name: &str) -> Self {
        let dir = self.root().join("data_stream").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.yml"),
            "type: metrics\ntitle: Metrics\nelasticsearch:\n  index_mode: time_series\n",
        )
        .unwrap();
        self
    }

    /// Adds a scenario generating `total_events` documents into `data_stream`.
    pub fn with_scenario(self, name: &str, data_stream: &str, total_events: u64) -> Self {
        let contents = format!(
            r#"description: {name}
data_stream:
  name: {data_stream}
corpora:
  generator:
    total_events: {total_events}
    template:
      raw: '{{"message":"{{{{.message}}}}"}}'
    fields:
      raw:
        fields:
          - name: message
            type: keyword
"#
        );
        self.write_scenario(name, &contents)
    }

    /// Adds a scenario without a corpus generator.
    pub fn with_plain_scenario(self, name: &str, data_stream: &str) -> Self {
        let contents = format!("description: {name}\ndata_stream:\n  name: {data_stream}\n");
        self.write_scenario(name, &contents)
    }

    fn write_scenario(self, name: &str, contents: &str) -> Self {
        let dir = self.root().join("_dev/benchmark/rally");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{name}.yml")), contents).unwrap();
        self
    }
}

/// Installer calls, in order, as `(operation, name, version)`.
#[derive(Debug, Default, Clone)]
pub struct RecordingInstaller {
    calls: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl RecordingInstaller {
    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &str, name: &str, version: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_owned(), name.to_owned(), version.to_owned()));
    }
}

#[async_trait::async_trait]
impl PackageInstaller for RecordingInstaller {
    async fn install(&self, name: &str, version: &str) -> Result<()> {
        self.record("install", name, version);
        Ok(())
    }

    async fn uninstall(&self, name: &str, version: &str) -> Result<()> {
        self.record("uninstall", name, version);
        Ok(())
    }
}
