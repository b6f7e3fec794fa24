//! Package and data stream manifests, and the index names derived from them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

const MANIFEST_FILE: &str = "manifest.yml";

/// The index mode that marks a data stream as time-series indexed.
const TIME_SERIES_INDEX_MODE: &str = "time_series";

/// The top-level `manifest.yml` of a package.
#[derive(Clone, Debug, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub title: String,
}

impl PackageManifest {
    /// Reads `<root>/manifest.yml`.
    pub fn read(root: &Path) -> Result<Self> {
        read_yaml(&root.join(MANIFEST_FILE), "reading package manifest failed")
    }
}

/// Elasticsearch-specific settings of a data stream.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DataStreamElasticsearch {
    #[serde(default)]
    pub index_mode: Option<String>,
}

/// The `manifest.yml` of a single data stream.
#[derive(Clone, Debug, Deserialize)]
pub struct DataStreamManifest {
    /// Name of the data stream, taken from its directory.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub elasticsearch: Option<DataStreamElasticsearch>,
}

impl DataStreamManifest {
    /// Reads `<root>/data_stream/<data_stream>/manifest.yml`.
    pub fn read(root: &Path, data_stream: &str) -> Result<Self> {
        let path = data_stream_path(root, data_stream).join(MANIFEST_FILE);
        let mut manifest: Self = read_yaml(&path, "reading data stream manifest failed")?;
        manifest.name = data_stream.to_owned();
        Ok(manifest)
    }

    /// Returns `true` if the data stream uses time-series index mode.
    pub fn is_time_series(&self) -> bool {
        self.elasticsearch
            .as_ref()
            .and_then(|es| es.index_mode.as_deref())
            == Some(TIME_SERIES_INDEX_MODE)
    }
}

/// The directory of a data stream within a package.
pub fn data_stream_path(root: &Path, data_stream: &str) -> PathBuf {
    root.join("data_stream").join(data_stream)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path, context: &str) -> Result<T> {
    let contents = fs::read_to_string(path)
        .map_err(|cause| Error::io(format!("{context}: {}", path.display()), cause))?;
    serde_yaml::from_str(&contents)
        .map_err(|cause| Error::yaml(format!("{context}: {}", path.display()), cause))
}

/// Index and pipeline names for one data stream of an installed package.
///
/// All names derive from package, data stream type and name, so scenarios targeting different
/// data streams never share an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataStreamTarget {
    /// The data stream documents are written to during a benchmark.
    pub runtime_data_stream: String,
    /// The composable index template installed with the package.
    pub index_template: String,
    /// Prefix shared by all ingest pipelines of the data stream.
    pub pipeline_prefix: String,
    pub is_time_series: bool,
}

impl DataStreamTarget {
    pub fn new(package: &PackageManifest, data_stream: &DataStreamManifest, version: &str) -> Self {
        let index_template = format!("{}-{}.{}", data_stream.kind, package.name, data_stream.name);
        Self {
            runtime_data_stream: format!("{index_template}-ep"),
            pipeline_prefix: format!("{index_template}-{version}"),
            index_template,
            is_time_series: data_stream.is_time_series(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(root: &Path) {
        fs::write(
            root.join(MANIFEST_FILE),
            "name: nginx\nversion: 1.20.0\ntitle: Nginx\n",
        )
        .unwrap();
    }

    fn data_stream(root: &Path, name: &str, contents: &str) {
        let dir = data_stream_path(root, name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), contents).unwrap();
    }

    #[test]
    fn derives_names() {
        let root = tempfile::tempdir().unwrap();
        package(root.path());
        data_stream(root.path(), "access", "type: logs\ntitle: Access logs\n");

        let package = PackageManifest::read(root.path()).unwrap();
        let manifest = DataStreamManifest::read(root.path(), "access").unwrap();
        let target = DataStreamTarget::new(&package, &manifest, &package.version);

        assert_eq!(target.runtime_data_stream, "logs-nginx.access-ep");
        assert_eq!(target.index_template, "logs-nginx.access");
        assert_eq!(target.pipeline_prefix, "logs-nginx.access-1.20.0");
        assert!(!target.is_time_series);
    }

    #[test]
    fn detects_time_series() {
        let root = tempfile::tempdir().unwrap();
        package(root.path());
        data_stream(
            root.path(),
            "stats",
            "type: metrics\nelasticsearch:\n  index_mode: time_series\n",
        );

        let manifest = DataStreamManifest::read(root.path(), "stats").unwrap();
        assert_eq!(manifest.name, "stats");
        assert!(manifest.is_time_series());
    }

    #[test]
    fn missing_manifest() {
        let root = tempfile::tempdir().unwrap();
        let error = PackageManifest::read(root.path()).unwrap_err();
        assert!(error.to_string().contains("reading package manifest failed"));
    }
}
