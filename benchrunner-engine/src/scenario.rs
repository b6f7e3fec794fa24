//! Benchmark scenario definitions.
//!
//! A scenario lives in `<package root>/_dev/benchmark/rally/<name>.yml` and describes the target
//! data stream and how to produce the corpus for it:
//!
//! ```yaml
//! description: Benchmark 20000 events ingested
//! data_stream:
//!   name: access
//! corpora:
//!   generator:
//!     total_events: 20000
//!     template:
//!       type: placeholder
//!       path: ./access-benchmark/template.ndjson
//!     config:
//!       path: ./access-benchmark/config.yml
//!     fields:
//!       path: ./access-benchmark/fields.yml
//! ```
//!
//! Package name and version are never read from the file; the caller overlays them from the
//! package manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Directory holding scenario definitions, relative to the package root.
pub const DEV_PATH: &str = "_dev/benchmark/rally";

/// File name suffix used to discover scenarios when none is named explicitly.
pub const SCENARIO_SUFFIX: &str = "-benchmark.yml";

/// A benchmark scenario.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Scenario {
    pub package: String,
    pub description: String,
    pub version: String,
    pub data_stream: DataStream,
    pub corpora: Corpora,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DataStream {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Corpora {
    pub generator: Option<GeneratorSpec>,
}

/// How to generate the corpus for a scenario.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneratorSpec {
    /// Number of documents to generate for a one-shot corpus.
    pub total_events: u64,
    pub template: CorporaTemplate,
    pub config: CorporaAsset,
    pub fields: CorporaAsset,
}

/// A structured generator input given either inline or by path.
///
/// A non-empty `path` takes precedence over `raw`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CorporaAsset {
    pub raw: serde_json::Map<String, serde_json::Value>,
    pub path: String,
}

/// The document template, given either inline or by path.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CorporaTemplate {
    pub raw: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The templating mode of a generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// Plain field substitution. Text that is not a field reference is copied verbatim.
    #[default]
    Placeholder,
    /// Text templates. Only field references are supported by the built-in generator.
    GoText,
}

impl TemplateKind {
    /// Parses a template type, falling back to [`TemplateKind::Placeholder`] for unknown values.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "" | "placeholder" => Self::Placeholder,
            "gotext" => Self::GoText,
            other => {
                tracing::warn!(
                    template_type = other,
                    "unknown generator template type, defaulting to \"placeholder\""
                );
                Self::Placeholder
            }
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder => f.write_str("placeholder"),
            Self::GoText => f.write_str("gotext"),
        }
    }
}

impl Scenario {
    /// The templating mode for this scenario's generator.
    pub fn template_kind(&self) -> TemplateKind {
        self.corpora
            .generator
            .as_ref()
            .map(|generator| TemplateKind::parse(&generator.template.kind))
            .unwrap_or_default()
    }
}

/// Returns the scenario directory of a package.
pub fn scenario_dir(root: &Path) -> PathBuf {
    root.join(DEV_PATH)
}

/// Reads the scenario `name` from the package at `root`.
///
/// `package` and `version` replace whatever the file contains. Fails if the scenario does not
/// name a data stream.
pub fn read_scenario(root: &Path, name: &str, package: &str, version: &str) -> Result<Scenario> {
    let path = scenario_dir(root).join(format!("{name}.yml"));
    read_scenario_file(&path, package, version)
}

fn read_scenario_file(path: &Path, package: &str, version: &str) -> Result<Scenario> {
    let contents = fs::read_to_string(path).map_err(|cause| {
        Error::io(
            format!("can't load benchmark configuration: {}", path.display()),
            cause,
        )
    })?;

    let mut scenario: Scenario = if contents.trim().is_empty() {
        Scenario::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|cause| {
            Error::yaml(
                format!("can't unpack benchmark configuration: {}", path.display()),
                cause,
            )
        })?
    };

    scenario.package = package.to_owned();
    scenario.version = version.to_owned();

    if scenario.data_stream.name.is_empty() {
        return Err(Error::Config(format!(
            "can't read data stream name from benchmark configuration {}: empty",
            path.display()
        )));
    }

    Ok(scenario)
}

/// Reads scenarios from the package at `root`.
///
/// With a `name`, only that scenario is read. Otherwise every `*-benchmark.yml` file below the
/// scenario directory is read, keyed by its file name without extension.
pub fn read_scenarios(
    root: &Path,
    name: Option<&str>,
    package: &str,
    version: &str,
) -> Result<BTreeMap<String, Scenario>> {
    let mut scenarios = BTreeMap::new();

    if let Some(name) = name.filter(|name| !name.is_empty()) {
        let scenario = read_scenario(root, name, package, version)?;
        scenarios.insert(name.to_owned(), scenario);
        return Ok(scenarios);
    }

    let dir = scenario_dir(root);
    for entry in WalkDir::new(&dir).sort_by_file_name() {
        let entry = entry.map_err(|cause| {
            let path = cause.path().unwrap_or(&dir).display().to_string();
            Error::io(format!("error loading scenarios: {path}"), cause.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(stem) = file_name.strip_suffix(".yml")
            && file_name.ends_with(SCENARIO_SUFFIX)
        {
            let scenario = read_scenario_file(entry.path(), package, version)?;
            scenarios.insert(stem.to_owned(), scenario);
        }
    }

    Ok(scenarios)
}
