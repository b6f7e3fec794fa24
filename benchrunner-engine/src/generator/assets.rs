use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::GeneratorError;
use crate::scenario::{CorporaAsset, GeneratorSpec, TemplateKind};

/// Template, config and field definitions of a generator, loaded and parsed.
#[derive(Clone, Debug, Default)]
pub struct GeneratorAssets {
    pub kind: TemplateKind,
    pub template: String,
    pub config: GeneratorConfig,
    pub fields: Vec<FieldDefinition>,
}

/// Per-field generation settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub fields: Vec<FieldConfig>,
}

impl GeneratorConfig {
    /// Returns the settings of the field `name`.
    pub fn field(&self, name: &str) -> Option<&FieldConfig> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Inserts `config`, replacing the settings of a field with the same name.
    pub fn set_field(&mut self, config: FieldConfig) {
        match self.fields.iter_mut().find(|field| field.name == config.name) {
            Some(existing) => *existing = config,
            None => self.fields.push(config),
        }
    }
}

/// Generation settings for a single field.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FieldConfig {
    pub name: String,
    /// A fixed value emitted for every document.
    pub value: Option<serde_json::Value>,
    /// Values to pick from at random.
    #[serde(rename = "enum")]
    pub enumeration: Vec<serde_json::Value>,
    /// Bounds for numeric fields.
    pub range: Option<FieldRange>,
    /// Number of distinct values to cycle through.
    pub cardinality: Option<u64>,
    /// Window in the past that date values are spread over.
    #[serde(with = "period")]
    pub period: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FieldRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Name and mapping type of a generated field.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldsDocument {
    List(Vec<FieldDefinition>),
    Wrapped { fields: Vec<FieldDefinition> },
}

/// Durations such as `24h` or `-15m`; the sign is ignored since periods always reach back.
mod period {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                serializer.collect_str(&humantime::format_duration(*duration))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(value) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let value = value.trim();
        humantime::parse_duration(value.strip_prefix('-').unwrap_or(value))
            .map(Some)
            .map_err(D::Error::custom)
    }
}

impl GeneratorAssets {
    /// Loads the assets of `spec`.
    ///
    /// Paths are resolved against `scenario_dir` after environment variable expansion; a
    /// non-empty path wins over inline data.
    pub fn resolve(
        spec: &GeneratorSpec,
        kind: TemplateKind,
        scenario_dir: &Path,
    ) -> Result<Self, GeneratorError> {
        let template = match read_asset("template", &spec.template.path, scenario_dir)? {
            Some(template) => template,
            None => spec.template.raw.clone(),
        };

        let config = match read_asset("config", &spec.config.path, scenario_dir)? {
            Some(data) => parse_yaml(&data, "can't get generator config")?,
            None => parse_raw(&spec.config, "can't parse raw generator config")?,
        };

        let fields: Option<FieldsDocument> =
            match read_asset("fields", &spec.fields.path, scenario_dir)? {
                Some(data) => parse_yaml(&data, "could not load fields yaml")?,
                None => parse_raw(&spec.fields, "can't parse raw generator fields")?,
            };
        let fields = match fields {
            Some(FieldsDocument::List(fields)) | Some(FieldsDocument::Wrapped { fields }) => fields,
            None => Vec::new(),
        };

        Ok(Self {
            kind,
            template,
            config: config.unwrap_or_default(),
            fields,
        })
    }

    /// Spreads the values of the date field `field` over the `period` preceding now.
    pub fn with_backfill(mut self, field: &str, period: Duration) -> Self {
        let mut config = self.config.field(field).cloned().unwrap_or_else(|| FieldConfig {
            name: field.to_owned(),
            ..Default::default()
        });
        config.period = Some(period);
        self.config.set_field(config);
        self
    }
}

fn read_asset(kind: &str, path: &str, base: &Path) -> Result<Option<String>, GeneratorError> {
    if path.is_empty() {
        return Ok(None);
    }

    let path = clean(&base.join(expand_env(path)));
    if !path.exists() {
        return Err(GeneratorError::Asset {
            context: format!("can't find {kind} file {}", path.display()),
            cause: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }

    fs::read_to_string(&path)
        .map(Some)
        .map_err(|cause| GeneratorError::Asset {
            context: format!("can't read {kind} file {}", path.display()),
            cause,
        })
}

fn parse_yaml<T>(data: &str, context: &str) -> Result<Option<T>, GeneratorError>
where
    T: serde::de::DeserializeOwned,
{
    if data.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(data)
        .map(Some)
        .map_err(|cause| GeneratorError::Parse {
            context: context.to_owned(),
            cause,
        })
}

fn parse_raw<T>(asset: &CorporaAsset, context: &str) -> Result<Option<T>, GeneratorError>
where
    T: serde::de::DeserializeOwned,
{
    if asset.raw.is_empty() {
        return Ok(None);
    }
    serde_yaml::to_value(&asset.raw)
        .and_then(serde_yaml::from_value)
        .map(Some)
        .map_err(|cause| GeneratorError::Parse {
            context: context.to_owned(),
            cause,
        })
}

/// Lexically normalizes `path`, resolving `.` and `..` components.
fn clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Replaces `$NAME` and `${NAME}` with the value of the environment variable.
///
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('$') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            output.push('$');
            rest = after;
            continue;
        }

        output.push_str(&std::env::var(name).unwrap_or_default());
        rest = &after[consumed..];
    }

    output.push_str(rest);
    output
}
