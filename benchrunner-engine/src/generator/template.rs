//! The built-in field substitution generator.

use std::time::{Duration, SystemTime};

use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{
    Emitted, FieldConfig, FieldDefinition, Generator, GeneratorAssets, GeneratorError,
    GeneratorFactory,
};
use crate::scenario::TemplateKind;

/// Length of generated keyword values.
const KEYWORD_LENGTH: usize = 10;

/// Builds [`TemplateGenerator`]s.
#[derive(Clone, Debug, Default)]
pub struct TemplateGeneratorFactory {
    seed: Option<u64>,
}

impl TemplateGeneratorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a fixed seed for all generators built by this factory.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

impl GeneratorFactory for TemplateGeneratorFactory {
    fn build(
        &self,
        assets: &GeneratorAssets,
        total_events: Option<u64>,
    ) -> Result<Box<dyn Generator>, GeneratorError> {
        let seed = self.seed.unwrap_or_else(rand::random);
        let generator = TemplateGenerator::new(assets, total_events, seed)?;
        Ok(Box::new(generator))
    }
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Field(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FieldKind {
    Keyword,
    ConstantKeyword,
    Integer,
    Float,
    Boolean,
    Ip,
    Date,
    GeoPoint,
}

impl FieldKind {
    fn parse(name: &str, kind: &str) -> Self {
        match kind {
            "" | "keyword" | "text" | "match_only_text" | "wildcard" => Self::Keyword,
            "constant_keyword" => Self::ConstantKeyword,
            "long" | "integer" | "short" | "byte" | "unsigned_long" => Self::Integer,
            "double" | "float" | "half_float" | "scaled_float" => Self::Float,
            "boolean" => Self::Boolean,
            "ip" => Self::Ip,
            "date" => Self::Date,
            "geo_point" => Self::GeoPoint,
            other => {
                tracing::debug!(field = name, field_type = other, "generating keyword values");
                Self::Keyword
            }
        }
    }
}

/// Where a date value falls for the current document.
#[derive(Clone, Copy, Debug)]
struct Clock {
    now: SystemTime,
    started: SystemTime,
    emitted: u64,
    total: Option<u64>,
}

#[derive(Debug)]
struct FieldSource {
    name: String,
    kind: FieldKind,
    config: FieldConfig,
    constant: Option<serde_json::Value>,
    pool: Vec<String>,
}

impl FieldSource {
    fn new(
        name: &str,
        definition: Option<&FieldDefinition>,
        config: Option<&FieldConfig>,
    ) -> Result<Self, GeneratorError> {
        let config = config.cloned().unwrap_or_default();
        let kind = match definition {
            Some(definition) => FieldKind::parse(name, &definition.kind),
            None if config.period.is_some() => FieldKind::Date,
            None => FieldKind::Keyword,
        };

        if let Some(range) = config.range {
            let bounds = [range.min, range.max];
            if bounds.iter().flatten().any(|bound| !bound.is_finite()) {
                return Err(GeneratorError::Template(format!(
                    "field `{name}` has a non-finite range bound"
                )));
            }
            if let [Some(min), Some(max)] = bounds
                && min > max
            {
                return Err(GeneratorError::Template(format!(
                    "field `{name}` has range min {min} above max {max}"
                )));
            }
        }

        Ok(Self {
            name: name.to_owned(),
            kind,
            constant: definition.and_then(|definition| definition.value.clone()),
            config,
            pool: Vec::new(),
        })
    }

    fn generate(&mut self, rng: &mut SmallRng, clock: Clock) -> String {
        if let Some(value) = &self.config.value {
            return render(value);
        }
        if !self.config.enumeration.is_empty() {
            let index = rng.random_range(0..self.config.enumeration.len());
            return render(&self.config.enumeration[index]);
        }
        if self.kind == FieldKind::Date {
            return self.date(rng, clock);
        }

        match self.config.cardinality {
            Some(cardinality) if cardinality > 0 => {
                if (self.pool.len() as u64) < cardinality {
                    let value = self.fresh(rng);
                    self.pool.push(value.clone());
                    value
                } else {
                    self.pool[rng.random_range(0..self.pool.len())].clone()
                }
            }
            _ => self.fresh(rng),
        }
    }

    fn fresh(&self, rng: &mut SmallRng) -> String {
        let range = self.config.range.unwrap_or_default();
        match self.kind {
            FieldKind::Keyword => rng
                .sample_iter(Alphanumeric)
                .take(KEYWORD_LENGTH)
                .map(char::from)
                .collect(),
            FieldKind::ConstantKeyword => match &self.constant {
                Some(value) => render(value),
                None => self.name.clone(),
            },
            FieldKind::Integer => {
                let min = range.min.unwrap_or(0.0) as i64;
                let max = range.max.unwrap_or(10_000.0) as i64;
                if min >= max {
                    min.to_string()
                } else {
                    rng.random_range(min..=max).to_string()
                }
            }
            FieldKind::Float => {
                let min = range.min.unwrap_or(0.0);
                let max = range.max.unwrap_or(10_000.0);
                let value = if min >= max {
                    min
                } else {
                    rng.random_range(min..max)
                };
                format!("{value:.2}")
            }
            FieldKind::Boolean => rng.random_bool(0.5).to_string(),
            FieldKind::Ip => {
                let [a, b, c, d]: [u8; 4] = rng.random();
                format!("{a}.{b}.{c}.{d}")
            }
            FieldKind::GeoPoint => {
                let lat: f64 = rng.random_range(-90.0..90.0);
                let lon: f64 = rng.random_range(-180.0..180.0);
                format!("{lat:.4},{lon:.4}")
            }
            FieldKind::Date => humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
        }
    }

    fn date(&self, rng: &mut SmallRng, clock: Clock) -> String {
        let timestamp = match (self.config.period, clock.total) {
            (Some(period), Some(total)) if total > 0 => {
                let offset = period.mul_f64(clock.emitted as f64 / total as f64);
                earlier(clock.started, period) + offset
            }
            (Some(period), _) => earlier(clock.now, period.mul_f64(rng.random::<f64>())),
            (None, _) => clock.now,
        };
        humantime::format_rfc3339_millis(timestamp).to_string()
    }
}

/// Steps back from `time`, stopping at the Unix epoch.
fn earlier(time: SystemTime, period: Duration) -> SystemTime {
    time.checked_sub(period).unwrap_or(SystemTime::UNIX_EPOCH)
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'))
}

/// Generates documents by substituting `{{.field}}` references in a template.
///
/// A field referenced several times in one template gets the same value within a document.
#[derive(Debug)]
pub struct TemplateGenerator {
    segments: Vec<Segment>,
    fields: Vec<FieldSource>,
    rng: SmallRng,
    total: Option<u64>,
    emitted: u64,
    started: SystemTime,
    closed: bool,
}

impl TemplateGenerator {
    pub fn new(
        assets: &GeneratorAssets,
        total_events: Option<u64>,
        seed: u64,
    ) -> Result<Self, GeneratorError> {
        let mut fields: Vec<FieldSource> = Vec::new();
        let mut segments = Vec::new();
        let mut rest = assets.template.as_str();

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            let Some(length) = rest[start..].find("}}") else {
                return Err(GeneratorError::Template(format!(
                    "unclosed action at `{}`",
                    &rest[start..]
                )));
            };

            let action = &rest[start..start + length + 2];
            let inner = action[2..action.len() - 2]
                .trim()
                .trim_start_matches('-')
                .trim_end_matches('-')
                .trim();

            match inner.strip_prefix('.').filter(|name| is_field_name(name)) {
                Some(name) => {
                    let index = match fields.iter().position(|field| field.name == name) {
                        Some(index) => index,
                        None => {
                            let definition = assets.fields.iter().find(|f| f.name == name);
                            let config = assets.config.field(name);
                            if definition.is_none() && config.is_none() {
                                return Err(GeneratorError::Template(format!(
                                    "field `{name}` is not defined"
                                )));
                            }
                            fields.push(FieldSource::new(name, definition, config)?);
                            fields.len() - 1
                        }
                    };
                    segments.push(Segment::Field(index));
                }
                None => match assets.kind {
                    TemplateKind::Placeholder => segments.push(Segment::Literal(action.to_owned())),
                    TemplateKind::GoText => {
                        return Err(GeneratorError::Unsupported(inner.to_owned()));
                    }
                },
            }

            rest = &rest[start + length + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self {
            segments,
            fields,
            rng: SmallRng::seed_from_u64(seed),
            total: total_events,
            emitted: 0,
            started: SystemTime::now(),
            closed: false,
        })
    }

    /// Number of documents emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl Generator for TemplateGenerator {
    fn emit(&mut self, buf: &mut Vec<u8>) -> Result<Emitted, GeneratorError> {
        if self.closed {
            return Err(GeneratorError::Closed);
        }
        if let Some(total) = self.total
            && self.emitted >= total
        {
            return Ok(Emitted::EndOfStream);
        }

        let clock = Clock {
            now: SystemTime::now(),
            started: self.started,
            emitted: self.emitted,
            total: self.total,
        };

        let mut values: Vec<Option<String>> = vec![None; self.fields.len()];
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => buf.extend_from_slice(text.as_bytes()),
                Segment::Field(index) => {
                    let value = values[*index]
                        .get_or_insert_with(|| self.fields[*index].generate(&mut self.rng, clock));
                    buf.extend_from_slice(value.as_bytes());
                }
            }
        }

        self.emitted += 1;
        Ok(Emitted::Document)
    }

    fn close(mut self: Box<Self>) -> Result<(), GeneratorError> {
        self.closed = true;
        tracing::trace!(emitted = self.emitted, "generator closed");
        Ok(())
    }
}
