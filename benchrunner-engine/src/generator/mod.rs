//! Synthetic document generation.
//!
//! A [`Generator`] produces one serialized JSON document per [`Generator::emit`] call until its
//! event budget is spent. Generators are built by a [`GeneratorFactory`] from resolved
//! [`GeneratorAssets`]; the default factory is [`TemplateGeneratorFactory`], which substitutes
//! field references in a document template with values drawn from field definitions.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

mod assets;
mod template;

pub use assets::{
    FieldConfig, FieldDefinition, FieldRange, GeneratorAssets, GeneratorConfig, expand_env,
};
pub use template::{TemplateGenerator, TemplateGeneratorFactory};

/// Errors raised while building or driving a generator.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// A template, config or fields file could not be found or read.
    #[error("{context}")]
    Asset {
        context: String,
        #[source]
        cause: std::io::Error,
    },

    /// Generator config or field definitions could not be parsed.
    #[error("{context}")]
    Parse {
        context: String,
        #[source]
        cause: serde_yaml::Error,
    },

    /// The template is malformed or references unknown fields.
    #[error("invalid template: {0}")]
    Template(String),

    /// The template uses a construct the generator cannot evaluate.
    #[error("unsupported template construct `{0}`")]
    Unsupported(String),

    /// `emit` was called after `close`.
    #[error("generator already closed")]
    Closed,
}

/// The outcome of a single [`Generator::emit`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Emitted {
    /// One document was appended to the buffer.
    Document,
    /// The event budget is spent; nothing was written.
    EndOfStream,
}

/// A stateful source of serialized documents.
pub trait Generator: fmt::Debug + Send + Sync {
    /// Appends exactly one document to `buf`, or reports the end of the stream.
    fn emit(&mut self, buf: &mut Vec<u8>) -> Result<Emitted, GeneratorError>;

    /// Releases the generator. Consuming `self` guarantees this happens once.
    fn close(self: Box<Self>) -> Result<(), GeneratorError>;
}

/// Builds generators from resolved assets.
pub trait GeneratorFactory: fmt::Debug + Send + Sync {
    /// Builds a generator yielding `total_events` documents, or an unbounded stream for `None`.
    fn build(
        &self,
        assets: &GeneratorAssets,
        total_events: Option<u64>,
    ) -> Result<Box<dyn Generator>, GeneratorError>;
}

/// Number of documents a backfill pass emits.
///
/// This is the number of whole periods in the backfill window times the events per period.
pub fn backfill_budget(backfill: Duration, period: Duration, events_per_period: u64) -> u64 {
    if period.is_zero() {
        return 0;
    }
    let periods = (backfill.as_nanos() / period.as_nanos()) as u64;
    periods.saturating_mul(events_per_period)
}
