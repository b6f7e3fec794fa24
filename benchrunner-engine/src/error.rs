use thiserror::Error;

use crate::cleanup::MultiError;
use crate::generator::GeneratorError;
use crate::store::StoreError;

/// Errors that can occur while setting up, running or tearing down a benchmark.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration: scenario files, manifests, options.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors on corpus, track and report files.
    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        cause: std::io::Error,
    },

    /// Errors parsing YAML resources such as scenarios and manifests.
    #[error("yaml error: {context}")]
    Yaml {
        context: String,
        #[source]
        cause: serde_yaml::Error,
    },

    /// Errors de/serializing JSON documents and reports.
    #[error("json error: {context}")]
    Json {
        context: String,
        #[source]
        cause: serde_json::Error,
    },

    /// A request against the backing store or the metrics store failed.
    #[error("store error: {context}")]
    Store {
        context: String,
        #[source]
        cause: StoreError,
    },

    /// The event generator could not be built or failed to emit.
    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),

    /// Installing or removing the package under benchmark failed.
    #[error("package installer error: {context}")]
    Installer {
        context: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Data consistency errors: malformed documents, rejected bulk items, empty corpora.
    #[error("{0}")]
    Data(String),

    /// The external load-test driver failed.
    #[error("driver error: {0}")]
    Driver(String),

    /// One or more cleanup steps failed.
    #[error("cleanup failed:\n{0}")]
    Cleanup(#[from] MultiError),

    /// The run was stopped on request.
    #[error("benchmark run cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, cause: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            cause,
        }
    }

    pub(crate) fn store(context: impl Into<String>, cause: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            cause,
        }
    }

    pub(crate) fn json(context: impl Into<String>, cause: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            cause,
        }
    }

    pub(crate) fn yaml(context: impl Into<String>, cause: serde_yaml::Error) -> Self {
        Self::Yaml {
            context: context.into(),
            cause,
        }
    }

    /// Returns `true` if this error signals a requested stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for benchmark operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
