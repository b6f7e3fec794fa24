//! Execution engine for data-ingestion benchmarks.
//!
//! The engine drives benchmarks against an Elasticsearch-compatible [backing
//! store](store::BackingStore). Two [runners](runner::Runner) are provided:
//!
//! - [`rally::RallyRunner`] generates a one-shot corpus and replays it with the external `esrally`
//!   driver, collecting [metrics](collector::Collector) before and after the race and producing
//!   a [`report::Report`].
//! - [`stream::StreamRunner`] continuously ingests generated documents at a fixed rate until it
//!   is stopped.
//!
//! Runners are executed through [`runner::execute`], which always tears them down again. Every
//! resource acquired during set up or run is released by a [`cleanup::CleanupChain`].
#![warn(missing_debug_implementations)]

pub mod cleanup;
pub mod collector;
pub mod error;
pub mod generator;
pub mod installer;
pub mod package;
pub mod rally;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod stats;
pub mod store;
pub mod stream;
pub mod wait;

pub use error::{Error, Result};
