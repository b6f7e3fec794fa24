//! The `benchrunner` command line.
//!
//! This builds on top of [`benchrunner_engine`] and wires its runners to layered configuration,
//! logging, signal handling and report output.

pub mod cli;
pub mod config;
pub mod observability;
pub mod output;
pub mod registry;
