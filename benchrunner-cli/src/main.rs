//! Executes data-ingestion benchmarks against a running stack.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use anyhow::Result;

fn main() -> Result<()> {
    benchrunner_cli::cli::execute()
}
