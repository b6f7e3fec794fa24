//! The lifecycle shared by all benchmark runners.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::report::Reportable;

/// The kinds of benchmarks that can be executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BenchType {
    /// A one-shot corpus replayed by the external load-test driver.
    Rally,
    /// Continuous ingestion at a fixed rate.
    Stream,
}

impl BenchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rally => "rally",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for BenchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A benchmark that is set up, run and torn down again.
#[async_trait::async_trait]
pub trait Runner: fmt::Debug + Send {
    fn bench_type(&self) -> BenchType;

    /// Acquires everything the run needs.
    async fn set_up(&mut self, token: &CancellationToken) -> Result<()>;

    /// Runs the benchmark. Runners that produce no report return `None`.
    async fn run(&mut self, token: &CancellationToken) -> Result<Option<Reportable>>;

    /// Releases whatever [`set_up`](Self::set_up) and [`run`](Self::run) acquired.
    ///
    /// Runs even when the token is cancelled.
    async fn tear_down(&mut self, token: &CancellationToken) -> Result<()>;
}

/// Sets up and runs `runner`, then always tears it down.
///
/// A set-up or run error takes precedence over a teardown error, which is logged instead.
pub async fn execute(
    runner: &mut dyn Runner,
    token: &CancellationToken,
) -> Result<Option<Reportable>> {
    let bench_type = runner.bench_type();

    tracing::debug!(%bench_type, "setting up benchmark");
    let outcome = match runner.set_up(token).await {
        Ok(()) => {
            tracing::debug!(%bench_type, "running benchmark");
            runner.run(token).await
        }
        Err(error) => Err(error),
    };

    tracing::debug!(%bench_type, "tearing down benchmark");
    let teardown = runner.tear_down(token).await;

    match (outcome, teardown) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(error)) => Err(error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(teardown)) => {
            tracing::error!(
                %bench_type,
                error = &teardown as &dyn std::error::Error,
                "could not tear down benchmark"
            );
            Err(error)
        }
    }
}
