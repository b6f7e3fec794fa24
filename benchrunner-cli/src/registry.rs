//! The runners and output sinks of one CLI invocation.

use anyhow::Result;
use benchrunner_engine::report::Reportable;
use benchrunner_engine::runner::{self, Runner};
use tokio_util::sync::CancellationToken;

use crate::output::{self, OutputSink, Outcome};

/// Holds the runners to execute and the sinks receiving their reports.
#[derive(Debug, Default)]
pub struct Registry {
    runners: Vec<Box<dyn Runner>>,
    outputs: Vec<Box<dyn OutputSink>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: impl Runner + 'static) -> Self {
        self.runners.push(Box::new(runner));
        self
    }

    pub fn with_output(mut self, output: impl OutputSink + 'static) -> Self {
        self.outputs.push(Box::new(output));
        self
    }

    /// Executes every runner in registration order and dispatches their reports.
    ///
    /// A runner stopped through `token` counts as a clean exit. The first failure ends the
    /// invocation.
    pub async fn run(self, token: &CancellationToken) -> Result<()> {
        let Self { runners, outputs } = self;

        for mut runner in runners {
            let bench_type = runner.bench_type();
            let bar = output::spinner(bench_type)?;
            let result = runner::execute(runner.as_mut(), token).await;
            bar.finish_and_clear();

            match result {
                Ok(report) => {
                    if let Some(report) = report {
                        dispatch(&outputs, report)?;
                    }
                    output::print_outcome(bench_type, Outcome::Completed);
                }
                Err(error) if error.is_cancelled() => {
                    output::print_outcome(bench_type, Outcome::Stopped);
                    return Ok(());
                }
                Err(error) => {
                    output::print_outcome(bench_type, Outcome::Failed);
                    return Err(error.into());
                }
            }
        }

        Ok(())
    }
}

/// Hands every part of `report` to each sink accepting it.
fn dispatch(outputs: &[Box<dyn OutputSink>], report: Reportable) -> Result<()> {
    for part in report.split() {
        let mut handled = false;
        for output in outputs.iter().filter(|output| output.accepts(&part)) {
            output.write(&part)?;
            handled = true;
        }

        if !handled {
            tracing::warn!(package = part.package(), "no output accepts report");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use benchrunner_engine::runner::BenchType;
    use benchrunner_engine::Error;

    use super::*;

    #[derive(Debug, Default)]
    struct Capture(Arc<Mutex<Vec<Reportable>>>);

    impl OutputSink for Capture {
        fn accepts(&self, report: &Reportable) -> bool {
            report.filename().is_some()
        }

        fn write(&self, report: &Reportable) -> Result<()> {
            self.0.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Fixed(Option<benchrunner_engine::Result<Option<Reportable>>>);

    #[async_trait::async_trait]
    impl Runner for Fixed {
        fn bench_type(&self) -> BenchType {
            BenchType::Rally
        }

        async fn set_up(&mut self, _token: &CancellationToken) -> benchrunner_engine::Result<()> {
            Ok(())
        }

        async fn run(
            &mut self,
            _token: &CancellationToken,
        ) -> benchrunner_engine::Result<Option<Reportable>> {
            self.0.take().unwrap_or(Ok(None))
        }

        async fn tear_down(
            &mut self,
            _token: &CancellationToken,
        ) -> benchrunner_engine::Result<()> {
            Ok(())
        }
    }

    fn multi() -> Reportable {
        Reportable::Multi {
            package: "nginx".into(),
            parts: vec![
                Reportable::Human {
                    package: "nginx".into(),
                    body: "table".into(),
                },
                Reportable::File {
                    package: "nginx".into(),
                    filename: "rally/abc/report.json".into(),
                    body: b"{}".to_vec(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn dispatches_report_parts() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new()
            .with_runner(Fixed(Some(Ok(Some(multi())))))
            .with_output(Capture(captured.clone()));

        registry.run(&CancellationToken::new()).await.unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].filename(), Some("rally/abc/report.json"));
    }

    #[tokio::test]
    async fn cancelled_runs_are_not_failures() {
        let registry = Registry::new().with_runner(Fixed(Some(Err(Error::Cancelled))));
        registry.run(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn failures_are_returned() {
        let registry =
            Registry::new().with_runner(Fixed(Some(Err(Error::Data("3 failed".into())))));
        let error = registry.run(&CancellationToken::new()).await.unwrap_err();
        assert!(error.to_string().contains("3 failed"));
    }
}
