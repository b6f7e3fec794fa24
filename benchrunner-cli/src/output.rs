//! Destinations of benchmark reports and terminal feedback.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use benchrunner_engine::report::Reportable;
use benchrunner_engine::runner::BenchType;
use indicatif::{ProgressBar, ProgressStyle};
use yansi::Paint;

/// Receives the reports of finished runs.
pub trait OutputSink: fmt::Debug + Send + Sync {
    /// Whether this sink handles `report`. Only called with split, non-multi reports.
    fn accepts(&self, report: &Reportable) -> bool;

    fn write(&self, report: &Reportable) -> Result<()>;
}

/// Prints human readable reports to stdout.
#[derive(Debug, Default)]
pub struct Stdout;

impl OutputSink for Stdout {
    fn accepts(&self, report: &Reportable) -> bool {
        matches!(report, Reportable::Human { .. })
    }

    fn write(&self, report: &Reportable) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "--- Benchmark results for package: {} ---", report.package())?;
        stdout.write_all(report.report())?;
        stdout.flush()?;
        Ok(())
    }
}

/// Writes file reports below a results directory.
#[derive(Debug)]
pub struct ResultsDir {
    dir: PathBuf,
}

impl ResultsDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl OutputSink for ResultsDir {
    fn accepts(&self, report: &Reportable) -> bool {
        report.filename().is_some()
    }

    fn write(&self, report: &Reportable) -> Result<()> {
        let Some(filename) = report.filename() else {
            return Ok(());
        };

        let path = self.dir.join(filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("could not create results directory {}", parent.display())
            })?;
        }
        std::fs::write(&path, report.report())
            .with_context(|| format!("could not write report {}", path.display()))?;

        tracing::info!(path = %path.display(), "report written");
        Ok(())
    }
}

/// A spinner shown on stderr while a benchmark executes.
pub fn spinner(bench_type: BenchType) -> Result<ProgressBar> {
    let bar = ProgressBar::new_spinner()
        .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
        .with_message(format!("Running {bench_type} benchmark:"));
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

/// Outcome of one executed runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Stopped,
    Failed,
}

/// Prints the final status line of a benchmark.
pub fn print_outcome(bench_type: BenchType, outcome: Outcome) {
    let label = format!("## {bench_type} benchmark");
    match outcome {
        Outcome::Completed => println!("{} {}", label.bold(), "completed".bold().green()),
        Outcome::Stopped => println!("{} {}", label.bold(), "stopped".bold().yellow()),
        Outcome::Failed => println!("{} {}", label.bold(), "FAILED".bold().red()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_dir_writes_file_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultsDir::new(dir.path());
        let report = Reportable::File {
            package: "nginx".into(),
            filename: "rally/abc/report.json".into(),
            body: b"{}".to_vec(),
        };

        assert!(sink.accepts(&report));
        sink.write(&report).unwrap();

        let written = std::fs::read(dir.path().join("rally/abc/report.json")).unwrap();
        assert_eq!(written, b"{}");
    }

    #[test]
    fn sinks_pick_their_reports() {
        let human = Reportable::Human {
            package: "nginx".into(),
            body: "table".into(),
        };
        let file = Reportable::File {
            package: "nginx".into(),
            filename: "report.json".into(),
            body: Vec::new(),
        };

        assert!(Stdout.accepts(&human));
        assert!(!Stdout.accepts(&file));
        assert!(!ResultsDir::new("results").accepts(&human));
    }
}
