//! The external load-test driver, `esrally`.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::report::{BenchValue, RallyStat};

/// Default name of the driver executable.
pub const DEFAULT_EXECUTABLE: &str = "esrally";

const INSTALL_HINT: &str =
    "please follow instruction at https://esrally.readthedocs.io/en/stable/install.html";

/// Invokes the driver against one target store.
#[derive(Clone)]
pub struct RallyDriver {
    /// Executable name looked up on `PATH`, or a path to it.
    pub executable: String,
    /// URL of the store under benchmark.
    pub host: String,
    pub username: String,
    pub password: Option<SecretString>,
}

impl fmt::Debug for RallyDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RallyDriver")
            .field("executable", &self.executable)
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Files and identifiers of a single race.
#[derive(Clone, Copy, Debug)]
pub struct Race<'a> {
    pub run_id: &'a str,
    pub track: &'a Path,
    pub report: &'a Path,
}

impl RallyDriver {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_owned(),
            host: host.into(),
            username: String::new(),
            password: None,
        }
    }

    /// Command line arguments of a race.
    pub fn args(&self, race: &Race<'_>) -> Vec<String> {
        let password = self
            .password
            .as_ref()
            .map(|password| password.expose_secret())
            .unwrap_or_default();

        let target_hosts = json!({ "default": [self.host] });
        let client_options = json!({ "default": {
            "basic_auth_user": self.username,
            "basic_auth_password": password,
            "use_ssl": self.host.starts_with("https://"),
            "verify_certs": false,
        }});

        vec![
            "race".to_owned(),
            format!("--race-id={}", race.run_id),
            "--report-format=csv".to_owned(),
            format!("--report-file={}", race.report.display()),
            format!("--target-hosts={target_hosts}"),
            format!("--track-path={}", race.track.display()),
            format!("--client-options={client_options}"),
            "--pipeline=benchmark-only".to_owned(),
            "--kill-running-processes".to_owned(),
        ]
    }

    /// Runs a race and returns the statistics the driver reported.
    ///
    /// Cancelling `token` kills the driver process.
    pub async fn race(&self, race: &Race<'_>, token: &CancellationToken) -> Result<Vec<RallyStat>> {
        let executable = self.locate()?;
        tracing::debug!(
            executable = %executable.display(),
            track = %race.track.display(),
            "running rally"
        );

        let mut command = tokio::process::Command::new(&executable);
        command.args(self.args(race)).kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            output = command.output() => output.map_err(|cause| {
                Error::io(format!("could not run {}", executable.display()), cause)
            })?,
        };

        if !output.status.success() {
            return Err(Error::Driver(format!(
                "could not run esrally track {} ({}, stdout={:?}, stderr={:?})",
                race.track.display(),
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            )));
        }

        read_report(race.report)
    }

    /// Resolves the executable on `PATH`.
    fn locate(&self) -> Result<PathBuf> {
        let not_found = || {
            Error::Config(format!(
                "could not run esrally track: {} not found, {INSTALL_HINT}",
                self.executable
            ))
        };

        let executable = Path::new(&self.executable);
        if executable.components().count() > 1 {
            if !executable.is_file() {
                return Err(not_found());
            }
            return Ok(executable.to_path_buf());
        }

        let path = std::env::var_os("PATH").unwrap_or_else(OsString::new);
        std::env::split_paths(&path)
            .map(|dir| dir.join(executable))
            .find(|candidate| candidate.is_file())
            .ok_or_else(not_found)
    }
}

/// Parses the CSV report of a race.
///
/// Rows are kept in file order, including the header row. Missing columns are empty.
pub fn read_report(path: &Path) -> Result<Vec<RallyStat>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|error| {
            Error::Driver(format!(
                "could not open esrally report {}: {error}",
                path.display()
            ))
        })?;

    let mut stats = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|error| {
            Error::Driver(format!("could not read esrally report {}: {error}", path.display()))
        })?;
        let column = |index| record.get(index).unwrap_or_default();

        stats.push(RallyStat {
            metric: column(0).to_owned(),
            task: column(1).to_owned(),
            value: BenchValue::parse(column(2)),
            unit: column(3).to_owned(),
        });
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_race_arguments() {
        let driver = RallyDriver {
            username: "elastic".into(),
            password: Some(SecretString::from("changeme")),
            ..RallyDriver::new("https://127.0.0.1:9200")
        };
        let args = driver.args(&Race {
            run_id: "abc",
            track: Path::new("/tmp/track-1.json"),
            report: Path::new("/tmp/report-1.csv"),
        });

        assert_eq!(args[0], "race");
        assert!(args.contains(&"--race-id=abc".to_owned()));
        assert!(
            args.contains(&r#"--target-hosts={"default":["https://127.0.0.1:9200"]}"#.to_owned())
        );
        assert!(args.contains(&"--track-path=/tmp/track-1.json".to_owned()));
        assert!(args.contains(&"--report-file=/tmp/report-1.csv".to_owned()));
        let client_options = args.iter().find(|arg| arg.starts_with("--client-options=")).unwrap();
        assert!(client_options.contains(r#""basic_auth_password":"changeme""#));
        assert!(client_options.contains(r#""use_ssl":true"#));
        assert_eq!(args.last().unwrap(), "--kill-running-processes");
        assert!(!format!("{driver:?}").contains("changeme"));
    }

    #[test]
    fn missing_executable_is_a_config_error() {
        let driver = RallyDriver {
            executable: "benchrunner-no-such-driver".into(),
            ..RallyDriver::new("http://localhost:9200")
        };

        let error = driver.locate().unwrap_err();
        assert!(matches!(error, Error::Config(message) if message.contains("install.html")));
    }

    #[test]
    fn parses_csv_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(
            &path,
            "Metric,Task,Value,Unit\n\
             Median Throughput,bulk,1234.5,docs/s\n\
             error rate,bulk,0,%\n\
             Total Young Gen GC count,,12\n",
        )
        .unwrap();

        let stats = read_report(&path).unwrap();

        assert_eq!(stats.len(), 4);
        assert!(stats[0].is_header());
        assert_eq!(stats[1].value, BenchValue::Float(1234.5));
        assert_eq!(stats[2].value, BenchValue::Integer(0));
        assert_eq!(stats[3].unit, "");
        assert_eq!(stats[3].task, "");
    }
}
