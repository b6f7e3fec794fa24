//! Configuration of the benchmark runner.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `BENCH__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `BENCH__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `BENCH__ELASTICSEARCH__HOST=https://10.0.0.2:9200` sets the store under benchmark
//! - `BENCH__ELASTICSEARCH__PASSWORD=changeme` sets its password
//! - `BENCH__RALLY__EXECUTABLE=/opt/rally/bin/esrally` sets the driver executable
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! elasticsearch:
//!   host: https://10.0.0.2:9200
//!   password: changeme
//!
//! rally:
//!   executable: /opt/rally/bin/esrally
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use benchrunner_engine::installer::FleetConfig;
use benchrunner_engine::rally::DEFAULT_EXECUTABLE;
use benchrunner_engine::store::HttpStoreConfig;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{
    CloneableSecret, ExposeSecret, SecretBox, SecretString, SerializableSecret, zeroize::Zeroize,
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BENCH__";

/// Newtype around `String` that protects against accidental logging of secrets in the
/// configuration. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_owned())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

fn to_secret_string(secret: &Option<SecretBox<ConfigSecret>>) -> Option<SecretString> {
    secret
        .as_ref()
        .map(|secret| SecretString::from(secret.expose_secret().as_str().to_owned()))
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.to_owned()).filter(|value| !value.is_empty())
}

/// Connection to an Elasticsearch-compatible store.
///
/// Used in: [`Config::elasticsearch`], [`Config::metricstore`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConnection {
    /// Base URL of the store.
    ///
    /// # Default
    ///
    /// `https://127.0.0.1:9200`
    pub host: String,

    /// Basic auth user. Empty disables authentication.
    pub username: String,

    /// Basic auth password, redacted from logs.
    pub password: Option<SecretBox<ConfigSecret>>,

    /// Accept any TLS certificate presented by the store.
    pub skip_tls_verify: bool,
}

impl StoreConnection {
    pub fn store_config(&self) -> HttpStoreConfig {
        HttpStoreConfig {
            host: self.host.clone(),
            username: non_empty(&self.username),
            password: self.secret_password(),
            skip_tls_verify: self.skip_tls_verify,
        }
    }

    pub fn secret_password(&self) -> Option<SecretString> {
        to_secret_string(&self.password)
    }
}

impl Default for StoreConnection {
    fn default() -> Self {
        Self {
            host: "https://127.0.0.1:9200".to_owned(),
            username: "elastic".to_owned(),
            password: None,
            skip_tls_verify: true,
        }
    }
}

/// Connection to Kibana, used to install the package under benchmark.
///
/// Used in: [`Config::kibana`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Kibana {
    /// Base URL of Kibana.
    ///
    /// # Default
    ///
    /// `https://127.0.0.1:5601`
    pub host: String,
    pub username: String,
    pub password: Option<SecretBox<ConfigSecret>>,
    pub skip_tls_verify: bool,
}

impl Kibana {
    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            host: self.host.clone(),
            username: non_empty(&self.username),
            password: to_secret_string(&self.password),
            skip_tls_verify: self.skip_tls_verify,
        }
    }
}

impl Default for Kibana {
    fn default() -> Self {
        Self {
            host: "https://127.0.0.1:5601".to_owned(),
            username: "elastic".to_owned(),
            password: None,
            skip_tls_verify: true,
        }
    }
}

/// Settings of the external load-test driver.
///
/// Used in: [`Config::rally`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Rally {
    /// Name of the driver executable on `PATH`, or a path to it.
    ///
    /// # Default
    ///
    /// `esrally`
    pub executable: String,

    /// Pause between the end of a run and its cleanup, unless overridden on the command line.
    ///
    /// # Default
    ///
    /// `0s`
    #[serde(with = "humantime_serde")]
    pub defer_cleanup: Duration,
}

impl Default for Rally {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_owned(),
            defer_cleanup: Duration::ZERO,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Chooses [`LogFormat::Pretty`] for a TTY, otherwise [`LogFormat::Simplified`].
    Auto,
    /// Pretty printing with colors.
    Pretty,
    /// Simplified plain text output.
    Simplified,
    /// JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::error::Error for FormatParseError {}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// `RUST_LOG` provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `auto`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct of the benchmark runner.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The store under benchmark.
    pub elasticsearch: StoreConnection,

    /// Kibana of the stack under benchmark.
    pub kibana: Kibana,

    /// Optional store receiving collected metrics and reindexed benchmark documents.
    ///
    /// # Default
    ///
    /// `None` (metrics are only reported locally)
    pub metricstore: Option<StoreConnection>,

    pub rally: Rally,

    /// Directory below which every run keeps its corpus, track and driver report.
    ///
    /// # Default
    ///
    /// `benchrunner` in the system temporary directory
    pub work_dir: PathBuf,

    /// Directory receiving file reports.
    ///
    /// # Default
    ///
    /// `results` (relative to the working directory)
    pub results_dir: PathBuf,

    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            elasticsearch: StoreConnection::default(),
            kibana: Kibana::default(),
            metricstore: None,
            rally: Rally::default(),
            work_dir: std::env::temp_dir().join("benchrunner"),
            results_dir: PathBuf::from("results"),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided file and the environment.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `BENCH__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if environment variables
    /// contain invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}
