//! Installation of the package under benchmark.

use std::fmt;

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::error::{Error, Result};

/// Installs and removes packages on the stack under benchmark.
#[async_trait::async_trait]
pub trait PackageInstaller: fmt::Debug + Send + Sync + 'static {
    async fn install(&self, name: &str, version: &str) -> Result<()>;

    async fn uninstall(&self, name: &str, version: &str) -> Result<()>;
}

/// Errors of the [`FleetInstaller`].
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("request failed")]
    Reqwest(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Connection settings of a [`FleetInstaller`].
#[derive(Default)]
pub struct FleetConfig {
    /// Base URL of Kibana, such as `https://127.0.0.1:5601`.
    pub host: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub skip_tls_verify: bool,
}

impl fmt::Debug for FleetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("skip_tls_verify", &self.skip_tls_verify)
            .finish()
    }
}

/// Installs packages from the package registry through the Fleet API of Kibana.
pub struct FleetInstaller {
    client: reqwest::Client,
    host: String,
    username: Option<String>,
    password: Option<SecretString>,
}

impl fmt::Debug for FleetInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetInstaller")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl FleetInstaller {
    pub fn new(config: FleetConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::store::USER_AGENT)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|cause| installer_error("failed to build http client", cause.into()))?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_owned(),
            username: config.username.filter(|username| !username.is_empty()),
            password: config.password,
        })
    }

    fn package_url(&self, name: &str, version: &str) -> String {
        format!("{}/api/fleet/epm/packages/{name}/{version}", self.host)
    }

    async fn send(&self, method: Method, name: &str, version: &str) -> Result<(), FleetError> {
        let mut builder = self
            .client
            .request(method, self.package_url(name, version))
            .header("kbn-xsrf", "benchrunner");
        if let Some(username) = &self.username {
            builder = builder.basic_auth(
                username,
                self.password.as_ref().map(|password| password.expose_secret()),
            );
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await?;
        Err(FleetError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn installer_error(context: impl Into<String>, cause: FleetError) -> Error {
    Error::Installer {
        context: context.into(),
        cause: Box::new(cause),
    }
}

#[async_trait::async_trait]
impl PackageInstaller for FleetInstaller {
    async fn install(&self, name: &str, version: &str) -> Result<()> {
        tracing::debug!(package = name, version, "installing package");
        self.send(Method::POST, name, version)
            .await
            .map_err(|cause| {
                installer_error(format!("cannot install package {name}@{version}"), cause)
            })
    }

    async fn uninstall(&self, name: &str, version: &str) -> Result<()> {
        tracing::debug!(package = name, version, "removing package");
        match self.send(Method::DELETE, name, version).await {
            Err(FleetError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                tracing::debug!(package = name, "package is not installed");
                Ok(())
            }
            result => result.map_err(|cause| {
                installer_error(format!("error removing benchmark package {name}@{version}"), cause)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_package_urls() {
        let installer = FleetInstaller::new(FleetConfig {
            host: "https://localhost:5601/".into(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            installer.package_url("nginx", "1.2.3"),
            "https://localhost:5601/api/fleet/epm/packages/nginx/1.2.3"
        );
    }

    #[test]
    fn debug_hides_password() {
        let config = FleetConfig {
            host: "https://localhost:5601".into(),
            username: Some("elastic".into()),
            password: Some(SecretString::from("changeme")),
            skip_tls_verify: false,
        };

        assert!(!format!("{config:?}").contains("changeme"));
        let installer = FleetInstaller::new(config).unwrap();
        assert!(!format!("{installer:?}").contains("changeme"));
    }
}
