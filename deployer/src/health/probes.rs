//! Built-in health probes
//!
//! A probe runs one attempt against an already-resolved endpoint. Retries,
//! backoff and the per-attempt timeout belong to the checker.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::models::health::HealthCriteria;

fn failure(message: impl Into<String>) -> DeployerError {
    DeployerError::HealthCheckFailure(message.into())
}

/// One attempt of a typed check; `Ok` carries a short success message
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(
        &self,
        endpoint: &str,
        criteria: &HealthCriteria,
        timeout: Duration,
    ) -> Result<String, DeployerError>;
}

/// GET the endpoint and compare status and body
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(
        &self,
        endpoint: &str,
        criteria: &HealthCriteria,
        timeout: Duration,
    ) -> Result<String, DeployerError> {
        let url = url::Url::parse(endpoint)
            .map_err(|e| failure(format!("invalid url '{}': {}", endpoint, e)))?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    failure("request timed out")
                } else {
                    failure(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        let status_ok = match criteria.expected_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        if !status_ok {
            return Err(failure(format!("unexpected status {}", status)));
        }

        if let Some(needle) = &criteria.contains {
            let body = response
                .text()
                .await
                .map_err(|e| failure(format!("failed to read body: {}", e)))?;
            if !body.contains(needle.as_str()) {
                return Err(failure(format!("response body does not contain '{}'", needle)));
            }
        }

        Ok(format!("HTTP {}", status))
    }
}

/// Open a TCP connection to `host:port`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(
        &self,
        endpoint: &str,
        _criteria: &HealthCriteria,
        timeout: Duration,
    ) -> Result<String, DeployerError> {
        let address = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(format!("connected to {}", address)),
            Ok(Err(e)) => Err(failure(format!("connect to {} failed: {}", address, e))),
            Err(_) => Err(failure(format!("connect to {} timed out", address))),
        }
    }
}

/// Run the endpoint as a shell command and check exit code and stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProbe;

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn probe(
        &self,
        endpoint: &str,
        criteria: &HealthCriteria,
        timeout: Duration,
    ) -> Result<String, DeployerError> {
        debug!("Running health command: {}", endpoint);
        let output = tokio::time::timeout(
            timeout,
            Command::new("sh")
                .arg("-c")
                .arg(endpoint)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| failure("command timed out"))?
        .map_err(|e| failure(format!("failed to spawn command: {}", e)))?;

        let expected = criteria.expected_exit_code.unwrap_or(0);
        let code = output.status.code();
        if code != Some(expected) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "exit code {:?} (expected {}): {}",
                code,
                expected,
                stderr.trim()
            )));
        }

        if let Some(needle) = &criteria.contains {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.contains(needle.as_str()) {
                return Err(failure(format!("output does not contain '{}'", needle)));
            }
        }

        Ok(format!("exit code {}", expected))
    }
}

/// Check that a path exists
#[derive(Debug, Clone, Copy, Default)]
pub struct FileExistsProbe;

#[async_trait]
impl HealthProbe for FileExistsProbe {
    async fn probe(
        &self,
        endpoint: &str,
        _criteria: &HealthCriteria,
        _timeout: Duration,
    ) -> Result<String, DeployerError> {
        match tokio::fs::metadata(Path::new(endpoint)).await {
            Ok(_) => Ok(format!("{} exists", endpoint)),
            Err(e) => Err(failure(format!("{}: {}", endpoint, e))),
        }
    }
}

/// Parse a JSON configuration file and check required keys
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidationProbe;

#[async_trait]
impl HealthProbe for ConfigValidationProbe {
    async fn probe(
        &self,
        endpoint: &str,
        criteria: &HealthCriteria,
        _timeout: Duration,
    ) -> Result<String, DeployerError> {
        let value: serde_json::Value = File::new(endpoint)
            .read_json()
            .await
            .map_err(|e| failure(format!("invalid configuration {}: {}", endpoint, e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| failure(format!("{} is not a JSON object", endpoint)))?;

        let missing: Vec<&str> = criteria
            .required_keys
            .iter()
            .filter(|key| !object.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(failure(format!("missing keys: {}", missing.join(", "))));
        }

        Ok(format!("{} is valid", endpoint))
    }
}
