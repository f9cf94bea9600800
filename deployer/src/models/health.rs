//! Health check models

use serde::{Deserialize, Serialize};

/// Probe kinds supported by the health checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckType {
    Http,
    Tcp,
    Command,
    FileExists,
    ConfigValidation,
}

impl HealthCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckType::Http => "http",
            HealthCheckType::Tcp => "tcp",
            HealthCheckType::Command => "command",
            HealthCheckType::FileExists => "file-exists",
            HealthCheckType::ConfigValidation => "config-validation",
        }
    }
}

/// Success criteria for a probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCriteria {
    /// Expected HTTP status (any 2xx when absent)
    #[serde(default)]
    pub expected_status: Option<u16>,
    /// Substring the HTTP body or command stdout must contain
    #[serde(default)]
    pub contains: Option<String>,
    /// Expected command exit code (0 when absent)
    #[serde(default)]
    pub expected_exit_code: Option<i32>,
    /// Top-level keys a validated configuration must carry
    #[serde(default)]
    pub required_keys: Vec<String>,
}

/// Health check specification attached to a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    /// Endpoint template; supports `{{TARGET_HOST}}`, `{{TARGET_PORT}}`, `{{TARGET_PATH}}`
    pub endpoint: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub criteria: HealthCriteria,
}

fn default_timeout_seconds() -> u64 {
    10
}

impl HealthCheckSpec {
    pub fn new(check_type: HealthCheckType, endpoint: impl Into<String>) -> Self {
        Self {
            check_type,
            endpoint: endpoint.into(),
            timeout_seconds: default_timeout_seconds(),
            retries: 0,
            criteria: HealthCriteria::default(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of one health check (after retries)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check_type: HealthCheckType,
    pub endpoint: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: u64,
    pub attempts: u32,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
