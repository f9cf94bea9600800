//! Distribution target models

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::health::HealthCheckSpec;

/// Kind of endpoint a target represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    Workstation,
    Container,
    Vm,
    GitRepository,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Workstation => "workstation",
            TargetType::Container => "container",
            TargetType::Vm => "vm",
            TargetType::GitRepository => "git-repository",
        }
    }
}

/// Per-strategy connection settings, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        key_path: Option<String>,
        remote_path: String,
    },
    Docker {
        #[serde(default)]
        host: Option<String>,
        container: String,
        config_path: String,
    },
    Kubernetes {
        #[serde(default)]
        context: Option<String>,
        namespace: String,
        resource: String,
        #[serde(default)]
        service_host: Option<String>,
        #[serde(default)]
        service_port: Option<u16>,
    },
    Git {
        repository_url: String,
        #[serde(default = "default_branch")]
        branch: String,
        path: String,
    },
    Local {
        path: String,
    },
}

fn default_ssh_port() -> u16 {
    22
}

fn default_branch() -> String {
    "main".to_string()
}

impl ConnectionConfig {
    /// Discriminator tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionConfig::Ssh { .. } => "ssh",
            ConnectionConfig::Docker { .. } => "docker",
            ConnectionConfig::Kubernetes { .. } => "kubernetes",
            ConnectionConfig::Git { .. } => "git",
            ConnectionConfig::Local { .. } => "local",
        }
    }

    /// Host used for `{{TARGET_HOST}}` substitution
    pub fn host(&self) -> String {
        match self {
            ConnectionConfig::Ssh { host, .. } => host.clone(),
            ConnectionConfig::Docker { host, .. } => {
                host.clone().unwrap_or_else(|| "localhost".to_string())
            }
            ConnectionConfig::Kubernetes {
                service_host,
                resource,
                namespace,
                ..
            } => service_host
                .clone()
                .unwrap_or_else(|| format!("{}.{}.svc", resource, namespace)),
            ConnectionConfig::Git { repository_url, .. } => url::Url::parse(repository_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "localhost".to_string()),
            ConnectionConfig::Local { .. } => "localhost".to_string(),
        }
    }

    /// Port used for `{{TARGET_PORT}}` substitution
    pub fn port(&self) -> u16 {
        match self {
            ConnectionConfig::Ssh { port, .. } => *port,
            ConnectionConfig::Kubernetes { service_port, .. } => service_port.unwrap_or(80),
            ConnectionConfig::Git { repository_url, .. } => url::Url::parse(repository_url)
                .ok()
                .and_then(|u| u.port_or_known_default())
                .unwrap_or(443),
            ConnectionConfig::Docker { .. } | ConnectionConfig::Local { .. } => 80,
        }
    }

    /// Path used for `{{TARGET_PATH}}` substitution
    pub fn path(&self) -> String {
        match self {
            ConnectionConfig::Ssh { remote_path, .. } => remote_path.clone(),
            ConnectionConfig::Docker { config_path, .. } => config_path.clone(),
            ConnectionConfig::Kubernetes { resource, .. } => resource.clone(),
            ConnectionConfig::Git { path, .. } => path.clone(),
            ConnectionConfig::Local { path } => path.clone(),
        }
    }
}

/// Descriptive metadata used for filtering and reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Provider-specific attributes (department, region, ...)
    #[serde(default, flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// A deployable endpoint produced by a discovery provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionTarget {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Key into the strategy registry
    pub strategy: String,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub metadata: TargetMetadata,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub discovered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DistributionTarget {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        target_type: TargetType,
        strategy: impl Into<String>,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target_type,
            strategy: strategy.into(),
            connection,
            metadata: TargetMetadata::default(),
            health_check: None,
            discovered_at: None,
            last_seen: None,
        }
    }

    pub fn with_metadata(mut self, metadata: TargetMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }
}
