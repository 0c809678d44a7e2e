//! tierscale.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::{ScalingPolicy, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierscaleConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_metrics_window_secs")]
    pub metrics_window_secs: u64,
    /// Period of allocator reconciliation, timeout checks and directory repair.
    #[serde(default = "default_reconcile_ms")]
    pub reconcile_ms: u64,
    #[serde(default)]
    pub directory_propagation_ms: u64,
    /// How long removed and retired directory entries are remembered.
    #[serde(default = "default_tombstone_retention_secs")]
    pub tombstone_retention_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub creation_timeout_secs: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub tier: Tier,
    /// Port the service's instances listen on.
    #[serde(default = "default_service_port")]
    pub port: u16,
    /// Initial replica count; for the stateful tier, the ordinal count.
    #[serde(default)]
    pub replicas: u32,
    pub policy: Option<ScalingPolicy>,
}

fn default_tick_secs() -> u64 {
    15
}

fn default_metrics_window_secs() -> u64 {
    60
}

fn default_reconcile_ms() -> u64 {
    1000
}

fn default_tombstone_retention_secs() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tierscale")
}

fn default_port() -> u16 {
    8480
}

fn default_event_capacity() -> usize {
    1024
}

fn default_service_port() -> u16 {
    8080
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            metrics_window_secs: default_metrics_window_secs(),
            reconcile_ms: default_reconcile_ms(),
            directory_propagation_ms: 0,
            tombstone_retention_secs: default_tombstone_retention_secs(),
            startup_timeout_secs: default_timeout_secs(),
            creation_timeout_secs: default_timeout_secs(),
            data_dir: default_data_dir(),
            port: default_port(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl TierscaleConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: TierscaleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.tick_secs == 0 {
            return Err(ConfigError::ZeroTick);
        }
        if self.controller.reconcile_ms == 0 {
            return Err(ConfigError::ZeroReconcile);
        }
        let mut seen = HashSet::new();
        for svc in &self.services {
            if svc.name.trim().is_empty() {
                return Err(ConfigError::EmptyServiceName);
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(ConfigError::DuplicateService(svc.name.clone()));
            }
            if let Some(policy) = &svc.policy {
                policy.validate().map_err(|source| ConfigError::Policy {
                    service: svc.name.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Scaffold the two-tier layout: an autoscaled web tier over a
    /// three-replica database.
    pub fn scaffold() -> Self {
        TierscaleConfig {
            controller: ControllerConfig::default(),
            services: vec![
                ServiceConfig {
                    name: "web".to_string(),
                    tier: Tier::Stateless,
                    port: 8080,
                    replicas: 2,
                    policy: Some(ScalingPolicy {
                        target_utilization: 0.5,
                        min_replicas: 2,
                        max_replicas: 10,
                        scale_up_step_limit: 4,
                        scale_down_step_limit: 1,
                        stabilization_window: 20,
                    }),
                },
                ServiceConfig {
                    name: "db".to_string(),
                    tier: Tier::Stateful,
                    port: 5432,
                    replicas: 3,
                    policy: None,
                },
            ],
        }
    }
}
