//! Configuration types for harrier scans

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::timekeeper::TimeKeeper;

/// Bounds for the concurrent-agent cap
pub const MAX_CONCURRENT_RANGE: std::ops::RangeInclusive<usize> = 1..=20;

/// Scan session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Total time budget for one scan, in minutes
    #[serde(default = "default_budget_minutes")]
    pub budget_minutes: u64,
}

fn default_budget_minutes() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            budget_minutes: default_budget_minutes(),
        }
    }
}

impl SessionConfig {
    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.budget_minutes * 60)
    }
}

/// Agent tree limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cap on concurrently live agents
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Grace window an agent gets after a wrap-up request, in seconds
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_grace_secs() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Probe pacing curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Rough guess at how many probing actions one scan performs
    #[serde(default = "default_estimated_actions")]
    pub estimated_actions: u32,
    /// Shortest delay between probes, in milliseconds
    #[serde(default = "default_floor_ms")]
    pub floor_ms: u64,
    /// Longest delay between probes, in seconds
    #[serde(default = "default_ceiling_secs")]
    pub ceiling_secs: u64,
}

fn default_estimated_actions() -> u32 {
    100
}

fn default_floor_ms() -> u64 {
    250
}

fn default_ceiling_secs() -> u64 {
    60
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            estimated_actions: default_estimated_actions(),
            floor_ms: default_floor_ms(),
            ceiling_secs: default_ceiling_secs(),
        }
    }
}

impl PacingConfig {
    pub fn timekeeper(&self) -> TimeKeeper {
        TimeKeeper::new(
            self.estimated_actions,
            Duration::from_millis(self.floor_ms),
            Duration::from_secs(self.ceiling_secs),
        )
    }
}

/// Knowledge store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".harrier")
        .join("knowledge.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Out-of-band callback listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobConfig {
    /// Domain the external listener answers for; probes embed tokens as
    /// subdomains of it
    #[serde(default = "default_listener_domain")]
    pub listener_domain: String,
    /// Token lifetime, in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_listener_domain() -> String {
    "oob.invalid".to_string()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

impl Default for OobConfig {
    fn default() -> Self {
        Self {
            listener_domain: default_listener_domain(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl OobConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Complete scan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarrierConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub oob: OobConfig,
}

impl HarrierConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from default locations with cascade:
    /// 1. ./harrier.toml (local override)
    /// 2. ~/.harrier/config.toml (global defaults)
    /// 3. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(config) = Self::from_file("harrier.toml") {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let global_path = home.join(".harrier").join("config.toml");
            if let Ok(config) = Self::from_file(&global_path) {
                return config;
            }
        }

        Self::default()
    }

    /// Get the path to the global config file
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".harrier").join("config.toml"))
    }

    /// Expand environment variables in listener fields
    pub fn expand_env_vars(&mut self) {
        let domain = &self.oob.listener_domain;
        if domain.starts_with("${") && domain.ends_with('}') {
            let var_name = &domain[2..domain.len() - 1];
            if let Ok(value) = std::env::var(var_name) {
                self.oob.listener_domain = value;
            }
        }
    }

    /// Reject configurations the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.session.budget_minutes == 0 {
            return Err(Error::Config("session.budget_minutes must be > 0".to_string()));
        }
        if !MAX_CONCURRENT_RANGE.contains(&self.orchestrator.max_concurrent) {
            return Err(Error::Config(format!(
                "orchestrator.max_concurrent must be within {}..={}, got {}",
                MAX_CONCURRENT_RANGE.start(),
                MAX_CONCURRENT_RANGE.end(),
                self.orchestrator.max_concurrent
            )));
        }
        if self.orchestrator.grace_secs == 0 {
            return Err(Error::Config("orchestrator.grace_secs must be > 0".to_string()));
        }
        if self.pacing.estimated_actions == 0 {
            return Err(Error::Config("pacing.estimated_actions must be > 0".to_string()));
        }
        if Duration::from_millis(self.pacing.floor_ms) > Duration::from_secs(self.pacing.ceiling_secs)
        {
            return Err(Error::Config(
                "pacing.floor_ms must not exceed pacing.ceiling_secs".to_string(),
            ));
        }
        let domain = self.oob.listener_domain.trim();
        if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
            return Err(Error::Config(format!(
                "oob.listener_domain is not a usable domain: {:?}",
                self.oob.listener_domain
            )));
        }
        if self.oob.token_ttl_secs == 0 {
            return Err(Error::Config("oob.token_ttl_secs must be > 0".to_string()));
        }
        Ok(())
    }
}
