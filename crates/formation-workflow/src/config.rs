//! Engine configuration: a YAML file with environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Env var overriding `automation_timeout_ms`
pub const ENV_AUTOMATION_TIMEOUT_MS: &str = "FORMATION_AUTOMATION_TIMEOUT_MS";
/// Env var overriding `manual_review_role`
pub const ENV_MANUAL_REVIEW_ROLE: &str = "FORMATION_MANUAL_REVIEW_ROLE";

const DEFAULT_AUTOMATION_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MANUAL_REVIEW_ROLE: &str = "formation_reviewer";
const DEFAULT_AUTOMATION_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on one automation run; exceeding it counts as a failure
    pub automation_timeout_ms: u64,
    /// Assignee for automation fallbacks when the template names no role
    pub manual_review_role: String,
    /// Automations the worker runs at once
    pub automation_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            automation_timeout_ms: DEFAULT_AUTOMATION_TIMEOUT_MS,
            manual_review_role: DEFAULT_MANUAL_REVIEW_ROLE.to_string(),
            automation_concurrency: DEFAULT_AUTOMATION_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    pub fn automation_timeout(&self) -> Duration {
        Duration::from_millis(self.automation_timeout_ms)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.sanitized()
    }

    /// Load from a YAML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_AUTOMATION_TIMEOUT_MS) {
            self.automation_timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| {
                    format!("{} must be milliseconds, got '{}'", ENV_AUTOMATION_TIMEOUT_MS, raw)
                })?;
        }
        if let Some(role) = lookup(ENV_MANUAL_REVIEW_ROLE).filter(|r| !r.trim().is_empty()) {
            self.manual_review_role = role.trim().to_string();
        }
        self.sanitized()
    }

    fn sanitized(mut self) -> Result<Self> {
        anyhow::ensure!(self.automation_timeout_ms > 0, "automation_timeout_ms must be positive");
        anyhow::ensure!(
            !self.manual_review_role.trim().is_empty(),
            "manual_review_role must not be empty"
        );
        if self.automation_concurrency == 0 {
            tracing::warn!("automation_concurrency of 0 raised to 1");
            self.automation_concurrency = 1;
        }
        Ok(self)
    }
}
