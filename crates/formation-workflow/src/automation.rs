//! Automation boundary.
//!
//! The engine hands an Auto step's config to an [`AutomationRunner`] and
//! interprets the outcome; nothing else calls the runner. [`ActionRegistry`]
//! is the stock runner: it routes on the config's `action` name to a
//! registered handler (portal robots, registry lookups, document generators).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::state::StepData;

/// Config key naming the action to run
pub const ACTION_KEY: &str = "action";

/// Result reported by an automation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationOutcome {
    pub ok: bool,
    /// Result payload; merged into the step on success
    #[serde(default)]
    pub data: StepData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AutomationOutcome {
    pub fn success(data: StepData) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: StepData::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Automation config has no 'action'")]
    MissingAction,

    #[error("Unknown automation action: {0}")]
    UnknownAction(String),

    #[error("Automation backend error: {0}")]
    Backend(String),
}

/// Executes automation configs
#[async_trait]
pub trait AutomationRunner: Send + Sync {
    async fn run(&self, config: &StepData) -> Result<AutomationOutcome, AutomationError>;
}

/// One named automation action
#[async_trait]
pub trait AutomationAction: Send + Sync {
    async fn execute(&self, config: &StepData) -> Result<AutomationOutcome, AutomationError>;
}

/// Runner dispatching on the config's `action` name
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn AutomationAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn AutomationAction>) {
        let name = name.into();
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::debug!(action = %name, "Replaced automation action handler");
        }
    }

    pub fn with(mut self, name: impl Into<String>, action: Arc<dyn AutomationAction>) -> Self {
        self.register(name, action);
        self
    }

    /// Sorted action names
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl AutomationRunner for ActionRegistry {
    async fn run(&self, config: &StepData) -> Result<AutomationOutcome, AutomationError> {
        let name = config
            .get(ACTION_KEY)
            .and_then(|v| v.as_str())
            .ok_or(AutomationError::MissingAction)?;
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| AutomationError::UnknownAction(name.to_string()))?;

        tracing::debug!(action = %name, "Running automation action");
        action.execute(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAction;

    #[async_trait]
    impl AutomationAction for EchoAction {
        async fn execute(&self, config: &StepData) -> Result<AutomationOutcome, AutomationError> {
            let mut data = StepData::new();
            data.insert("echo".into(), json!(config.get("portal").cloned()));
            Ok(AutomationOutcome::success(data))
        }
    }

    fn config(value: serde_json::Value) -> StepData {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_registry_routes_by_action() {
        let registry = ActionRegistry::new().with("portal.reserve_name", Arc::new(EchoAction));

        let outcome = registry
            .run(&config(json!({ "action": "portal.reserve_name", "portal": "ifza" })))
            .await
            .unwrap();

        assert!(outcome.ok);
        assert_eq!(outcome.data["echo"], json!("ifza"));
        assert_eq!(registry.actions(), vec!["portal.reserve_name"]);
    }

    #[tokio::test]
    async fn test_registry_unknown_and_missing_action() {
        let registry = ActionRegistry::new().with("portal.reserve_name", Arc::new(EchoAction));

        let unknown = registry.run(&config(json!({ "action": "registry.lookup" }))).await;
        assert!(matches!(
            unknown,
            Err(AutomationError::UnknownAction(name)) if name == "registry.lookup"
        ));

        let missing = registry.run(&config(json!({ "portal": "ifza" }))).await;
        assert!(matches!(missing, Err(AutomationError::MissingAction)));
    }
}
