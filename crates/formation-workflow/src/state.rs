//! Workflow State Types
//!
//! Defines the instance/step data model and the status transition guards.
//! An instance and its steps travel together as a [`WorkflowAggregate`], the
//! unit of work the engine loads, mutates and saves under one lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::template::ValidationRules;

/// Opaque step payload: template config plus captured submission/result data.
pub type StepData = serde_json::Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Statuses
// ─────────────────────────────────────────────────────────────────────────────

/// Overall status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal instances are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for InstanceStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StatusParseError::UnknownInstanceStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Completed or skipped: counts toward workflow completion
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Terminal step states do not transition (a failed step only via retry)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Open steps can still be started, completed, skipped or failed
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Can this status transition to the given status?
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        use StepStatus::*;
        match (self, target) {
            (Pending, InProgress | Completed | Skipped | Failed) => true,
            (InProgress, Completed | Skipped | Failed) => true,
            // Retry resets a failed step
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl FromStr for StepStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(StatusParseError::UnknownStepStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of work a step represents. Only `Auto` is machine-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Form,
    DocUpload,
    Auto,
    Review,
    Payment,
    Issuance,
    Notify,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::DocUpload => "doc_upload",
            Self::Auto => "auto",
            Self::Review => "review",
            Self::Payment => "payment",
            Self::Issuance => "issuance",
            Self::Notify => "notify",
        }
    }

    pub fn is_automated(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl FromStr for StepType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(Self::Form),
            "doc_upload" => Ok(Self::DocUpload),
            "auto" => Ok(Self::Auto),
            "review" => Ok(Self::Review),
            "payment" => Ok(Self::Payment),
            "issuance" => Ok(Self::Issuance),
            "notify" => Ok(Self::Notify),
            _ => Err(StatusParseError::UnknownStepType(s.to_string())),
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatusParseError {
    #[error("Unknown instance status: {0}")]
    UnknownInstanceStatus(String),

    #[error("Unknown step status: {0}")]
    UnknownStepStatus(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance
// ─────────────────────────────────────────────────────────────────────────────

/// One run of a formation workflow for one company
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    /// Instance ID
    pub id: Uuid,
    /// Company the workflow runs for
    pub company_id: Uuid,
    /// Workflow type key (e.g., "ifza_company_formation")
    pub workflow_type: String,
    /// Overall lifecycle status
    pub status: InstanceStatus,
    /// Step number currently being worked on; 0 = not started
    pub current_step: u32,
    /// Copied from the template at creation (name, version, estimated duration)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Set on activation
    pub started_at: Option<DateTime<Utc>>,
    /// Set when every step is completed or skipped
    pub completed_at: Option<DateTime<Utc>>,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// Last change to the instance row
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        company_id: Uuid,
        workflow_type: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            company_id,
            workflow_type: workflow_type.into(),
            status: InstanceStatus::Pending,
            current_step: 0,
            metadata,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_in_progress(&mut self) {
        let now = Utc::now();
        self.status = InstanceStatus::InProgress;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = InstanceStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.status = InstanceStatus::Failed;
        self.touch();
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = InstanceStatus::Cancelled;
        self.touch();
    }

    /// Move the current step pointer forward. Never moves backwards.
    pub(crate) fn point_to(&mut self, step_number: u32) {
        debug_assert!(step_number >= self.current_step);
        self.current_step = self.current_step.max(step_number);
        self.touch();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Step
// ─────────────────────────────────────────────────────────────────────────────

/// One unit of work within an instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Step ID
    pub id: Uuid,
    /// Owning instance
    pub workflow_instance_id: Uuid,
    /// 1-based, contiguous within the instance
    pub step_number: u32,
    /// Template slug (e.g., "ubos")
    pub key: String,
    /// Human-readable title shown to the assignee
    pub title: String,
    /// Manual kind or Auto
    pub step_type: StepType,
    /// Current step status
    pub status: StepStatus,
    /// Captured data: submissions, automation results, fallback and skip markers
    #[serde(default)]
    pub data: StepData,
    /// Fixed at creation from the template
    pub validation_rules: ValidationRules,
    /// Roles/users the step is assigned to (set by fallback-to-manual)
    #[serde(default)]
    pub assignees: Vec<String>,
    /// When the step went in progress
    pub started_at: Option<DateTime<Utc>>,
    /// When the step was completed, skipped or failed
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason for a failed step
    pub error_message: Option<String>,
}

impl WorkflowStep {
    pub fn new(
        workflow_instance_id: Uuid,
        step_number: u32,
        key: impl Into<String>,
        title: impl Into<String>,
        step_type: StepType,
        validation_rules: ValidationRules,
        data: StepData,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_instance_id,
            step_number,
            key: key.into(),
            title: title.into(),
            step_type,
            status: StepStatus::Pending,
            data,
            validation_rules,
            assignees: Vec::new(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Shallow merge: incoming keys overwrite, everything else is preserved
    pub fn merge_data(&mut self, incoming: StepData) {
        for (key, value) in incoming {
            self.data.insert(key, value);
        }
    }

    /// Pending → InProgress. Already in progress is left as is.
    pub(crate) fn start(&mut self) -> bool {
        match self.status {
            StepStatus::Pending => {
                self.status = StepStatus::InProgress;
                self.started_at = Some(Utc::now());
                true
            }
            StepStatus::InProgress => true,
            _ => false,
        }
    }

    pub(crate) fn finish(&mut self, status: StepStatus) {
        debug_assert!(status.is_finished());
        debug_assert!(self.status.can_transition_to(status));
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error_message: impl Into<String>) {
        debug_assert!(self.status.can_transition_to(StepStatus::Failed));
        self.status = StepStatus::Failed;
        self.error_message = Some(error_message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Failed → Pending with the run metadata cleared
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.status.can_transition_to(StepStatus::Pending));
        self.status = StepStatus::Pending;
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────────────────────────

/// An instance together with its steps, ordered by step number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowAggregate {
    pub instance: WorkflowInstance,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowAggregate {
    pub fn new(instance: WorkflowInstance, mut steps: Vec<WorkflowStep>) -> Self {
        steps.sort_by_key(|s| s.step_number);
        Self { instance, steps }
    }

    pub fn step_index(&self, step_id: Uuid) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn step_by_number(&self, step_number: u32) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    pub fn step_by_key(&self, key: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Every step completed or skipped
    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status.is_finished())
    }

    /// Next open step after the current pointer, stepping over steps
    /// that were finished ahead of time
    pub(crate) fn next_open_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.step_number > self.instance.current_step && s.status.is_open())
            .min_by_key(|(_, s)| s.step_number)
            .map(|(idx, _)| idx)
    }

    pub fn progress(&self) -> WorkflowProgress {
        let total_steps = self.steps.len() as u32;
        let completed_steps = self
            .steps
            .iter()
            .filter(|s| s.status.is_finished())
            .count() as u32;

        let percentage = if total_steps > 0 {
            (completed_steps as f32 / total_steps as f32) * 100.0
        } else {
            0.0
        };

        WorkflowProgress {
            instance_id: self.instance.id,
            total_steps,
            completed_steps,
            current_step: self.instance.current_step,
            percentage,
            status: self.instance.status,
        }
    }
}

/// Progress summary for one instance
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowProgress {
    pub instance_id: Uuid,
    pub total_steps: u32,
    /// Completed plus skipped
    pub completed_steps: u32,
    pub current_step: u32,
    pub percentage: f32,
    pub status: InstanceStatus,
}
