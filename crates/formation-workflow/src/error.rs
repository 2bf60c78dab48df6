//! Engine error taxonomy
//!
//! Caller-contract violations are typed variants the caller is expected to
//! match on. Validation failures are not errors (see [`crate::StepResult`]).
//! Automation failures are business outcomes handled inside the engine.

use uuid::Uuid;

use crate::state::{InstanceStatus, StepStatus};
use crate::template::TemplateError;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No template for workflow type '{0}'")]
    TemplateNotFound(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Workflow step not found: {0}")]
    StepNotFound(Uuid),

    #[error("Workflow instance {instance_id} is {status}, expected pending")]
    NotPending {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("Step {step_id} is {status} and cannot be completed or skipped")]
    StepNotCompletable { step_id: Uuid, status: StepStatus },

    #[error("Step {0} is not an automated step")]
    NotAutomated(Uuid),

    #[error("Step {0} has no automation config")]
    NoAutomationConfig(Uuid),

    #[error("Step {step_id} is step {step_number} but the workflow is on step {current_step}")]
    NotCurrentStep {
        step_id: Uuid,
        step_number: u32,
        current_step: u32,
    },

    #[error("Step {step_id} is {status}, only failed steps can be retried")]
    NotFailed { step_id: Uuid, status: StepStatus },

    #[error("Workflow instance {instance_id} is already {status}")]
    AlreadyTerminal {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("Workflow instance {instance_id} is {status}; its steps can no longer change")]
    InstanceTerminal {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("Workflow invariant violated on instance {instance_id}: {detail}")]
    InvariantViolation { instance_id: Uuid, detail: String },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Caller-contract violations: the caller asked for an invalid operation
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound(_)
                | Self::NotPending { .. }
                | Self::StepNotCompletable { .. }
                | Self::NotAutomated(_)
                | Self::NoAutomationConfig(_)
                | Self::NotCurrentStep { .. }
                | Self::NotFailed { .. }
                | Self::AlreadyTerminal { .. }
                | Self::InstanceTerminal { .. }
        )
    }
}
