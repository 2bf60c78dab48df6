//! Formation Workflow Engine
//!
//! Drives company-formation workflows (license applications, document
//! collection, payments, registry submissions) through ordered, typed steps.
//!
//! Key concepts:
//! - A template defines the steps of one workflow type; an instance is one
//!   company's run of it
//! - Manual steps are completed with validated submissions; Auto steps run
//!   through an [`AutomationRunner`] and may fall back to manual review
//! - All mutations of one instance are serialized; the instance and its steps
//!   are saved together as a [`WorkflowAggregate`]
//!
//! # Example
//!
//! ```yaml
//! workflow_type: ifza_company_formation
//! name: IFZA Free Zone Company Formation
//! version: 3
//! fallback:
//!   allow_manual: true
//! steps:
//!   - number: 1
//!     key: company_details
//!     type: form
//!     title: Company details
//!     fields:
//!       - name: proposed_name
//!         min_length: 3
//!   - number: 2
//!     key: name_reservation
//!     type: auto
//!     title: Reserve trade name
//!     automation:
//!       action: portal.reserve_name
//! ```

mod automation;
mod config;
mod engine;
mod error;
mod notify;
mod state;
mod store;
mod template;
mod validator;
mod worker;

pub use automation::{
    ActionRegistry, AutomationAction, AutomationError, AutomationOutcome, AutomationRunner,
    ACTION_KEY,
};
pub use config::{EngineConfig, ENV_AUTOMATION_TIMEOUT_MS, ENV_MANUAL_REVIEW_ROLE};
pub use engine::{
    AutomationJob, AutomationQueue, EngineCollaborators, StepResult, WorkflowEngine,
    AUTOMATION_ERROR_KEY, FALLBACK_INSTRUCTIONS_KEY, FALLBACK_TO_MANUAL_KEY, SKIP_REASON_KEY,
};
pub use error::WorkflowError;
pub use notify::{
    ChannelNotificationSink, Notification, NotificationEvent, NotificationSink,
    PostCompletionDispatcher, TracingNotificationSink, TracingPostCompletion,
};
pub use state::{
    InstanceStatus, StatusParseError, StepData, StepStatus, StepType, WorkflowAggregate,
    WorkflowInstance, WorkflowProgress, WorkflowStep,
};
pub use store::{MemoryStore, WorkflowStore};
pub use template::{
    DocumentRequirement, FallbackPolicy, FieldRule, FieldType, PaymentLineItem,
    StaticTemplateProvider, StepDefinition, StepTemplateProvider, TemplateError, ValidationRules,
    WorkflowTemplate,
    YamlTemplateProvider, AUTOMATION_KEY,
};
pub use validator::{FieldError, StepValidator};
pub use worker::AutomationWorker;
