//! Fire-and-forget side effects: notifications and the post-completion hook.
//!
//! Both traits are synchronous and infallible from the engine's point of view.
//! Implementations that need I/O must hand the work off (channel, spawned task)
//! instead of blocking the caller, which may be holding an instance lock.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::WorkflowInstance;

/// State changes worth telling someone about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum NotificationEvent {
    WorkflowStarted,
    /// A manual step is now in progress and waiting for input
    StepReady { step_number: u32, step_key: String },
    /// Automation failed and the step was handed to a human
    AutomationFallback {
        step_number: u32,
        error: String,
        assignees: Vec<String>,
    },
    WorkflowFailed { step_number: u32, error: String },
    WorkflowCompleted,
    WorkflowCancelled,
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::StepReady { .. } => "step_ready",
            Self::AutomationFallback { .. } => "automation_fallback",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowCancelled => "workflow_cancelled",
        }
    }
}

/// Receives workflow notifications. Must not block or fail the caller.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, instance: &WorkflowInstance, event: NotificationEvent);
}

/// Company-level side effect once a workflow completes (e.g., license generation)
pub trait PostCompletionDispatcher: Send + Sync {
    fn on_workflow_completed(&self, instance: &WorkflowInstance);
}

/// Logs notifications as structured events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, instance: &WorkflowInstance, event: NotificationEvent) {
        tracing::info!(
            instance_id = %instance.id,
            company_id = %instance.company_id,
            workflow_type = %instance.workflow_type,
            kind = event.kind(),
            ?event,
            "Workflow notification"
        );
    }
}

/// Notification as delivered over a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub instance_id: Uuid,
    pub company_id: Uuid,
    pub workflow_type: String,
    pub event: NotificationEvent,
}

/// Forwards notifications to an unbounded channel (delivery workers, tests)
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotificationSink {
    fn notify(&self, instance: &WorkflowInstance, event: NotificationEvent) {
        let notification = Notification {
            instance_id: instance.id,
            company_id: instance.company_id,
            workflow_type: instance.workflow_type.clone(),
            event,
        };
        if self.tx.send(notification).is_err() {
            tracing::debug!(
                instance_id = %instance.id,
                "Notification receiver dropped, discarding notification"
            );
        }
    }
}

/// Post-completion hook that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPostCompletion;

impl PostCompletionDispatcher for TracingPostCompletion {
    fn on_workflow_completed(&self, instance: &WorkflowInstance) {
        tracing::info!(
            instance_id = %instance.id,
            company_id = %instance.company_id,
            workflow_type = %instance.workflow_type,
            "Workflow completed, no post-completion handler configured"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelNotificationSink::new();
        let instance =
            WorkflowInstance::new(Uuid::new_v4(), "ifza_company_formation", HashMap::new());

        sink.notify(
            &instance,
            NotificationEvent::StepReady {
                step_number: 1,
                step_key: "license".into(),
            },
        );

        let received = rx.try_recv().unwrap();
        assert_eq!(received.instance_id, instance.id);
        assert_eq!(received.event.kind(), "step_ready");
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelNotificationSink::new();
        drop(rx);
        let instance =
            WorkflowInstance::new(Uuid::new_v4(), "ifza_company_formation", HashMap::new());

        sink.notify(&instance, NotificationEvent::WorkflowCompleted);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = NotificationEvent::WorkflowFailed {
            step_number: 2,
            error: "portal down".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "workflow_failed");
        assert_eq!(json["step_number"], 2);
    }
}
