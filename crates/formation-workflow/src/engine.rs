//! Workflow Engine
//!
//! Drives formation workflows through their steps: creation, activation,
//! manual completion, skips, automated execution with fallback-to-manual,
//! retries, cancellation and completion detection.
//!
//! Every mutation of an instance happens while holding that instance's lock:
//! load the aggregate, apply guards and transitions, save, then emit side
//! effects. Automated steps are not executed inline; they are queued for the
//! [`crate::AutomationWorker`], whose results come back through the same
//! locked entry points.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::automation::AutomationRunner;
use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::notify::{NotificationEvent, NotificationSink, PostCompletionDispatcher};
use crate::state::{
    InstanceStatus, StepData, StepStatus, WorkflowAggregate, WorkflowInstance, WorkflowProgress,
    WorkflowStep,
};
use crate::store::WorkflowStore;
use crate::template::{FallbackPolicy, StepTemplateProvider, AUTOMATION_KEY};
use crate::validator::{FieldError, StepValidator};

/// Step data keys written by the engine
pub const FALLBACK_TO_MANUAL_KEY: &str = "fallbackToManual";
pub const AUTOMATION_ERROR_KEY: &str = "automationError";
pub const FALLBACK_INSTRUCTIONS_KEY: &str = "fallbackInstructions";
pub const SKIP_REASON_KEY: &str = "skipReason";

/// Outcome of a step completion attempt
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub ok: bool,
    /// Step state after the call (unchanged when validation failed)
    pub step: WorkflowStep,
    pub validation_errors: Vec<FieldError>,
}

/// An Auto step waiting to be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationJob {
    pub instance_id: Uuid,
    pub step_id: Uuid,
    pub step_number: u32,
}

/// Receiving end of the automation dispatch queue
pub struct AutomationQueue {
    pub(crate) rx: mpsc::UnboundedReceiver<AutomationJob>,
}

/// Collaborators the engine is wired with
pub struct EngineCollaborators {
    pub store: Arc<dyn WorkflowStore>,
    pub templates: Arc<dyn StepTemplateProvider>,
    pub automation: Arc<dyn AutomationRunner>,
    pub notifications: Arc<dyn NotificationSink>,
    pub post_completion: Arc<dyn PostCompletionDispatcher>,
}

/// Per-instance lock table. Idle entries are pruned on acquire.
#[derive(Default)]
struct InstanceLocks {
    table: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    async fn acquire(&self, instance_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the table holds an idle entry
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(instance_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Marks a step's automation as running until dropped
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<Uuid>>,
    step_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.step_id);
    }
}

/// Side effects collected during a mutation, emitted after the save
#[derive(Default)]
struct Effects {
    notifications: Vec<NotificationEvent>,
    jobs: Vec<AutomationJob>,
    completed: bool,
}

struct EngineInner {
    store: Arc<dyn WorkflowStore>,
    templates: Arc<dyn StepTemplateProvider>,
    automation: Arc<dyn AutomationRunner>,
    notifications: Arc<dyn NotificationSink>,
    post_completion: Arc<dyn PostCompletionDispatcher>,
    config: EngineConfig,
    locks: InstanceLocks,
    running: Mutex<HashSet<Uuid>>,
    jobs: mpsc::UnboundedSender<AutomationJob>,
}

/// The workflow execution engine. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine and the queue its automation jobs are sent to
    pub fn new(
        collaborators: EngineCollaborators,
        config: EngineConfig,
    ) -> (Self, AutomationQueue) {
        let (jobs, rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(EngineInner {
                store: collaborators.store,
                templates: collaborators.templates,
                automation: collaborators.automation,
                notifications: collaborators.notifications,
                post_completion: collaborators.post_completion,
                config,
                locks: InstanceLocks::default(),
                running: Mutex::new(HashSet::new()),
                jobs,
            }),
        };
        (engine, AutomationQueue { rx })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creation and lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a pending instance and all of its steps from the template.
    ///
    /// Callers must make sure no non-terminal instance exists for the same
    /// (company, workflow type); see [`WorkflowEngine::find_active`].
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        company_id: Uuid,
        workflow_type: &str,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let template = self
            .inner
            .templates
            .load(workflow_type)
            .await?
            .ok_or_else(|| WorkflowError::TemplateNotFound(workflow_type.to_string()))?;
        template.check()?;

        let instance =
            WorkflowInstance::new(company_id, workflow_type, template.instance_metadata());
        let steps = template
            .steps
            .iter()
            .map(|def| {
                WorkflowStep::new(
                    instance.id,
                    def.number,
                    def.key.clone(),
                    def.title.clone(),
                    def.step_type,
                    def.validation_rules(),
                    def.initial_data(),
                )
            })
            .collect();
        let aggregate = WorkflowAggregate::new(instance, steps);

        self.inner.store.insert(&aggregate).await?;

        info!(
            instance_id = %aggregate.instance.id,
            template_version = template.version,
            steps = aggregate.steps.len(),
            "Workflow instance created"
        );
        Ok(aggregate.instance)
    }

    /// Move a pending instance to in progress and start its first step
    #[instrument(skip(self))]
    pub async fn activate(&self, instance_id: Uuid) -> Result<(), WorkflowError> {
        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;

        if aggregate.instance.status != InstanceStatus::Pending {
            return Err(WorkflowError::NotPending {
                instance_id,
                status: aggregate.instance.status,
            });
        }

        let mut effects = Effects::default();
        aggregate.instance.mark_in_progress();
        effects.notifications.push(NotificationEvent::WorkflowStarted);

        if aggregate.is_complete() {
            // Every step was finished before activation
            self.complete_workflow(&mut aggregate, &mut effects);
        } else {
            self.advance(&mut aggregate, &mut effects)?;
        }

        self.inner.store.save(&aggregate).await?;
        info!(
            instance_id = %instance_id,
            current_step = aggregate.instance.current_step,
            "Workflow activated"
        );
        self.emit(&aggregate.instance, effects);
        Ok(())
    }

    /// Mark a non-terminal instance cancelled. Steps are left as they are.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: Uuid) -> Result<(), WorkflowError> {
        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;

        if aggregate.instance.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                instance_id,
                status: aggregate.instance.status,
            });
        }

        aggregate.instance.mark_cancelled();
        self.inner.store.save(&aggregate).await?;

        info!(instance_id = %instance_id, "Workflow cancelled");
        self.emit(
            &aggregate.instance,
            Effects {
                notifications: vec![NotificationEvent::WorkflowCancelled],
                ..Effects::default()
            },
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Step operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate and complete a step, then complete or advance the workflow.
    ///
    /// Invalid data yields `ok = false` with field errors and changes nothing.
    #[instrument(skip(self, submitted))]
    pub async fn complete_step(
        &self,
        step_id: Uuid,
        submitted: StepData,
    ) -> Result<StepResult, WorkflowError> {
        let instance_id = self.instance_of(step_id).await?;

        // Validation needs no lock: rules are fixed at creation
        let snapshot = self.load(instance_id).await?;
        let step = Self::step(&snapshot, step_id)?;
        Self::ensure_open(step)?;

        let normalized = match StepValidator::validate(&step.validation_rules, &submitted) {
            Ok(normalized) => normalized,
            Err(validation_errors) => {
                debug!(
                    step_id = %step_id,
                    errors = validation_errors.len(),
                    "Step submission failed validation"
                );
                return Ok(StepResult {
                    ok: false,
                    step: step.clone(),
                    validation_errors,
                });
            }
        };

        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;
        Self::ensure_mutable(&aggregate)?;
        let idx = Self::index_of(&aggregate, step_id)?;
        Self::ensure_open(&aggregate.steps[idx])?;

        let mut effects = Effects::default();
        self.finish_step(&mut aggregate, idx, StepStatus::Completed, normalized, &mut effects)?;
        self.inner.store.save(&aggregate).await?;

        info!(
            instance_id = %instance_id,
            step = aggregate.steps[idx].step_number,
            "Step completed"
        );
        let step = aggregate.steps[idx].clone();
        self.emit(&aggregate.instance, effects);

        Ok(StepResult {
            ok: true,
            step,
            validation_errors: Vec::new(),
        })
    }

    /// Skip a step that earlier answers made unnecessary
    #[instrument(skip(self))]
    pub async fn skip(&self, step_id: Uuid, reason: &str) -> Result<(), WorkflowError> {
        let instance_id = self.instance_of(step_id).await?;
        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;
        Self::ensure_mutable(&aggregate)?;
        let idx = Self::index_of(&aggregate, step_id)?;
        Self::ensure_open(&aggregate.steps[idx])?;

        let mut data = StepData::new();
        data.insert(SKIP_REASON_KEY.into(), serde_json::Value::String(reason.to_string()));

        let mut effects = Effects::default();
        self.finish_step(&mut aggregate, idx, StepStatus::Skipped, data, &mut effects)?;
        self.inner.store.save(&aggregate).await?;

        info!(
            instance_id = %instance_id,
            step = aggregate.steps[idx].step_number,
            reason,
            "Step skipped"
        );
        self.emit(&aggregate.instance, effects);
        Ok(())
    }

    /// Reset a failed step and start it again. Step-scoped: sibling steps and
    /// the instance status are left untouched.
    #[instrument(skip(self))]
    pub async fn retry_step(&self, step_id: Uuid) -> Result<(), WorkflowError> {
        let instance_id = self.instance_of(step_id).await?;
        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;
        let idx = Self::index_of(&aggregate, step_id)?;

        let step = &mut aggregate.steps[idx];
        if step.status != StepStatus::Failed {
            return Err(WorkflowError::NotFailed {
                step_id,
                status: step.status,
            });
        }
        step.reset();
        step.start();
        let step_number = step.step_number;

        self.inner.store.save(&aggregate).await?;
        info!(
            instance_id = %instance_id,
            step = step_number,
            instance_status = %aggregate.instance.status,
            "Failed step reset for retry"
        );
        Ok(())
    }

    /// Execute the current Auto step through the automation runner.
    ///
    /// The runner is called without holding the instance lock; its result is
    /// applied under the lock only if the step is still in progress.
    #[instrument(skip(self))]
    pub async fn run_automation(&self, step_id: Uuid) -> Result<(), WorkflowError> {
        let instance_id = self.instance_of(step_id).await?;

        let Some(_running) = self.mark_running(step_id) else {
            debug!(step_id = %step_id, "Automation already running for step");
            return Ok(());
        };

        let (config, step_number) = {
            let _guard = self.inner.locks.acquire(instance_id).await;
            let mut aggregate = self.load(instance_id).await?;
            Self::ensure_mutable(&aggregate)?;
            let idx = Self::index_of(&aggregate, step_id)?;

            let step = &mut aggregate.steps[idx];
            if !step.step_type.is_automated() {
                return Err(WorkflowError::NotAutomated(step_id));
            }
            Self::ensure_open(step)?;
            let config = step
                .data
                .get(AUTOMATION_KEY)
                .and_then(|v| v.as_object())
                .cloned()
                .ok_or(WorkflowError::NoAutomationConfig(step_id))?;

            let current_step = aggregate.instance.current_step;
            if aggregate.instance.status != InstanceStatus::InProgress
                || step.step_number != current_step
            {
                return Err(WorkflowError::NotCurrentStep {
                    step_id,
                    step_number: step.step_number,
                    current_step,
                });
            }

            if step.status == StepStatus::Pending {
                step.start();
                let step_number = step.step_number;
                self.inner.store.save(&aggregate).await?;
                (config, step_number)
            } else {
                (config, step.step_number)
            }
        };

        info!(instance_id = %instance_id, step = step_number, "Running automation");
        let timeout = self.inner.config.automation_timeout();
        let result = match tokio::time::timeout(timeout, self.inner.automation.run(&config)).await {
            Ok(Ok(outcome)) if outcome.ok => Ok(outcome.data),
            Ok(Ok(outcome)) => Err(outcome
                .error
                .unwrap_or_else(|| "automation reported failure".to_string())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("automation timed out after {}ms", timeout.as_millis())),
        };

        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;
        let idx = Self::index_of(&aggregate, step_id)?;
        if aggregate.instance.is_terminal()
            || aggregate.steps[idx].status != StepStatus::InProgress
        {
            warn!(
                instance_id = %instance_id,
                step = step_number,
                instance_status = %aggregate.instance.status,
                step_status = %aggregate.steps[idx].status,
                succeeded = result.is_ok(),
                "Discarding automation result for a step that moved on"
            );
            return Ok(());
        }

        let mut effects = Effects::default();
        match result {
            Ok(data) => {
                info!(instance_id = %instance_id, step = step_number, "Automation succeeded");
                self.finish_step(&mut aggregate, idx, StepStatus::Completed, data, &mut effects)?;
            }
            Err(message) => {
                self.handle_automation_failure(&mut aggregate, idx, &message, &mut effects)
                    .await;
            }
        }

        self.inner.store.save(&aggregate).await?;
        self.emit(&aggregate.instance, effects);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, instance_id: Uuid) -> Result<WorkflowAggregate, WorkflowError> {
        self.load(instance_id).await
    }

    pub async fn get_step(&self, step_id: Uuid) -> Result<WorkflowStep, WorkflowError> {
        let aggregate = self.load(self.instance_of(step_id).await?).await?;
        Self::step(&aggregate, step_id).cloned()
    }

    pub async fn get_progress(&self, instance_id: Uuid) -> Result<WorkflowProgress, WorkflowError> {
        Ok(self.load(instance_id).await?.progress())
    }

    /// Non-terminal instance for (company, workflow type), for callers
    /// checking the one-active-instance contract before `start`
    pub async fn find_active(
        &self,
        company_id: Uuid,
        workflow_type: &str,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        Ok(self.inner.store.find_active(company_id, workflow_type).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch re-entry
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a dispatched job, routing errors so the workflow never stalls silently
    pub(crate) async fn execute_job(&self, job: AutomationJob) {
        match self.run_automation(job.step_id).await {
            Ok(()) => {}
            Err(WorkflowError::NoAutomationConfig(step_id)) => {
                warn!(
                    instance_id = %job.instance_id,
                    step = job.step_number,
                    "Dispatched automated step has no automation config"
                );
                if let Err(e) = self
                    .fail_automation(step_id, "automated step has no automation config")
                    .await
                {
                    error!(
                        instance_id = %job.instance_id,
                        error = %e,
                        "Failed to record automation failure"
                    );
                }
            }
            Err(e) if e.is_contract_violation() => {
                warn!(
                    instance_id = %job.instance_id,
                    step = job.step_number,
                    error = %e,
                    "Dropping stale automation job"
                );
            }
            Err(e) => {
                error!(
                    instance_id = %job.instance_id,
                    step = job.step_number,
                    error = %e,
                    "Automation job failed"
                );
            }
        }
    }

    /// Apply the automation-failure policy to an open step
    pub(crate) async fn fail_automation(
        &self,
        step_id: Uuid,
        message: &str,
    ) -> Result<(), WorkflowError> {
        let instance_id = self.instance_of(step_id).await?;
        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut aggregate = self.load(instance_id).await?;
        Self::ensure_mutable(&aggregate)?;
        let idx = Self::index_of(&aggregate, step_id)?;
        Self::ensure_open(&aggregate.steps[idx])?;

        let mut effects = Effects::default();
        self.handle_automation_failure(&mut aggregate, idx, message, &mut effects)
            .await;
        self.inner.store.save(&aggregate).await?;
        self.emit(&aggregate.instance, effects);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions (caller holds the instance lock)
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge data, finish the step, then complete or advance the workflow.
    /// A pending instance only records the step; activation picks it up.
    fn finish_step(
        &self,
        aggregate: &mut WorkflowAggregate,
        idx: usize,
        status: StepStatus,
        data: StepData,
        effects: &mut Effects,
    ) -> Result<(), WorkflowError> {
        let step = &mut aggregate.steps[idx];
        step.merge_data(data);
        step.finish(status);
        let step_number = step.step_number;

        if aggregate.instance.status != InstanceStatus::InProgress {
            debug!(
                instance_id = %aggregate.instance.id,
                step = step_number,
                "Step finished before activation"
            );
            return Ok(());
        }

        if aggregate.is_complete() {
            self.complete_workflow(aggregate, effects);
            return Ok(());
        }

        if aggregate.instance.current_step == step_number {
            self.advance(aggregate, effects)
        } else {
            debug!(
                instance_id = %aggregate.instance.id,
                step = step_number,
                current_step = aggregate.instance.current_step,
                "Step finished ahead of the current step, not advancing"
            );
            Ok(())
        }
    }

    /// Point the instance at the next open step and start or dispatch it.
    /// A step that is already in progress only gets the pointer.
    fn advance(
        &self,
        aggregate: &mut WorkflowAggregate,
        effects: &mut Effects,
    ) -> Result<(), WorkflowError> {
        let Some(idx) = aggregate.next_open_index() else {
            let detail = format!(
                "no open step after step {} but the workflow is not complete",
                aggregate.instance.current_step
            );
            error!(instance_id = %aggregate.instance.id, %detail, "Cannot advance workflow");
            return Err(WorkflowError::InvariantViolation {
                instance_id: aggregate.instance.id,
                detail,
            });
        };

        let step_number = aggregate.steps[idx].step_number;
        aggregate.instance.point_to(step_number);
        if aggregate.steps[idx].status == StepStatus::InProgress {
            debug!(
                instance_id = %aggregate.instance.id,
                step = step_number,
                "Next step already in progress"
            );
        } else {
            self.activate_step(aggregate, idx, effects);
        }
        Ok(())
    }

    /// Start the step; Auto steps are then queued for the worker, manual
    /// steps announced as ready
    fn activate_step(&self, aggregate: &mut WorkflowAggregate, idx: usize, effects: &mut Effects) {
        let instance_id = aggregate.instance.id;
        let step = &mut aggregate.steps[idx];
        step.start();

        if step.step_type.is_automated() {
            debug!(
                instance_id = %instance_id,
                step = step.step_number,
                "Dispatching automated step"
            );
            effects.jobs.push(AutomationJob {
                instance_id,
                step_id: step.id,
                step_number: step.step_number,
            });
        } else {
            effects.notifications.push(NotificationEvent::StepReady {
                step_number: step.step_number,
                step_key: step.key.clone(),
            });
        }
    }

    fn complete_workflow(&self, aggregate: &mut WorkflowAggregate, effects: &mut Effects) {
        aggregate.instance.mark_completed();
        effects.completed = true;
        effects.notifications.push(NotificationEvent::WorkflowCompleted);
        info!(instance_id = %aggregate.instance.id, "Workflow completed");
    }

    /// Fallback-to-manual when the template allows it, otherwise fail the
    /// step and the whole workflow
    async fn handle_automation_failure(
        &self,
        aggregate: &mut WorkflowAggregate,
        idx: usize,
        message: &str,
        effects: &mut Effects,
    ) {
        let workflow_type = aggregate.instance.workflow_type.clone();
        let step_number = aggregate.steps[idx].step_number;

        let (policy, instructions) = match self.inner.templates.load(&workflow_type).await {
            Ok(Some(template)) => {
                let instructions = template
                    .step(step_number)
                    .and_then(|def| def.fallback_instructions.clone());
                (template.fallback, instructions)
            }
            Ok(None) => {
                warn!(%workflow_type, "Template gone, applying no-fallback policy");
                (FallbackPolicy::default(), None)
            }
            Err(e) => {
                warn!(
                    %workflow_type,
                    error = %e,
                    "Template lookup failed, applying no-fallback policy"
                );
                (FallbackPolicy::default(), None)
            }
        };

        let instance_id = aggregate.instance.id;
        let step = &mut aggregate.steps[idx];

        if policy.allow_manual {
            let role = policy
                .manual_role
                .unwrap_or_else(|| self.inner.config.manual_review_role.clone());

            step.start();
            step.data.insert(FALLBACK_TO_MANUAL_KEY.into(), serde_json::Value::Bool(true));
            step.data.insert(
                AUTOMATION_ERROR_KEY.into(),
                serde_json::Value::String(message.to_string()),
            );
            if let Some(instructions) = instructions {
                step.data.insert(
                    FALLBACK_INSTRUCTIONS_KEY.into(),
                    serde_json::Value::String(instructions),
                );
            }
            if !step.assignees.contains(&role) {
                step.assignees.push(role);
            }

            warn!(
                instance_id = %instance_id,
                step = step_number,
                error = message,
                "Automation failed, step handed to manual review"
            );
            effects.notifications.push(NotificationEvent::AutomationFallback {
                step_number,
                error: message.to_string(),
                assignees: step.assignees.clone(),
            });
        } else {
            step.fail(message);
            aggregate.instance.mark_failed();

            warn!(
                instance_id = %instance_id,
                step = step_number,
                error = message,
                "Automation failed without fallback, workflow failed"
            );
            effects.notifications.push(NotificationEvent::WorkflowFailed {
                step_number,
                error: message.to_string(),
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn emit(&self, instance: &WorkflowInstance, effects: Effects) {
        for event in effects.notifications {
            self.inner.notifications.notify(instance, event);
        }
        if effects.completed {
            self.inner.post_completion.on_workflow_completed(instance);
        }
        for job in effects.jobs {
            if self.inner.jobs.send(job).is_err() {
                error!(
                    instance_id = %job.instance_id,
                    step = job.step_number,
                    "Automation queue closed, job not dispatched"
                );
            }
        }
    }

    fn mark_running(&self, step_id: Uuid) -> Option<RunningGuard<'_>> {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        running.insert(step_id).then(|| RunningGuard {
            running: &self.inner.running,
            step_id,
        })
    }

    async fn load(&self, instance_id: Uuid) -> Result<WorkflowAggregate, WorkflowError> {
        self.inner
            .store
            .load(instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(instance_id))
    }

    async fn instance_of(&self, step_id: Uuid) -> Result<Uuid, WorkflowError> {
        self.inner
            .store
            .instance_for_step(step_id)
            .await?
            .ok_or(WorkflowError::StepNotFound(step_id))
    }

    fn index_of(aggregate: &WorkflowAggregate, step_id: Uuid) -> Result<usize, WorkflowError> {
        aggregate
            .step_index(step_id)
            .ok_or(WorkflowError::StepNotFound(step_id))
    }

    fn step(aggregate: &WorkflowAggregate, step_id: Uuid) -> Result<&WorkflowStep, WorkflowError> {
        Self::index_of(aggregate, step_id).map(|idx| &aggregate.steps[idx])
    }

    fn ensure_open(step: &WorkflowStep) -> Result<(), WorkflowError> {
        if step.status.is_open() {
            Ok(())
        } else {
            Err(WorkflowError::StepNotCompletable {
                step_id: step.id,
                status: step.status,
            })
        }
    }

    fn ensure_mutable(aggregate: &WorkflowAggregate) -> Result<(), WorkflowError> {
        if aggregate.instance.is_terminal() {
            Err(WorkflowError::InstanceTerminal {
                instance_id: aggregate.instance.id,
                status: aggregate.instance.status,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_instance_lock_is_exclusive() {
        let locks = InstanceLocks::default();
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), locks.acquire(id)).await;
        assert!(blocked.is_err());

        // Other instances are not affected
        let _other = locks.acquire(Uuid::new_v4()).await;

        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(20), locks.acquire(id)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let locks = InstanceLocks::default();

        let first = locks.acquire(Uuid::new_v4()).await;
        let _second = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.len(), 2);

        drop(first);
        let _third = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.len(), 2);
    }
}
