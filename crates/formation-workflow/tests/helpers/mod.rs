//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use formation_workflow::{
    AutomationError, AutomationOutcome, AutomationRunner, AutomationWorker, ChannelNotificationSink,
    DocumentRequirement, EngineCollaborators, EngineConfig, FieldRule, FieldType, MemoryStore,
    Notification, PaymentLineItem, PostCompletionDispatcher, StaticTemplateProvider, StepData,
    StepDefinition, StepTemplateProvider, StepType, WorkflowAggregate, WorkflowEngine,
    WorkflowInstance, WorkflowStep, WorkflowTemplate,
};

pub const FORMATION: &str = "ifza_company_formation";

// ── Scripted automation ────────────────────────────────────────

/// What the next automation run does
pub enum Script {
    Succeed(StepData),
    Fail(&'static str),
    Error(&'static str),
    /// Never returns; only the engine timeout ends it
    Hang,
}

/// Runner replaying queued scripts; succeeds when the queue is empty
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    configs: Mutex<Vec<StepData>>,
}

impl ScriptedRunner {
    pub fn push(&self, script: Script) {
        self.script.lock().unwrap().push_back(script);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn configs(&self) -> Vec<StepData> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AutomationRunner for ScriptedRunner {
    async fn run(&self, config: &StepData) -> Result<AutomationOutcome, AutomationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().unwrap().push(config.clone());
        let next = self.script.lock().unwrap().pop_front();

        match next {
            None => Ok(AutomationOutcome::success(data(json!({ "reservation_id": "NR-1001" })))),
            Some(Script::Succeed(data)) => Ok(AutomationOutcome::success(data)),
            Some(Script::Fail(message)) => Ok(AutomationOutcome::failure(message)),
            Some(Script::Error(message)) => Err(AutomationError::Backend(message.to_string())),
            Some(Script::Hang) => std::future::pending().await,
        }
    }
}

// ── Post-completion recorder ───────────────────────────────────

#[derive(Default)]
pub struct RecordingPostCompletion {
    completed: Mutex<Vec<Uuid>>,
}

impl RecordingPostCompletion {
    pub fn completed(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap().clone()
    }
}

impl PostCompletionDispatcher for RecordingPostCompletion {
    fn on_workflow_completed(&self, instance: &WorkflowInstance) {
        self.completed.lock().unwrap().push(instance.id);
    }
}

// ── Harness ────────────────────────────────────────────────────

pub struct Harness {
    pub engine: WorkflowEngine,
    pub worker: AutomationWorker,
    pub store: Arc<MemoryStore>,
    pub automation: Arc<ScriptedRunner>,
    pub completions: Arc<RecordingPostCompletion>,
    pub notifications: UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new(template: WorkflowTemplate) -> Self {
        Self::with_config(template, EngineConfig::default())
    }

    pub fn with_config(template: WorkflowTemplate, config: EngineConfig) -> Self {
        let provider = StaticTemplateProvider::new([template]).unwrap();
        Self::with_provider(Arc::new(provider), config)
    }

    pub fn with_provider(templates: Arc<dyn StepTemplateProvider>, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let automation = Arc::new(ScriptedRunner::default());
        let completions = Arc::new(RecordingPostCompletion::default());
        let (sink, notifications) = ChannelNotificationSink::new();

        let (engine, queue) = WorkflowEngine::new(
            EngineCollaborators {
                store: store.clone(),
                templates,
                automation: automation.clone(),
                notifications: Arc::new(sink),
                post_completion: completions.clone(),
            },
            config,
        );
        let worker = AutomationWorker::new(engine.clone(), queue);

        Self {
            engine,
            worker,
            store,
            automation,
            completions,
            notifications,
        }
    }

    /// Start and activate a workflow for a fresh company
    pub async fn begin(&self) -> WorkflowAggregate {
        let instance = self.engine.start(Uuid::new_v4(), FORMATION).await.unwrap();
        self.engine.activate(instance.id).await.unwrap();
        self.engine.get(instance.id).await.unwrap()
    }

    pub async fn step(&self, instance_id: Uuid, key: &str) -> WorkflowStep {
        self.engine
            .get(instance_id)
            .await
            .unwrap()
            .step_by_key(key)
            .cloned()
            .unwrap()
    }

    /// Notification kinds received so far, in order
    pub fn drain_notifications(&mut self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            kinds.push(notification.event.kind());
        }
        kinds
    }
}

// ── Data and templates ─────────────────────────────────────────

pub fn data(value: Value) -> StepData {
    value.as_object().cloned().unwrap_or_default()
}

pub fn company_details() -> StepData {
    data(json!({
        "proposed_name": "  Falcon Trading FZCO ",
        "contact_email": "Founder@Falcon.AE",
        "shareholders": "2",
        "activity": "trading",
    }))
}

pub fn documents() -> StepData {
    data(json!({
        "documents": {
            "passport": "uploads/passport.pdf",
            "proof_of_address": { "ref": "uploads/utility-bill", "format": "jpg" },
        }
    }))
}

pub fn payment() -> StepData {
    data(json!({
        "payment_reference": "PAY-7781",
        "amount_paid": "15000.00",
        "currency": "aed",
    }))
}

pub fn form_step() -> StepDefinition {
    StepDefinition::new(1, "company_details", StepType::Form, "Company details").with_fields(vec![
        FieldRule::text("proposed_name").with_length(Some(3), Some(120)),
        FieldRule::text("contact_email").of_type(FieldType::Email),
        FieldRule::text("shareholders")
            .of_type(FieldType::Integer)
            .with_range(Some(1.0), Some(50.0)),
        FieldRule::text("activity").with_options(["trading", "consulting"]),
        FieldRule::text("trade_license_no").optional(),
    ])
}

pub fn name_reservation_step(number: u32) -> StepDefinition {
    StepDefinition::new(number, "name_reservation", StepType::Auto, "Reserve trade name")
        .with_automation(data(json!({ "action": "portal.reserve_name", "portal": "ifza" })))
        .with_fallback_instructions("Reserve the trade name on the IFZA portal")
}

pub fn documents_step(number: u32) -> StepDefinition {
    StepDefinition::new(number, "documents", StepType::DocUpload, "Upload documents")
        .with_documents(vec![
            DocumentRequirement {
                document_type: "passport".into(),
                label: Some("Passport copy".into()),
                required: true,
                accepted_formats: vec!["pdf".into(), "jpg".into()],
            },
            DocumentRequirement {
                document_type: "proof_of_address".into(),
                label: None,
                required: false,
                accepted_formats: vec!["pdf".into(), "jpg".into()],
            },
        ])
}

pub fn payment_step(number: u32) -> StepDefinition {
    StepDefinition::new(number, "payment", StepType::Payment, "Pay formation fees").with_line_items(
        vec![
            PaymentLineItem {
                code: "license_fee".into(),
                description: "Trade license".into(),
                amount: Decimal::new(12_500, 0),
            },
            PaymentLineItem {
                code: "registration_fee".into(),
                description: "Registration".into(),
                amount: Decimal::new(2_500, 0),
            },
        ],
        Some("AED"),
    )
}

/// Form → Auto → DocUpload → Payment → Issuance, manual fallback allowed
pub fn formation_template() -> WorkflowTemplate {
    WorkflowTemplate::new(
        FORMATION,
        "IFZA Company Formation",
        3,
        vec![
            form_step(),
            name_reservation_step(2),
            documents_step(3),
            payment_step(4),
            StepDefinition::new(5, "license_issuance", StepType::Issuance, "Issue trade license"),
        ],
    )
    .with_fallback(true, None)
}

/// Three manual forms and nothing else
pub fn manual_template() -> WorkflowTemplate {
    let steps = (1..=3)
        .map(|n| {
            StepDefinition::new(n, format!("form_{}", n), StepType::Form, format!("Form {}", n))
        })
        .collect();
    WorkflowTemplate::new(FORMATION, "Manual formation", 1, steps)
}

/// Form → Auto with no manual fallback
pub fn strict_automation_template() -> WorkflowTemplate {
    WorkflowTemplate::new(
        FORMATION,
        "Strict formation",
        1,
        vec![form_step(), name_reservation_step(2), documents_step(3)],
    )
}

/// Step 1 automated
pub fn auto_first_template() -> WorkflowTemplate {
    WorkflowTemplate::new(
        FORMATION,
        "Automation first",
        1,
        vec![name_reservation_step(1), documents_step(2)],
    )
    .with_fallback(true, Some("formation_ops"))
}
