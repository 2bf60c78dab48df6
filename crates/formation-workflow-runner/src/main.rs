//! Formation workflow runner
//!
//! Usage:
//!   formation_runner check --templates templates/
//!   formation_runner simulate --templates templates/ -w ifza_company_formation \
//!       --submissions samples/ifza_submissions.yaml
//!   formation_runner simulate ... --fail-automation   # exercise the fallback path
//!
//! `simulate` runs a workflow end to end against the in-memory store. Manual
//! steps are completed from the submissions file (keyed by step key) or
//! skipped; automation is simulated.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use formation_workflow::{
    ActionRegistry, AutomationAction, AutomationError, AutomationOutcome, AutomationWorker,
    ChannelNotificationSink, EngineCollaborators, EngineConfig, InstanceStatus, MemoryStore,
    Notification, NotificationEvent, StepData, StepTemplateProvider, TracingPostCompletion,
    WorkflowEngine, WorkflowTemplate, YamlTemplateProvider, ACTION_KEY,
};

const NO_SUBMISSION_REASON: &str = "no submission provided";

#[derive(Parser)]
#[command(name = "formation_runner")]
#[command(about = "Check formation workflow templates and dry-run workflows")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and check templates, then print each step plan
    Check {
        /// Template file or directory of YAML templates
        #[arg(short, long, env = "FORMATION_TEMPLATES")]
        templates: PathBuf,
    },

    /// Walk one workflow from start to finish with simulated automation
    Simulate {
        /// Template file or directory of YAML templates
        #[arg(short, long, env = "FORMATION_TEMPLATES")]
        templates: PathBuf,

        /// Workflow type to run
        #[arg(short, long)]
        workflow_type: String,

        /// YAML map of step key to submitted data
        #[arg(short, long)]
        submissions: Option<PathBuf>,

        /// Make every automated step fail
        #[arg(long)]
        fail_automation: bool,

        /// Engine config YAML
        #[arg(short, long, env = "FORMATION_ENGINE_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formation_workflow=info,formation_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let outcome = match args.command {
        Command::Check { templates } => check(&templates),
        Command::Simulate {
            templates,
            workflow_type,
            submissions,
            fail_automation,
            config,
        } => {
            let options = SimulateOptions {
                workflow_type,
                submissions,
                fail_automation,
                config,
            };
            simulate(&templates, &options)
                .await
                .map(|status| status != InstanceStatus::Failed)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// check
// ─────────────────────────────────────────────────────────────────────────────

fn check(path: &Path) -> Result<bool> {
    let provider = YamlTemplateProvider::load_from_path(path)?;
    let templates = provider.templates();

    println!(
        "{} template(s) from {} file(s)",
        templates.len(),
        provider.sources().len()
    );
    for workflow_type in templates.workflow_types() {
        if let Some(template) = templates.get(workflow_type) {
            print_plan(template);
        }
    }
    Ok(true)
}

fn print_plan(template: &WorkflowTemplate) {
    println!();
    println!(
        "{} (v{}): {}",
        template.workflow_type, template.version, template.name
    );
    if template.fallback.allow_manual {
        println!(
            "  automation fallback: manual ({})",
            template.fallback.manual_role.as_deref().unwrap_or("engine default role")
        );
    }
    for step in &template.steps {
        let action = step
            .automation
            .as_ref()
            .and_then(|a| a.get(ACTION_KEY))
            .and_then(|a| a.as_str())
            .map(|a| format!(" -> {}", a))
            .unwrap_or_default();
        println!(
            "  {:>2}. {:<24} {:<10} rules={}{}",
            step.number,
            step.key,
            step.step_type.as_str(),
            step.validation_rules().kind(),
            action
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// simulate
// ─────────────────────────────────────────────────────────────────────────────

struct SimulateOptions {
    workflow_type: String,
    submissions: Option<PathBuf>,
    fail_automation: bool,
    config: Option<PathBuf>,
}

/// Stands in for a portal robot or registry integration
struct SimulatedAction {
    name: String,
    fail: bool,
}

#[async_trait]
impl AutomationAction for SimulatedAction {
    async fn execute(&self, config: &StepData) -> Result<AutomationOutcome, AutomationError> {
        if self.fail {
            return Ok(AutomationOutcome::failure(format!(
                "simulated failure of '{}'",
                self.name
            )));
        }

        let mut data = StepData::new();
        data.insert("simulated".into(), json!(true));
        data.insert(
            "reference".into(),
            json!(format!("SIM-{}", &Uuid::new_v4().simple().to_string()[..8])),
        );
        if let Some(portal) = config.get("portal") {
            data.insert("portal".into(), portal.clone());
        }
        Ok(AutomationOutcome::success(data))
    }
}

/// Registry with a simulated handler for every action the template names
fn simulated_registry(template: &WorkflowTemplate, fail: bool) -> ActionRegistry {
    let actions: BTreeSet<&str> = template
        .steps
        .iter()
        .filter_map(|s| s.automation.as_ref())
        .filter_map(|a| a.get(ACTION_KEY).and_then(|v| v.as_str()))
        .collect();

    actions.into_iter().fold(ActionRegistry::new(), |registry, name| {
        registry.with(
            name,
            Arc::new(SimulatedAction {
                name: name.to_string(),
                fail,
            }),
        )
    })
}

fn load_submissions(path: Option<&Path>) -> Result<HashMap<String, StepData>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    config.with_env_overrides()
}

async fn simulate(templates_path: &Path, options: &SimulateOptions) -> Result<InstanceStatus> {
    let provider = YamlTemplateProvider::load_from_path(templates_path)?;
    let template = provider
        .load(&options.workflow_type)
        .await?
        .with_context(|| format!("No template for workflow type '{}'", options.workflow_type))?;
    let submissions = load_submissions(options.submissions.as_deref())?;
    let config = load_config(options.config.as_deref())?;
    tracing::debug!(
        submissions = submissions.len(),
        timeout_ms = config.automation_timeout_ms,
        "Simulation inputs loaded"
    );

    let (sink, mut notifications) = ChannelNotificationSink::new();
    let (engine, queue) = WorkflowEngine::new(
        EngineCollaborators {
            store: Arc::new(MemoryStore::new()),
            templates: Arc::new(provider),
            automation: Arc::new(simulated_registry(&template, options.fail_automation)),
            notifications: Arc::new(sink),
            post_completion: Arc::new(TracingPostCompletion),
        },
        config,
    );
    let mut worker = AutomationWorker::new(engine.clone(), queue);

    let instance = engine.start(Uuid::new_v4(), &template.workflow_type).await?;
    println!(
        "Started {} v{} ({} steps), instance {}",
        template.workflow_type,
        template.version,
        template.steps.len(),
        instance.id
    );
    engine.activate(instance.id).await?;

    // Each round finishes at least one step or ends the run
    for _ in 0..=template.steps.len() {
        worker.process_pending().await;
        print_notifications(&mut notifications);

        let aggregate = engine.get(instance.id).await?;
        if aggregate.instance.is_terminal() {
            break;
        }

        let current = aggregate.instance.current_step;
        let Some(step) = aggregate
            .step_by_number(current)
            .filter(|s| s.status.is_open())
        else {
            bail!("Workflow stalled at step {}", current);
        };

        match submissions.get(&step.key) {
            Some(data) => {
                let result = engine.complete_step(step.id, data.clone()).await?;
                if !result.ok {
                    println!("  step {} ({}) rejected:", step.step_number, step.key);
                    for error in &result.validation_errors {
                        println!("    - {} [{}]", error, error.code);
                    }
                    return Ok(aggregate.instance.status);
                }
                println!("  step {} ({}) completed", step.step_number, step.key);
            }
            None => {
                engine.skip(step.id, NO_SUBMISSION_REASON).await?;
                println!(
                    "  step {} ({}) skipped: {}",
                    step.step_number, step.key, NO_SUBMISSION_REASON
                );
            }
        }
    }
    print_notifications(&mut notifications);

    let progress = engine.get_progress(instance.id).await?;
    println!(
        "Finished {}: {}/{} steps done ({:.0}%), current step {}",
        progress.status,
        progress.completed_steps,
        progress.total_steps,
        progress.percentage,
        progress.current_step
    );
    Ok(progress.status)
}

fn print_notifications(rx: &mut UnboundedReceiver<Notification>) {
    while let Ok(notification) = rx.try_recv() {
        match &notification.event {
            NotificationEvent::StepReady {
                step_number,
                step_key,
            } => println!("  -> step {} ({}) ready", step_number, step_key),
            NotificationEvent::AutomationFallback {
                step_number,
                error,
                assignees,
            } => println!(
                "  -> step {} automation failed ({}), assigned to {}",
                step_number,
                error,
                assignees.join(", ")
            ),
            NotificationEvent::WorkflowFailed { step_number, error } => {
                println!("  -> workflow failed at step {}: {}", step_number, error)
            }
            other => println!("  -> {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_path(relative: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join(relative)
    }

    fn options(fail_automation: bool) -> SimulateOptions {
        SimulateOptions {
            workflow_type: "ifza_company_formation".into(),
            submissions: Some(manifest_path("samples/ifza_submissions.yaml")),
            fail_automation,
            config: None,
        }
    }

    #[test]
    fn test_bundled_templates_pass_check() {
        assert!(check(&manifest_path("templates")).unwrap());
    }

    #[test]
    fn test_registry_covers_template_actions() {
        let provider = YamlTemplateProvider::load_from_path(&manifest_path("templates")).unwrap();
        let template = provider.templates().get("ifza_company_formation").unwrap();

        let registry = simulated_registry(template, false);
        assert_eq!(registry.actions(), vec!["portal.reserve_name"]);
    }

    #[tokio::test]
    async fn test_simulate_sample_completes() {
        let status = simulate(&manifest_path("templates"), &options(false))
            .await
            .unwrap();
        assert_eq!(status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_simulate_with_failing_automation_falls_back() {
        // The bundled template allows manual fallback, and the sample has
        // no submission for the name reservation, so it ends up skipped
        let status = simulate(&manifest_path("templates"), &options(true))
            .await
            .unwrap();
        assert_eq!(status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_simulate_unknown_workflow_type() {
        let mut options = options(false);
        options.workflow_type = "mainland_llc".into();

        assert!(simulate(&manifest_path("templates"), &options).await.is_err());
    }
}
