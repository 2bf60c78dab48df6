//! Concurrent mutations of one instance are serialized
//!
//! Completing every step of an instance at once must leave it completed
//! exactly once, with no step update lost.

mod helpers;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Barrier;
use uuid::Uuid;

use formation_workflow::{InstanceStatus, StepDefinition, StepStatus, StepType, WorkflowTemplate};
use helpers::*;

fn wide_template(steps: u32) -> WorkflowTemplate {
    let steps = (1..=steps)
        .map(|n| {
            StepDefinition::new(n, format!("form_{}", n), StepType::Form, format!("Form {}", n))
        })
        .collect();
    WorkflowTemplate::new(FORMATION, "Wide formation", 1, steps)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_complete_once() {
    let h = Harness::new(wide_template(12));
    let aggregate = h.begin().await;
    let id = aggregate.instance.id;
    let barrier = Arc::new(Barrier::new(aggregate.steps.len()));

    let mut tasks = Vec::new();
    for step in &aggregate.steps {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        let step_id = step.id;
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            let submission = helpers::data(json!({ "submitted_by": step_id.to_string() }));
            engine.complete_step(step_id, submission).await
        }));
    }
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert!(result.ok);
    }

    let finished = h.engine.get(id).await.unwrap();
    assert_eq!(finished.instance.status, InstanceStatus::Completed);
    for step in &finished.steps {
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.data["submitted_by"], json!(step.id.to_string()));
    }
    assert_eq!(h.completions.completed(), vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instances_progress_independently() {
    let h = Harness::new(manual_template());
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(h.begin().await.instance.id);
    }

    let mut tasks = Vec::new();
    for id in ids.clone() {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            let steps = engine.get(id).await?.steps;
            for step in steps {
                engine.skip(step.id, "exempt").await?;
            }
            Ok::<Uuid, formation_workflow::WorkflowError>(id)
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for id in &ids {
        let instance = h.engine.get(*id).await.unwrap().instance;
        assert_eq!(instance.status, InstanceStatus::Completed);
    }
    let mut completed = h.completions.completed();
    completed.sort();
    let mut expected = ids;
    expected.sort();
    assert_eq!(completed, expected);
}
