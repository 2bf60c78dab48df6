//! Workflow persistence boundary.
//!
//! An instance and its steps are read and written as one
//! [`WorkflowAggregate`]; the engine never updates a step row on its own.
//! Backends map this onto two collections (instances, steps) with steps
//! cascade-deleted alongside their instance.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::{WorkflowAggregate, WorkflowInstance};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new aggregate. Fails if the instance id already exists.
    async fn insert(&self, aggregate: &WorkflowAggregate) -> Result<()>;

    /// Overwrite an existing aggregate (instance row plus every step row)
    async fn save(&self, aggregate: &WorkflowAggregate) -> Result<()>;

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowAggregate>>;

    /// Owning instance of a step
    async fn instance_for_step(&self, step_id: Uuid) -> Result<Option<Uuid>>;

    /// The non-terminal instance for (company, workflow type), if any
    async fn find_active(
        &self,
        company_id: Uuid,
        workflow_type: &str,
    ) -> Result<Option<WorkflowInstance>>;

    /// Delete an instance and its steps
    async fn delete(&self, instance_id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct MemoryTables {
    aggregates: HashMap<Uuid, WorkflowAggregate>,
    /// step_id → instance_id
    step_index: HashMap<Uuid, Uuid>,
}

/// In-memory store for tests, dry runs and embedding
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.aggregates.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert(&self, aggregate: &WorkflowAggregate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let instance_id = aggregate.instance.id;
        if tables.aggregates.contains_key(&instance_id) {
            return Err(anyhow!("workflow instance {} already exists", instance_id));
        }
        for step in &aggregate.steps {
            tables.step_index.insert(step.id, instance_id);
        }
        tables.aggregates.insert(instance_id, aggregate.clone());
        Ok(())
    }

    async fn save(&self, aggregate: &WorkflowAggregate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let instance_id = aggregate.instance.id;
        let existing = tables
            .aggregates
            .get_mut(&instance_id)
            .ok_or_else(|| anyhow!("workflow instance {} does not exist", instance_id))?;
        *existing = aggregate.clone();
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowAggregate>> {
        Ok(self.tables.read().await.aggregates.get(&instance_id).cloned())
    }

    async fn instance_for_step(&self, step_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.tables.read().await.step_index.get(&step_id).copied())
    }

    async fn find_active(
        &self,
        company_id: Uuid,
        workflow_type: &str,
    ) -> Result<Option<WorkflowInstance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .aggregates
            .values()
            .map(|a| &a.instance)
            .filter(|i| {
                i.company_id == company_id
                    && i.workflow_type == workflow_type
                    && !i.is_terminal()
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn delete(&self, instance_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.aggregates.remove(&instance_id).is_some() {
            tables.step_index.retain(|_, owner| *owner != instance_id);
        }
        Ok(())
    }
}
