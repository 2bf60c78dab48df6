//! Step Templates
//!
//! Ordered, versioned step definitions per workflow type. The engine treats the
//! provider as a pure lookup; the YAML-backed provider is the one shipped for
//! deployments, the static one backs tests and embedders.

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::state::{StepData, StepType};

/// Key under which a step's automation descriptor lives in `WorkflowStep::data`
pub const AUTOMATION_KEY: &str = "automation";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Invalid template '{workflow_type}': {reason}")]
    Invalid {
        workflow_type: String,
        reason: String,
    },

    #[error("Duplicate template for workflow type '{0}'")]
    Duplicate(String),

    #[error("Template provider error: {0}")]
    Provider(String),
}

// ---------------------------------------------------------------------------
// Validation schema
// ---------------------------------------------------------------------------

/// Declared type of a form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Email,
    Number,
    Integer,
    Boolean,
    /// ISO date, `YYYY-MM-DD`
    Date,
    /// One of `options`
    Select,
    List,
}

fn default_true() -> bool {
    true
}

/// One declared form field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Regex the whole (trimmed) value must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FieldRule {
    /// Required text field with no further constraints
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            field_type: FieldType::Text,
            required: true,
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            pattern: None,
            options: Vec::new(),
        }
    }

    pub fn of_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_type = FieldType::Select;
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// A document the applicant has to upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequirement {
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Lowercase extensions, e.g. `pdf`, `jpg`. Empty = any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_formats: Vec<String>,
}

/// A fee the payment step has to cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLineItem {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub amount: Decimal,
}

/// Schema a step's submitted data is validated against. Derived from the
/// template once, at instance creation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationRules {
    #[default]
    None,
    Fields {
        fields: Vec<FieldRule>,
    },
    Documents {
        documents: Vec<DocumentRequirement>,
    },
    Payment {
        line_items: Vec<PaymentLineItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        currency: Option<String>,
    },
}

impl ValidationRules {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fields { .. } => "fields",
            Self::Documents { .. } => "documents",
            Self::Payment { .. } => "payment",
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// What to do when an automated step fails
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Convert automation failures into manual steps instead of failing
    #[serde(default)]
    pub allow_manual: bool,
    /// Role the manual step is assigned to; engine default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_role: Option<String>,
}

/// One step in a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub number: u32,
    pub key: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<DocumentRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_items: Vec<PaymentLineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Automation descriptor; must name an `action`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<StepData>,
    /// Instructions for the human who takes over a failed automation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_instructions: Option<String>,
}

impl StepDefinition {
    pub fn new(
        number: u32,
        key: impl Into<String>,
        step_type: StepType,
        title: impl Into<String>,
    ) -> Self {
        Self {
            number,
            key: key.into(),
            step_type,
            title: title.into(),
            description: None,
            fields: Vec::new(),
            documents: Vec::new(),
            line_items: Vec::new(),
            currency: None,
            automation: None,
            fallback_instructions: None,
        }
    }

    pub fn with_fields(mut self, fields: Vec<FieldRule>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_documents(mut self, documents: Vec<DocumentRequirement>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_line_items(
        mut self,
        line_items: Vec<PaymentLineItem>,
        currency: Option<&str>,
    ) -> Self {
        self.line_items = line_items;
        self.currency = currency.map(str::to_string);
        self
    }

    pub fn with_automation(mut self, automation: StepData) -> Self {
        self.automation = Some(automation);
        self
    }

    pub fn with_fallback_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.fallback_instructions = Some(instructions.into());
        self
    }

    /// Submitted-data schema for this step, by step type
    pub fn validation_rules(&self) -> ValidationRules {
        match self.step_type {
            StepType::Form => ValidationRules::Fields {
                fields: self.fields.clone(),
            },
            StepType::DocUpload => ValidationRules::Documents {
                documents: self.documents.clone(),
            },
            StepType::Payment => ValidationRules::Payment {
                line_items: self.line_items.clone(),
                currency: self.currency.clone(),
            },
            StepType::Auto | StepType::Review | StepType::Issuance | StepType::Notify => {
                ValidationRules::None
            }
        }
    }

    /// Data a freshly created step starts with
    pub fn initial_data(&self) -> StepData {
        let mut data = StepData::new();
        if let Some(automation) = &self.automation {
            data.insert(
                AUTOMATION_KEY.to_string(),
                serde_json::Value::Object(automation.clone()),
            );
        }
        data
    }
}

/// Ordered, versioned step definitions for one workflow type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub workflow_type: String,
    pub name: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_days: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowTemplate {
    pub fn new(
        workflow_type: impl Into<String>,
        name: impl Into<String>,
        version: u32,
        steps: Vec<StepDefinition>,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            name: name.into(),
            version,
            estimated_duration_days: None,
            metadata: HashMap::new(),
            fallback: FallbackPolicy::default(),
            steps,
        }
    }

    pub fn with_fallback(mut self, allow_manual: bool, manual_role: Option<&str>) -> Self {
        self.fallback = FallbackPolicy {
            allow_manual,
            manual_role: manual_role.map(str::to_string),
        };
        self
    }

    pub fn step(&self, number: u32) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.number == number)
    }

    /// Metadata copied onto each instance created from this template
    pub fn instance_metadata(&self) -> HashMap<String, serde_json::Value> {
        let mut metadata = self.metadata.clone();
        metadata.insert("name".into(), serde_json::json!(self.name));
        metadata.insert("version".into(), serde_json::json!(self.version));
        if let Some(days) = self.estimated_duration_days {
            metadata.insert("estimated_duration_days".into(), serde_json::json!(days));
        }
        metadata
    }

    /// Structural checks: steps numbered exactly 1..=N in order, unique keys,
    /// compilable field patterns
    pub fn check(&self) -> Result<(), TemplateError> {
        let invalid = |reason: String| TemplateError::Invalid {
            workflow_type: self.workflow_type.clone(),
            reason,
        };

        if self.workflow_type.trim().is_empty() {
            return Err(invalid("workflow_type is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("template has no steps".into()));
        }

        let mut keys = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.number != expected {
                return Err(invalid(format!(
                    "step numbers must be contiguous from 1: expected {}, found {}",
                    expected, step.number
                )));
            }
            if !keys.insert(step.key.as_str()) {
                return Err(invalid(format!("duplicate step key '{}'", step.key)));
            }
            for field in &step.fields {
                if let Some(pattern) = &field.pattern {
                    Regex::new(pattern).map_err(|e| {
                        invalid(format!(
                            "step {} field '{}' has an invalid pattern: {}",
                            step.number, field.name, e
                        ))
                    })?;
                }
                if field.field_type == FieldType::Select && field.options.is_empty() {
                    return Err(invalid(format!(
                        "step {} select field '{}' declares no options",
                        step.number, field.name
                    )));
                }
            }
            if step.step_type.is_automated() && step.automation.is_none() {
                tracing::warn!(
                    workflow_type = %self.workflow_type,
                    step = step.number,
                    "Automated step has no automation descriptor"
                );
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Supplies step templates by workflow type
#[async_trait]
pub trait StepTemplateProvider: Send + Sync {
    /// `Ok(None)` when the workflow type is unknown
    async fn load(&self, workflow_type: &str) -> Result<Option<WorkflowTemplate>, TemplateError>;
}

/// In-memory template set
#[derive(Debug, Clone, Default)]
pub struct StaticTemplateProvider {
    templates: HashMap<String, WorkflowTemplate>,
}

impl StaticTemplateProvider {
    /// Check and index the given templates; duplicate workflow types are rejected
    pub fn new(
        templates: impl IntoIterator<Item = WorkflowTemplate>,
    ) -> Result<Self, TemplateError> {
        let mut provider = Self::default();
        for template in templates {
            provider.insert(template)?;
        }
        Ok(provider)
    }

    pub fn insert(&mut self, template: WorkflowTemplate) -> Result<(), TemplateError> {
        template.check()?;
        if self.templates.contains_key(&template.workflow_type) {
            return Err(TemplateError::Duplicate(template.workflow_type));
        }
        self.templates
            .insert(template.workflow_type.clone(), template);
        Ok(())
    }

    pub fn get(&self, workflow_type: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(workflow_type)
    }

    /// Sorted workflow types
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[async_trait]
impl StepTemplateProvider for StaticTemplateProvider {
    async fn load(&self, workflow_type: &str) -> Result<Option<WorkflowTemplate>, TemplateError> {
        Ok(self.templates.get(workflow_type).cloned())
    }
}

/// A YAML file holds either one template or a `templates:` list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TemplateFile {
    Many { templates: Vec<WorkflowTemplate> },
    One(WorkflowTemplate),
}

/// Templates loaded from YAML files
#[derive(Debug, Clone)]
pub struct YamlTemplateProvider {
    inner: StaticTemplateProvider,
    sources: Vec<PathBuf>,
}

impl YamlTemplateProvider {
    /// Load from a single YAML file or every `*.yaml`/`*.yml` in a directory
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let sources = if path.is_dir() {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(path)
                .with_context(|| format!("Reading template directory {}", path.display()))?
            {
                let file = entry?.path();
                let is_yaml = file
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml");
                if is_yaml {
                    files.push(file);
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut inner = StaticTemplateProvider::default();
        for file in &sources {
            for template in Self::parse_file(file)? {
                let workflow_type = template.workflow_type.clone();
                inner.insert(template).with_context(|| {
                    format!("Loading '{}' from {}", workflow_type, file.display())
                })?;
            }
        }

        tracing::info!(
            templates = inner.len(),
            files = sources.len(),
            "Loaded workflow templates from {}",
            path.display()
        );

        Ok(Self { inner, sources })
    }

    fn parse_file(file: &Path) -> anyhow::Result<Vec<WorkflowTemplate>> {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Reading {}", file.display()))?;
        Self::parse_str(&content).with_context(|| format!("Parsing {}", file.display()))
    }

    /// Parse one YAML document (single template or `templates:` list)
    pub fn parse_str(content: &str) -> anyhow::Result<Vec<WorkflowTemplate>> {
        let parsed: TemplateFile = serde_yaml::from_str(content)?;
        Ok(match parsed {
            TemplateFile::Many { templates } => templates,
            TemplateFile::One(template) => vec![template],
        })
    }

    pub fn templates(&self) -> &StaticTemplateProvider {
        &self.inner
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

#[async_trait]
impl StepTemplateProvider for YamlTemplateProvider {
    async fn load(&self, workflow_type: &str) -> Result<Option<WorkflowTemplate>, TemplateError> {
        self.inner.load(workflow_type).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
