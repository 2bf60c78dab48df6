//! Step Validation
//!
//! Checks submitted step data against the step's [`ValidationRules`] and
//! returns the normalized data to merge. No I/O and no state besides a cache
//! of compiled field patterns; safe to run concurrently for any number of steps.

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{LazyLock, PoisonError, RwLock};

use crate::state::StepData;
use crate::template::{DocumentRequirement, FieldRule, FieldType, PaymentLineItem, ValidationRules};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

/// Anchored template field patterns, keyed by the raw pattern
static FIELD_PATTERNS: LazyLock<RwLock<HashMap<String, Regex>>> = LazyLock::new(Default::default);

/// A single field-level validation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validates submitted step data
pub struct StepValidator;

impl StepValidator {
    /// Validate `submitted` against `rules`.
    ///
    /// Returns the normalized data on success, or every field error found.
    pub fn validate(
        rules: &ValidationRules,
        submitted: &StepData,
    ) -> Result<StepData, Vec<FieldError>> {
        match rules {
            ValidationRules::None => Ok(submitted.clone()),
            ValidationRules::Fields { fields } => Self::validate_fields(fields, submitted),
            ValidationRules::Documents { documents } => {
                Self::validate_documents(documents, submitted)
            }
            ValidationRules::Payment {
                line_items,
                currency,
            } => Self::validate_payment(line_items, currency.as_deref(), submitted),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Form fields
    // ─────────────────────────────────────────────────────────────────────────

    fn validate_fields(
        fields: &[FieldRule],
        submitted: &StepData,
    ) -> Result<StepData, Vec<FieldError>> {
        let mut normalized = submitted.clone();
        let mut errors = Vec::new();

        for rule in fields {
            match submitted.get(&rule.name).filter(|v| !is_blank(v)) {
                None => {
                    if rule.required {
                        errors.push(FieldError::new(
                            &rule.name,
                            "required",
                            format!("{} is required", display_name(rule)),
                        ));
                    }
                    // Blank optional values are dropped rather than stored as ""
                    normalized.remove(&rule.name);
                }
                Some(value) => match check_field(rule, value) {
                    Ok(clean) => {
                        normalized.insert(rule.name.clone(), clean);
                    }
                    Err(mut field_errors) => errors.append(&mut field_errors),
                },
            }
        }

        if errors.is_empty() {
            Ok(normalized)
        } else {
            Err(errors)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Documents
    // ─────────────────────────────────────────────────────────────────────────

    fn validate_documents(
        requirements: &[DocumentRequirement],
        submitted: &StepData,
    ) -> Result<StepData, Vec<FieldError>> {
        let mut errors = Vec::new();

        let documents = match submitted.get("documents") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(vec![FieldError::new(
                    "documents",
                    "invalid_type",
                    "documents must be an object keyed by document type",
                )])
            }
        };

        for requirement in requirements {
            let field = format!("documents.{}", requirement.document_type);
            let entry = documents.and_then(|d| d.get(&requirement.document_type));

            let Some((doc_ref, format)) = entry.and_then(document_ref) else {
                if requirement.required {
                    errors.push(FieldError::new(
                        &field,
                        "required",
                        format!(
                            "{} is required",
                            requirement
                                .label
                                .as_deref()
                                .unwrap_or(&requirement.document_type)
                        ),
                    ));
                }
                continue;
            };

            if !requirement.accepted_formats.is_empty() {
                let format = format.or_else(|| extension_of(&doc_ref));
                let accepted = format.as_deref().is_some_and(|f| {
                    requirement
                        .accepted_formats
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(f))
                });
                if !accepted {
                    errors.push(FieldError::new(
                        &field,
                        "invalid_format",
                        format!(
                            "Accepted formats: {}",
                            requirement.accepted_formats.join(", ")
                        ),
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(submitted.clone())
        } else {
            Err(errors)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payment
    // ─────────────────────────────────────────────────────────────────────────

    fn validate_payment(
        line_items: &[PaymentLineItem],
        currency: Option<&str>,
        submitted: &StepData,
    ) -> Result<StepData, Vec<FieldError>> {
        let mut normalized = submitted.clone();
        let mut errors = Vec::new();
        let amount_due: Decimal = line_items.iter().map(|item| item.amount).sum();

        match submitted.get("payment_reference").and_then(Value::as_str) {
            Some(reference) if !reference.trim().is_empty() => {
                normalized.insert(
                    "payment_reference".into(),
                    Value::String(reference.trim().to_string()),
                );
            }
            _ => errors.push(FieldError::new(
                "payment_reference",
                "required",
                "Payment reference is required",
            )),
        }

        match submitted.get("amount_paid").filter(|v| !is_blank(v)) {
            None => errors.push(FieldError::new(
                "amount_paid",
                "required",
                "Amount paid is required",
            )),
            Some(value) => match as_decimal(value) {
                None => errors.push(FieldError::new(
                    "amount_paid",
                    "invalid_type",
                    "Amount paid must be a decimal amount",
                )),
                Some(paid) if paid < amount_due => errors.push(FieldError::new(
                    "amount_paid",
                    "insufficient_amount",
                    format!("Amount paid {} is less than amount due {}", paid, amount_due),
                )),
                Some(paid) => {
                    normalized.insert("amount_paid".into(), Value::String(paid.to_string()));
                }
            },
        }

        if let Some(expected) = currency {
            let given = submitted.get("currency").and_then(Value::as_str).map(str::trim);
            match given {
                Some(c) if c.eq_ignore_ascii_case(expected) => {
                    normalized.insert("currency".into(), Value::String(expected.to_string()));
                }
                Some(c) => errors.push(FieldError::new(
                    "currency",
                    "currency_mismatch",
                    format!("Expected currency {}, got {}", expected, c),
                )),
                None => {
                    errors.push(FieldError::new("currency", "required", "Currency is required"))
                }
            }
        }

        if errors.is_empty() {
            normalized.insert("amount_due".into(), Value::String(amount_due.to_string()));
            Ok(normalized)
        } else {
            Err(errors)
        }
    }
}

fn display_name(rule: &FieldRule) -> &str {
    rule.label.as_deref().unwrap_or(&rule.name)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Type-check, normalize and constrain one present field value
fn check_field(rule: &FieldRule, value: &Value) -> Result<Value, Vec<FieldError>> {
    let name = display_name(rule);
    let invalid_type = |expected: &str| {
        vec![FieldError::new(
            &rule.name,
            "invalid_type",
            format!("{} must be {}", name, expected),
        )]
    };

    let clean = match rule.field_type {
        FieldType::Text => match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            _ => return Err(invalid_type("text")),
        },
        FieldType::Email => match value.as_str().map(|s| s.trim().to_lowercase()) {
            Some(email) if EMAIL_RE.is_match(&email) => Value::String(email),
            Some(_) => {
                return Err(vec![FieldError::new(
                    &rule.name,
                    "invalid_format",
                    format!("{} must be a valid email address", name),
                )])
            }
            None => return Err(invalid_type("an email address")),
        },
        FieldType::Number => match as_f64(value) {
            Some(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| invalid_type("a finite number"))?,
            None => return Err(invalid_type("a number")),
        },
        FieldType::Integer => match as_f64(value) {
            Some(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::from(n as i64),
            _ => return Err(invalid_type("a whole number")),
        },
        FieldType::Boolean => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Value::Bool(true),
            Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Value::Bool(false),
            _ => return Err(invalid_type("true or false")),
        },
        FieldType::Date => match value.as_str().map(str::trim) {
            Some(s) if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => {
                Value::String(s.to_string())
            }
            _ => {
                return Err(vec![FieldError::new(
                    &rule.name,
                    "invalid_format",
                    format!("{} must be a date (YYYY-MM-DD)", name),
                )])
            }
        },
        FieldType::Select => match value.as_str().map(str::trim) {
            Some(s) if rule.options.iter().any(|o| o == s) => Value::String(s.to_string()),
            Some(_) => {
                return Err(vec![FieldError::new(
                    &rule.name,
                    "invalid_option",
                    format!("{} must be one of: {}", name, rule.options.join(", ")),
                )])
            }
            None => return Err(invalid_type("text")),
        },
        FieldType::List => match value {
            Value::Array(items) => Value::Array(items.clone()),
            _ => return Err(invalid_type("a list")),
        },
    };

    let mut errors = Vec::new();
    check_length(rule, &clean, &mut errors);
    check_range(rule, &clean, &mut errors);
    check_pattern(rule, &clean, &mut errors);

    if errors.is_empty() {
        Ok(clean)
    } else {
        Err(errors)
    }
}

fn check_length(rule: &FieldRule, value: &Value, errors: &mut Vec<FieldError>) {
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        _ => return,
    };
    let name = display_name(rule);

    if let Some(min) = rule.min_length.filter(|min| len < *min) {
        errors.push(FieldError::new(
            &rule.name,
            "too_short",
            format!("{} must have at least {} characters", name, min),
        ));
    }
    if let Some(max) = rule.max_length.filter(|max| len > *max) {
        errors.push(FieldError::new(
            &rule.name,
            "too_long",
            format!("{} must have at most {} characters", name, max),
        ));
    }
}

fn check_range(rule: &FieldRule, value: &Value, errors: &mut Vec<FieldError>) {
    let Some(n) = value.as_f64() else {
        return;
    };
    let below = rule.min.is_some_and(|min| n < min);
    let above = rule.max.is_some_and(|max| n > max);
    if below || above {
        let bounds = match (rule.min, rule.max) {
            (Some(min), Some(max)) => format!("between {} and {}", min, max),
            (Some(min), None) => format!("at least {}", min),
            (None, Some(max)) => format!("at most {}", max),
            (None, None) => unreachable!(),
        };
        errors.push(FieldError::new(
            &rule.name,
            "out_of_range",
            format!("{} must be {}", display_name(rule), bounds),
        ));
    }
}

fn check_pattern(rule: &FieldRule, value: &Value, errors: &mut Vec<FieldError>) {
    let (Some(pattern), Some(text)) = (rule.pattern.as_deref(), value.as_str()) else {
        return;
    };
    match field_pattern(pattern) {
        Ok(re) if re.is_match(text) => {}
        Ok(_) => errors.push(FieldError::new(
            &rule.name,
            "pattern_mismatch",
            format!("{} has an invalid format", display_name(rule)),
        )),
        Err(e) => errors.push(FieldError::new(
            &rule.name,
            "schema_error",
            format!("Field pattern is invalid: {}", e),
        )),
    }
}

/// Compile a field pattern anchored so the whole value has to match, once
fn field_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let cached = FIELD_PATTERNS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(pattern)
        .cloned();
    if let Some(re) = cached {
        return Ok(re);
    }

    let re = Regex::new(&format!("^(?:{})$", pattern))?;
    FIELD_PATTERNS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// A document entry is either a bare reference or `{ ref, format }`
fn document_ref(entry: &Value) -> Option<(String, Option<String>)> {
    match entry {
        Value::String(s) if !s.trim().is_empty() => Some((s.trim().to_string(), None)),
        Value::Object(map) => {
            let doc_ref = map
                .get("ref")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())?;
            let format = map
                .get("format")
                .and_then(Value::as_str)
                .map(|f| f.trim().to_lowercase());
            Some((doc_ref.to_string(), format))
        }
        _ => None,
    }
}

fn extension_of(doc_ref: &str) -> Option<String> {
    let name = doc_ref.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> StepData {
        match value {
            Value::Object(map) => map,
            _ => panic!("test data must be an object"),
        }
    }

    fn license_rules() -> ValidationRules {
        ValidationRules::Fields {
            fields: vec![
                FieldRule::text("company_name").with_length(Some(3), Some(60)),
                FieldRule::text("contact_email").of_type(FieldType::Email),
                FieldRule::text("license_type").with_options(["commercial", "professional"]),
                FieldRule::text("visa_quota")
                    .of_type(FieldType::Integer)
                    .with_range(Some(0.0), Some(6.0)),
                FieldRule::text("trade_code")
                    .with_pattern("[A-Z]{2}-[0-9]{4}")
                    .optional(),
            ],
        }
    }

    #[test]
    fn test_valid_form_is_normalized() {
        let submitted = data(json!({
            "company_name": "  Falcon Trading  ",
            "contact_email": "Owner@Falcon.AE",
            "license_type": "commercial",
            "visa_quota": "3",
            "extra_note": "kept as is"
        }));

        let normalized = StepValidator::validate(&license_rules(), &submitted).unwrap();

        assert_eq!(normalized["company_name"], json!("Falcon Trading"));
        assert_eq!(normalized["contact_email"], json!("owner@falcon.ae"));
        assert_eq!(normalized["visa_quota"], json!(3));
        assert_eq!(normalized["extra_note"], json!("kept as is"));
        assert!(!normalized.contains_key("trade_code"));
    }

    #[test]
    fn test_missing_and_invalid_fields_are_all_reported() {
        let submitted = data(json!({
            "company_name": "AB",
            "contact_email": "not-an-email",
            "license_type": "industrial",
            "visa_quota": 9,
            "trade_code": "xx-12"
        }));

        let errors = StepValidator::validate(&license_rules(), &submitted).unwrap_err();
        let codes: Vec<(&str, &str)> = errors
            .iter()
            .map(|e| (e.field.as_str(), e.code.as_str()))
            .collect();

        assert!(codes.contains(&("company_name", "too_short")));
        assert!(codes.contains(&("contact_email", "invalid_format")));
        assert!(codes.contains(&("license_type", "invalid_option")));
        assert!(codes.contains(&("visa_quota", "out_of_range")));
        assert!(codes.contains(&("trade_code", "pattern_mismatch")));
    }

    #[test]
    fn test_field_patterns_compile_once_and_anchor() {
        let first = field_pattern("[0-9]{6}-LIC").unwrap();
        assert!(first.is_match("204518-LIC"));
        assert!(!first.is_match("x204518-LIC"));
        assert!(!first.is_match("204518-LICENSE"));

        assert!(FIELD_PATTERNS.read().unwrap().contains_key("[0-9]{6}-LIC"));
        let second = field_pattern("[0-9]{6}-LIC").unwrap();
        assert_eq!(first.as_str(), second.as_str());

        assert!(field_pattern("[unclosed").is_err());
        assert!(!FIELD_PATTERNS.read().unwrap().contains_key("[unclosed"));
    }

    #[test]
    fn test_blank_required_field() {
        let submitted = data(json!({ "company_name": "   " }));
        let errors = StepValidator::validate(&license_rules(), &submitted).unwrap_err();

        assert!(errors
            .iter()
            .any(|e| e.field == "company_name" && e.code == "required"));
    }

    #[test]
    fn test_boolean_and_date_coercion() {
        let rules = ValidationRules::Fields {
            fields: vec![
                FieldRule::text("has_corporate_shareholders").of_type(FieldType::Boolean),
                FieldRule::text("incorporation_date").of_type(FieldType::Date),
            ],
        };

        let ok = StepValidator::validate(
            &rules,
            &data(json!({
                "has_corporate_shareholders": "False",
                "incorporation_date": "2026-03-01"
            })),
        )
        .unwrap();
        assert_eq!(ok["has_corporate_shareholders"], json!(false));

        let errors = StepValidator::validate(
            &rules,
            &data(json!({
                "has_corporate_shareholders": "maybe",
                "incorporation_date": "01/03/2026"
            })),
        )
        .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_documents() {
        let rules = ValidationRules::Documents {
            documents: vec![
                DocumentRequirement {
                    document_type: "passport".into(),
                    label: Some("Passport copy".into()),
                    required: true,
                    accepted_formats: vec!["pdf".into(), "jpg".into()],
                },
                DocumentRequirement {
                    document_type: "noc".into(),
                    label: None,
                    required: false,
                    accepted_formats: vec![],
                },
            ],
        };

        assert!(StepValidator::validate(
            &rules,
            &data(json!({ "documents": { "passport": "blob://docs/passport.PDF" } }))
        )
        .is_ok());

        assert!(StepValidator::validate(
            &rules,
            &data(json!({
                "documents": { "passport": { "ref": "blob://docs/p1", "format": "jpg" } }
            }))
        )
        .is_ok());

        let errors = StepValidator::validate(
            &rules,
            &data(json!({ "documents": { "passport": "blob://docs/passport.docx" } })),
        )
        .unwrap_err();
        assert_eq!(errors[0].code, "invalid_format");

        let errors = StepValidator::validate(&rules, &StepData::new()).unwrap_err();
        assert_eq!(errors[0].field, "documents.passport");
        assert_eq!(errors[0].code, "required");
    }

    #[test]
    fn test_payment() {
        let rules = ValidationRules::Payment {
            line_items: vec![
                PaymentLineItem {
                    code: "license_fee".into(),
                    description: "License".into(),
                    amount: Decimal::new(1290000, 2),
                },
                PaymentLineItem {
                    code: "visa_allocation".into(),
                    description: "Visas".into(),
                    amount: Decimal::new(200000, 2),
                },
            ],
            currency: Some("AED".into()),
        };

        let normalized = StepValidator::validate(
            &rules,
            &data(json!({
                "payment_reference": " PAY-001 ",
                "amount_paid": 14900,
                "currency": "aed"
            })),
        )
        .unwrap();
        assert_eq!(normalized["payment_reference"], json!("PAY-001"));
        assert_eq!(normalized["amount_paid"], json!("14900"));
        assert_eq!(normalized["amount_due"], json!("14900.00"));
        assert_eq!(normalized["currency"], json!("AED"));

        let errors = StepValidator::validate(
            &rules,
            &data(json!({
                "payment_reference": "PAY-002",
                "amount_paid": "100.50",
                "currency": "USD"
            })),
        )
        .unwrap_err();
        let codes: Vec<&str> = errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["insufficient_amount", "currency_mismatch"]);
    }

    #[test]
    fn test_no_rules_accepts_anything() {
        let submitted = data(json!({ "reviewer": "ops", "approved": true }));
        assert_eq!(
            StepValidator::validate(&ValidationRules::None, &submitted).unwrap(),
            submitted
        );
    }
}
