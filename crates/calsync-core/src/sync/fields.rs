//! Declarative extension fields and their validation.
//!
//! Extension fields live in dedicated sheet columns (their `slot`) and in
//! private calendar properties. Values are checked against the definition's
//! bounds; out-of-policy values are rejected or clamped depending on the
//! configured [`OverflowPolicy`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sync::record_codec::EXTENSION_COLUMNS;
use crate::sync::types::{FieldValue, SyncError, SyncResult};

/// Value type of an extension field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    Text,
}

/// What to do with a value outside its declared bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the record with a validation error.
    #[default]
    Reject,
    /// Clamp numbers into range and truncate long text.
    Clamp,
}

/// Declarative definition of one extension field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub name: String,
    /// Sheet column header holding the value.
    #[serde(default)]
    pub slot: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Raw default, parsed like any other value.
    #[serde(default)]
    pub default: String,
}

impl FieldDefinition {
    pub fn number(name: &str, slot: &str, min: f64, max: f64, default: f64) -> Self {
        Self {
            name: name.to_string(),
            slot: slot.to_string(),
            field_type: FieldType::Number,
            min: Some(min),
            max: Some(max),
            max_length: None,
            default: format!("{default}"),
        }
    }

    pub fn text(name: &str, slot: &str, max_length: usize, default: &str) -> Self {
        Self {
            name: name.to_string(),
            slot: slot.to_string(),
            field_type: FieldType::Text,
            min: None,
            max: None,
            max_length: Some(max_length),
            default: default.to_string(),
        }
    }
}

/// The stock extension fields: a 1..5 priority and a 500-character note.
pub fn default_definitions() -> Vec<FieldDefinition> {
    vec![
        FieldDefinition::number("priority", "Priority", 1.0, 5.0, 3.0),
        FieldDefinition::text("notes", "Notes", 500, ""),
    ]
}

/// A structural problem in a set of field definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    /// Field name, or `#<index>` when the name itself is missing.
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check definitions for structural completeness. Never fails; returns every issue found.
pub fn validate_all(definitions: &[FieldDefinition]) -> Vec<FieldIssue> {
    let mut issues = Vec::new();
    let mut names = HashSet::new();
    let mut slots = HashSet::new();

    for (index, def) in definitions.iter().enumerate() {
        let label = if def.name.trim().is_empty() {
            format!("#{index}")
        } else {
            def.name.clone()
        };
        let mut issue = |message: String| {
            issues.push(FieldIssue {
                field: label.clone(),
                message,
            })
        };

        if def.name.trim().is_empty() {
            issue("missing name".into());
        } else if def.name == "id" {
            issue("'id' is reserved for the sync identifier".into());
        } else if !names.insert(def.name.as_str()) {
            issue("duplicate field name".into());
        }

        if def.slot.trim().is_empty() {
            issue("missing slot".into());
        } else if !EXTENSION_COLUMNS.contains(&def.slot.as_str()) {
            issue(format!(
                "slot '{}' is not an extension column ({})",
                def.slot,
                EXTENSION_COLUMNS.join(", ")
            ));
        } else if !slots.insert(def.slot.as_str()) {
            issue(format!("slot '{}' is used by another field", def.slot));
        }

        match def.field_type {
            FieldType::Number => {
                if def.max_length.is_some() {
                    issue("max_length only applies to text fields".into());
                }
                if let (Some(min), Some(max)) = (def.min, def.max) {
                    if min > max {
                        issue(format!("min {min} is greater than max {max}"));
                    }
                }
            }
            FieldType::Text => {
                if def.min.is_some() || def.max.is_some() {
                    issue("min/max only apply to number fields".into());
                }
            }
        }

        // The default must survive strict validation of its own definition.
        if let Err(e) = check_value(def, Some(&def.default), OverflowPolicy::Reject) {
            issue(format!("invalid default: {e}"));
        }
    }

    issues
}

/// Validates raw extension values against a set of definitions.
#[derive(Debug, Clone)]
pub struct FieldValidator {
    definitions: Vec<FieldDefinition>,
    policy: OverflowPolicy,
}

impl FieldValidator {
    pub fn new(definitions: Vec<FieldDefinition>, policy: OverflowPolicy) -> Self {
        Self {
            definitions,
            policy,
        }
    }

    pub fn definitions(&self) -> &[FieldDefinition] {
        &self.definitions
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn definition(&self, name: &str) -> Option<&FieldDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    /// Structural issues of this validator's own definitions.
    pub fn issues(&self) -> Vec<FieldIssue> {
        validate_all(&self.definitions)
    }

    /// Validate one raw value. A missing or blank value resolves to the default.
    pub fn validate(&self, field_name: &str, raw: Option<&str>) -> SyncResult<FieldValue> {
        let def = self
            .definition(field_name)
            .ok_or_else(|| SyncError::validation(field_name, "unknown extension field"))?;
        check_value(def, raw, self.policy)
    }

    /// Default value of every registered field.
    pub fn defaults(&self) -> BTreeMap<String, FieldValue> {
        self.definitions
            .iter()
            .filter_map(|d| {
                check_value(d, None, OverflowPolicy::Clamp)
                    .ok()
                    .map(|v| (d.name.clone(), v))
            })
            .collect()
    }
}

impl Default for FieldValidator {
    fn default() -> Self {
        Self::new(default_definitions(), OverflowPolicy::default())
    }
}

fn check_value(
    def: &FieldDefinition,
    raw: Option<&str>,
    policy: OverflowPolicy,
) -> SyncResult<FieldValue> {
    // Blank means unset; anything else is kept verbatim.
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => def.default.as_str(),
    };

    match def.field_type {
        FieldType::Number => {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(SyncError::validation(&def.name, "value is required"));
            }
            let n: f64 = raw
                .parse()
                .ok()
                .filter(|n: &f64| n.is_finite())
                .ok_or_else(|| {
                    SyncError::validation(&def.name, format!("'{raw}' is not a number"))
                })?;
            let min = def.min.unwrap_or(f64::NEG_INFINITY);
            let max = def.max.unwrap_or(f64::INFINITY);
            if n >= min && n <= max {
                return Ok(FieldValue::Number(n));
            }
            match policy {
                OverflowPolicy::Reject => Err(SyncError::validation(
                    &def.name,
                    format!("{n} is outside [{}, {}]", fmt_bound(def.min), fmt_bound(def.max)),
                )),
                OverflowPolicy::Clamp => Ok(FieldValue::Number(n.clamp(min, max))),
            }
        }
        FieldType::Text => {
            let limit = def.max_length.unwrap_or(usize::MAX);
            let len = raw.chars().count();
            if len <= limit {
                return Ok(FieldValue::Text(raw.to_string()));
            }
            match policy {
                OverflowPolicy::Reject => Err(SyncError::validation(
                    &def.name,
                    format!("{len} characters exceeds the limit of {limit}"),
                )),
                OverflowPolicy::Clamp => Ok(FieldValue::Text(raw.chars().take(limit).collect())),
            }
        }
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| format!("{b}"))
}
