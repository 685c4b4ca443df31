//! Canonical questionnaire schema and progress metrics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AnketaRecord;

/// Shape of a canonical field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn text(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Text,
    }
}

const fn list(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::List,
    }
}

/// The fixed set of human-editable questionnaire fields, in display order.
pub const CANONICAL_FIELDS: [FieldSpec; 27] = [
    text("company_name"),
    text("industry"),
    text("specialization"),
    text("business_description"),
    text("website"),
    text("contact_name"),
    text("contact_role"),
    text("contact_email"),
    text("contact_phone"),
    text("city"),
    text("working_hours"),
    text("employee_count"),
    list("services"),
    list("client_types"),
    text("average_check"),
    list("current_problems"),
    list("business_goals"),
    list("constraints"),
    text("agent_name"),
    text("agent_purpose"),
    text("agent_tone"),
    list("agent_functions"),
    list("integrations"),
    text("call_direction"),
    list("languages"),
    text("budget"),
    text("timeline"),
];

pub fn canonical_field(name: &str) -> Option<&'static FieldSpec> {
    CANONICAL_FIELDS.iter().find(|spec| spec.name == name)
}

pub fn is_canonical_field(name: &str) -> bool {
    canonical_field(name).is_some()
}

/// A canonical field value as displayed in the form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl Default for FieldValue {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl FieldValue {
    pub fn empty_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text => Self::Text(String::new()),
            FieldKind::List => Self::List(Vec::new()),
        }
    }

    /// Returns true for blank text and for lists without a non-blank entry.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::List(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }

    /// Converts a JSON value into a field value; scalars become text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Text(String::new()),
            Value::String(text) => Self::Text(text.clone()),
            Value::Bool(flag) => Self::Text(flag.to_string()),
            Value::Number(number) => Self::Text(number.to_string()),
            Value::Array(items) => Self::List(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text.clone()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect(),
            ),
            Value::Object(_) => Self::Text(value.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::List(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        }
    }
}

/// Percentage of canonical fields holding a non-empty value in `record`.
///
/// `record` is expected in canonical shape (after normalization).
pub fn completion_percentage(record: &AnketaRecord) -> u8 {
    let filled = CANONICAL_FIELDS
        .iter()
        .filter(|spec| {
            record
                .get(spec.name)
                .is_some_and(|value| !FieldValue::from_json(value).is_empty())
        })
        .count();
    ratio_percent(filled, CANONICAL_FIELDS.len())
}

/// One interview question with the answer captured for it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionPair {
    pub question: String,
    #[serde(default)]
    pub answer: Option<String>,
}

/// Interview-mode progress: answered pairs over total pairs.
pub fn interview_completion_percentage(pairs: &[QuestionPair]) -> u8 {
    let answered = pairs
        .iter()
        .filter(|pair| {
            pair.answer
                .as_deref()
                .is_some_and(|answer| !answer.trim().is_empty())
        })
        .count();
    ratio_percent(answered, pairs.len())
}

fn ratio_percent(part: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (part as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}
