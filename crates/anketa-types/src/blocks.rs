//! AI-derived structured blocks produced by dialogue synthesis.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Block shapes the synthesis service is known to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnownAiBlock {
    Faq {
        question: String,
        answer: String,
    },
    Objection {
        objection: String,
        #[serde(default)]
        response: String,
    },
    Summary {
        text: String,
    },
    Recommendation {
        title: String,
        #[serde(default)]
        detail: String,
    },
    /// A questionnaire field value proposed during synthesis.
    FieldSuggestion {
        field: String,
        value: Value,
    },
}

/// An AI-derived block; unknown shapes are kept verbatim instead of rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AiBlock {
    Known(KnownAiBlock),
    Unknown(Value),
}

impl AiBlock {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value::<KnownAiBlock>(value.clone())
            .map(Self::Known)
            .unwrap_or(Self::Unknown(value))
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Known(KnownAiBlock::Faq { .. }) => "faq",
            Self::Known(KnownAiBlock::Objection { .. }) => "objection",
            Self::Known(KnownAiBlock::Summary { .. }) => "summary",
            Self::Known(KnownAiBlock::Recommendation { .. }) => "recommendation",
            Self::Known(KnownAiBlock::FieldSuggestion { .. }) => "field_suggestion",
            Self::Unknown(value) => value
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    /// Returns true when the block carries enough content to be rendered.
    pub fn is_renderable(&self) -> bool {
        match self {
            Self::Known(KnownAiBlock::Faq { question, answer }) => {
                !question.trim().is_empty() && !answer.trim().is_empty()
            }
            Self::Known(KnownAiBlock::Objection { objection, .. }) => !objection.trim().is_empty(),
            Self::Known(KnownAiBlock::Summary { text }) => !text.trim().is_empty(),
            Self::Known(KnownAiBlock::Recommendation { title, .. }) => !title.trim().is_empty(),
            Self::Known(KnownAiBlock::FieldSuggestion { field, value }) => {
                !field.trim().is_empty() && !value.is_null()
            }
            Self::Unknown(_) => false,
        }
    }

    /// One-line plain-text rendering used in logs and fallbacks.
    pub fn headline(&self) -> String {
        match self {
            Self::Known(KnownAiBlock::Faq { question, .. }) => question.clone(),
            Self::Known(KnownAiBlock::Objection { objection, .. }) => objection.clone(),
            Self::Known(KnownAiBlock::Summary { text }) => {
                text.lines().next().unwrap_or_default().to_string()
            }
            Self::Known(KnownAiBlock::Recommendation { title, .. }) => title.clone(),
            Self::Known(KnownAiBlock::FieldSuggestion { field, .. }) => field.clone(),
            Self::Unknown(_) => format!("unsupported block '{}'", self.kind()),
        }
    }
}
