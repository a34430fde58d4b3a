//! Core data models.
//!
//! Status enums are stored as their upper-case names (`"PENDING"`,
//! `"ACTIVE"`, ...) and round-trip through [`std::str::FromStr`]. Staged
//! item payloads are a closed sum type, [`StagedPayload`], so an unknown
//! item type is rejected when it enters or leaves the staging table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PipelineError;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(PipelineError::Validation(format!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle of a document through extraction and commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(ParseStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

/// The three sequential processing phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    DomainClassification,
    KnowledgeExtraction,
    Chunking,
}

string_enum!(Phase {
    DomainClassification => "DOMAIN_CLASSIFICATION",
    KnowledgeExtraction => "KNOWLEDGE_EXTRACTION",
    Chunking => "CHUNKING",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    DomainAssignment,
    DomainSuggestion,
    Rule,
    QaPair,
    Uncertainty,
    Chunk,
}

string_enum!(ItemType {
    DomainAssignment => "DOMAIN_ASSIGNMENT",
    DomainSuggestion => "DOMAIN_SUGGESTION",
    Rule => "RULE",
    QaPair => "QA_PAIR",
    Uncertainty => "UNCERTAINTY",
    Chunk => "CHUNK",
});

impl ItemType {
    /// The phase that produces items of this type.
    pub fn phase(&self) -> Phase {
        match self {
            ItemType::DomainAssignment | ItemType::DomainSuggestion => {
                Phase::DomainClassification
            }
            ItemType::Rule | ItemType::QaPair | ItemType::Uncertainty => {
                Phase::KnowledgeExtraction
            }
            ItemType::Chunk => Phase::Chunking,
        }
    }
}

/// Status shared by rules and Q&A pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnowledgeStatus {
    Active,
    Superseded,
    Deprecated,
}

string_enum!(KnowledgeStatus {
    Active => "ACTIVE",
    Superseded => "SUPERSEDED",
    Deprecated => "DEPRECATED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(SuggestionStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionStatus {
    Open,
    Answered,
    Dismissed,
}

string_enum!(QuestionStatus {
    Open => "OPEN",
    Answered => "ANSWERED",
    Dismissed => "DISMISSED",
});

/// Review state of a staged item, derived from its two flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Verified,
    Rejected,
}

string_enum!(ReviewStatus {
    Pending => "PENDING",
    Verified => "VERIFIED",
    Rejected => "REJECTED",
});

// ============ Staged payloads ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainAssignment {
    pub primary_domain_slug: String,
    #[serde(default)]
    pub secondary_domain_slugs: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSuggestionItem {
    pub suggested_slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_slug: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpan {
    #[serde(default)]
    pub quote: String,
    #[serde(default)]
    pub location_hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRule {
    pub rule_code: String,
    pub title: String,
    pub body: String,
    pub confidence: f64,
    #[serde(default)]
    pub source_span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedQa {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub linked_rule_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uncertainty {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub suggested_question: String,
}

/// One window produced by the chunker. Offsets are in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    pub content: String,
    pub index: usize,
    pub start_char: usize,
    pub end_char: usize,
}

/// Typed payload of a staged extraction item.
///
/// Serializes as `{"itemType": "RULE", "data": {...}}`, which is also how
/// the staging table's `item_type` and `data` columns are reassembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "itemType", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagedPayload {
    DomainAssignment(DomainAssignment),
    DomainSuggestion(DomainSuggestionItem),
    Rule(ExtractedRule),
    QaPair(ExtractedQa),
    Uncertainty(Uncertainty),
    Chunk(TextChunk),
}

impl StagedPayload {
    pub fn item_type(&self) -> ItemType {
        match self {
            StagedPayload::DomainAssignment(_) => ItemType::DomainAssignment,
            StagedPayload::DomainSuggestion(_) => ItemType::DomainSuggestion,
            StagedPayload::Rule(_) => ItemType::Rule,
            StagedPayload::QaPair(_) => ItemType::QaPair,
            StagedPayload::Uncertainty(_) => ItemType::Uncertainty,
            StagedPayload::Chunk(_) => ItemType::Chunk,
        }
    }

    pub fn phase(&self) -> Phase {
        self.item_type().phase()
    }

    /// The inner payload as JSON, without the type tag.
    pub fn data(&self) -> serde_json::Value {
        let value = match self {
            StagedPayload::DomainAssignment(v) => serde_json::to_value(v),
            StagedPayload::DomainSuggestion(v) => serde_json::to_value(v),
            StagedPayload::Rule(v) => serde_json::to_value(v),
            StagedPayload::QaPair(v) => serde_json::to_value(v),
            StagedPayload::Uncertainty(v) => serde_json::to_value(v),
            StagedPayload::Chunk(v) => serde_json::to_value(v),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild a payload from its stored item type and JSON data.
    pub fn from_parts(item_type: &str, data: serde_json::Value) -> Result<Self, PipelineError> {
        let item_type: ItemType = item_type.parse()?;
        serde_json::from_value(serde_json::json!({
            "itemType": item_type.as_str(),
            "data": data,
        }))
        .map_err(|e| {
            PipelineError::Validation(format!("malformed {} payload: {}", item_type, e))
        })
    }

    /// Short human-readable preview for progress events and CLI listings.
    pub fn preview(&self) -> String {
        match self {
            StagedPayload::DomainAssignment(d) => {
                if d.secondary_domain_slugs.is_empty() {
                    d.primary_domain_slug.clone()
                } else {
                    format!(
                        "{} (+{})",
                        d.primary_domain_slug,
                        d.secondary_domain_slugs.join(", ")
                    )
                }
            }
            StagedPayload::DomainSuggestion(s) => format!("{}: {}", s.suggested_slug, s.title),
            StagedPayload::Rule(r) => format!("{} {}", r.rule_code, r.title),
            StagedPayload::QaPair(q) => q.question.clone(),
            StagedPayload::Uncertainty(u) => u.description.clone(),
            StagedPayload::Chunk(c) => truncate_chars(&c.content, 80),
        }
    }
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

/// Highest number a rule code may carry. Larger codes count as mangled.
pub const MAX_RULE_NUMBER: u32 = 999_999;

/// Numeric part of a rule code such as `R-12`.
pub fn parse_rule_code(code: &str) -> Option<u32> {
    let rest = code.trim();
    let rest = rest
        .strip_prefix("R-")
        .or_else(|| rest.strip_prefix("r-"))?;
    rest.parse().ok().filter(|n| *n <= MAX_RULE_NUMBER)
}

pub fn format_rule_code(n: u32) -> String {
    format!("R-{}", n)
}

/// One past the highest numbered code in `codes` (1 when there are none).
pub fn next_code_after<'a>(codes: impl IntoIterator<Item = &'a str>) -> u32 {
    codes
        .into_iter()
        .filter_map(parse_rule_code)
        .max()
        .map(|max| max.saturating_add(1))
        .unwrap_or(1)
}

// ============ Stored rows ============

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub raw_text: String,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub retry_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedExtraction {
    pub id: String,
    pub document_id: String,
    pub phase: Phase,
    #[serde(flatten)]
    pub payload: StagedPayload,
    pub is_verified: bool,
    pub is_rejected: bool,
    pub verified_at: Option<i64>,
    pub created_at: i64,
}

impl StagedExtraction {
    pub fn review_status(&self) -> ReviewStatus {
        match (self.is_verified, self.is_rejected) {
            (true, _) => ReviewStatus::Verified,
            (false, true) => ReviewStatus::Rejected,
            (false, false) => ReviewStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub rule_code: String,
    pub title: String,
    pub body: String,
    pub confidence: f64,
    pub status: KnowledgeStatus,
    pub version: i64,
    pub source_quote: Option<String>,
    pub source_location: Option<String>,
    pub document_id: Option<String>,
    pub supersedes_rule_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QaPair {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub rule_id: Option<String>,
    pub document_id: Option<String>,
    pub status: KnowledgeStatus,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub start_char: i64,
    pub end_char: i64,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQuestion {
    pub id: String,
    pub issue_type: String,
    pub question: String,
    pub context: serde_json::Value,
    pub status: QuestionStatus,
    pub response: Option<String>,
    pub document_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeChange {
    pub id: String,
    pub target_type: String,
    pub target_id: String,
    pub change_type: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub initiated_by: String,
    pub approved_by: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub reviewed_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_is_case_insensitive() {
        assert_eq!("processing".parse::<ParseStatus>().unwrap(), ParseStatus::Processing);
        assert_eq!(Phase::KnowledgeExtraction.as_str(), "KNOWLEDGE_EXTRACTION");
        assert!("ARCHIVED".parse::<KnowledgeStatus>().is_err());
    }

    #[test]
    fn test_item_type_phase_mapping() {
        assert_eq!(ItemType::DomainSuggestion.phase(), Phase::DomainClassification);
        assert_eq!(ItemType::Uncertainty.phase(), Phase::KnowledgeExtraction);
        assert_eq!(ItemType::Chunk.phase(), Phase::Chunking);
    }

    #[test]
    fn test_payload_from_parts() {
        let data = serde_json::json!({
            "ruleCode": "R-3",
            "title": "Срочность",
            "body": "Срочный перевод +50%",
            "confidence": 0.9,
            "sourceSpan": {"quote": "+50%", "locationHint": "п. 2"}
        });
        let payload = StagedPayload::from_parts("RULE", data.clone()).unwrap();
        assert_eq!(payload.item_type(), ItemType::Rule);
        assert_eq!(payload.phase(), Phase::KnowledgeExtraction);
        assert_eq!(payload.data(), data);
    }

    #[test]
    fn test_payload_rejects_unknown_type() {
        let err = StagedPayload::from_parts("GLOSSARY_TERM", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_payload_rejects_shape_mismatch() {
        let chunk = serde_json::json!({"content": "x", "index": 0, "startChar": 0, "endChar": 1});
        assert!(StagedPayload::from_parts("RULE", chunk).is_err());
    }

    #[test]
    fn test_uncertainty_uses_type_key() {
        let u: Uncertainty = serde_json::from_value(serde_json::json!({
            "type": "ambiguity",
            "description": "Не указана валюта",
            "suggestedQuestion": "В какой валюте цена?"
        }))
        .unwrap();
        assert_eq!(u.kind, "ambiguity");
    }

    #[test]
    fn test_rule_codes() {
        assert_eq!(parse_rule_code("R-17"), Some(17));
        assert_eq!(parse_rule_code(" r-3 "), Some(3));
        assert_eq!(parse_rule_code("RULE-3"), None);
        assert_eq!(format_rule_code(4), "R-4");
        assert_eq!(next_code_after(["R-2", "R-10", "junk"]), 11);
        assert_eq!(next_code_after(Vec::<&str>::new()), 1);
    }

    #[test]
    fn test_oversized_rule_codes_are_ignored() {
        assert_eq!(parse_rule_code("R-4294967295"), None);
        assert_eq!(parse_rule_code("R-99999999999"), None);
        assert_eq!(parse_rule_code("R-999999"), Some(MAX_RULE_NUMBER));
        assert_eq!(next_code_after(["R-4294967295", "R-3"]), 4);
    }

    #[test]
    fn test_truncate_chars_counts_characters() {
        assert_eq!(truncate_chars("привет", 10), "привет");
        assert_eq!(truncate_chars("привет", 3), "при…");
    }
}
