//! Wire DTOs for the chat backend.
//!
//! DESIGN
//! ======
//! These mirror the backend's JSON as-is. Fields whose shape varies between
//! deployments (`response` in history records, `explanation` in explanation
//! replies) stay as `serde_json::Value` here and are normalized by the chat
//! layer, so the wire types never guess at meaning.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Status string the backend uses for successful history operations.
pub const STATUS_OK: &str = "ok";

/// Reply shown in place of a missing quiz answer.
pub const NO_ANSWER: &str = "No answer";

// =============================================================================
// AUTH
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

// =============================================================================
// CATALOG
// =============================================================================

/// One selectable chatbot as listed by the catalog endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatbotEntry {
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    pub id: i64,
    pub name: String,
    pub source: String,
    #[serde(default, alias = "quizTopic")]
    pub quiz_topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub chatbots: Vec<ChatbotEntry>,
}

// =============================================================================
// HISTORY
// =============================================================================

/// One persisted exchange, newest first in the server's listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "_id", deserialize_with = "deserialize_record_id")]
    pub id: String,
    #[serde(default)]
    pub message: String,
    /// Either a plain string or `{ response, sources }`.
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatHistoryResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub chat_history: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearHistoryResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub deleted_count: u64,
}

// =============================================================================
// ANSWERS
// =============================================================================

/// Reply from the aggregate endpoint: citations keyed by document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregateAnswer {
    pub text: String,
    #[serde(default)]
    pub source: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicSource {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicAnswerBody {
    pub response: String,
    #[serde(default)]
    pub sources: Vec<TopicSource>,
}

/// Reply from a per-topic RAG endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicAnswer {
    pub answer: TopicAnswerBody,
}

/// The two answer envelopes, tagged by which endpoint produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEnvelope {
    Aggregate(AggregateAnswer),
    Topic(TopicAnswer),
}

// =============================================================================
// EXPLANATIONS
// =============================================================================

/// A previously answered quiz question the user wants explained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizReview {
    pub question: String,
    /// The chosen answer text; `None` when the question was skipped.
    pub user_answer: Option<String>,
    pub correct_answer: String,
    /// Every option, in display order.
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationItem {
    pub question: String,
    pub user_answer: String,
    pub correct_answer: String,
    pub remaining_answers: Vec<String>,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationRequest {
    pub total_questions: u32,
    pub correct_answers: u32,
    pub timestamp: String,
    pub explanations: Vec<ExplanationItem>,
    pub source: String,
}

impl ExplanationRequest {
    /// Single-question request for `review`, routed to `source`.
    #[must_use]
    pub fn for_review(review: &QuizReview, source: &str, timestamp: String) -> Self {
        let user_answer = review.user_answer.clone().unwrap_or_else(|| NO_ANSWER.to_owned());
        let is_correct = review.user_answer.as_deref() == Some(review.correct_answer.as_str());
        let remaining_answers = review
            .options
            .iter()
            .filter(|o| **o != user_answer && **o != review.correct_answer)
            .cloned()
            .collect();
        Self {
            total_questions: 1,
            correct_answers: u32::from(is_correct),
            timestamp,
            explanations: vec![ExplanationItem {
                question: review.question.clone(),
                user_answer,
                correct_answer: review.correct_answer.clone(),
                remaining_answers,
                is_correct,
            }],
            source: source.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExplanationEntry {
    /// A string (possibly JSON-encoded `{ response, sources }`) or an object.
    #[serde(default)]
    pub explanation: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExplanationResponse {
    #[serde(default)]
    pub explanations: Vec<ExplanationEntry>,
}

// =============================================================================
// LENIENT DESERIALIZERS
// =============================================================================

#[allow(clippy::cast_possible_truncation)]
fn deserialize_i64_lenient<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| D::Error::custom("id out of range")),
        Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected numeric id, got {other}"))),
    }
}

/// Accepts `"abc"`, `42` or a Mongo-style `{ "$oid": "abc" }`.
fn deserialize_record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Object(map) => match map.get("$oid") {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(D::Error::custom("record id object without $oid")),
        },
        other => Err(D::Error::custom(format!("unsupported record id: {other}"))),
    }
}
