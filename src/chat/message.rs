//! Transcript messages and normalization of backend replies into them.
//!
//! DESIGN
//! ======
//! The backend returns answers in two envelopes (aggregate vs per-topic),
//! history in a record format, and explanations in yet another. Everything
//! is converted here into [`Message`] / [`BotReply`] with a common
//! [`Source`] citation shape, so the controller never branches on envelope.

#[cfg(test)]
#[path = "message_test.rs"]
mod message_test;

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::net::error::ApiError;
use crate::net::types::{AnswerEnvelope, ExplanationResponse, HistoryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// One citation attached to a bot reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub file_name: String,
    pub excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file_name.is_empty() {
            f.write_str(&self.excerpt)
        } else {
            write!(f, "{}: {}", self.file_name, self.excerpt)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    /// Set when the message was rehydrated from persisted history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Sender::User,
            text: text.into(),
            timestamp_ms,
            sources: None,
            history_id: None,
        }
    }

    #[must_use]
    pub fn bot(text: impl Into<String>, sources: Option<Vec<Source>>, timestamp_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Sender::Bot,
            text: text.into(),
            timestamp_ms,
            sources,
            history_id: None,
        }
    }
}

/// Normalized bot answer, independent of which endpoint produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct BotReply {
    pub text: String,
    pub sources: Vec<Source>,
}

impl BotReply {
    #[must_use]
    pub fn into_message(self, timestamp_ms: i64) -> Message {
        Message::bot(self.text, Some(self.sources), timestamp_ms)
    }
}

impl From<AnswerEnvelope> for BotReply {
    fn from(envelope: AnswerEnvelope) -> Self {
        match envelope {
            AnswerEnvelope::Aggregate(answer) => Self {
                text: answer.text,
                sources: answer
                    .source
                    .into_iter()
                    .map(|(file_name, excerpt)| Source { file_name, excerpt: value_text(&excerpt), score: None })
                    .collect(),
            },
            AnswerEnvelope::Topic(answer) => Self {
                text: answer.answer.response,
                sources: answer
                    .answer
                    .sources
                    .into_iter()
                    .map(|s| Source { file_name: s.file_name, excerpt: s.text, score: s.score })
                    .collect(),
            },
        }
    }
}

/// Normalize an explanation reply.
///
/// The first entry's `explanation` may be plain text, a JSON-encoded
/// `{ response, sources }` string, or an object carrying `text`.
///
/// # Errors
///
/// Returns [`ApiError::Envelope`] when the reply holds no explanation.
pub fn explanation_reply(response: ExplanationResponse) -> Result<BotReply, ApiError> {
    let entry = response
        .explanations
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Envelope("no explanations in reply".to_owned()))?;

    let raw = match entry.explanation {
        Value::Null => return Err(ApiError::Envelope("empty explanation".to_owned())),
        Value::String(s) => s,
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => Value::Object(map).to_string(),
        },
        other => other.to_string(),
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(parsed)) => {
            let text = match parsed.get("response") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                _ => raw.clone(),
            };
            Ok(BotReply { text, sources: sources_from_value(parsed.get("sources")) })
        }
        _ => Ok(BotReply { text: raw, sources: Vec::new() }),
    }
}

/// Map newest-first history records into chronological transcript messages.
///
/// Each record yields a user message followed by its bot reply. Records
/// repeating an already-seen id are skipped. A record whose timestamp is
/// missing, unparsable or earlier than its predecessor takes the previous
/// record's timestamp, so the output never goes backwards.
#[must_use]
pub fn messages_from_history(records: Vec<HistoryRecord>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut messages = Vec::with_capacity(records.len() * 2);
    let mut previous_ms = 0;
    for record in records.into_iter().rev() {
        if !seen.insert(record.id.clone()) {
            continue;
        }
        let timestamp_ms = record
            .timestamp
            .as_deref()
            .and_then(parse_timestamp_ms)
            .map_or(previous_ms, |ms| ms.max(previous_ms));
        previous_ms = timestamp_ms;
        let (bot_text, sources) = history_response(&record.response);
        messages.push(Message {
            id: format!("user-{}", record.id),
            sender: Sender::User,
            text: record.message,
            timestamp_ms,
            sources: None,
            history_id: Some(record.id.clone()),
        });
        messages.push(Message {
            id: format!("bot-{}", record.id),
            sender: Sender::Bot,
            text: bot_text,
            timestamp_ms,
            sources: Some(sources),
            history_id: Some(record.id),
        });
    }
    messages
}

fn history_response(response: &Value) -> (String, Vec<Source>) {
    match response {
        Value::Null => (String::new(), Vec::new()),
        Value::String(s) => (s.clone(), Vec::new()),
        Value::Object(map) => {
            let text = match map.get("response") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                _ => response.to_string(),
            };
            (text, sources_from_value(map.get("sources")))
        }
        other => (other.to_string(), Vec::new()),
    }
}

/// Lenient citation list: objects with file/excerpt/score fields, or
/// `"file: excerpt"` strings. Anything else is dropped.
fn sources_from_value(value: Option<&Value>) -> Vec<Source> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items.iter().filter_map(source_from_value).collect()
}

fn source_from_value(value: &Value) -> Option<Source> {
    match value {
        Value::String(s) => Some(match s.split_once(": ") {
            Some((file, excerpt)) => Source { file_name: file.to_owned(), excerpt: excerpt.to_owned(), score: None },
            None => Source { file_name: String::new(), excerpt: s.clone(), score: None },
        }),
        Value::Object(map) => {
            let field = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k)).map(value_text).unwrap_or_default();
            let score = ["score", "relevance_score"]
                .iter()
                .find_map(|k| map.get(*k))
                .and_then(Value::as_f64);
            Some(Source {
                file_name: field(&["file_name", "fileName", "source"]),
                excerpt: field(&["text", "excerpt", "content"]),
                score,
            })
        }
        _ => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse an RFC 3339 or naive ISO-8601 (assumed UTC) timestamp to epoch ms.
#[must_use]
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let parsed = OffsetDateTime::parse(raw, &Rfc3339).or_else(|_| {
        let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
        PrimitiveDateTime::parse(raw, naive).map(PrimitiveDateTime::assume_utc)
    });
    match parsed {
        Ok(dt) => i64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok(),
        Err(e) => {
            tracing::debug!(raw, error = %e, "unparsable history timestamp");
            None
        }
    }
}

/// Format epoch ms as RFC 3339, falling back to the Unix epoch.
#[must_use]
pub fn format_timestamp_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_owned())
}
