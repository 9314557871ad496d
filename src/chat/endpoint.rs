#[cfg(test)]
#[path = "endpoint_test.rs"]
mod endpoint_test;

use serde::Serialize;

use crate::net::types::ChatbotEntry;

/// Catalog id of the cross-topic aggregate chatbot.
pub const AGGREGATE_ENDPOINT_ID: i64 = 0;

/// A selectable chat target. Immutable once built from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationEndpoint {
    pub id: i64,
    pub display_name: String,
    /// Routing key for history queries and topic answers.
    pub source_key: String,
    pub quiz_topic_key: Option<String>,
}

impl ConversationEndpoint {
    #[must_use]
    pub fn new(id: i64, display_name: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self { id, display_name: display_name.into(), source_key: source_key.into(), quiz_topic_key: None }
    }

    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.id == AGGREGATE_ENDPOINT_ID
    }
}

impl From<ChatbotEntry> for ConversationEndpoint {
    fn from(entry: ChatbotEntry) -> Self {
        Self {
            id: entry.id,
            display_name: entry.name,
            source_key: entry.source,
            quiz_topic_key: entry.quiz_topic.filter(|t| !t.is_empty()),
        }
    }
}
