use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub total_tokens_used: i64,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    /// `None` when the body is held encrypted elsewhere.
    pub content: Option<String>,
    pub token_count: i64,
    pub model: Option<String>,
    pub response_time_ms: Option<i64>,
    pub position: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: Option<String>,
    pub token_count: i64,
    pub model: Option<String>,
    pub response_time_ms: Option<i64>,
}

impl NewMessage {
    pub fn user(conversation_id: &str, content: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            role: MessageRole::User,
            content: Some(content.to_string()),
            token_count: estimate_tokens(content),
            model: None,
            response_time_ms: None,
        }
    }

    pub fn assistant(
        conversation_id: &str,
        content: String,
        token_count: i64,
        model: &str,
        response_time_ms: i64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            role: MessageRole::Assistant,
            content: Some(content),
            token_count,
            model: Some(model.to_string()),
            response_time_ms: Some(response_time_ms),
        }
    }
}

/// Length heuristic: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    (chars + 3) / 4
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: String,
    pub name: String,
    pub model_id: String,
    pub provider: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: i64,
    pub temperature: f64,
    pub is_default: i64,
    pub is_active: i64,
    pub cost_per_1k_input: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

impl AiModel {
    pub fn is_local_model(&self) -> bool {
        self.provider == "LMStudio" || self.endpoint.contains("localhost")
    }

    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAiModel {
    pub name: String,
    pub model_id: String,
    pub provider: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub max_tokens: i64,
    pub temperature: f64,
    pub is_active: bool,
    pub cost_per_1k_input: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
}

/// Admin edit; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub cost_per_1k_input: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiModelSummary {
    #[serde(flatten)]
    pub model: AiModel,
    pub display_name: String,
    pub is_local_model: bool,
    pub is_loaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatistics {
    pub project_id: String,
    pub project_name: String,
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_tokens_used: i64,
    pub last_activity_at: Option<String>,
    pub created_at: String,
    pub messages_by_role: BTreeMap<String, i64>,
    pub tokens_by_model: BTreeMap<String, i64>,
    pub average_response_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("Hello"), 2);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[test]
    fn token_estimate_counts_characters_not_bytes() {
        assert_eq!(estimate_tokens("héllo"), 2);
    }
}
