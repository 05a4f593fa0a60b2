use crate::config::ChatConfig;
use crate::db::models::Message;
use crate::error::AppError;
use crate::repositories::conversation_repo::ConversationRepo;
use crate::services::provider_client::ChatMessage;

/// Provider input: the system instruction, prior turns in order, then the new
/// user text. History entries without content are left out.
pub fn assemble_messages(
    system_prompt: &str,
    history: &[Message],
    new_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));

    messages.extend(history.iter().filter_map(|message| {
        message
            .content
            .as_deref()
            .map(|content| ChatMessage::new(&message.role, content))
    }));

    messages.push(ChatMessage::user(new_text));
    messages
}

#[derive(Clone)]
pub struct ContextService {
    conversation_repo: ConversationRepo,
    config: ChatConfig,
}

impl ContextService {
    pub fn new(conversation_repo: ConversationRepo, config: ChatConfig) -> Self {
        Self {
            conversation_repo,
            config,
        }
    }

    /// Context for a user message that has already been persisted at
    /// `user_position`. The window covers the messages before it.
    pub async fn build_context(
        &self,
        conversation_id: &str,
        user_position: i64,
        new_text: &str,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let history = self
            .conversation_repo
            .recent_messages(conversation_id, user_position, self.config.context_messages)
            .await?;

        Ok(assemble_messages(&self.config.system_prompt, &history, new_text))
    }
}
