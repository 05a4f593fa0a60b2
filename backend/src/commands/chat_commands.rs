use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::commands::project_commands::{authorize_conversation, authorize_project};
use crate::db::models::Message;
use crate::error::AppError;
use crate::log_info;
use crate::services::conversation_service::SendMessage;
use crate::services::fanout_service::{FanoutEvent, FanoutHub, Subscription, Topic};
use crate::services::provider_client::FragmentStream;
use crate::state::AppState;

/// Mirrors a reply to the other connections watching the conversation.
/// Publishes `Typing { active: false }` once, when dropped.
struct ReplyMirror {
    hub: FanoutHub,
    topic: Topic,
    origin: String,
}

impl ReplyMirror {
    fn start(hub: &FanoutHub, conversation_id: &str, connection_id: &str) -> Self {
        let mirror = Self {
            hub: hub.clone(),
            topic: Topic::conversation(conversation_id),
            origin: connection_id.to_string(),
        };
        mirror.publish(FanoutEvent::Typing { active: true });
        mirror
    }

    fn publish(&self, event: FanoutEvent) {
        self.hub.publish(&self.topic, Some(&self.origin), event);
    }
}

impl Drop for ReplyMirror {
    fn drop(&mut self) {
        self.publish(FanoutEvent::Typing { active: false });
    }
}

/// Send a message on behalf of `user_id` from `connection_id`. The caller
/// receives the primary stream; other subscribers of the conversation get
/// the typing indicator and every chunk.
pub async fn send_message(
    state: &AppState,
    user_id: &str,
    connection_id: &str,
    request: SendMessage,
    cancel: CancellationToken,
) -> Result<FragmentStream, AppError> {
    log_info!("lmchat.command", "send_message invoked");
    authorize_project(state, user_id, &request.project_id).await?;

    let mirror = ReplyMirror::start(&state.fanout, &request.conversation_id, connection_id);
    let primary = state.conversation.send_message(request, cancel).await?;

    let mirrored = stream::unfold((primary, mirror), |(mut primary, mirror)| async move {
        let item = primary.next().await?;
        if let Ok(text) = &item {
            mirror.publish(FanoutEvent::Chunk { text: text.clone() });
        }
        Some((item, (primary, mirror)))
    });

    Ok(Box::pin(mirrored))
}

/// Non-streaming send; observers only see the typing indicator.
pub async fn get_response(
    state: &AppState,
    user_id: &str,
    connection_id: &str,
    request: SendMessage,
    cancel: CancellationToken,
) -> Result<Message, AppError> {
    log_info!("lmchat.command", "get_response invoked");
    authorize_project(state, user_id, &request.project_id).await?;

    let _typing = ReplyMirror::start(&state.fanout, &request.conversation_id, connection_id);
    state.conversation.get_response(request, cancel).await
}

/// Subscribe to conversation events raised in a project.
pub async fn join_project(
    state: &AppState,
    user_id: &str,
    connection_id: &str,
    project_id: &str,
) -> Result<Subscription, AppError> {
    log_info!("lmchat.command", "join_project invoked");
    authorize_project(state, user_id, project_id).await?;
    Ok(state.fanout.subscribe(Topic::project(project_id), connection_id))
}

/// Subscribe to a conversation's mirrored output and title changes.
pub async fn join_conversation(
    state: &AppState,
    user_id: &str,
    connection_id: &str,
    conversation_id: &str,
) -> Result<Subscription, AppError> {
    log_info!("lmchat.command", "join_conversation invoked");
    authorize_conversation(state, user_id, conversation_id).await?;
    Ok(state
        .fanout
        .subscribe(Topic::conversation(conversation_id), connection_id))
}

/// Leave a project or conversation room.
pub fn leave(state: &AppState, subscription: Subscription) {
    state.fanout.unsubscribe(subscription);
}
