use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::db::models::{estimate_tokens, AiModel, Conversation, Message, NewMessage};
use crate::error::AppError;
use crate::repositories::conversation_repo::ConversationRepo;
use crate::services::context_service::ContextService;
use crate::services::model_service::ModelService;
use crate::services::provider_client::{
    ChatCompletionRequest, ChatMessage, CompletionProvider, FragmentStream,
};
use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub project_id: String,
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub model_override: Option<String>,
}

/// How the streaming phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
    Abandoned,
}

/// Marks a conversation as streaming until dropped.
struct StreamSlot {
    in_flight: Arc<DashMap<String, Instant>>,
    conversation_id: String,
}

impl StreamSlot {
    fn acquire(
        in_flight: &Arc<DashMap<String, Instant>>,
        conversation_id: &str,
    ) -> Result<Self, AppError> {
        match in_flight.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => Err(AppError::business(
                "CONVERSATION_BUSY",
                "A response is already being generated for this conversation",
            )),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Ok(Self {
                    in_flight: in_flight.clone(),
                    conversation_id: conversation_id.to_string(),
                })
            }
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.conversation_id);
    }
}

/// Everything the relay task needs once the provider stream is open.
struct StreamJob {
    conversation_repo: ConversationRepo,
    conversation_id: String,
    model_id: String,
    started: Instant,
    slot: StreamSlot,
}

#[derive(Clone)]
pub struct ConversationService {
    conversation_repo: ConversationRepo,
    context_service: ContextService,
    model_service: ModelService,
    provider: Arc<dyn CompletionProvider>,
    in_flight: Arc<DashMap<String, Instant>>,
}

impl ConversationService {
    pub fn new(
        conversation_repo: ConversationRepo,
        context_service: ContextService,
        model_service: ModelService,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            conversation_repo,
            context_service,
            model_service,
            provider,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.in_flight.contains_key(conversation_id)
    }

    /// Persist the user's message, stream the assistant reply and record it.
    ///
    /// The returned stream yields fragments in provider order. The assistant
    /// message is written before the stream ends, whether it ends naturally,
    /// on a provider error, on cancellation or because the receiver was
    /// dropped. Nothing is recorded for a reply that produced no fragment and
    /// did not complete.
    pub async fn send_message(
        &self,
        request: SendMessage,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, AppError> {
        let (slot, model, messages) = self.prepare(&request, &cancel).await?;

        let started = Instant::now();
        let upstream = self
            .provider
            .stream_complete(completion_request(&model, messages), cancel.clone())
            .await?;

        let (tx, rx) = mpsc::channel::<Result<String, AppError>>(1);
        let job = StreamJob {
            conversation_repo: self.conversation_repo.clone(),
            conversation_id: request.conversation_id.clone(),
            model_id: model.model_id.clone(),
            started,
            slot,
        };

        tokio::spawn(relay(job, upstream, tx, cancel));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Non-streaming variant: waits for the whole reply and returns the stored
    /// assistant message.
    pub async fn get_response(
        &self,
        request: SendMessage,
        cancel: CancellationToken,
    ) -> Result<Message, AppError> {
        let (_slot, model, messages) = self.prepare(&request, &cancel).await?;

        let started = Instant::now();
        let completion = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled("completion request".to_string()));
            }
            completion = self.provider.complete(completion_request(&model, messages)) => completion?,
        };
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let estimate = estimate_tokens(&completion.content);
        let (token_count, tokens_used) = match completion.usage.as_ref() {
            Some(usage) if usage.completion_tokens > 0 => {
                let total = if usage.total_tokens > 0 {
                    usage.total_tokens
                } else {
                    usage.completion_tokens
                };
                (usage.completion_tokens, total)
            }
            _ => (estimate, estimate),
        };

        let assistant = NewMessage::assistant(
            &request.conversation_id,
            completion.content,
            token_count,
            &model.model_id,
            elapsed_ms,
        );
        let stored = self
            .conversation_repo
            .finalize_exchange(assistant, tokens_used)
            .await?;

        log_info!(
            "lmchat.chat",
            "Completed reply for conversation {}: {} tokens in {} ms",
            request.conversation_id,
            token_count,
            elapsed_ms
        );
        Ok(stored)
    }

    /// Validate, persist the user turn, assemble context and pick the model.
    async fn prepare(
        &self,
        request: &SendMessage,
        cancel: &CancellationToken,
    ) -> Result<(StreamSlot, AiModel, Vec<ChatMessage>), AppError> {
        if request.content.trim().is_empty() {
            return Err(AppError::validation("content", "Message content cannot be empty"));
        }

        let conversation = self
            .load_conversation(&request.project_id, &request.conversation_id)
            .await?;
        let slot = StreamSlot::acquire(&self.in_flight, &conversation.id)?;
        ensure_live(cancel)?;

        let user_message = self
            .conversation_repo
            .insert_message(NewMessage::user(&conversation.id, &request.content))
            .await?;
        ensure_live(cancel)?;

        let messages = self
            .context_service
            .build_context(&conversation.id, user_message.position, &request.content)
            .await?;
        ensure_live(cancel)?;

        let model = self
            .model_service
            .resolve_for_request(request.model_override.as_deref())
            .await?;
        ensure_live(cancel)?;

        log_info!(
            "lmchat.chat",
            "Sending {} context messages to {} for conversation {}",
            messages.len(),
            model.model_id,
            conversation.id
        );

        Ok((slot, model, messages))
    }

    async fn load_conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, AppError> {
        self.conversation_repo
            .get_conversation(conversation_id)
            .await?
            .filter(|conversation| conversation.project_id == project_id)
            .ok_or_else(|| AppError::not_found("conversation", conversation_id))
    }
}

fn completion_request(model: &AiModel, messages: Vec<ChatMessage>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.model_id.clone(),
        messages,
        temperature: model.temperature,
        max_tokens: model.max_tokens,
        stream: true,
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled("send message".to_string()));
    }
    Ok(())
}

async fn relay(
    job: StreamJob,
    mut upstream: FragmentStream,
    tx: mpsc::Sender<Result<String, AppError>>,
    cancel: CancellationToken,
) {
    let mut text = String::new();
    let mut fragments: i64 = 0;
    let mut failure: Option<AppError> = None;
    let mut outcome = StreamOutcome::Completed;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome = StreamOutcome::Cancelled;
                break;
            }
            _ = tx.closed() => {
                outcome = StreamOutcome::Abandoned;
                break;
            }
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        outcome = StreamOutcome::Cancelled;
                        break;
                    }
                    sent = tx.send(Ok(fragment.clone())) => sent,
                };
                if sent.is_err() {
                    outcome = StreamOutcome::Abandoned;
                    break;
                }

                text.push_str(&fragment);
                fragments += 1;
            }
            Some(Err(e)) => {
                log_warn!(
                    "lmchat.chat",
                    "Provider stream failed for conversation {} after {} fragments: {}",
                    job.conversation_id,
                    fragments,
                    e
                );
                failure = Some(e);
                outcome = StreamOutcome::Failed;
                break;
            }
            None => break,
        }
    }
    drop(upstream);

    let record = outcome == StreamOutcome::Completed || fragments > 0;
    if record {
        let elapsed_ms = job.started.elapsed().as_millis() as i64;
        let assistant = NewMessage::assistant(
            &job.conversation_id,
            text,
            fragments,
            &job.model_id,
            elapsed_ms,
        );

        match job.conversation_repo.finalize_exchange(assistant, fragments).await {
            Ok(message) => {
                log_info!(
                    "lmchat.chat",
                    "Recorded reply {} ({:?}): {} fragments in {} ms",
                    message.id,
                    outcome,
                    fragments,
                    elapsed_ms
                );
            }
            Err(e) => {
                log_error!(
                    "lmchat.chat",
                    "Failed to record reply for conversation {}: {}",
                    job.conversation_id,
                    e
                );
                if failure.is_none() && outcome == StreamOutcome::Completed {
                    failure = Some(e);
                }
            }
        }
    } else {
        log_info!(
            "lmchat.chat",
            "Reply for conversation {} ended ({:?}) before any fragment; nothing recorded",
            job.conversation_id,
            outcome
        );
    }

    drop(job.slot);

    if let Some(err) = failure {
        let _ = tx.send(Err(err)).await;
    }
}
