#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use lmchat_lib::config::AppConfig;
use lmchat_lib::db::models::{AiModel, Conversation, Message, NewAiModel, NewProject, Project};
use lmchat_lib::db::Database;
use lmchat_lib::error::AppError;
use lmchat_lib::services::provider_client::{
    ChatCompletion, ChatCompletionRequest, CompletionProvider, FragmentStream, LoadedModel,
    ProviderModel,
};
use lmchat_lib::state::AppState;

/// One scripted step of a streamed reply.
#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Fail(&'static str),
    /// Stop producing without ending the stream.
    Hang,
}

#[derive(Debug, Clone)]
pub enum Reply {
    Stream(Vec<Step>),
    Refuse(&'static str),
}

/// In-process provider driven by a queue of scripted replies.
#[derive(Default)]
pub struct FakeProvider {
    models: Mutex<Vec<ProviderModel>>,
    loaded: Mutex<Vec<LoadedModel>>,
    replies: Mutex<VecDeque<Reply>>,
    completion: Mutex<Option<ChatCompletion>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
    reachable: Mutex<bool>,
}

impl FakeProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        *provider.reachable.lock().unwrap() = true;
        provider
    }

    pub fn with_models(self, ids: &[&str]) -> Self {
        *self.models.lock().unwrap() = ids
            .iter()
            .map(|id| ProviderModel {
                id: id.to_string(),
                object: Some("model".to_string()),
                owned_by: None,
            })
            .collect();
        self
    }

    pub fn with_loaded(self, ids: &[&str]) -> Self {
        *self.loaded.lock().unwrap() = ids
            .iter()
            .map(|id| LoadedModel {
                id: id.to_string(),
                state: "loaded".to_string(),
                estimated_vram: None,
            })
            .collect();
        self
    }

    pub fn reply(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn push_reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn set_completion(&self, completion: ChatCompletion) {
        *self.completion.lock().unwrap() = Some(completion);
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    fn endpoint(&self) -> &str {
        "http://fake.local/v1"
    }

    async fn list_models(&self) -> Vec<ProviderModel> {
        self.models.lock().unwrap().clone()
    }

    async fn list_loaded_models(&self) -> Vec<LoadedModel> {
        self.loaded.lock().unwrap().clone()
    }

    async fn test_connection(&self) -> bool {
        *self.reachable.lock().unwrap()
    }

    async fn complete(&self, request: ChatCompletionRequest) -> Result<ChatCompletion, AppError> {
        self.requests.lock().unwrap().push(request);
        self.completion
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::Transport("no completion scripted".to_string()))
    }

    async fn stream_complete(
        &self,
        request: ChatCompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<FragmentStream, AppError> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Stream(Vec::new()));

        let steps = match reply {
            Reply::Refuse(reason) => return Err(AppError::Transport(reason.to_string())),
            Reply::Stream(steps) => steps,
        };

        let hang = steps.iter().any(|step| matches!(step, Step::Hang));
        let items: Vec<Result<String, AppError>> = steps
            .into_iter()
            .take_while(|step| !matches!(step, Step::Hang))
            .map(|step| match step {
                Step::Text(text) => Ok(text.to_string()),
                Step::Fail(reason) => Err(AppError::Transport(reason.to_string())),
                Step::Hang => unreachable!(),
            })
            .collect();

        let scripted = stream::iter(items);
        if hang {
            Ok(Box::pin(scripted.chain(stream::pending())))
        } else {
            Ok(Box::pin(scripted))
        }
    }
}

pub struct Harness {
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
    pub user_id: String,
    pub project: Project,
    pub conversation: Conversation,
}

pub async fn harness(provider: FakeProvider) -> Harness {
    harness_with_config(provider, AppConfig::default()).await
}

pub async fn harness_with_config(provider: FakeProvider, config: AppConfig) -> Harness {
    let database = Database::in_memory().await.expect("in-memory database");
    let provider = Arc::new(provider);
    let state = AppState::from_parts(database, config, provider.clone());

    let user = state
        .user_repo
        .ensure_user("user-1", "alice")
        .await
        .expect("user");
    let project = state
        .project_repo
        .create_project(NewProject {
            user_id: user.id.clone(),
            name: "Research".to_string(),
            description: None,
        })
        .await
        .expect("project");
    let conversation = state
        .conversation_repo
        .create_conversation(&project.id, "First chat")
        .await
        .expect("conversation");

    Harness {
        state,
        provider,
        user_id: user.id,
        project,
        conversation,
    }
}

pub fn new_model(model_id: &str, active: bool) -> NewAiModel {
    NewAiModel {
        name: model_id.to_string(),
        model_id: model_id.to_string(),
        provider: "LMStudio".to_string(),
        endpoint: "http://localhost:1234/v1".to_string(),
        api_key: None,
        max_tokens: 2048,
        temperature: 0.4,
        is_active: active,
        cost_per_1k_input: None,
        cost_per_1k_output: None,
    }
}

pub async fn add_model(state: &AppState, model_id: &str, active: bool) -> AiModel {
    let model = state
        .model_repo
        .insert_model(new_model(model_id, active))
        .await
        .expect("insert model");
    // Keep created_at ordering unambiguous at millisecond resolution.
    tokio::time::sleep(Duration::from_millis(5)).await;
    model
}

pub async fn add_default_model(state: &AppState, model_id: &str) -> AiModel {
    let model = add_model(state, model_id, true).await;
    state.models.set_default(&model.id).await.expect("set default")
}

pub async fn messages(state: &AppState, conversation_id: &str) -> Vec<Message> {
    state
        .conversation_repo
        .get_messages(conversation_id, 1_000, 0)
        .await
        .expect("messages")
}

pub async fn conversation(state: &AppState, conversation_id: &str) -> Conversation {
    state
        .conversation_repo
        .get_conversation(conversation_id)
        .await
        .expect("load conversation")
        .expect("conversation exists")
}

pub async fn default_count(state: &AppState) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM ai_models WHERE is_default = 1")
        .fetch_one(state.db.read_pool())
        .await
        .expect("count defaults")
}

/// Wait until the conversation's stream has released its slot.
pub async fn wait_idle(state: &AppState, conversation_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.conversation.is_streaming(conversation_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream released its slot");
}

pub async fn collect(stream: FragmentStream) -> Vec<Result<String, AppError>> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream finished")
}
