use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::AppError;
use crate::log_info;
use crate::repositories::conversation_repo::ConversationRepo;
use crate::repositories::model_repo::ModelRepo;
use crate::repositories::project_repo::ProjectRepo;
use crate::repositories::user_repo::UserRepo;
use crate::services::context_service::ContextService;
use crate::services::conversation_service::ConversationService;
use crate::services::fanout_service::FanoutHub;
use crate::services::model_service::ModelService;
use crate::services::provider_client::{CompletionProvider, LmStudioClient};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<AppConfig>,

    pub user_repo: Arc<UserRepo>,
    pub project_repo: Arc<ProjectRepo>,
    pub conversation_repo: Arc<ConversationRepo>,
    pub model_repo: Arc<ModelRepo>,

    pub provider: Arc<dyn CompletionProvider>,
    pub models: Arc<ModelService>,
    pub context: Arc<ContextService>,
    pub conversation: Arc<ConversationService>,
    pub fanout: FanoutHub,
}

impl AppState {
    /// Open the on-disk database and connect to the configured provider.
    pub async fn initialize(config: AppConfig) -> Result<Self, AppError> {
        let startup_clock = Instant::now();
        config.validate()?;

        let database = Database::new(&config.data_dir, config.max_read_connections).await?;
        let provider: Arc<dyn CompletionProvider> = Arc::new(LmStudioClient::new(&config.provider)?);

        let state = Self::from_parts(database, config, provider);

        log_info!(
            "lmchat.db",
            "State initialized in {} ms (database {:?}, provider {})",
            startup_clock.elapsed().as_millis(),
            state.db.db_path,
            state.provider.endpoint()
        );
        Ok(state)
    }

    /// Wire services over an existing database and provider.
    pub fn from_parts(
        database: Database,
        config: AppConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let read_pool = database.read_pool().clone();
        let write_pool = database.write_pool().clone();

        let user_repo = Arc::new(UserRepo::with_pools(read_pool.clone(), write_pool.clone()));
        let project_repo = Arc::new(ProjectRepo::with_pools(read_pool.clone(), write_pool.clone()));
        let conversation_repo = Arc::new(ConversationRepo::with_pools(
            read_pool.clone(),
            write_pool.clone(),
        ));
        let model_repo = Arc::new(ModelRepo::with_pools(read_pool, write_pool));

        let models = Arc::new(ModelService::new(
            (*model_repo).clone(),
            provider.clone(),
            config.models.clone(),
            &config.provider,
        ));
        let context = Arc::new(ContextService::new(
            (*conversation_repo).clone(),
            config.chat.clone(),
        ));
        let conversation = Arc::new(ConversationService::new(
            (*conversation_repo).clone(),
            (*context).clone(),
            (*models).clone(),
            provider.clone(),
        ));

        Self {
            db: Arc::new(database),
            config: Arc::new(config),
            user_repo,
            project_repo,
            conversation_repo,
            model_repo,
            provider,
            models,
            context,
            conversation,
            fanout: FanoutHub::new(),
        }
    }
}
