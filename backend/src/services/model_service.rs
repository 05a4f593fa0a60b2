use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::config::{ModelDefaults, ProviderConfig};
use crate::db::models::{AiModel, AiModelSummary, ModelUpdate, NewAiModel};
use crate::error::AppError;
use crate::repositories::model_repo::ModelRepo;
use crate::services::provider_client::{CompletionProvider, LoadedModel};
use crate::{log_error, log_info, log_warn};

const LOADED_KEY: &str = "loaded";

/// Chooses the model configuration used for each completion and keeps the
/// local catalogue in step with the provider's inventory.
#[derive(Clone)]
pub struct ModelService {
    model_repo: ModelRepo,
    provider: Arc<dyn CompletionProvider>,
    defaults: ModelDefaults,
    provider_label: String,
    loaded_models: Cache<String, Vec<LoadedModel>>,
}

impl ModelService {
    pub fn new(
        model_repo: ModelRepo,
        provider: Arc<dyn CompletionProvider>,
        defaults: ModelDefaults,
        provider_config: &ProviderConfig,
    ) -> Self {
        Self {
            model_repo,
            provider,
            defaults,
            provider_label: provider_config.provider_label.clone(),
            loaded_models: Cache::builder()
                .time_to_live(Duration::from_secs(30))
                .max_capacity(4)
                .build(),
        }
    }

    /// The default model when it is active, else the earliest active model.
    pub async fn resolve_default(&self) -> Result<AiModel, AppError> {
        if let Some(model) = self.model_repo.get_default_active().await? {
            return Ok(model);
        }

        self.model_repo
            .first_active()
            .await?
            .ok_or_else(|| AppError::business("NO_AI_MODEL", "No active model available"))
    }

    /// Honour an explicit override, otherwise fall back to the default.
    /// An empty local catalogue triggers a provider sync first; a failed sync
    /// is logged and resolution carries on with what is stored.
    pub async fn resolve_for_request(
        &self,
        model_override: Option<&str>,
    ) -> Result<AiModel, AppError> {
        if let Some(key) = model_override.map(str::trim).filter(|k| !k.is_empty()) {
            return self
                .model_repo
                .find_active(key)
                .await?
                .ok_or_else(|| AppError::not_found("model", key));
        }

        if self.model_repo.count_active().await? == 0 {
            if let Err(e) = self.sync_from_provider().await {
                log_warn!("lmchat.models", "On-demand model sync failed: {}", e);
            }
        }

        self.resolve_default().await
    }

    pub async fn set_default(&self, id: &str) -> Result<AiModel, AppError> {
        self.model_repo.set_default_model(id).await?;
        log_info!("lmchat.models", "Default model set to {}", id);

        self.model_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("model", id))
    }

    /// Insert every provider model missing locally. Returns how many were added.
    pub async fn sync_from_provider(&self) -> Result<usize, AppError> {
        let remote = self.provider.list_models().await;
        if remote.is_empty() {
            log_warn!("lmchat.models", "Provider reported no models; catalogue unchanged");
            return Ok(0);
        }

        let known: HashSet<String> = self
            .model_repo
            .list_all()
            .await
            .map_err(|e| e.context("reading local model catalogue"))?
            .into_iter()
            .map(|model| model.model_id)
            .collect();

        let mut inserted = 0usize;
        for provider_model in remote {
            if known.contains(&provider_model.id) {
                continue;
            }

            let new_model = NewAiModel {
                name: provider_model.id.clone(),
                model_id: provider_model.id.clone(),
                provider: self.provider_label.clone(),
                endpoint: self.provider.endpoint().to_string(),
                api_key: None,
                max_tokens: self.defaults.max_tokens,
                temperature: self.defaults.temperature,
                is_active: true,
                cost_per_1k_input: None,
                cost_per_1k_output: None,
            };

            match self.model_repo.insert_discovered(new_model, inserted == 0).await {
                Ok(model) => {
                    inserted += 1;
                    log_info!(
                        "lmchat.models",
                        "Discovered model {} (default={})",
                        model.model_id,
                        model.is_default == 1
                    );
                }
                Err(e) => {
                    log_error!(
                        "lmchat.models",
                        "Failed to register model {}: {}",
                        provider_model.id,
                        e
                    );
                }
            }
        }

        Ok(inserted)
    }

    /// Flip the active flag. The default model cannot be deactivated.
    pub async fn toggle_active(&self, id: &str) -> Result<AiModel, AppError> {
        let model = self.get_unlocked(id, "deactivate").await?;
        self.model_repo.set_active(id, model.is_active == 0).await?;

        self.model_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("model", id))
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.get_unlocked(id, "delete").await?;
        self.model_repo.delete_model(id).await?;
        log_info!("lmchat.models", "Deleted model {}", id);
        Ok(())
    }

    pub async fn update_model(&self, id: &str, update: ModelUpdate) -> Result<AiModel, AppError> {
        if let Some(temperature) = update.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(AppError::validation(
                    "temperature",
                    "Temperature must be between 0 and 2",
                ));
            }
        }
        if let Some(max_tokens) = update.max_tokens {
            if max_tokens <= 0 {
                return Err(AppError::validation("maxTokens", "Max tokens must be positive"));
            }
        }
        if update.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(AppError::validation("name", "Name cannot be empty"));
        }

        self.model_repo.update_model(id, &update).await
    }

    pub async fn get_model(&self, id: &str) -> Result<AiModel, AppError> {
        self.model_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("model", id))
    }

    /// Every configured model, annotated with whether the provider currently
    /// holds it in memory.
    pub async fn list_available(&self) -> Result<Vec<AiModelSummary>, AppError> {
        let models = self.model_repo.list_all().await?;

        let provider = self.provider.clone();
        let loaded = self
            .loaded_models
            .get_with(LOADED_KEY.to_string(), async move {
                provider.list_loaded_models().await
            })
            .await;
        let loaded_ids: HashSet<&str> = loaded
            .iter()
            .filter(|model| model.is_loaded())
            .map(|model| model.id.as_str())
            .collect();

        Ok(models
            .into_iter()
            .map(|model| AiModelSummary {
                display_name: model.display_name(),
                is_local_model: model.is_local_model(),
                is_loaded: loaded_ids.contains(model.model_id.as_str()),
                model,
            })
            .collect())
    }

    pub async fn test_connection(&self) -> bool {
        self.provider.test_connection().await
    }

    async fn get_unlocked(&self, id: &str, action: &str) -> Result<AiModel, AppError> {
        let model = self.get_model(id).await?;
        if model.is_default == 1 {
            return Err(AppError::business(
                "DEFAULT_MODEL_LOCKED",
                format!("Cannot {action} the default model"),
            ));
        }
        Ok(model)
    }
}
