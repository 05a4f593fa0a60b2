use crate::db::models::{AiModel, AiModelSummary, ModelUpdate};
use crate::error::AppError;
use crate::log_info;
use crate::state::AppState;

pub async fn list_models(state: &AppState) -> Result<Vec<AiModelSummary>, AppError> {
    log_info!("lmchat.command", "list_models invoked");
    state.models.list_available().await
}

pub async fn get_default_model(state: &AppState) -> Result<AiModel, AppError> {
    state.models.resolve_default().await
}

pub async fn sync_models(state: &AppState) -> Result<usize, AppError> {
    log_info!("lmchat.command", "sync_models invoked");
    state.models.sync_from_provider().await
}

pub async fn set_default_model(state: &AppState, model_id: &str) -> Result<AiModel, AppError> {
    log_info!("lmchat.command", "set_default_model invoked");
    state.models.set_default(model_id).await
}

pub async fn toggle_model(state: &AppState, model_id: &str) -> Result<AiModel, AppError> {
    log_info!("lmchat.command", "toggle_model invoked");
    state.models.toggle_active(model_id).await
}

pub async fn delete_model(state: &AppState, model_id: &str) -> Result<(), AppError> {
    log_info!("lmchat.command", "delete_model invoked");
    state.models.delete(model_id).await
}

pub async fn update_model(
    state: &AppState,
    model_id: &str,
    update: ModelUpdate,
) -> Result<AiModel, AppError> {
    log_info!("lmchat.command", "update_model invoked");
    state.models.update_model(model_id, update).await
}

pub async fn test_connection(state: &AppState) -> Result<bool, AppError> {
    Ok(state.models.test_connection().await)
}
