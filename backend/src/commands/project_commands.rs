use crate::db::models::{Conversation, Message, NewProject, Project, ProjectStatistics};
use crate::error::AppError;
use crate::log_info;
use crate::services::fanout_service::{FanoutEvent, Topic};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 100;

/// The project must exist and belong to `user_id`.
pub async fn authorize_project(
    state: &AppState,
    user_id: &str,
    project_id: &str,
) -> Result<Project, AppError> {
    let project = state
        .project_repo
        .get_project(project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project", project_id))?;

    if project.user_id != user_id {
        return Err(AppError::AccessDenied(format!(
            "project {project_id} is not owned by the caller"
        )));
    }
    Ok(project)
}

/// The conversation must exist inside a project owned by `user_id`.
pub async fn authorize_conversation(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<Conversation, AppError> {
    let conversation = state
        .conversation_repo
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| AppError::not_found("conversation", conversation_id))?;

    authorize_project(state, user_id, &conversation.project_id).await?;
    Ok(conversation)
}

pub async fn create_project(
    state: &AppState,
    user_id: &str,
    name: &str,
    description: Option<String>,
) -> Result<Project, AppError> {
    log_info!("lmchat.command", "create_project invoked");
    if name.trim().is_empty() {
        return Err(AppError::validation("name", "Project name cannot be empty"));
    }

    state.user_repo.ensure_user(user_id, user_id).await?;
    state
        .project_repo
        .create_project(NewProject {
            user_id: user_id.to_string(),
            name: name.trim().to_string(),
            description,
        })
        .await
}

pub async fn list_projects(state: &AppState, user_id: &str) -> Result<Vec<Project>, AppError> {
    state.project_repo.list_for_user(user_id).await
}

pub async fn create_conversation(
    state: &AppState,
    user_id: &str,
    project_id: &str,
    title: Option<String>,
) -> Result<Conversation, AppError> {
    log_info!("lmchat.command", "create_conversation invoked");
    authorize_project(state, user_id, project_id).await?;

    let title = title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New conversation".to_string());
    let conversation = state
        .conversation_repo
        .create_conversation(project_id, &title)
        .await?;

    state.fanout.publish(
        &Topic::project(project_id),
        None,
        FanoutEvent::ConversationCreated {
            conversation_id: conversation.id.clone(),
            title: conversation.title.clone(),
        },
    );
    Ok(conversation)
}

pub async fn list_conversations(
    state: &AppState,
    user_id: &str,
    project_id: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Conversation>, AppError> {
    authorize_project(state, user_id, project_id).await?;
    state
        .conversation_repo
        .list_for_project(
            project_id,
            limit.unwrap_or(DEFAULT_PAGE_SIZE),
            offset.unwrap_or(0),
        )
        .await
}

pub async fn rename_conversation(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
    title: &str,
) -> Result<(), AppError> {
    if title.trim().is_empty() {
        return Err(AppError::validation("title", "Title cannot be empty"));
    }
    authorize_conversation(state, user_id, conversation_id).await?;
    let title = title.trim();
    state
        .conversation_repo
        .update_title(conversation_id, title)
        .await?;

    state.fanout.publish(
        &Topic::conversation(conversation_id),
        None,
        FanoutEvent::TitleUpdated {
            conversation_id: conversation_id.to_string(),
            title: title.to_string(),
        },
    );
    Ok(())
}

pub async fn get_messages(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Message>, AppError> {
    authorize_conversation(state, user_id, conversation_id).await?;
    state
        .conversation_repo
        .get_messages(
            conversation_id,
            limit.unwrap_or(DEFAULT_PAGE_SIZE),
            offset.unwrap_or(0),
        )
        .await
}

pub async fn get_statistics(
    state: &AppState,
    user_id: &str,
    project_id: &str,
) -> Result<ProjectStatistics, AppError> {
    log_info!("lmchat.command", "get_statistics invoked");
    authorize_project(state, user_id, project_id).await?;
    state.project_repo.statistics(project_id).await
}
