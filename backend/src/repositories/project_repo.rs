use std::collections::BTreeMap;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{NewProject, Project, ProjectStatistics};
use crate::error::AppError;

#[derive(Debug, sqlx::FromRow)]
struct ProjectTotals {
    total_conversations: i64,
    total_tokens_used: i64,
    last_activity_at: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct GroupCount {
    label: String,
    total: i64,
}

#[derive(Clone)]
pub struct ProjectRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl ProjectRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            read_pool: pool.clone(),
            write_pool: pool,
        }
    }

    pub fn with_pools(read_pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    pub async fn create_project(&self, project: NewProject) -> Result<Project, AppError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO projects (id, user_id, name, description) VALUES (?1, ?2, ?3, ?4)")
            .bind(&id)
            .bind(&project.user_id)
            .bind(&project.name)
            .bind(&project.description)
            .execute(&self.write_pool)
            .await?;

        self.get_project(&id)
            .await?
            .ok_or_else(|| AppError::not_found("project", id))
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>, AppError> {
        let row = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Project>, AppError> {
        let rows = sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE user_id = ?1 ORDER BY created_at DESC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn statistics(&self, project_id: &str) -> Result<ProjectStatistics, AppError> {
        let project = self
            .get_project(project_id)
            .await?
            .ok_or_else(|| AppError::not_found("project", project_id))?;

        let totals = sqlx::query_as::<_, ProjectTotals>(
            r#"
            SELECT COUNT(*) AS total_conversations,
                   COALESCE(SUM(total_tokens_used), 0) AS total_tokens_used,
                   MAX(last_message_at) AS last_activity_at
            FROM conversations
            WHERE project_id = ?1
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.read_pool)
        .await?;

        let by_role = sqlx::query_as::<_, GroupCount>(
            r#"
            SELECT m.role AS label, COUNT(*) AS total
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.project_id = ?1
            GROUP BY m.role
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.read_pool)
        .await?;

        let by_model = sqlx::query_as::<_, GroupCount>(
            r#"
            SELECT m.model AS label, COALESCE(SUM(m.token_count), 0) AS total
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.project_id = ?1 AND m.model IS NOT NULL AND m.model != ''
            GROUP BY m.model
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.read_pool)
        .await?;

        let average_response_time_ms: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(m.response_time_ms)
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.project_id = ?1 AND m.response_time_ms IS NOT NULL
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.read_pool)
        .await?;

        let messages_by_role: BTreeMap<String, i64> =
            by_role.into_iter().map(|row| (row.label, row.total)).collect();
        let total_messages = messages_by_role.values().sum();

        Ok(ProjectStatistics {
            project_id: project.id,
            project_name: project.name,
            total_conversations: totals.total_conversations,
            total_messages,
            total_tokens_used: totals.total_tokens_used,
            last_activity_at: totals.last_activity_at,
            created_at: project.created_at,
            messages_by_role,
            tokens_by_model: by_model.into_iter().map(|row| (row.label, row.total)).collect(),
            average_response_time_ms: average_response_time_ms.unwrap_or(0.0),
        })
    }
}
