use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{AiModel, ModelUpdate, NewAiModel};
use crate::error::AppError;

#[derive(Clone)]
pub struct ModelRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl ModelRepo {
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

    pub async fn insert_model(&self, model: NewAiModel) -> Result<AiModel, AppError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO ai_models (
              id, name, model_id, provider, endpoint, api_key, max_tokens, temperature,
              is_default, is_active, cost_per_1k_input, cost_per_1k_output
            ) VALUES (
              ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11
            )
            "#,
        )
        .bind(&id)
        .bind(&model.name)
        .bind(&model.model_id)
        .bind(&model.provider)
        .bind(&model.endpoint)
        .bind(&model.api_key)
        .bind(model.max_tokens)
        .bind(model.temperature)
        .bind(if model.is_active { 1_i64 } else { 0_i64 })
        .bind(model.cost_per_1k_input)
        .bind(model.cost_per_1k_output)
        .execute(&self.write_pool)
        .await?;

        self.get_by_id(&id)
            .await?
            .ok_or_else(|| AppError::not_found("model", id))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<AiModel>, AppError> {
        let row = sqlx::query_as::<_, AiModel>("SELECT * FROM ai_models WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn get_by_model_id(&self, model_id: &str) -> Result<Option<AiModel>, AppError> {
        let row = sqlx::query_as::<_, AiModel>("SELECT * FROM ai_models WHERE model_id = ?1")
            .bind(model_id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    /// Active model matching either the row id or the provider's model id.
    pub async fn find_active(&self, key: &str) -> Result<Option<AiModel>, AppError> {
        let row = sqlx::query_as::<_, AiModel>(
            "SELECT * FROM ai_models WHERE (id = ?1 OR model_id = ?1) AND is_active = 1 LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn list_all(&self) -> Result<Vec<AiModel>, AppError> {
        let rows = sqlx::query_as::<_, AiModel>(
            "SELECT * FROM ai_models ORDER BY is_default DESC, name ASC, id ASC",
        )
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_default_active(&self) -> Result<Option<AiModel>, AppError> {
        let row = sqlx::query_as::<_, AiModel>(
            "SELECT * FROM ai_models WHERE is_default = 1 AND is_active = 1 LIMIT 1",
        )
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn first_active(&self) -> Result<Option<AiModel>, AppError> {
        let row = sqlx::query_as::<_, AiModel>(
            "SELECT * FROM ai_models WHERE is_active = 1 ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn count_active(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_models WHERE is_active = 1")
            .fetch_one(&self.read_pool)
            .await?;
        Ok(count)
    }

    /// Clear every default flag and set the target in one transaction.
    /// The target is also activated.
    pub async fn set_default_model(&self, id: &str) -> Result<(), AppError> {
        let mut tx = self.write_pool.begin().await?;

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_models WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Err(AppError::not_found("model", id));
        }

        sqlx::query("UPDATE ai_models SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE ai_models
            SET is_default = 1, is_active = 1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Insert a provider-discovered model and, when no default exists yet,
    /// promote it in the same transaction.
    pub async fn insert_discovered(
        &self,
        model: NewAiModel,
        promote_if_no_default: bool,
    ) -> Result<AiModel, AppError> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.write_pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ai_models (
              id, name, model_id, provider, endpoint, api_key, max_tokens, temperature,
              is_default, is_active
            ) VALUES (
              ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9
            )
            "#,
        )
        .bind(&id)
        .bind(&model.name)
        .bind(&model.model_id)
        .bind(&model.provider)
        .bind(&model.endpoint)
        .bind(&model.api_key)
        .bind(model.max_tokens)
        .bind(model.temperature)
        .bind(if model.is_active { 1_i64 } else { 0_i64 })
        .execute(&mut *tx)
        .await?;

        if promote_if_no_default {
            sqlx::query(
                r#"
                UPDATE ai_models SET is_default = 1
                WHERE id = ?1
                  AND NOT EXISTS (SELECT 1 FROM ai_models WHERE is_default = 1)
                "#,
            )
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_by_id(&id)
            .await?
            .ok_or_else(|| AppError::not_found("model", id))
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ai_models
            SET is_active = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?2
            "#,
        )
        .bind(if active { 1_i64 } else { 0_i64 })
        .bind(id)
        .execute(&self.write_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("model", id));
        }
        Ok(())
    }

    pub async fn update_model(&self, id: &str, update: &ModelUpdate) -> Result<AiModel, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ai_models SET
              name = COALESCE(?1, name),
              endpoint = COALESCE(?2, endpoint),
              api_key = COALESCE(?3, api_key),
              max_tokens = COALESCE(?4, max_tokens),
              temperature = COALESCE(?5, temperature),
              cost_per_1k_input = COALESCE(?6, cost_per_1k_input),
              cost_per_1k_output = COALESCE(?7, cost_per_1k_output),
              updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?8
            "#,
        )
        .bind(&update.name)
        .bind(&update.endpoint)
        .bind(&update.api_key)
        .bind(update.max_tokens)
        .bind(update.temperature)
        .bind(update.cost_per_1k_input)
        .bind(update.cost_per_1k_output)
        .bind(id)
        .execute(&self.write_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("model", id));
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("model", id))
    }

    pub async fn delete_model(&self, id: &str) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM ai_models WHERE id = ?1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("model", id));
        }
        Ok(())
    }
}
