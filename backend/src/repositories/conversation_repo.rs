use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Conversation, Message, NewMessage};
use crate::error::AppError;

#[derive(Clone)]
pub struct ConversationRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl ConversationRepo {
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

    pub async fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Conversation, AppError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO conversations (id, project_id, title) VALUES (?1, ?2, ?3)")
            .bind(&id)
            .bind(project_id)
            .bind(title)
            .execute(&self.write_pool)
            .await?;

        self.get_conversation(&id)
            .await?
            .ok_or_else(|| AppError::not_found("conversation", id))
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let row = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn list_for_project(
        &self,
        project_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>, AppError> {
        let rows = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT * FROM conversations
            WHERE project_id = ?1
            ORDER BY COALESCE(last_message_at, created_at) DESC, id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(project_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_title(&self, id: &str, title: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE conversations SET title = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?2",
        )
        .bind(title)
        .bind(id)
        .execute(&self.write_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("conversation", id));
        }
        Ok(())
    }

    /// Append a message. The position is allocated inside the INSERT so
    /// concurrent writers can never share one.
    pub async fn insert_message(&self, msg: NewMessage) -> Result<Message, AppError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(INSERT_MESSAGE_SQL)
            .bind(&id)
            .bind(&msg.conversation_id)
            .bind(msg.role.as_str())
            .bind(&msg.content)
            .bind(msg.token_count)
            .bind(&msg.model)
            .bind(msg.response_time_ms)
            .execute(&self.write_pool)
            .await?;

        self.get_message_by_id(&id)
            .await?
            .ok_or_else(|| AppError::not_found("message", id))
    }

    /// Persist the assistant reply and fold its tokens into the conversation
    /// totals as one unit. The counters move by SQL deltas.
    pub async fn finalize_exchange(
        &self,
        msg: NewMessage,
        tokens_used: i64,
    ) -> Result<Message, AppError> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.write_pool.begin().await?;

        sqlx::query(INSERT_MESSAGE_SQL)
            .bind(&id)
            .bind(&msg.conversation_id)
            .bind(msg.role.as_str())
            .bind(&msg.content)
            .bind(msg.token_count)
            .bind(&msg.model)
            .bind(msg.response_time_ms)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET total_tokens_used = total_tokens_used + ?1,
                last_message_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?2
            "#,
        )
        .bind(tokens_used)
        .bind(&msg.conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_message_by_id(&id)
            .await?
            .ok_or_else(|| AppError::not_found("message", id))
    }

    pub async fn get_message_by_id(&self, id: &str) -> Result<Option<Message>, AppError> {
        let row = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY position ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.read_pool)
        .await?;

        Ok(rows)
    }

    /// The last `limit` messages strictly before `before_position`, oldest first.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        before_position: i64,
        limit: i64,
    ) -> Result<Vec<Message>, AppError> {
        let mut rows = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ?1 AND position < ?2
            ORDER BY position DESC
            LIMIT ?3
            "#,
        )
        .bind(conversation_id)
        .bind(before_position)
        .bind(limit)
        .fetch_all(&self.read_pool)
        .await?;

        rows.reverse();
        Ok(rows)
    }

    pub async fn count_by_role(&self, conversation_id: &str, role: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND role = ?2",
        )
        .bind(conversation_id)
        .bind(role)
        .fetch_one(&self.read_pool)
        .await?;
        Ok(count)
    }
}

const INSERT_MESSAGE_SQL: &str = r#"
    INSERT INTO messages (
      id, conversation_id, role, content, token_count, model, response_time_ms, position
    ) VALUES (
      ?1, ?2, ?3, ?4, ?5, ?6, ?7,
      (SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = ?2)
    )
"#;
