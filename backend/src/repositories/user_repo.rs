use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::AppError;

/// Identity is owned by the host application; this table only anchors project ownership.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub id: Option<String>,
    pub username: String,
    pub display_name: String,
}

#[derive(Clone)]
pub struct UserRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl UserRepo {
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

    pub async fn create_user(&self, user: NewUser) -> Result<User, AppError> {
        let id = user.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        sqlx::query("INSERT INTO users (id, username, display_name) VALUES (?1, ?2, ?3)")
            .bind(&id)
            .bind(&user.username)
            .bind(&user.display_name)
            .execute(&self.write_pool)
            .await?;

        self.get_user(&id)
            .await?
            .ok_or_else(|| AppError::not_found("user", id))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    /// Register an externally authenticated identity on first sight.
    pub async fn ensure_user(&self, id: &str, username: &str) -> Result<User, AppError> {
        if let Some(user) = self.get_user(id).await? {
            return Ok(user);
        }

        self.create_user(NewUser {
            id: Some(id.to_string()),
            username: username.to_string(),
            display_name: username.to_string(),
        })
        .await
    }
}
