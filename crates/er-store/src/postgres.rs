use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::LoginStore;

pub struct PgLoginStore {
    pool: PgPool,
}

impl PgLoginStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_logins (
                user_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (user_id, client_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_user_logins_user ON user_logins(user_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LoginStore for PgLoginStore {
    async fn store_login(&self, user_id: &str, client_id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO user_logins (user_id, client_id, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (user_id, client_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_client_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT client_id FROM user_logins WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("client_id")).collect())
    }
}
