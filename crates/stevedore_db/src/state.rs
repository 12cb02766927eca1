//! Service-state key-value store.
//!
//! Holds the schema version and bucket-level operational hints that do
//! not belong on the bucket row itself.

use crate::error::Result;
use crate::QueueDb;
use sqlx::Row;

impl QueueDb {
    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM service_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Self::now_millis())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
