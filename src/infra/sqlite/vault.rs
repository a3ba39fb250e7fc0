//! SQLite payload vault

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use crate::domain::ReleasedPayload;
use crate::infra::{PayloadVault, Result};

/// Stores released payloads as JSON alongside the ledger tables
#[derive(Clone)]
pub struct SqlitePayloadVault {
    pool: SqlitePool,
}

impl SqlitePayloadVault {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PayloadVault for SqlitePayloadVault {
    async fn put(&self, payload_ref: &str, payload: &ReleasedPayload) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        sqlx::query("INSERT INTO package_payloads (payload_ref, body, stored_at) VALUES (?, ?, ?)")
            .bind(payload_ref)
            .bind(&body)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, payload_ref: &str) -> Result<Option<ReleasedPayload>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM package_payloads WHERE payload_ref = ?")
                .bind(payload_ref)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(body,)| serde_json::from_str(&body).map_err(Into::into))
            .transpose()
    }

    async fn remove(&self, payload_ref: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM package_payloads WHERE payload_ref = ?")
            .bind(payload_ref)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
